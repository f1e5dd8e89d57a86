//! Logging for measurement runs.
//!
//! Every RTMR event digest, both MRTD values and the resulting identities are
//! logged at DEBUG, so a mismatching identity can be diffed entry by entry
//! against the event log of a real TD. DEBUG is enabled by
//! `TEEMEASURE_DEBUG=1` (or `true`) or the `debug-logging` feature; otherwise
//! only errors are printed.

use std::sync::OnceLock;

use log::LevelFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Install the `env_logger` backend for this crate's log target.
///
/// Runs once per process; [`crate::measure_component`] calls it. If the
/// embedding application already installed a logger, that one is kept.
pub fn init() {
    INIT.get_or_init(|| {
        let _ = env_logger::Builder::new()
            .filter_module("teemeasure_core", level())
            .format_timestamp_millis()
            .try_init();
    });
}

fn level() -> LevelFilter {
    let from_env = std::env::var("TEEMEASURE_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if cfg!(feature = "debug-logging") || from_env {
        LevelFilter::Debug
    } else {
        LevelFilter::Error
    }
}

/// Emit an RTMR event log entry by entry.
pub(crate) fn debug_log(name: &str, log: &[Vec<u8>]) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    for (idx, entry) in log.iter().enumerate() {
        log::debug!("{name}[{idx}]: {}", hex::encode(entry));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        debug_log("RTMR0", &[vec![0u8; 48]]);
    }
}
