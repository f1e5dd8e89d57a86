//! RTMR event logs and register extension.
//!
//! TDVF and the kernel EFI stub extend RTMR0..RTMR2 in a fixed order during a
//! direct boot. The logs built here list those events; [`Rtmr::replay`]
//! folds a log into the final register value.

use sha2::{Digest, Sha384};

use crate::error::MeasurementError;
use crate::tdx::acpi::AcpiTables;
use crate::tdx::event::{
    measure_cmdline, measure_efi_variable, measure_sha384, EFI_GLOBAL_VARIABLE_GUID,
    EFI_IMAGE_SECURITY_DATABASE_GUID,
};

/// Digest of the configuration firmware volume (empty OVMF variable store).
const CFV_DIGEST: [u8; 48] = hex_literal::hex!(
    "344BC51C980BA621AAA00DA3ED7436F7D6E549197DFE699515DFA2C6583D95E6412AF21C097D473155875FFD561D6790"
);

/// Digest of the `Boot0000` load option QEMU registers for direct boot.
const BOOT0000_DIGEST: [u8; 48] = hex_literal::hex!(
    "23ADA07F5261F12F34A0BD8E46760962D6B4D576A416F1FEA1C64BC656B1D28EACF7047AE6E967C58FD2A98BFA74C298"
);

const SEPARATOR: [u8; 4] = [0u8; 4];
const BOOT_ORDER: [u8; 2] = [0u8; 2];

/// Boot transition strings measured into RTMR1 after the kernel image.
const RTMR1_EVENTS: [&[u8]; 3] = [
    b"Calling EFI Application from Boot Option",
    b"Exit Boot Services Invocation",
    b"Exit Boot Services Returned with Success",
];

/// Secure Boot variables measured while they are empty, in order.
const SECURE_BOOT_VARIABLES: [(&str, &str); 5] = [
    (EFI_GLOBAL_VARIABLE_GUID, "SecureBoot"),
    (EFI_GLOBAL_VARIABLE_GUID, "PK"),
    (EFI_GLOBAL_VARIABLE_GUID, "KEK"),
    (EFI_IMAGE_SECURITY_DATABASE_GUID, "db"),
    (EFI_IMAGE_SECURITY_DATABASE_GUID, "dbx"),
];

/// A 48-byte runtime measurement register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rtmr([u8; 48]);

impl Default for Rtmr {
    fn default() -> Self {
        Self([0u8; 48])
    }
}

impl Rtmr {
    pub fn new() -> Self {
        Self::default()
    }

    /// `self = SHA384(self || digest)`.
    pub fn extend(&mut self, digest: &[u8]) {
        let mut h = Sha384::new();
        h.update(self.0);
        h.update(digest);
        self.0 = h.finalize().into();
    }

    /// Register value after extending every entry of `log` from zero.
    pub fn replay(log: &[Vec<u8>]) -> Self {
        log.iter().fold(Self::new(), |mut rtmr, entry| {
            rtmr.extend(entry);
            rtmr
        })
    }

    pub fn value(&self) -> [u8; 48] {
        self.0
    }
}

/// Ordered event logs for RTMR0..RTMR2.
///
/// RTMR3 is reserved for the running workload and is never extended here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmrLogs {
    pub rtmr0: Vec<Vec<u8>>,
    pub rtmr1: Vec<Vec<u8>>,
    pub rtmr2: Vec<Vec<u8>>,
}

impl RtmrLogs {
    /// Final values of RTMR0..RTMR3.
    pub fn replay(&self) -> [[u8; 48]; 4] {
        [
            Rtmr::replay(&self.rtmr0).value(),
            Rtmr::replay(&self.rtmr1).value(),
            Rtmr::replay(&self.rtmr2).value(),
            Rtmr::new().value(),
        ]
    }

    /// Emit every log at debug level.
    pub fn debug_log(&self) {
        crate::logging::debug_log("RTMR0", &self.rtmr0);
        crate::logging::debug_log("RTMR1", &self.rtmr1);
        crate::logging::debug_log("RTMR2", &self.rtmr2);
    }
}

/// Firmware events: TD HOB, CFV, Secure Boot variables, ACPI blobs, boot options.
pub fn rtmr0_log(td_hob: &[u8], acpi: &AcpiTables) -> Result<Vec<Vec<u8>>, MeasurementError> {
    let mut log = Vec::with_capacity(14);
    log.push(measure_sha384(td_hob));
    log.push(CFV_DIGEST.to_vec());
    for (guid, name) in SECURE_BOOT_VARIABLES {
        log.push(measure_efi_variable(guid, name)?);
    }
    log.push(measure_sha384(&SEPARATOR));
    log.push(measure_sha384(&acpi.loader));
    log.push(measure_sha384(&acpi.rsdp));
    log.push(measure_sha384(&acpi.tables));
    log.push(measure_sha384(&BOOT_ORDER));
    log.push(BOOT0000_DIGEST.to_vec());
    log.push(measure_sha384(&SEPARATOR));
    Ok(log)
}

/// Kernel image digest followed by the boot transition events.
pub fn rtmr1_log(kernel_digest: Vec<u8>) -> Vec<Vec<u8>> {
    let mut log = Vec::with_capacity(1 + RTMR1_EVENTS.len());
    log.push(kernel_digest);
    log.extend(RTMR1_EVENTS.iter().map(|event| measure_sha384(event)));
    log
}

/// Kernel command line.
pub fn rtmr2_log(cmdline: &str) -> Vec<Vec<u8>> {
    vec![measure_cmdline(cmdline)]
}
