//! TDX measurement.
//!
//! Reproduces MRTD and RTMR0..RTMR3 for a TD booted by QEMU with TDVF and a
//! direct-boot Linux kernel. MRTD depends only on the firmware image; the
//! RTMRs also depend on the kernel, its command line and the VM resources.

pub mod acpi;
pub mod authenticode;
pub mod event;
pub mod hob;
pub mod kernel;
pub mod mrtd;
pub mod rtmr;
pub mod tdvf;

use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};

use crate::config::TdxComponent;
use crate::error::MeasurementError;

pub use mrtd::MrtdVariant;
pub use rtmr::{Rtmr, RtmrLogs};
pub use tdvf::TdvfMetadata;

/// Register values for one MRTD variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TdxMeasurements {
    pub variant: MrtdVariant,
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub mrtd: [u8; 48],
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub rtmr0: [u8; 48],
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub rtmr1: [u8; 48],
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub rtmr2: [u8; 48],
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub rtmr3: [u8; 48],
}

/// Build the RTMR0..RTMR2 event logs for a component.
pub fn rtmr_logs(
    component: &TdxComponent,
    metadata: &TdvfMetadata,
) -> Result<RtmrLogs, MeasurementError> {
    let resources = &component.resources;
    let td_hob = hob::build_td_hob(resources, metadata.td_hob_address())?;
    let acpi = acpi::generate_tables(resources, &component.acpi_templates)?;
    let kernel_digest = kernel::measure_kernel(&component.kernel)?;

    Ok(RtmrLogs {
        rtmr0: rtmr::rtmr0_log(&td_hob, &acpi)?,
        rtmr1: rtmr::rtmr1_log(kernel_digest),
        rtmr2: rtmr::rtmr2_log(&component.cmdline),
    })
}

/// Compute the measurements of `component` for every MRTD variant.
///
/// Results follow [`MrtdVariant::ALL`] order. The RTMRs are identical across
/// variants.
pub fn measure_tdx(component: &TdxComponent) -> Result<Vec<TdxMeasurements>, MeasurementError> {
    component.resources.validate()?;
    let metadata = TdvfMetadata::parse(&component.firmware)?;
    log::debug!(
        "TDVF: {} sections, TD HOB at {:?}",
        metadata.sections.len(),
        metadata.td_hob_address()
    );

    let mrtds = mrtd::compute_all_mrtds(&component.firmware, &metadata)?;

    let logs = rtmr_logs(component, &metadata)?;
    logs.debug_log();
    let [rtmr0, rtmr1, rtmr2, rtmr3] = logs.replay();

    Ok(mrtds
        .into_iter()
        .map(|(variant, mrtd)| TdxMeasurements {
            variant,
            mrtd,
            rtmr0,
            rtmr1,
            rtmr2,
            rtmr3,
        })
        .collect())
}

fn normalize_hex(value: &str) -> String {
    let mut lowered = value.trim().to_ascii_lowercase();
    if lowered.starts_with("0x") {
        lowered.drain(..2);
    }
    lowered.retain(|ch| !ch.is_ascii_whitespace());
    lowered
}

fn serialize_hex<S>(value: &[u8; 48], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&hex::encode(value))
}

fn deserialize_hex<'de, D>(deserializer: D) -> Result<[u8; 48], D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let bytes = hex::decode(normalize_hex(&s)).map_err(DeError::custom)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| DeError::invalid_length(b.len(), &"48 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use crate::tdx::acpi::template::tests::fixture_templates;
    use crate::tdx::authenticode::tests::build_pe;
    use crate::tdx::tdvf::tests::{build_firmware, td_hob_section};

    fn component(memory_mib: u64) -> TdxComponent {
        TdxComponent::builder()
            .firmware(build_firmware(&[td_hob_section()]))
            .kernel(build_pe(2, 0x90))
            .cmdline("console=ttyS0")
            .resources(ResourceConfig::new(memory_mib, 2))
            .acpi_templates(fixture_templates())
            .build()
            .unwrap()
    }

    #[test]
    fn test_one_result_per_variant() {
        let results = measure_tdx(&component(2048)).unwrap();
        assert_eq!(results.len(), MrtdVariant::ALL.len());
        for (result, variant) in results.iter().zip(MrtdVariant::ALL) {
            assert_eq!(result.variant, variant);
            assert_eq!(result.rtmr3, [0u8; 48]);
            assert_eq!(result.rtmr0, results[0].rtmr0);
        }
    }

    #[test]
    fn test_memory_changes_rtmr0_only() {
        let low = measure_tdx(&component(2048)).unwrap();
        let high = measure_tdx(&component(4096)).unwrap();
        assert_ne!(low[0].rtmr0, high[0].rtmr0);
        assert_eq!(low[0].mrtd, high[0].mrtd);
        assert_eq!(low[0].rtmr1, high[0].rtmr1);
        assert_eq!(low[0].rtmr2, high[0].rtmr2);
    }

    #[test]
    fn test_cmdline_changes_rtmr2() {
        let a = component(2048);
        let mut b = a.clone();
        b.cmdline = "console=hvc0".into();
        let a = measure_tdx(&a).unwrap();
        let b = measure_tdx(&b).unwrap();
        assert_ne!(a[0].rtmr2, b[0].rtmr2);
        assert_eq!(a[0].rtmr1, b[0].rtmr1);
    }

    #[test]
    fn test_logs_replay_to_registers() {
        let c = component(2048);
        let meta = TdvfMetadata::parse(&c.firmware).unwrap();
        let logs = rtmr_logs(&c, &meta).unwrap();
        assert_eq!(logs.rtmr0.len(), 14);
        assert_eq!(logs.rtmr1.len(), 4);
        assert_eq!(logs.rtmr2.len(), 1);

        let m = &measure_tdx(&c).unwrap()[0];
        assert_eq!(Rtmr::replay(&logs.rtmr0).value(), m.rtmr0);
    }

    #[test]
    fn test_bad_kernel_fails_whole_measurement() {
        let mut c = component(2048);
        c.kernel = vec![0u8; 0x100];
        assert!(matches!(
            measure_tdx(&c),
            Err(MeasurementError::InvalidKernel(_))
        ));
    }

    #[test]
    fn test_no_acpi_dump_fails_whole_measurement() {
        let mut c = component(2048);
        c.acpi_templates = acpi::AcpiTemplates::new();
        assert!(matches!(
            measure_tdx(&c),
            Err(MeasurementError::MissingAcpiTemplate { cpu_count: 2 })
        ));
    }

    #[test]
    fn measurements_serialize_as_hex() {
        let m = measure_tdx(&component(2048)).unwrap().remove(0);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["variant"], "two_pass");
        assert_eq!(json["mrtd"].as_str().unwrap(), hex::encode(m.mrtd));

        let back: TdxMeasurements = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn deserialize_accepts_prefixed_hex() {
        let json = serde_json::json!({
            "variant": "single_pass",
            "mrtd": format!("0x{}", "AB".repeat(48)),
            "rtmr0": "00".repeat(48),
            "rtmr1": "00".repeat(48),
            "rtmr2": "00".repeat(48),
            "rtmr3": "00".repeat(48),
        });
        let m: TdxMeasurements = serde_json::from_value(json).unwrap();
        assert_eq!(m.mrtd, [0xab; 48]);

        let short = serde_json::json!({
            "variant": "single_pass",
            "mrtd": "00",
            "rtmr0": "", "rtmr1": "", "rtmr2": "", "rtmr3": "",
        });
        assert!(serde_json::from_value::<TdxMeasurements>(short).is_err());
    }
}
