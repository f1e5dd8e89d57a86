//! Captured QEMU ACPI table dumps.
//!
//! The `etc/acpi/tables` blob depends on the QEMU build and machine type, so
//! it is taken from a real TD rather than rebuilt. Dumps are keyed by CPU
//! count; nothing is embedded in the crate.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::MeasurementError;

/// File name prefix of a dump, followed by the CPU count and `.hex` or `.bin`.
pub const TEMPLATE_FILE_PREFIX: &str = "template_qemu_cpu";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Hex,
    Binary,
}

/// `template_qemu_cpu4.hex` -> `(4, Hex)`.
fn parse_file_name(name: &str) -> Option<(u8, Encoding)> {
    let rest = name.strip_prefix(TEMPLATE_FILE_PREFIX)?;
    let (count, extension) = rest.split_once('.')?;
    let encoding = match extension {
        "hex" => Encoding::Hex,
        "bin" => Encoding::Binary,
        _ => return None,
    };
    Some((count.parse().ok()?, encoding))
}

/// `etc/acpi/tables` dumps by CPU count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcpiTemplates {
    by_cpu_count: BTreeMap<u8, Vec<u8>>,
}

impl AcpiTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the raw table dump for `cpu_count` CPUs.
    pub fn insert(&mut self, cpu_count: u8, tables: Vec<u8>) -> Option<Vec<u8>> {
        self.by_cpu_count.insert(cpu_count, tables)
    }

    /// Register a hex-encoded dump. Whitespace is ignored.
    pub fn insert_hex(&mut self, cpu_count: u8, encoded: &str) -> Result<(), MeasurementError> {
        let compact: String = encoded.split_whitespace().collect();
        let tables =
            hex::decode(compact).map_err(|e| MeasurementError::CorruptAcpiTemplate {
                cpu_count,
                reason: e.to_string(),
            })?;
        self.insert(cpu_count, tables);
        Ok(())
    }

    /// Load every `template_qemu_cpu<N>.{hex,bin}` file in `dir`.
    ///
    /// Other files are ignored.
    pub fn load_dir(dir: &Path) -> Result<Self, MeasurementError> {
        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| MeasurementError::Io { path, source }
        };

        let mut templates = Self::new();
        for entry in std::fs::read_dir(dir).map_err(io_error(dir))? {
            let path = entry.map_err(io_error(dir))?.path();
            let Some((cpu_count, encoding)) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(parse_file_name)
            else {
                continue;
            };

            let bytes = std::fs::read(&path).map_err(io_error(path.as_path()))?;
            match encoding {
                Encoding::Binary => {
                    templates.insert(cpu_count, bytes);
                }
                Encoding::Hex => {
                    let text = String::from_utf8(bytes).map_err(|e| {
                        MeasurementError::CorruptAcpiTemplate {
                            cpu_count,
                            reason: e.to_string(),
                        }
                    })?;
                    templates.insert_hex(cpu_count, &text)?;
                }
            }
            log::debug!("ACPI template for {cpu_count} CPUs from {}", path.display());
        }
        Ok(templates)
    }

    /// CPU counts with a dump, ascending.
    pub fn cpu_counts(&self) -> Vec<u8> {
        self.by_cpu_count.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_cpu_count.is_empty()
    }

    /// Dump for `cpu_count` CPUs.
    pub fn get(&self, cpu_count: u8) -> Result<&[u8], MeasurementError> {
        self.by_cpu_count
            .get(&cpu_count)
            .map(Vec::as_slice)
            .ok_or(MeasurementError::MissingAcpiTemplate { cpu_count })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Directory of synthetic q35-shaped dumps used by the tests.
    pub(crate) const FIXTURE_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/acpi");

    pub(crate) fn fixture_templates() -> AcpiTemplates {
        AcpiTemplates::load_dir(Path::new(FIXTURE_DIR)).unwrap()
    }

    #[test]
    fn test_file_names() {
        assert_eq!(
            parse_file_name("template_qemu_cpu4.hex"),
            Some((4, Encoding::Hex))
        );
        assert_eq!(
            parse_file_name("template_qemu_cpu16.bin"),
            Some((16, Encoding::Binary))
        );
        assert_eq!(parse_file_name("template_qemu_cpu4.txt"), None);
        assert_eq!(parse_file_name("template_qemu_cpu.hex"), None);
        assert_eq!(parse_file_name("template_qemu_cpu300.hex"), None);
        assert_eq!(parse_file_name("README.md"), None);
    }

    #[test]
    fn test_empty_set_has_no_template() {
        let templates = AcpiTemplates::new();
        assert!(templates.is_empty());
        assert!(matches!(
            templates.get(1),
            Err(MeasurementError::MissingAcpiTemplate { cpu_count: 1 })
        ));
    }

    #[test]
    fn test_insert_hex() {
        let mut templates = AcpiTemplates::new();
        templates.insert_hex(2, "4141\n 4242\n").unwrap();
        assert_eq!(templates.get(2).unwrap(), b"AABB");

        let err = templates.insert_hex(3, "zz").unwrap_err();
        assert!(matches!(
            err,
            MeasurementError::CorruptAcpiTemplate { cpu_count: 3, .. }
        ));
    }

    #[test]
    fn test_load_fixture_dir() {
        let templates = fixture_templates();
        assert_eq!(templates.cpu_counts(), (1..=8).collect::<Vec<u8>>());
        assert!(templates.get(9).is_err());
    }

    #[test]
    fn test_load_dir_reads_binary_and_skips_others() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("template_qemu_cpu2.bin"), b"RAW").unwrap();
        std::fs::write(dir.path().join("template_qemu_cpu3.hex"), "414243").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let templates = AcpiTemplates::load_dir(dir.path()).unwrap();
        assert_eq!(templates.cpu_counts(), vec![2, 3]);
        assert_eq!(templates.get(2).unwrap(), b"RAW");
        assert_eq!(templates.get(3).unwrap(), b"ABC");
    }

    #[test]
    fn test_load_missing_dir() {
        let err = AcpiTemplates::load_dir(Path::new("/nonexistent/acpi")).unwrap_err();
        assert!(matches!(err, MeasurementError::Io { .. }));
    }
}
