//! Configuration types for measurement inputs.
//!
//! These types describe what the bundle loader hands to the measurement
//! code: the TEE kind, the raw artifacts and the VM resources.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MeasurementError;
use crate::tdx::acpi::AcpiTemplates;

/// Memory size (in MiB) at and above which QEMU splits guest RAM around the
/// 32-bit PCI hole.
pub const MEMORY_SPLIT_MIB: u64 = 2816;

/// First byte of guest RAM not covered by the fixed TDVF memory map.
pub const LOW_MEMORY_END: u64 = 0x820000;

/// VM resources selected in the application manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Guest memory size in MiB.
    #[serde(alias = "memory")]
    pub memory_mib: u64,

    /// Number of virtual CPUs. Selects the ACPI template.
    #[serde(alias = "cpus")]
    pub cpu_count: u8,
}

impl ResourceConfig {
    pub fn new(memory_mib: u64, cpu_count: u8) -> Self {
        Self {
            memory_mib,
            cpu_count,
        }
    }

    /// Check that the resources describe a bootable TD.
    pub fn validate(&self) -> Result<(), MeasurementError> {
        if self.cpu_count == 0 {
            return Err(MeasurementError::InvalidResources(
                "cpu_count must be at least 1".into(),
            ));
        }
        let bytes = self.memory_mib.checked_mul(1024 * 1024).ok_or_else(|| {
            MeasurementError::InvalidResources(format!(
                "memory size {} MiB overflows",
                self.memory_mib
            ))
        })?;
        if bytes <= LOW_MEMORY_END {
            return Err(MeasurementError::InvalidResources(format!(
                "memory size {} MiB does not cover the firmware memory map",
                self.memory_mib
            )));
        }
        Ok(())
    }

    /// Guest memory size in bytes.
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mib.saturating_mul(1024 * 1024)
    }

    /// Whether guest RAM is split into a below-2GiB and an above-4GiB range.
    pub fn is_high_memory(&self) -> bool {
        self.memory_mib >= MEMORY_SPLIT_MIB
    }
}

/// TEE kinds that can be measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeeKind {
    Sgx,
    Tdx,
}

impl FromStr for TeeKind {
    type Err = MeasurementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sgx" => Ok(TeeKind::Sgx),
            "tdx" => Ok(TeeKind::Tdx),
            other => Err(MeasurementError::UnsupportedTeeKind(other.to_string())),
        }
    }
}

impl fmt::Display for TeeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeeKind::Sgx => f.write_str("sgx"),
            TeeKind::Tdx => f.write_str("tdx"),
        }
    }
}

/// Everything needed to measure a TDX component booted by QEMU.
#[derive(Debug, Clone)]
pub struct TdxComponent {
    /// TDVF/OVMF firmware image.
    pub firmware: Vec<u8>,
    /// Linux kernel image (bzImage with EFI stub).
    pub kernel: Vec<u8>,
    /// Kernel command line, without the trailing NUL.
    pub cmdline: String,
    /// VM resources.
    pub resources: ResourceConfig,
    /// Captured `etc/acpi/tables` dumps, one per CPU count.
    pub acpi_templates: AcpiTemplates,
}

impl TdxComponent {
    /// Create a new builder for a TDX component.
    pub fn builder() -> TdxComponentBuilder {
        TdxComponentBuilder::new()
    }
}

/// Builder for [`TdxComponent`].
///
/// # Example
///
/// ```
/// use teemeasure_core::{ResourceConfig, TdxComponent};
///
/// let result = TdxComponent::builder()
///     .firmware(vec![0u8; 64])
///     .kernel(vec![0u8; 0x1000])
///     .cmdline("console=ttyS0")
///     .resources(ResourceConfig::new(512, 1))
///     .build();
/// assert!(result.is_ok());
/// ```
#[derive(Debug, Default)]
pub struct TdxComponentBuilder {
    firmware: Option<Vec<u8>>,
    kernel: Option<Vec<u8>>,
    cmdline: String,
    resources: Option<ResourceConfig>,
    acpi_templates: AcpiTemplates,
}

impl TdxComponentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the firmware image bytes.
    pub fn firmware(mut self, firmware: Vec<u8>) -> Self {
        self.firmware = Some(firmware);
        self
    }

    /// Set the kernel image bytes.
    pub fn kernel(mut self, kernel: Vec<u8>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    /// Set the kernel command line.
    pub fn cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.cmdline = cmdline.into();
        self
    }

    /// Set the VM resources.
    pub fn resources(mut self, resources: ResourceConfig) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Set the captured ACPI table dumps.
    ///
    /// Without a dump for the configured CPU count, measurement fails with
    /// [`MeasurementError::MissingAcpiTemplate`].
    pub fn acpi_templates(mut self, templates: AcpiTemplates) -> Self {
        self.acpi_templates = templates;
        self
    }

    /// Build the component, checking that all artifacts are present.
    pub fn build(self) -> Result<TdxComponent, MeasurementError> {
        let firmware = self
            .firmware
            .filter(|fw| !fw.is_empty())
            .ok_or(MeasurementError::MissingArtifact("firmware"))?;
        let kernel = self
            .kernel
            .filter(|k| !k.is_empty())
            .ok_or(MeasurementError::MissingArtifact("kernel"))?;
        let resources = self
            .resources
            .ok_or(MeasurementError::MissingArtifact("resources"))?;
        resources.validate()?;

        Ok(TdxComponent {
            firmware,
            kernel,
            cmdline: self.cmdline,
            resources,
            acpi_templates: self.acpi_templates,
        })
    }
}

/// An SGX component, identified by its signed SIGSTRUCT.
#[derive(Debug, Clone)]
pub struct SgxComponent {
    pub sigstruct: Vec<u8>,
}

/// A bundle component ready for measurement.
#[derive(Debug, Clone)]
pub enum Component {
    Sgx(SgxComponent),
    Tdx(TdxComponent),
}

impl Component {
    pub fn kind(&self) -> TeeKind {
        match self {
            Component::Sgx(_) => TeeKind::Sgx,
            Component::Tdx(_) => TeeKind::Tdx,
        }
    }
}

/// Component description as found in a bundle manifest.
///
/// Artifact paths are resolved relative to the directory passed to
/// [`ComponentManifest::load`].
///
/// # Example
///
/// ```
/// use teemeasure_core::ComponentManifest;
///
/// let json = r#"{
///     "kind": "tdx",
///     "firmware": "OVMF.fd",
///     "kernel": "bzImage",
///     "cmdline": "console=ttyS0",
///     "resources": {"memory": 512, "cpus": 1},
///     "acpi_templates": "acpi"
/// }"#;
/// let manifest = ComponentManifest::from_json(json).unwrap();
/// assert_eq!(manifest.resources.unwrap().cpu_count, 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentManifest {
    /// TEE kind, `sgx` or `tdx`.
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<PathBuf>,

    #[serde(default)]
    pub cmdline: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceConfig>,

    /// Directory of `template_qemu_cpu<N>.{hex,bin}` ACPI dumps (TDX only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acpi_templates: Option<PathBuf>,

    /// Signed SIGSTRUCT file (SGX only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sigstruct: Option<PathBuf>,
}

impl ComponentManifest {
    /// Parse a manifest from JSON.
    pub fn from_json(json: &str) -> Result<Self, MeasurementError> {
        serde_json::from_str(json).map_err(|e| MeasurementError::Configuration(e.to_string()))
    }

    /// Read every artifact named by the manifest and build a [`Component`].
    pub fn load(&self, base_dir: &Path) -> Result<Component, MeasurementError> {
        match self.kind.parse::<TeeKind>()? {
            TeeKind::Sgx => {
                let path = self
                    .sigstruct
                    .as_deref()
                    .ok_or(MeasurementError::MissingArtifact("sigstruct"))?;
                Ok(Component::Sgx(SgxComponent {
                    sigstruct: read_artifact(base_dir, path)?,
                }))
            }
            TeeKind::Tdx => {
                let firmware = self
                    .firmware
                    .as_deref()
                    .ok_or(MeasurementError::MissingArtifact("firmware"))?;
                let kernel = self
                    .kernel
                    .as_deref()
                    .ok_or(MeasurementError::MissingArtifact("kernel"))?;
                let resources = self
                    .resources
                    .ok_or(MeasurementError::MissingArtifact("resources"))?;

                let acpi_templates = match self.acpi_templates.as_deref() {
                    Some(dir) => AcpiTemplates::load_dir(&base_dir.join(dir))?,
                    None => AcpiTemplates::new(),
                };

                let component = TdxComponent::builder()
                    .firmware(read_artifact(base_dir, firmware)?)
                    .kernel(read_artifact(base_dir, kernel)?)
                    .cmdline(self.cmdline.clone())
                    .resources(resources)
                    .acpi_templates(acpi_templates)
                    .build()?;
                Ok(Component::Tdx(component))
            }
        }
    }
}

fn read_artifact(base_dir: &Path, path: &Path) -> Result<Vec<u8>, MeasurementError> {
    let full = base_dir.join(path);
    log::debug!("reading artifact {}", full.display());
    std::fs::read(&full).map_err(|source| MeasurementError::Io { path: full, source })
}
