use std::path::Path;

pub mod config;
pub mod cursor;
pub mod error;
pub mod identity;
pub mod logging;
pub mod sgx;
pub mod tdx;

pub use config::{
    Component, ComponentManifest, ResourceConfig, SgxComponent, TdxComponent, TdxComponentBuilder,
    TeeKind,
};
pub use error::{ErrorKind, MeasurementError};
pub use identity::{ComponentIdentity, EnclaveIdentity};
pub use tdx::acpi::AcpiTemplates;
pub use tdx::{measure_tdx, MrtdVariant, TdxMeasurements};

/// Compute the candidate identities of a bundle component.
///
/// SGX components yield exactly one identity. TDX components yield one per
/// [`MrtdVariant`], in [`MrtdVariant::ALL`] order, since the hypervisor
/// version that will boot the TD is not known in advance.
pub fn measure_component(
    component: &Component,
) -> Result<Vec<ComponentIdentity>, MeasurementError> {
    logging::init();

    let identities = match component {
        Component::Sgx(sgx) => vec![ComponentIdentity {
            variant: None,
            identity: sgx::sgx_identity(&sgx.sigstruct)?,
        }],
        Component::Tdx(tdx) => measure_tdx(tdx)?
            .iter()
            .map(ComponentIdentity::from_tdx)
            .collect(),
    };

    for id in &identities {
        match id.variant {
            Some(variant) => log::debug!("{} identity ({variant}): {}", component.kind(), id.identity),
            None => log::debug!("{} identity: {}", component.kind(), id.identity),
        }
    }
    Ok(identities)
}

/// Load the component described by `manifest` from `base_dir` and measure it.
pub fn measure_manifest(
    manifest: &ComponentManifest,
    base_dir: &Path,
) -> Result<Vec<ComponentIdentity>, MeasurementError> {
    logging::init();
    let component = manifest.load(base_dir)?;
    measure_component(&component)
}
