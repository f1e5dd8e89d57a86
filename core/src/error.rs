//! Error types for measurement computation.

use std::path::PathBuf;

use thiserror::Error;

/// Broad classification of a [`MeasurementError`].
///
/// Every error aborts the computation for the component being measured; the
/// caller decides whether to skip, warn or abort the overall build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Firmware, kernel or signature bytes are not well-formed.
    MalformedInput,
    /// A template or artifact required for the computation is not available.
    MissingResource,
    /// The component asks for a TEE kind that cannot be measured.
    UnsupportedKind,
}

/// Errors that can occur while computing measurements.
#[derive(Debug, Error)]
pub enum MeasurementError {
    /// A read ran past the end of a buffer.
    #[error("truncated buffer: need {needed} bytes at offset {offset:#x}, buffer is {len} bytes")]
    Truncated {
        offset: usize,
        needed: usize,
        len: usize,
    },

    /// The OVMF table footer GUID does not match.
    #[error("invalid OVMF table footer GUID at offset {offset:#x}")]
    InvalidFooterGuid { offset: usize },

    /// The OVMF table-of-tables length is out of bounds.
    #[error("invalid OVMF tables length {length} at offset {offset:#x}")]
    InvalidTablesLength { offset: usize, length: usize },

    /// An OVMF table entry has an impossible length.
    #[error("invalid OVMF table entry length {length} at offset {offset:#x}")]
    InvalidEntryLength { offset: usize, length: usize },

    /// The TDX metadata offset GUID was not found in the OVMF table.
    #[error("TDX metadata offset GUID not found in OVMF table")]
    MetadataNotFound,

    /// The metadata offset points outside the firmware image.
    #[error("TDVF metadata offset {offset:#x} exceeds firmware size {len:#x}")]
    InvalidMetadataOffset { offset: usize, len: usize },

    /// The TDVF descriptor signature is not `TDVF`.
    #[error("invalid TDVF descriptor signature at offset {offset:#x}")]
    InvalidDescriptorSignature { offset: usize },

    /// The TDVF descriptor version is not supported.
    #[error("unsupported TDVF descriptor version {version}")]
    UnsupportedDescriptorVersion { version: u32 },

    /// A TDVF section violates its alignment or size invariants.
    #[error("invalid TDVF section {index}: {reason}")]
    InvalidSection { index: usize, reason: &'static str },

    /// No embedded ACPI template exists for the requested CPU count.
    #[error("no ACPI template for {cpu_count} CPUs")]
    MissingAcpiTemplate { cpu_count: u8 },

    /// An embedded ACPI template could not be decoded.
    #[error("corrupt ACPI template for {cpu_count} CPUs: {reason}")]
    CorruptAcpiTemplate { cpu_count: u8, reason: String },

    /// A required ACPI table was not found in the template.
    #[error("ACPI table {signature} not found in template")]
    AcpiTableNotFound { signature: &'static str },

    /// An ACPI table in the template is malformed.
    #[error("malformed ACPI table at offset {offset:#x}: {reason}")]
    InvalidAcpiTable { offset: usize, reason: &'static str },

    /// The table-loader command stream does not fit its fixed size.
    #[error("table loader commands are {len} bytes, limit is {limit}")]
    LoaderOverflow { len: usize, limit: usize },

    /// The kernel image cannot be patched or hashed.
    #[error("invalid kernel image: {0}")]
    InvalidKernel(String),

    /// The SGX signature structure is malformed.
    #[error("invalid SIGSTRUCT: {0}")]
    InvalidSigstruct(String),

    /// Resource configuration is out of range.
    #[error("invalid resources: {0}")]
    InvalidResources(String),

    /// A required artifact was not provided.
    #[error("missing artifact: {0}")]
    MissingArtifact(&'static str),

    /// The TEE kind cannot be measured.
    #[error("unsupported TEE kind: {0}")]
    UnsupportedTeeKind(String),

    /// An enclave identity text encoding could not be decoded.
    #[error("invalid enclave identity encoding: {0}")]
    InvalidIdentity(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Reading an artifact from disk failed.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MeasurementError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeasurementError::MissingAcpiTemplate { .. }
            | MeasurementError::MissingArtifact(_)
            | MeasurementError::Configuration(_)
            | MeasurementError::InvalidResources(_)
            | MeasurementError::Io { .. } => ErrorKind::MissingResource,
            MeasurementError::UnsupportedTeeKind(_) => ErrorKind::UnsupportedKind,
            _ => ErrorKind::MalformedInput,
        }
    }
}
