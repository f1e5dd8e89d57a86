//! SGX enclave identity lookup.
//!
//! An SGX enclave is already measured by its signer: MRENCLAVE is recorded in
//! the SIGSTRUCT and MRSIGNER is the SHA-256 of the signing key modulus.

use sgx_isa::Sigstruct;
use sha2::{Digest, Sha256};

use crate::error::MeasurementError;
use crate::identity::EnclaveIdentity;

/// Size of a SIGSTRUCT.
pub const SIGSTRUCT_LEN: usize = 1808;

const SIGSTRUCT_HEADER: [u8; 16] = [
    0x06, 0x00, 0x00, 0x00, 0xe1, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
];
const SIGSTRUCT_HEADER2: [u8; 16] = [
    0x01, 0x01, 0x00, 0x00, 0x60, 0x00, 0x00, 0x00, 0x60, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
];

/// Parse and sanity-check a SIGSTRUCT.
pub fn parse_sigstruct(data: &[u8]) -> Result<Sigstruct, MeasurementError> {
    if data.len() != SIGSTRUCT_LEN {
        return Err(MeasurementError::InvalidSigstruct(format!(
            "expected {SIGSTRUCT_LEN} bytes, got {}",
            data.len()
        )));
    }
    let sig = Sigstruct::try_copy_from(data)
        .ok_or_else(|| MeasurementError::InvalidSigstruct("unexpected layout".into()))?;
    if sig.header != SIGSTRUCT_HEADER {
        return Err(MeasurementError::InvalidSigstruct("bad header".into()));
    }
    if sig.header2 != SIGSTRUCT_HEADER2 {
        return Err(MeasurementError::InvalidSigstruct("bad header2".into()));
    }
    Ok(sig)
}

/// Identity recorded in a signed SIGSTRUCT.
pub fn sgx_identity(sigstruct: &[u8]) -> Result<EnclaveIdentity, MeasurementError> {
    let sig = parse_sigstruct(sigstruct)?;
    let identity = EnclaveIdentity {
        mr_enclave: sig.enclavehash,
        mr_signer: Sha256::digest(sig.modulus).into(),
    };
    log::debug!("SGX identity: {identity}");
    Ok(identity)
}
