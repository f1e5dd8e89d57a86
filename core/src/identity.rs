//! Enclave identities.
//!
//! An [`EnclaveIdentity`] is the `(MRENCLAVE, MRSIGNER)` pair admission
//! policies match on. TDX measurements are folded into the same shape so SGX
//! and TDX components can share one policy format.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};
use tiny_keccak::{Hasher, TupleHash};

use crate::error::MeasurementError;
use crate::tdx::{MrtdVariant, TdxMeasurements};

/// TD enclave identity conversion context.
pub const TD_ENCLAVE_IDENTITY_CONTEXT: &[u8] = b"oasis-core/tdx: TD enclave identity";

/// Length of the binary encoding, `mr_enclave || mr_signer`.
pub const ENCLAVE_IDENTITY_LEN: usize = 64;

/// Composite enclave identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EnclaveIdentity {
    pub mr_enclave: [u8; 32],
    pub mr_signer: [u8; 32],
}

impl EnclaveIdentity {
    /// Identity of a TD.
    ///
    /// `mr_enclave` is `TupleHash256[context](MRTD, RTMR0, RTMR1, RTMR2, RTMR3)`.
    /// `mr_signer` is all zeroes, which is never a valid SGX signer.
    pub fn from_tdx(m: &TdxMeasurements) -> Self {
        let mut mr_enclave = [0u8; 32];
        let mut h = TupleHash::v256(TD_ENCLAVE_IDENTITY_CONTEXT);
        h.update(&m.mrtd);
        h.update(&m.rtmr0);
        h.update(&m.rtmr1);
        h.update(&m.rtmr2);
        h.update(&m.rtmr3);
        h.finalize(&mut mr_enclave);

        Self {
            mr_enclave,
            mr_signer: [0u8; 32],
        }
    }

    pub fn to_bytes(&self) -> [u8; ENCLAVE_IDENTITY_LEN] {
        let mut out = [0u8; ENCLAVE_IDENTITY_LEN];
        out[..32].copy_from_slice(&self.mr_enclave);
        out[32..].copy_from_slice(&self.mr_signer);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MeasurementError> {
        if bytes.len() != ENCLAVE_IDENTITY_LEN {
            return Err(MeasurementError::InvalidIdentity(format!(
                "expected {ENCLAVE_IDENTITY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut identity = Self::default();
        identity.mr_enclave.copy_from_slice(&bytes[..32]);
        identity.mr_signer.copy_from_slice(&bytes[32..]);
        Ok(identity)
    }
}

/// Standard base64 of `mr_enclave || mr_signer`.
impl fmt::Display for EnclaveIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.to_bytes()))
    }
}

impl FromStr for EnclaveIdentity {
    type Err = MeasurementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| MeasurementError::InvalidIdentity(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for EnclaveIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EnclaveIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(DeError::custom)
    }
}

/// An identity together with the hypervisor variant it was computed for.
///
/// `variant` is `None` for SGX components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<MrtdVariant>,
    pub identity: EnclaveIdentity,
}

impl ComponentIdentity {
    pub fn from_tdx(m: &TdxMeasurements) -> Self {
        Self {
            variant: Some(m.variant),
            identity: EnclaveIdentity::from_tdx(m),
        }
    }
}
