//! Digests of individual boot-time measurement events.
//!
//! Each function returns the SHA-384 digest that firmware extends into an
//! RTMR for one event.

use sha2::{Digest, Sha384};

use crate::error::MeasurementError;

/// EFI global variable vendor GUID (`SecureBoot`, `PK`, `KEK`).
pub const EFI_GLOBAL_VARIABLE_GUID: &str = "8BE4DF61-93CA-11D2-AA0D-00E098032B8C";

/// EFI image security database GUID (`db`, `dbx`).
pub const EFI_IMAGE_SECURITY_DATABASE_GUID: &str = "D719B2CB-3D3A-4596-A3BC-DAD00E67656F";

/// SHA-384 of raw bytes.
pub fn measure_sha384(data: &[u8]) -> Vec<u8> {
    Sha384::digest(data).to_vec()
}

/// UTF-16LE encoding without BOM.
pub fn utf16_encode(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

/// Encode a textual GUID into its 16-byte mixed-endian form.
///
/// The first three dash-separated groups are stored little-endian, the last
/// two as written.
pub fn encode_guid(guid: &str) -> Result<[u8; 16], MeasurementError> {
    let invalid = || MeasurementError::Configuration(format!("invalid GUID '{guid}'"));

    let groups: Vec<&str> = guid.split('-').collect();
    let expected_lens = [8, 4, 4, 4, 12];
    if groups.len() != expected_lens.len()
        || groups.iter().zip(expected_lens).any(|(g, l)| g.len() != l)
    {
        return Err(invalid());
    }

    let mut out = [0u8; 16];
    let mut pos = 0;
    for (idx, group) in groups.iter().enumerate() {
        let mut raw = hex::decode(group).map_err(|_| invalid())?;
        if idx <= 2 {
            raw.reverse();
        }
        out[pos..pos + raw.len()].copy_from_slice(&raw);
        pos += raw.len();
    }
    Ok(out)
}

/// Digest of an `EV_EFI_VARIABLE_DRIVER_CONFIG` event for an empty variable.
///
/// Layout: vendor GUID, name length in characters (u64), data length (u64,
/// always zero), UTF-16LE name.
pub fn measure_efi_variable(vendor_guid: &str, name: &str) -> Result<Vec<u8>, MeasurementError> {
    let name_utf16 = utf16_encode(name);
    let mut data = Vec::with_capacity(16 + 16 + name_utf16.len());
    data.extend_from_slice(&encode_guid(vendor_guid)?);
    data.extend_from_slice(&(name.encode_utf16().count() as u64).to_le_bytes());
    data.extend_from_slice(&0u64.to_le_bytes());
    data.extend_from_slice(&name_utf16);
    Ok(measure_sha384(&data))
}

/// Digest of the kernel command line as measured by the EFI stub.
///
/// The command line is NUL-terminated and measured as UTF-16LE.
pub fn measure_cmdline(cmdline: &str) -> Vec<u8> {
    let mut terminated = String::with_capacity(cmdline.len() + 1);
    terminated.push_str(cmdline);
    terminated.push('\0');
    measure_sha384(&utf16_encode(&terminated))
}
