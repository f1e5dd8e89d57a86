//! Direct-boot kernel measurement.
//!
//! QEMU rewrites a few fields of the Linux x86 setup header before TDVF loads
//! the kernel as an EFI application, so the Authenticode digest TDVF extends
//! is taken over the patched image.

use crate::error::MeasurementError;
use crate::tdx::authenticode::authenticode_sha384;

/// Guest address QEMU places the kernel command line at.
pub const CMDLINE_ADDR: u32 = 0x20000;

/// Guest address of the real-mode kernel setup code.
const REAL_MODE_ADDR: u32 = 0x10000;

/// End of the setup header fields touched here.
const MIN_KERNEL_LEN: usize = 0x230;

const TYPE_OF_LOADER: usize = 0x210;
const LOADFLAGS: usize = 0x211;
const HEAP_END_PTR: usize = 0x224;
const CMD_LINE_PTR: usize = 0x228;

/// `type_of_loader` value for QEMU.
const LOADER_TYPE_QEMU: u8 = 0xb0;
const CAN_USE_HEAP: u8 = 0x80;

/// Apply QEMU's setup header edits to a copy of `kernel`.
pub fn patch_kernel(kernel: &[u8]) -> Result<Vec<u8>, MeasurementError> {
    if kernel.len() < MIN_KERNEL_LEN {
        return Err(MeasurementError::InvalidKernel(format!(
            "image is {} bytes, setup header needs {MIN_KERNEL_LEN}",
            kernel.len()
        )));
    }

    let mut kd = kernel.to_vec();
    kd[TYPE_OF_LOADER] = LOADER_TYPE_QEMU;
    kd[LOADFLAGS] |= CAN_USE_HEAP;

    // Written as 32 bits, so ext_loader_ver and ext_loader_type (0x226, 0x227)
    // are cleared as well. QEMU itself stores only the 16-bit heap_end_ptr.
    let heap_end_ptr = CMDLINE_ADDR - REAL_MODE_ADDR - 0x200;
    kd[HEAP_END_PTR..HEAP_END_PTR + 4].copy_from_slice(&heap_end_ptr.to_le_bytes());
    kd[CMD_LINE_PTR..CMD_LINE_PTR + 4].copy_from_slice(&CMDLINE_ADDR.to_le_bytes());
    Ok(kd)
}

/// Authenticode digest of the patched kernel, as extended into RTMR1.
pub fn measure_kernel(kernel: &[u8]) -> Result<Vec<u8>, MeasurementError> {
    let patched = patch_kernel(kernel)?;
    Ok(authenticode_sha384(&patched)?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tdx::authenticode::tests::build_pe;

    #[test]
    fn test_patch_fields() {
        let mut kernel = vec![0u8; 0x400];
        kernel[LOADFLAGS] = 0x01;
        let kd = patch_kernel(&kernel).unwrap();
        assert_eq!(kd[0x210], 0xb0);
        assert_eq!(kd[0x211], 0x81);
        assert_eq!(&kd[0x224..0x228], &0xFE00u32.to_le_bytes());
        assert_eq!(&kd[0x228..0x22C], &0x20000u32.to_le_bytes());
        assert_eq!(kd.len(), kernel.len());
        assert_eq!(kd[..0x210], kernel[..0x210]);
        assert_eq!(kd[0x22C..], kernel[0x22C..]);
    }

    #[test]
    fn test_heap_end_ptr_clears_ext_loader_fields() {
        let mut kernel = vec![0u8; 0x400];
        kernel[0x226] = 0x12;
        kernel[0x227] = 0x34;
        let kd = patch_kernel(&kernel).unwrap();
        assert_eq!(&kd[0x224..0x226], &[0x00, 0xFE]);
        assert_eq!(&kd[0x226..0x228], &[0x00, 0x00]);
    }

    #[test]
    fn test_short_kernel_is_rejected() {
        assert!(matches!(
            patch_kernel(&[0u8; 0x22f]),
            Err(MeasurementError::InvalidKernel(_))
        ));
    }

    #[test]
    fn test_measure_hashes_patched_image() {
        let kernel = build_pe(2, 0x90);
        let digest = measure_kernel(&kernel).unwrap();
        assert_eq!(digest.len(), 48);
        assert_ne!(digest, authenticode_sha384(&kernel).unwrap().to_vec());
        assert_eq!(
            digest,
            authenticode_sha384(&patch_kernel(&kernel).unwrap())
                .unwrap()
                .to_vec()
        );
    }

    #[test]
    fn test_measure_rejects_non_pe() {
        assert!(measure_kernel(&[0u8; 0x1000]).is_err());
    }
}
