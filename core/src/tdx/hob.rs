//! TD HOB construction.
//!
//! QEMU hands TDVF a hand-off block list describing guest memory. Its
//! SHA-384 is the first event extended into RTMR0.

use crate::config::{ResourceConfig, LOW_MEMORY_END};
use crate::error::MeasurementError;

/// TD HOB base address used when the firmware has no TD HOB section.
pub const DEFAULT_TD_HOB_BASE: u64 = 0x809000;

const EFI_HOB_TYPE_HANDOFF: u16 = 0x0001;
const EFI_HOB_TYPE_RESOURCE_DESCRIPTOR: u16 = 0x0003;
const EFI_HOB_HANDOFF_TABLE_VERSION: u32 = 9;

const HANDOFF_HOB_LEN: u16 = 56;
const RESOURCE_HOB_LEN: u16 = 48;

/// Offset of `EfiEndOfHobList` inside the handoff HOB.
const END_OF_HOB_LIST_OFFSET: usize = 48;

/// Size of the End-of-HOB-list header that firmware appends.
const END_OF_HOB_LIST_LEN: u64 = 8;

/// PRESENT | INITIALIZED | TESTED.
const RESOURCE_ATTRIBUTES: u32 = 0x0000_0007;

/// Lowest address above 4 GiB where QEMU places RAM beyond the 32-bit split.
const HIGH_MEMORY_BASE: u64 = 0x1_0000_0000;
const LOW_MEMORY_TOP_SPLIT: u64 = 0x8000_0000;

/// `EFI_RESOURCE_TYPE` values used by the TD memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResourceType {
    /// Accepted system memory.
    SystemMemory = 0x00,
    /// Memory the guest still has to accept.
    Unaccepted = 0x07,
}

/// Fixed part of the QEMU TDX memory map below `LOW_MEMORY_END`.
const FIXED_MEMORY_MAP: [(ResourceType, u64, u64); 7] = [
    (ResourceType::Unaccepted, 0x0000_0000, 0x0080_0000),
    (ResourceType::SystemMemory, 0x0080_0000, 0x0000_6000),
    (ResourceType::Unaccepted, 0x0080_6000, 0x0000_3000),
    (ResourceType::SystemMemory, 0x0080_9000, 0x0000_2000),
    (ResourceType::SystemMemory, 0x0080_B000, 0x0000_2000),
    (ResourceType::Unaccepted, 0x0080_D000, 0x0000_4000),
    (ResourceType::SystemMemory, 0x0081_1000, 0x0000_F000),
];

/// `EFI_HOB_HANDOFF_INFO_TABLE`, with `EfiEndOfHobList` left zero.
fn handoff_hob() -> Vec<u8> {
    let mut hob = Vec::with_capacity(HANDOFF_HOB_LEN as usize);
    hob.extend_from_slice(&EFI_HOB_TYPE_HANDOFF.to_le_bytes()); // HobType
    hob.extend_from_slice(&HANDOFF_HOB_LEN.to_le_bytes()); // HobLength
    hob.extend_from_slice(&[0u8; 4]); // Reserved
    hob.extend_from_slice(&EFI_HOB_HANDOFF_TABLE_VERSION.to_le_bytes()); // Version
    hob.extend_from_slice(&[0u8; 4]); // BootMode
    hob.extend_from_slice(&[0u8; 8]); // EfiMemoryTop
    hob.extend_from_slice(&[0u8; 8]); // EfiMemoryBottom
    hob.extend_from_slice(&[0u8; 8]); // EfiFreeMemoryTop
    hob.extend_from_slice(&[0u8; 8]); // EfiFreeMemoryBottom
    hob.extend_from_slice(&[0u8; 8]); // EfiEndOfHobList
    hob
}

/// `EFI_HOB_RESOURCE_DESCRIPTOR` for one memory range.
fn resource_hob(resource_type: ResourceType, start: u64, length: u64) -> [u8; 48] {
    let mut hob = [0u8; RESOURCE_HOB_LEN as usize];
    hob[0..2].copy_from_slice(&EFI_HOB_TYPE_RESOURCE_DESCRIPTOR.to_le_bytes());
    hob[2..4].copy_from_slice(&RESOURCE_HOB_LEN.to_le_bytes());
    // 4..8 reserved, 8..24 owner GUID
    hob[24] = resource_type as u8;
    // 25..28 padding
    hob[28..32].copy_from_slice(&RESOURCE_ATTRIBUTES.to_le_bytes());
    hob[32..40].copy_from_slice(&start.to_le_bytes());
    hob[40..48].copy_from_slice(&length.to_le_bytes());
    hob
}

/// Memory ranges QEMU reports for guest RAM above the fixed map.
fn ram_ranges(resources: &ResourceConfig) -> Vec<(u64, u64)> {
    let memory = resources.memory_bytes();
    if resources.is_high_memory() {
        log::trace!("TD HOB: splitting {memory:#x} bytes of RAM around the PCI hole");
        vec![
            (LOW_MEMORY_END, LOW_MEMORY_TOP_SPLIT - LOW_MEMORY_END),
            (HIGH_MEMORY_BASE, memory - LOW_MEMORY_TOP_SPLIT),
        ]
    } else {
        vec![(LOW_MEMORY_END, memory - LOW_MEMORY_END)]
    }
}

/// Build the TD HOB list for the given resources.
///
/// `base` is the guest address of the TD HOB; `None` uses
/// [`DEFAULT_TD_HOB_BASE`].
pub fn build_td_hob(
    resources: &ResourceConfig,
    base: Option<u64>,
) -> Result<Vec<u8>, MeasurementError> {
    resources.validate()?;
    let base = base.unwrap_or(DEFAULT_TD_HOB_BASE);

    let mut td_hob = handoff_hob();
    for (resource_type, start, length) in FIXED_MEMORY_MAP {
        td_hob.extend_from_slice(&resource_hob(resource_type, start, length));
    }
    for (start, length) in ram_ranges(resources) {
        td_hob.extend_from_slice(&resource_hob(ResourceType::Unaccepted, start, length));
    }

    let end_of_hob_list = base + td_hob.len() as u64 + END_OF_HOB_LIST_LEN;
    td_hob[END_OF_HOB_LIST_OFFSET..END_OF_HOB_LIST_OFFSET + 8]
        .copy_from_slice(&end_of_hob_list.to_le_bytes());

    Ok(td_hob)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u64_at(buf: &[u8], offset: usize) -> u64 {
        u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
    }

    #[test]
    fn test_low_memory_layout() {
        let hob = build_td_hob(&ResourceConfig::new(512, 1), None).unwrap();
        assert_eq!(hob.len(), 56 + 48 * 8);
        assert_eq!(&hob[0..4], &[0x01, 0x00, 56, 0x00]);
        assert_eq!(u64_at(&hob, 48), 0x809000 + hob.len() as u64 + 8);

        let last = &hob[hob.len() - 48..];
        assert_eq!(last[24], ResourceType::Unaccepted as u8);
        assert_eq!(u64_at(last, 32), 0x820000);
        assert_eq!(u64_at(last, 40), 0x2000_0000 - 0x820000);
    }

    #[test]
    fn test_high_memory_layout() {
        let hob = build_td_hob(&ResourceConfig::new(4096, 1), None).unwrap();
        assert_eq!(hob.len(), 56 + 48 * 9);

        let low = &hob[hob.len() - 96..hob.len() - 48];
        assert_eq!(u64_at(low, 32), 0x820000);
        assert_eq!(u64_at(low, 40), 0x7F7E_0000);

        let high = &hob[hob.len() - 48..];
        assert_eq!(u64_at(high, 32), 0x1_0000_0000);
        assert_eq!(u64_at(high, 40), 0x1_0000_0000 - 0x8000_0000);
    }

    #[test]
    fn test_split_boundary_changes_layout() {
        let below = build_td_hob(&ResourceConfig::new(2815, 1), None).unwrap();
        let at = build_td_hob(&ResourceConfig::new(2816, 1), None).unwrap();
        assert_eq!(below.len(), 56 + 48 * 8);
        assert_eq!(at.len(), 56 + 48 * 9);
    }

    #[test]
    fn test_custom_base_changes_end_of_list() {
        let resources = ResourceConfig::new(512, 1);
        let a = build_td_hob(&resources, None).unwrap();
        let b = build_td_hob(&resources, Some(0x900000)).unwrap();
        assert_eq!(a[..48], b[..48]);
        assert_eq!(a[56..], b[56..]);
        assert_eq!(u64_at(&b, 48) - u64_at(&a, 48), 0x900000 - 0x809000);
    }

    #[test]
    fn test_resource_hob_layout() {
        let hob = resource_hob(ResourceType::SystemMemory, 0x800000, 0x6000);
        assert_eq!(&hob[0..4], &[0x03, 0x00, 48, 0x00]);
        assert!(hob[4..24].iter().all(|&b| b == 0));
        assert_eq!(hob[24], 0x00);
        assert_eq!(&hob[28..32], &7u32.to_le_bytes());
    }

    #[test]
    fn test_td_hob_digests() {
        use crate::tdx::event::measure_sha384;

        let low = build_td_hob(&ResourceConfig::new(2048, 1), None).unwrap();
        assert_eq!(
            measure_sha384(&low),
            hex_literal::hex!(
                "0e35f1b315ba6c912cf791e5c79dd9d3a2b8704516aa27d4e5aa78fb09ede04aef2bbd02ac7a8734c48562b9c26ba35d"
            )
        );

        let high = build_td_hob(&ResourceConfig::new(4096, 1), None).unwrap();
        assert_eq!(
            measure_sha384(&high),
            hex_literal::hex!(
                "02a008e63d55a77823c04a5513a5810d4e592dc41bf2596267c09eae5d4b4e3b329ae614973fb192297d8833d37a08fd"
            )
        );
    }
}
