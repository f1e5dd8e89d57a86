//! MRTD computation.
//!
//! Replays the TDH.MEM.PAGE.ADD / TDH.MR.EXTEND sequence the hypervisor issues
//! while building the TD, hashing the same 128-byte records the TDX module
//! feeds into MRTD.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};

use crate::cursor::Cursor;
use crate::error::MeasurementError;
use crate::tdx::tdvf::{TdvfMetadata, TdvfSection, PAGE_SIZE};

/// Bytes measured per TDH.MR.EXTEND call.
pub const MR_EXTEND_GRANULARITY: u64 = 0x100;

const TDCALL_RECORD_LEN: usize = 128;
const GPA_OFFSET: usize = 16;

/// Order in which the hypervisor adds and measures pages.
///
/// QEMU releases disagree, and the deployed version is not known when the
/// bundle is built, so both are always computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MrtdVariant {
    /// All pages of a section are added before any of that section's pages
    /// is extended.
    TwoPass,
    /// Each page is added and then extended.
    SinglePass,
}

impl MrtdVariant {
    /// Every supported variant, in output order.
    pub const ALL: [MrtdVariant; 2] = [MrtdVariant::TwoPass, MrtdVariant::SinglePass];

    pub fn name(&self) -> &'static str {
        match self {
            MrtdVariant::TwoPass => "two_pass",
            MrtdVariant::SinglePass => "single_pass",
        }
    }
}

impl fmt::Display for MrtdVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn tdcall_record(tag: &[u8], gpa: u64) -> [u8; TDCALL_RECORD_LEN] {
    let mut buf = [0u8; TDCALL_RECORD_LEN];
    buf[..tag.len()].copy_from_slice(tag);
    buf[GPA_OFFSET..GPA_OFFSET + 8].copy_from_slice(&gpa.to_le_bytes());
    buf
}

struct MrtdHasher<'a> {
    fw: Cursor<'a>,
    h: Sha384,
}

/// Guest address `offset` bytes into section `index`.
fn section_gpa(s: &TdvfSection, index: usize, offset: u64) -> Result<u64, MeasurementError> {
    s.memory_address
        .checked_add(offset)
        .ok_or(MeasurementError::InvalidSection {
            index,
            reason: "section address range overflows",
        })
}

impl MrtdHasher<'_> {
    fn page_add(
        &mut self,
        s: &TdvfSection,
        index: usize,
        page: u64,
    ) -> Result<(), MeasurementError> {
        if s.is_page_added() {
            let gpa = section_gpa(s, index, page * PAGE_SIZE)?;
            self.h.update(tdcall_record(b"MEM.PAGE.ADD", gpa));
        }
        Ok(())
    }

    fn mr_extend(
        &mut self,
        s: &TdvfSection,
        index: usize,
        page: u64,
    ) -> Result<(), MeasurementError> {
        if !s.is_mr_extended() {
            return Ok(());
        }
        for chunk in 0..PAGE_SIZE / MR_EXTEND_GRANULARITY {
            let offset = page * PAGE_SIZE + chunk * MR_EXTEND_GRANULARITY;
            self.h
                .update(tdcall_record(b"MR.EXTEND", section_gpa(s, index, offset)?));

            let data_offset = u64::from(s.data_offset) + offset;
            let data = self
                .fw
                .slice(data_offset as usize, MR_EXTEND_GRANULARITY as usize)?;
            self.h.update(data);
        }
        Ok(())
    }
}

/// Compute MRTD for one page-ordering variant.
///
/// `TwoPass` orders records per section: every page of a section is added
/// before that section is extended, then the next section starts.
pub fn compute_mrtd(
    fw: &[u8],
    meta: &TdvfMetadata,
    variant: MrtdVariant,
) -> Result<[u8; 48], MeasurementError> {
    let mut hasher = MrtdHasher {
        fw: Cursor::new(fw),
        h: Sha384::new(),
    };

    for (index, s) in meta.sections.iter().enumerate() {
        if !s.is_page_added() && !s.is_mr_extended() {
            continue;
        }
        let num_pages = s.num_pages();
        match variant {
            MrtdVariant::TwoPass => {
                for page in 0..num_pages {
                    hasher.page_add(s, index, page)?;
                }
                for page in 0..num_pages {
                    hasher.mr_extend(s, index, page)?;
                }
            }
            MrtdVariant::SinglePass => {
                for page in 0..num_pages {
                    hasher.page_add(s, index, page)?;
                    hasher.mr_extend(s, index, page)?;
                }
            }
        }
    }

    Ok(hasher.h.finalize().into())
}

/// Compute MRTD for every supported variant.
///
/// The variants share no state, so they are hashed on separate threads.
/// Results are returned in [`MrtdVariant::ALL`] order.
pub fn compute_all_mrtds(
    fw: &[u8],
    meta: &TdvfMetadata,
) -> Result<Vec<(MrtdVariant, [u8; 48])>, MeasurementError> {
    let results: Vec<Result<[u8; 48], MeasurementError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = MrtdVariant::ALL
            .iter()
            .map(|&variant| scope.spawn(move || compute_mrtd(fw, meta, variant)))
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            })
            .collect()
    });

    MrtdVariant::ALL
        .into_iter()
        .zip(results)
        .map(|(variant, mrtd)| {
            let mrtd = mrtd?;
            log::debug!("MRTD ({variant}): {}", hex::encode(mrtd));
            Ok((variant, mrtd))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tdx::tdvf::tests::{build_firmware, td_hob_section, TestSection};
    use crate::tdx::tdvf::{TdvfSectionType, ATTRIBUTE_MR_EXTEND, ATTRIBUTE_PAGE_AUG};

    fn two_page_bfv() -> TestSection {
        TestSection {
            sec_type: 0,
            attributes: ATTRIBUTE_MR_EXTEND,
            memory_address: 0xFFC0_0000,
            pages: 2,
            fill: 0x5a,
        }
    }

    #[test]
    fn test_mrtd_is_deterministic() {
        let fw = build_firmware(&[two_page_bfv(), td_hob_section()]);
        let meta = TdvfMetadata::parse(&fw).unwrap();
        for variant in MrtdVariant::ALL {
            let a = compute_mrtd(&fw, &meta, variant).unwrap();
            let b = compute_mrtd(&fw, &meta, variant).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_single_page_section_orders_agree() {
        // With one page, add-then-extend is the same sequence in both orders.
        let fw = build_firmware(&[td_hob_section()]);
        let meta = TdvfMetadata::parse(&fw).unwrap();
        let two = compute_mrtd(&fw, &meta, MrtdVariant::TwoPass).unwrap();
        let single = compute_mrtd(&fw, &meta, MrtdVariant::SinglePass).unwrap();
        assert_eq!(two.len(), 48);
        assert_eq!(two, single);
    }

    #[test]
    fn test_variants_differ_for_multi_page_sections() {
        let fw = build_firmware(&[two_page_bfv()]);
        let meta = TdvfMetadata::parse(&fw).unwrap();
        let all = compute_all_mrtds(&fw, &meta).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, MrtdVariant::TwoPass);
        assert_eq!(all[1].0, MrtdVariant::SinglePass);
        assert_ne!(all[0].1, all[1].1);
    }

    #[test]
    fn test_single_pass_record_sequence() {
        let fw = build_firmware(&[td_hob_section()]);
        let meta = TdvfMetadata::parse(&fw).unwrap();

        let mut h = Sha384::new();
        h.update(tdcall_record(b"MEM.PAGE.ADD", 0x809000));
        for chunk in 0..16u64 {
            h.update(tdcall_record(b"MR.EXTEND", 0x809000 + chunk * 0x100));
            let start = (chunk * 0x100) as usize;
            h.update(&fw[start..start + 0x100]);
        }
        let expected: [u8; 48] = h.finalize().into();

        assert_eq!(
            compute_mrtd(&fw, &meta, MrtdVariant::SinglePass).unwrap(),
            expected
        );
    }

    #[test]
    fn test_page_aug_sections_are_not_measured() {
        let fw = build_firmware(&[TestSection {
            sec_type: 3,
            attributes: ATTRIBUTE_PAGE_AUG,
            memory_address: 0x80B000,
            pages: 4,
            fill: 0,
        }]);
        let meta = TdvfMetadata::parse(&fw).unwrap();
        let mrtd = compute_mrtd(&fw, &meta, MrtdVariant::TwoPass).unwrap();
        let empty: [u8; 48] = Sha384::new().finalize().into();
        assert_eq!(mrtd, empty);
    }

    #[test]
    fn test_address_overflow_is_an_error() {
        // Bypasses parse-time validation to exercise the hasher itself.
        let meta = TdvfMetadata {
            sections: vec![TdvfSection {
                data_offset: 0,
                raw_data_size: 0,
                memory_address: 0xFFFF_FFFF_FFFF_F000,
                memory_data_size: 2 * PAGE_SIZE,
                sec_type: TdvfSectionType::TempMem,
                attributes: 0,
            }],
        };
        for variant in MrtdVariant::ALL {
            assert!(matches!(
                compute_mrtd(&[], &meta, variant),
                Err(MeasurementError::InvalidSection { index: 0, .. })
            ));
        }
    }

    #[test]
    fn test_unmeasured_sections_are_skipped() {
        let meta = TdvfMetadata {
            sections: vec![TdvfSection {
                data_offset: 0,
                raw_data_size: 0,
                memory_address: 0,
                memory_data_size: 1 << 50,
                sec_type: TdvfSectionType::PermMem,
                attributes: ATTRIBUTE_PAGE_AUG,
            }],
        };
        let empty: [u8; 48] = Sha384::new().finalize().into();
        assert_eq!(compute_mrtd(&[], &meta, MrtdVariant::TwoPass).unwrap(), empty);
    }

    #[test]
    fn test_tdcall_record_layout() {
        let rec = tdcall_record(b"MR.EXTEND", 0x1122334455667788);
        assert_eq!(&rec[..9], b"MR.EXTEND");
        assert!(rec[9..16].iter().all(|&b| b == 0));
        assert_eq!(&rec[16..24], &0x1122334455667788u64.to_le_bytes());
        assert!(rec[24..].iter().all(|&b| b == 0));
    }
}
