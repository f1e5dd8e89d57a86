//! TDVF metadata parsing.
//!
//! The OVMF image carries a table of GUID-tagged entries ending 32 bytes
//! before the end of the image. One of those entries holds the offset of the
//! TDVF descriptor, which lists the sections the hypervisor loads into the TD.

use crate::cursor::Cursor;
use crate::error::MeasurementError;
use crate::tdx::event::encode_guid;

/// TDX page size.
pub const PAGE_SIZE: u64 = 0x1000;

/// OVMF table footer GUID.
pub const OVMF_TABLE_FOOTER_GUID: &str = "96b582de-1fb2-45f7-baea-a366c55a082d";

/// OVMF table entry holding the TDX metadata offset.
pub const TDX_METADATA_OFFSET_GUID: &str = "e47a6535-984a-4798-865e-4685a7bf8ec2";

/// Bytes between the end of the OVMF table and the end of the image.
const BYTES_AFTER_TABLE_FOOTER: usize = 32;

/// GUID plus 2-byte length, trailing every OVMF table entry.
const ENTRY_HEADER_LEN: usize = 18;

const DESCRIPTOR_LEN: usize = 16;
const SECTION_LEN: usize = 32;

/// Guest physical address width of a TD. Sections must end at or below it.
pub const MAX_GPA: u64 = 1 << 52;

/// Largest section measured with TDH.MEM.PAGE.ADD.
pub const MAX_PAGE_ADDED_SIZE: u64 = 1 << 32;

/// Section attribute: measure the section contents with MR.EXTEND.
pub const ATTRIBUTE_MR_EXTEND: u32 = 0x0000_0001;

/// Section attribute: pages are added with TDH.MEM.PAGE.AUG (not measured).
pub const ATTRIBUTE_PAGE_AUG: u32 = 0x0000_0002;

/// TDVF section types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdvfSectionType {
    Bfv,
    Cfv,
    TdHob,
    TempMem,
    PermMem,
    Payload,
    PayloadParam,
    Other(u32),
}

impl From<u32> for TdvfSectionType {
    fn from(value: u32) -> Self {
        match value {
            0 => TdvfSectionType::Bfv,
            1 => TdvfSectionType::Cfv,
            2 => TdvfSectionType::TdHob,
            3 => TdvfSectionType::TempMem,
            4 => TdvfSectionType::PermMem,
            5 => TdvfSectionType::Payload,
            6 => TdvfSectionType::PayloadParam,
            other => TdvfSectionType::Other(other),
        }
    }
}

/// One section record of the TDVF descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdvfSection {
    pub data_offset: u32,
    pub raw_data_size: u32,
    pub memory_address: u64,
    pub memory_data_size: u64,
    pub sec_type: TdvfSectionType,
    pub attributes: u32,
}

impl TdvfSection {
    /// Pages of this section are measured by TDH.MEM.PAGE.ADD.
    pub fn is_page_added(&self) -> bool {
        self.attributes & ATTRIBUTE_PAGE_AUG == 0
    }

    /// Contents of this section are measured by TDH.MR.EXTEND.
    pub fn is_mr_extended(&self) -> bool {
        self.attributes & ATTRIBUTE_MR_EXTEND != 0
    }

    pub fn num_pages(&self) -> u64 {
        self.memory_data_size / PAGE_SIZE
    }

    fn parse(cursor: &mut Cursor<'_>) -> Result<Self, MeasurementError> {
        Ok(Self {
            data_offset: cursor.u32_le()?,
            raw_data_size: cursor.u32_le()?,
            memory_address: cursor.u64_le()?,
            memory_data_size: cursor.u64_le()?,
            sec_type: TdvfSectionType::from(cursor.u32_le()?),
            attributes: cursor.u32_le()?,
        })
    }

    fn validate(&self, index: usize, fw_len: usize) -> Result<(), MeasurementError> {
        let invalid = |reason| MeasurementError::InvalidSection { index, reason };

        if self.memory_address % PAGE_SIZE != 0 {
            return Err(invalid("memory address not page aligned"));
        }
        if self.memory_data_size % PAGE_SIZE != 0 {
            return Err(invalid("memory data size not page aligned"));
        }
        let end = self
            .memory_address
            .checked_add(self.memory_data_size)
            .ok_or_else(|| invalid("section address range overflows"))?;
        if end > MAX_GPA {
            return Err(invalid("section address range exceeds the TD GPA width"));
        }
        if self.is_page_added() && self.memory_data_size > MAX_PAGE_ADDED_SIZE {
            return Err(invalid("page-added section larger than 4 GiB"));
        }
        if self.memory_data_size < u64::from(self.raw_data_size) {
            return Err(invalid("memory data size smaller than raw data size"));
        }
        if self.is_mr_extended() && u64::from(self.raw_data_size) < self.memory_data_size {
            return Err(invalid("raw data size smaller than measured memory size"));
        }
        let raw_end = u64::from(self.data_offset) + u64::from(self.raw_data_size);
        if raw_end > fw_len as u64 {
            return Err(invalid("raw data extends past end of firmware"));
        }
        Ok(())
    }
}

/// Parsed TDVF metadata.
#[derive(Debug, Clone)]
pub struct TdvfMetadata {
    pub sections: Vec<TdvfSection>,
}

impl TdvfMetadata {
    /// Parse the TDVF metadata from a firmware image.
    pub fn parse(fw: &[u8]) -> Result<Self, MeasurementError> {
        let fw_cursor = Cursor::new(fw);
        let footer_end = fw
            .len()
            .checked_sub(BYTES_AFTER_TABLE_FOOTER)
            .ok_or(MeasurementError::Truncated {
                offset: 0,
                needed: BYTES_AFTER_TABLE_FOOTER,
                len: fw.len(),
            })?;
        let footer_start =
            footer_end
                .checked_sub(ENTRY_HEADER_LEN)
                .ok_or(MeasurementError::Truncated {
                    offset: 0,
                    needed: BYTES_AFTER_TABLE_FOOTER + ENTRY_HEADER_LEN,
                    len: fw.len(),
                })?;

        let footer_guid = fw_cursor.slice(footer_end - 16, 16)?;
        if footer_guid != encode_guid(OVMF_TABLE_FOOTER_GUID)? {
            return Err(MeasurementError::InvalidFooterGuid {
                offset: footer_end - 16,
            });
        }

        // The footer length covers the whole table including the footer entry.
        let tables_len = Cursor::at(fw, footer_start).u16_le()? as usize;
        if tables_len < ENTRY_HEADER_LEN || tables_len > footer_end {
            return Err(MeasurementError::InvalidTablesLength {
                offset: footer_start,
                length: tables_len,
            });
        }
        let tables_start = footer_end - tables_len;
        let tables = fw_cursor.slice(tables_start, tables_len - ENTRY_HEADER_LEN)?;

        let data = find_table_entry(tables, tables_start, TDX_METADATA_OFFSET_GUID)?
            .ok_or(MeasurementError::MetadataNotFound)?;
        if data.len() < 4 {
            return Err(MeasurementError::InvalidEntryLength {
                offset: tables_start,
                length: data.len() + ENTRY_HEADER_LEN,
            });
        }
        let meta_offset = Cursor::at(data, data.len() - 4).u32_le()? as usize;
        let descriptor_offset =
            fw.len()
                .checked_sub(meta_offset)
                .ok_or(MeasurementError::InvalidMetadataOffset {
                    offset: meta_offset,
                    len: fw.len(),
                })?;

        let mut cursor = Cursor::at(fw, descriptor_offset);
        if cursor.take(4)? != b"TDVF" {
            return Err(MeasurementError::InvalidDescriptorSignature {
                offset: descriptor_offset,
            });
        }
        let _length = cursor.u32_le()?;
        let version = cursor.u32_le()?;
        if version != 1 {
            return Err(MeasurementError::UnsupportedDescriptorVersion { version });
        }
        let num_sections = cursor.u32_le()? as usize;

        // Bound the section count by the bytes actually present.
        let available = fw.len() - descriptor_offset - DESCRIPTOR_LEN;
        if num_sections > available / SECTION_LEN {
            return Err(MeasurementError::Truncated {
                offset: descriptor_offset + DESCRIPTOR_LEN,
                needed: num_sections.saturating_mul(SECTION_LEN),
                len: fw.len(),
            });
        }

        let mut sections = Vec::with_capacity(num_sections);
        for index in 0..num_sections {
            let section = TdvfSection::parse(&mut cursor)?;
            section.validate(index, fw.len())?;
            log::trace!("TDVF section {index}: {section:?}");
            sections.push(section);
        }

        Ok(Self { sections })
    }

    /// Guest physical address of the TD HOB section, if present.
    pub fn td_hob_address(&self) -> Option<u64> {
        self.sections
            .iter()
            .find(|s| s.sec_type == TdvfSectionType::TdHob)
            .map(|s| s.memory_address)
    }
}

/// Walk the OVMF table backwards looking for the entry tagged with `guid`.
///
/// Each entry is laid out as `[data][u16 length][GUID]`, where the length
/// covers the whole entry. Returns the entry's data bytes.
fn find_table_entry<'a>(
    tables: &'a [u8],
    base: usize,
    guid: &str,
) -> Result<Option<&'a [u8]>, MeasurementError> {
    let wanted = encode_guid(guid)?;
    let cursor = Cursor::new(tables);
    let mut end = tables.len();

    while end >= ENTRY_HEADER_LEN {
        let entry_guid = cursor.slice(end - 16, 16)?;
        let entry_len = Cursor::at(tables, end - ENTRY_HEADER_LEN).u16_le()? as usize;
        if entry_len < ENTRY_HEADER_LEN || entry_len > end {
            return Err(MeasurementError::InvalidEntryLength {
                offset: base + end - ENTRY_HEADER_LEN,
                length: entry_len,
            });
        }
        let start = end - entry_len;
        if entry_guid == wanted {
            return Ok(Some(cursor.slice(start, entry_len - ENTRY_HEADER_LEN)?));
        }
        end = start;
    }
    Ok(None)
}
