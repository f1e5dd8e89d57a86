//! Authenticode SHA-384 digest of a PE/COFF image.
//!
//! This is the digest UEFI firmware extends for an EFI application: the image
//! minus the checksum field, the certificate table directory entry and the
//! certificate table itself, with sections hashed in file order. Header and
//! section table parsing is done by `object`.

use std::mem;

use object::pe::{self, ImageDosHeader, ImageFileHeader};
use object::read::pe::{ImageNtHeaders, ImageOptionalHeader};
use object::LittleEndian as LE;
use sha2::{Digest, Sha384};

use crate::error::MeasurementError;

/// Offset of `CheckSum` inside both optional header layouts.
const CHECKSUM_OFFSET: usize = 64;

/// Size of one data directory entry.
const DATA_DIRECTORY_LEN: usize = mem::size_of::<pe::ImageDataDirectory>();

fn invalid(reason: impl std::fmt::Display) -> MeasurementError {
    MeasurementError::InvalidKernel(reason.to_string())
}

/// Compute the Authenticode SHA-384 digest of `data`.
pub fn authenticode_sha384(data: &[u8]) -> Result<[u8; 48], MeasurementError> {
    match object::read::pe::optional_header_magic(data).map_err(invalid)? {
        pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC => digest::<pe::ImageNtHeaders64>(data),
        pe::IMAGE_NT_OPTIONAL_HDR32_MAGIC => digest::<pe::ImageNtHeaders32>(data),
        _ => Err(invalid("unknown optional header magic")),
    }
}

fn digest<Pe: ImageNtHeaders>(data: &[u8]) -> Result<[u8; 48], MeasurementError> {
    let dos = ImageDosHeader::parse(data).map_err(invalid)?;
    let nt_offset = u64::from(dos.nt_headers_offset());
    let mut offset = nt_offset;
    let (nt_headers, data_directories) = Pe::parse(data, &mut offset).map_err(invalid)?;
    let sections = nt_headers.sections(data, offset).map_err(invalid)?;

    let optional = nt_offset as usize + 4 + mem::size_of::<ImageFileHeader>();
    let checksum = optional + CHECKSUM_OFFSET;
    let size_of_headers = nt_headers.optional_header().size_of_headers() as usize;

    // Directory entry offset and table size, when the image has the entry.
    let cert = data_directories
        .get(pe::IMAGE_DIRECTORY_ENTRY_SECURITY)
        .map(|dir| {
            let entry = optional
                + mem::size_of::<Pe::ImageOptionalHeader>()
                + pe::IMAGE_DIRECTORY_ENTRY_SECURITY * DATA_DIRECTORY_LEN;
            (entry, dir.size.get(LE) as usize)
        });

    let headers_end = cert.map_or(checksum + 4, |(entry, _)| entry + DATA_DIRECTORY_LEN);
    if headers_end > size_of_headers || size_of_headers > data.len() {
        return Err(invalid("headers exceed image size"));
    }

    let mut hasher = Sha384::new();
    hasher.update(&data[..checksum]);
    match cert {
        Some((entry, _)) => {
            hasher.update(&data[checksum + 4..entry]);
            hasher.update(&data[entry + DATA_DIRECTORY_LEN..size_of_headers]);
        }
        None => hasher.update(&data[checksum + 4..size_of_headers]),
    }
    let mut hashed = size_of_headers;

    let mut raw_sections: Vec<(usize, usize)> = sections
        .iter()
        .map(|section| {
            (
                section.pointer_to_raw_data.get(LE) as usize,
                section.size_of_raw_data.get(LE) as usize,
            )
        })
        .filter(|&(_, size)| size > 0)
        .collect();
    raw_sections.sort_by_key(|&(start, _)| start);

    for (start, size) in raw_sections {
        // Sections may claim more raw data than the file holds.
        let end = start.saturating_add(size).min(data.len());
        if start < end {
            hasher.update(&data[start..end]);
        }
        hashed += size;
    }

    let cert_table_size = cert.map_or(0, |(_, size)| size);
    if cert_table_size > 0 && data.len() > hashed {
        let trailing = data.len() - hashed;
        if trailing > cert_table_size {
            hasher.update(&data[hashed..hashed + trailing - cert_table_size]);
        }
    }

    let remainder = data.len() % 8;
    if remainder != 0 {
        hasher.update(&[0u8; 8][..8 - remainder]);
    }

    Ok(hasher.finalize().into())
}
