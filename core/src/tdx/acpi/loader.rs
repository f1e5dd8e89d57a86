//! QEMU `etc/table-loader` command stream.
//!
//! Firmware executes these commands to allocate the ACPI blobs, link
//! pointers between them and fix up checksums. The stream is measured
//! verbatim, so every record must match QEMU's `BiosLinkerLoaderEntry`
//! layout byte for byte.

use crate::cursor::{read_u32, write_bytes};
use crate::error::MeasurementError;

/// Fixed size of the command stream.
pub const LOADER_LEN: usize = 4096;

/// Size of one command record.
pub const COMMAND_LEN: usize = 128;

/// Size of a zero-padded file name field.
pub const FILE_NAME_LEN: usize = 56;

pub const RSDP_FILE: &str = "etc/acpi/rsdp";
pub const TABLES_FILE: &str = "etc/acpi/tables";

const COMMAND_ALLOCATE: u32 = 0x1;
const COMMAND_ADD_POINTER: u32 = 0x2;
const COMMAND_ADD_CHECKSUM: u32 = 0x3;

/// Allocation zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AllocZone {
    High = 0x1,
    FSeg = 0x2,
}

fn file_name(name: &str) -> [u8; FILE_NAME_LEN] {
    let mut out = [0u8; FILE_NAME_LEN];
    let len = name.len().min(FILE_NAME_LEN - 1);
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

/// Accumulates loader commands.
#[derive(Debug, Default)]
pub struct TableLoader {
    commands: Vec<u8>,
}

impl TableLoader {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, command: u32, body: &[u8]) {
        let mut record = [0u8; COMMAND_LEN];
        record[..4].copy_from_slice(&command.to_le_bytes());
        record[4..4 + body.len()].copy_from_slice(body);
        self.commands.extend_from_slice(&record);
    }

    /// `ALLOCATE`: file, alignment, zone.
    pub fn allocate(&mut self, file: &str, align: u32, zone: AllocZone) {
        let mut body = Vec::with_capacity(FILE_NAME_LEN + 5);
        body.extend_from_slice(&file_name(file));
        body.extend_from_slice(&align.to_le_bytes());
        body.push(zone as u8);
        self.push(COMMAND_ALLOCATE, &body);
    }

    /// `ADD_POINTER`: make the `size`-byte field at `offset` in `dest_file`
    /// point at `src_offset` inside `src_file`.
    ///
    /// Like QEMU's linker, this also stores `src_offset` into the destination
    /// blob; firmware later adds the allocated base address.
    pub fn add_pointer(
        &mut self,
        dest: &mut [u8],
        dest_file: &str,
        src_file: &str,
        offset: u32,
        size: u8,
        src_offset: u32,
    ) -> Result<(), MeasurementError> {
        let value = u64::from(src_offset).to_le_bytes();
        write_bytes(dest, offset as usize, &value[..size as usize])?;

        let mut body = Vec::with_capacity(2 * FILE_NAME_LEN + 5);
        body.extend_from_slice(&file_name(dest_file));
        body.extend_from_slice(&file_name(src_file));
        body.extend_from_slice(&offset.to_le_bytes());
        body.push(size);
        self.push(COMMAND_ADD_POINTER, &body);
        Ok(())
    }

    /// `ADD_CHECKSUM`: checksum byte at `offset` covers `start..start+length`.
    pub fn add_checksum(&mut self, file: &str, offset: u32, start: u32, length: u32) {
        let mut body = Vec::with_capacity(FILE_NAME_LEN + 12);
        body.extend_from_slice(&file_name(file));
        body.extend_from_slice(&offset.to_le_bytes());
        body.extend_from_slice(&start.to_le_bytes());
        body.extend_from_slice(&length.to_le_bytes());
        self.push(COMMAND_ADD_CHECKSUM, &body);
    }

    /// Number of commands recorded so far.
    pub fn len(&self) -> usize {
        self.commands.len() / COMMAND_LEN
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Zero-pad the stream to exactly [`LOADER_LEN`] bytes.
    pub fn finish(self) -> Result<Vec<u8>, MeasurementError> {
        let mut commands = self.commands;
        if commands.len() > LOADER_LEN {
            return Err(MeasurementError::LoaderOverflow {
                len: commands.len(),
                limit: LOADER_LEN,
            });
        }
        commands.resize(LOADER_LEN, 0);
        Ok(commands)
    }
}

/// Command code of the record at `index`, for inspection.
pub fn command_at(stream: &[u8], index: usize) -> Result<u32, MeasurementError> {
    read_u32(stream, index * COMMAND_LEN)
}
