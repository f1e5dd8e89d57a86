//! ACPI table generation.
//!
//! Reproduces the three firmware config blobs QEMU exposes to TDVF
//! (`etc/acpi/tables`, `etc/acpi/rsdp` and `etc/table-loader`). TDVF measures
//! each blob into RTMR0, so they have to match QEMU byte for byte.
//!
//! Tables come from a captured dump for the VM's CPU count (see
//! [`AcpiTemplates`]). Only the DSDT PCI memory window and the pointer fields
//! depend on the VM resources and are filled in here.

pub mod loader;
pub mod template;

use crate::config::ResourceConfig;
use crate::cursor::{read_u32, write_bytes};
use crate::error::MeasurementError;

use loader::{AllocZone, TableLoader, RSDP_FILE, TABLES_FILE};

pub use template::AcpiTemplates;

/// Size of the standard ACPI description header.
const ACPI_HEADER_LEN: usize = 36;

/// Offset of the checksum byte in a description header.
const ACPI_CHECKSUM_OFFSET: usize = 9;

/// FADT fields linked by the loader.
const FACP_FIRMWARE_CTRL: usize = 36;
const FACP_DSDT: usize = 40;
const FACP_X_DSDT: usize = 140;

const RSDP_LEN: usize = 20;
const RSDP_CHECKSUM_OFFSET: u32 = 8;
const RSDP_RSDT_ADDRESS: u32 = 16;

/// Tables referenced from the RSDT, in entry order.
const RSDT_TABLES: [&str; 4] = ["FACP", "APIC", "MCFG", "WAET"];

/// First byte above the 32-bit PCI MMIO window (the MCFG base).
const PCI_WINDOW_END: u64 = 0xB000_0000;

/// Start of the PCI window when RAM is split around it.
const HIGH_MEMORY_PCI_START: u64 = 0x8000_0000;

/// `_MAX` of the DSDT memory descriptor that describes the PCI window.
const PCI_WINDOW_MAX: u32 = 0xAFFF_FFFF;

/// DWord address space descriptor tag, length 0x17, memory resource type.
const DWORD_MEMORY_DESCRIPTOR: [u8; 4] = [0x87, 0x17, 0x00, 0x00];
const DESCRIPTOR_MIN: usize = 10;
const DESCRIPTOR_MAX: usize = 14;
const DESCRIPTOR_LENGTH: usize = 22;
const DESCRIPTOR_LEN: usize = 26;

/// The three blobs TDVF measures, in measurement order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcpiTables {
    /// `etc/acpi/tables`.
    pub tables: Vec<u8>,
    /// `etc/acpi/rsdp`.
    pub rsdp: Vec<u8>,
    /// `etc/table-loader`, padded to its fixed size.
    pub loader: Vec<u8>,
}

/// Location of one table inside the tables blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TableEntry {
    signature: [u8; 4],
    offset: usize,
    len: usize,
}

impl TableEntry {
    fn offset_u32(&self) -> u32 {
        self.offset as u32
    }

    fn len_u32(&self) -> u32 {
        self.len as u32
    }
}

/// Walk the concatenated `[signature][length]` tables.
fn scan_tables(tables: &[u8]) -> Result<Vec<TableEntry>, MeasurementError> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < tables.len() {
        let mut signature = [0u8; 4];
        signature.copy_from_slice(
            tables
                .get(offset..offset + 4)
                .ok_or(MeasurementError::InvalidAcpiTable {
                    offset,
                    reason: "truncated table signature",
                })?,
        );
        let len = read_u32(tables, offset + 4)? as usize;
        if len < 8 || offset + len > tables.len() {
            return Err(MeasurementError::InvalidAcpiTable {
                offset,
                reason: "table length out of bounds",
            });
        }
        entries.push(TableEntry {
            signature,
            offset,
            len,
        });
        offset += len;
    }
    Ok(entries)
}

fn find_table(
    entries: &[TableEntry],
    signature: &'static str,
    min_len: usize,
) -> Result<TableEntry, MeasurementError> {
    let entry = entries
        .iter()
        .find(|e| &e.signature[..] == signature.as_bytes())
        .copied()
        .ok_or(MeasurementError::AcpiTableNotFound { signature })?;
    if entry.len < min_len {
        return Err(MeasurementError::InvalidAcpiTable {
            offset: entry.offset,
            reason: "table shorter than its fixed fields",
        });
    }
    Ok(entry)
}

/// Start of the 32-bit PCI MMIO window for the given resources.
fn pci_window_start(resources: &ResourceConfig) -> u64 {
    if resources.is_high_memory() {
        HIGH_MEMORY_PCI_START
    } else {
        resources.memory_bytes()
    }
}

/// Rewrite `_MIN` and the length of the DSDT PCI memory window.
fn patch_dsdt(
    tables: &mut [u8],
    dsdt: TableEntry,
    resources: &ResourceConfig,
) -> Result<(), MeasurementError> {
    let body = &tables[dsdt.offset..dsdt.offset + dsdt.len];
    let position = body
        .windows(DESCRIPTOR_LEN)
        .position(|w| {
            w[..4] == DWORD_MEMORY_DESCRIPTOR
                && read_u32(w, DESCRIPTOR_MAX).map_or(false, |max| max == PCI_WINDOW_MAX)
        })
        .ok_or(MeasurementError::InvalidAcpiTable {
            offset: dsdt.offset,
            reason: "PCI memory window descriptor not found",
        })?;
    let descriptor = dsdt.offset + position;

    let start = pci_window_start(resources);
    let length = PCI_WINDOW_END - start;
    log::trace!("ACPI: PCI window {start:#x}..{PCI_WINDOW_END:#x}");

    write_bytes(
        tables,
        descriptor + DESCRIPTOR_MIN,
        &(start as u32).to_le_bytes(),
    )?;
    write_bytes(
        tables,
        descriptor + DESCRIPTOR_LENGTH,
        &(length as u32).to_le_bytes(),
    )?;
    Ok(())
}

fn build_rsdp() -> Vec<u8> {
    let mut rsdp = Vec::with_capacity(RSDP_LEN);
    rsdp.extend_from_slice(b"RSD PTR "); // Signature
    rsdp.push(0); // Checksum
    rsdp.extend_from_slice(b"BOCHS "); // OEMID
    rsdp.push(0); // Revision
    rsdp.extend_from_slice(&[0u8; 4]); // RsdtAddress
    rsdp
}

/// Generate the ACPI blobs QEMU would expose for `resources`.
///
/// Fails with [`MeasurementError::MissingAcpiTemplate`] when `templates` has
/// no dump for the requested CPU count.
pub fn generate_tables(
    resources: &ResourceConfig,
    templates: &AcpiTemplates,
) -> Result<AcpiTables, MeasurementError> {
    resources.validate()?;
    let mut tables = templates.get(resources.cpu_count)?.to_vec();
    let entries = scan_tables(&tables)?;

    let facs = find_table(&entries, "FACS", 8)?;
    let dsdt = find_table(&entries, "DSDT", ACPI_HEADER_LEN)?;
    let facp = find_table(&entries, "FACP", FACP_X_DSDT + 8)?;
    let rsdt = find_table(
        &entries,
        "RSDT",
        ACPI_HEADER_LEN + 4 * RSDT_TABLES.len(),
    )?;

    patch_dsdt(&mut tables, dsdt, resources)?;

    let mut loader = TableLoader::new();
    loader.allocate(RSDP_FILE, 16, AllocZone::FSeg);
    loader.allocate(TABLES_FILE, 64, AllocZone::High);

    loader.add_checksum(
        TABLES_FILE,
        dsdt.offset_u32() + ACPI_CHECKSUM_OFFSET as u32,
        dsdt.offset_u32(),
        dsdt.len_u32(),
    );

    for (field, size, target) in [
        (FACP_FIRMWARE_CTRL, 4, facs),
        (FACP_DSDT, 4, dsdt),
        (FACP_X_DSDT, 8, dsdt),
    ] {
        loader.add_pointer(
            &mut tables,
            TABLES_FILE,
            TABLES_FILE,
            (facp.offset + field) as u32,
            size,
            target.offset_u32(),
        )?;
    }

    let mut linked = Vec::with_capacity(RSDT_TABLES.len());
    for signature in RSDT_TABLES {
        let table = find_table(&entries, signature, ACPI_HEADER_LEN)?;
        loader.add_checksum(
            TABLES_FILE,
            table.offset_u32() + ACPI_CHECKSUM_OFFSET as u32,
            table.offset_u32(),
            table.len_u32(),
        );
        linked.push(table);
    }

    for (i, table) in linked.iter().enumerate() {
        loader.add_pointer(
            &mut tables,
            TABLES_FILE,
            TABLES_FILE,
            (rsdt.offset + ACPI_HEADER_LEN + 4 * i) as u32,
            4,
            table.offset_u32(),
        )?;
    }
    loader.add_checksum(
        TABLES_FILE,
        rsdt.offset_u32() + ACPI_CHECKSUM_OFFSET as u32,
        rsdt.offset_u32(),
        rsdt.len_u32(),
    );

    let mut rsdp = build_rsdp();
    loader.add_pointer(
        &mut rsdp,
        RSDP_FILE,
        TABLES_FILE,
        RSDP_RSDT_ADDRESS,
        4,
        rsdt.offset_u32(),
    )?;
    loader.add_checksum(RSDP_FILE, RSDP_CHECKSUM_OFFSET, 0, RSDP_LEN as u32);

    log::debug!(
        "ACPI: {} CPUs, tables {} bytes, {} loader commands",
        resources.cpu_count,
        tables.len(),
        loader.len()
    );

    Ok(AcpiTables {
        tables,
        rsdp,
        loader: loader.finish()?,
    })
}
