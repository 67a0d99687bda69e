//! Disk partition table of the adapter
//!
//! The adapter presents a GPT disk whose first entry is a Microsoft basic
//! data partition. That entry's type GUID doubles as the device identity.

use gpt_disk_io::Disk;
use gpt_disk_types::GptPartitionType;
use uguid::Guid;

use crate::device::{RawDevice, SectorIo};
use crate::error::{MigError, Result};
use crate::layout::{PARTITION_SIGNATURE_LEN, SECTOR_SIZE};

/// Expected bytes at the partition signature offset
pub const ADAPTER_SIGNATURE: [u8; PARTITION_SIGNATURE_LEN] = GptPartitionType::BASIC_DATA.0.to_bytes();

/// Check a 16-byte partition type GUID against the adapter identity
pub fn is_adapter_signature(bytes: &[u8]) -> bool {
    match <[u8; PARTITION_SIGNATURE_LEN]>::try_from(bytes) {
        Ok(raw) => GptPartitionType(Guid::from_bytes(raw)) == GptPartitionType::BASIC_DATA,
        Err(_) => false,
    }
}

/// One used GPT entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub index: usize,
    pub type_guid: Guid,
    pub unique_guid: Guid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub name: String,
}

impl PartitionEntry {
    pub fn is_basic_data(&self) -> bool {
        self.type_guid == GptPartitionType::BASIC_DATA.0
    }

    /// Size in bytes (inclusive LBA range)
    pub fn size(&self) -> u64 {
        (self.last_lba.saturating_sub(self.first_lba) + 1) * SECTOR_SIZE as u64
    }
}

/// Read the primary GPT and list its used entries
pub fn scan(device: &mut dyn RawDevice) -> Result<Vec<PartitionEntry>> {
    let mut disk = Disk::new(SectorIo::new(device)).map_err(disk_error)?;

    let mut block = [0u8; SECTOR_SIZE];
    let header = disk.read_primary_gpt_header(&mut block).map_err(disk_error)?;
    if !header.is_signature_valid() {
        log::warn!("primary GPT header has no EFI PART signature");
        return Ok(Vec::new());
    }

    let layout = header
        .get_partition_entry_array_layout()
        .map_err(|e| io_error(format!("bad partition array layout: {e:?}")))?;

    let mut entries = Vec::new();
    let iter = disk
        .gpt_partition_entry_array_iter(layout, &mut block)
        .map_err(disk_error)?;
    for (index, entry) in iter.enumerate() {
        let entry = entry.map_err(disk_error)?;
        if !entry.is_used() {
            continue;
        }
        entries.push(PartitionEntry {
            index,
            type_guid: entry.partition_type_guid.0,
            unique_guid: entry.unique_partition_guid,
            first_lba: entry.starting_lba.to_u64(),
            last_lba: entry.ending_lba.to_u64(),
            name: entry.name.to_string(),
        });
    }
    Ok(entries)
}

fn disk_error(err: gpt_disk_io::DiskError<MigError>) -> MigError {
    match err {
        gpt_disk_io::DiskError::Io(e) => e,
        other => io_error(other.to_string()),
    }
}

fn io_error(message: String) -> MigError {
    MigError::IoError {
        code: None,
        kind: std::io::ErrorKind::InvalidData,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_data_signature_bytes() {
        assert_eq!(
            ADAPTER_SIGNATURE,
            [
                0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7,
                0x26, 0x99, 0xC7
            ]
        );
        assert!(is_adapter_signature(&ADAPTER_SIGNATURE));
    }

    #[test]
    fn rejects_other_guids() {
        assert!(!is_adapter_signature(&[0u8; 16]));
        assert!(!is_adapter_signature(&GptPartitionType::EFI_SYSTEM.0.to_bytes()));
        assert!(!is_adapter_signature(&ADAPTER_SIGNATURE[..15]));
    }
}
