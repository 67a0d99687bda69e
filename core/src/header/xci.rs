//! Cartridge image (XCI) header
//!
//! The header occupies one 0x200-byte region. The leading 0x100 bytes are an
//! RSA signature over the rest; the magic `HEAD` follows at 0x100. Only a
//! header whose magic matches may be used to bound I/O.

use crate::error::{MigError, Result};
use crate::layout::{IMAGE_HEADER_MAGIC_OFFSET, IMAGE_HEADER_SIZE, SECTOR_SIZE};

/// Header magic tag
pub const HEADER_MAGIC: [u8; 4] = *b"HEAD";

const GIB: u64 = 1024 * 1024 * 1024;

/// Physical cartridge capacity class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityClass {
    Gb1,
    Gb2,
    Gb4,
    Gb8,
    Gb16,
    Gb32,
}

impl CapacityClass {
    /// Look up the class for a header code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0xFA => Some(Self::Gb1),
            0xF8 => Some(Self::Gb2),
            0xF0 => Some(Self::Gb4),
            0xE0 => Some(Self::Gb8),
            0xE1 => Some(Self::Gb16),
            0xE2 => Some(Self::Gb32),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Gb1 => 0xFA,
            Self::Gb2 => 0xF8,
            Self::Gb4 => 0xF0,
            Self::Gb8 => 0xE0,
            Self::Gb16 => 0xE1,
            Self::Gb32 => 0xE2,
        }
    }

    /// Capacity in bytes
    pub fn bytes(self) -> u64 {
        match self {
            Self::Gb1 => GIB,
            Self::Gb2 => 2 * GIB,
            Self::Gb4 => 4 * GIB,
            Self::Gb8 => 8 * GIB,
            Self::Gb16 => 16 * GIB,
            Self::Gb32 => 32 * GIB,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Gb1 => "1GB",
            Self::Gb2 => "2GB",
            Self::Gb4 => "4GB",
            Self::Gb8 => "8GB",
            Self::Gb16 => "16GB",
            Self::Gb32 => "32GB",
        }
    }
}

/// Parsed cartridge image header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartridgeImageHeader {
    pub signature: [u8; 0x100],
    pub magic: [u8; 4],
    /// Secure area start, in media units
    pub secure_area_start: u32,
    /// Backup area start, in media units
    pub backup_area_start: u32,
    pub title_key_dec_index: u8,
    /// Capacity class code (see [`CapacityClass`])
    pub capacity_code: u8,
    pub header_version: u8,
    pub flags: u8,
    pub package_id: u64,
    /// Last valid sector of the image
    pub valid_data_end: u64,
    pub iv: [u8; 16],
    pub partition_table_offset: u64,
    pub partition_table_size: u64,
    pub partition_table_hash: [u8; 32],
    pub initial_data_hash: [u8; 32],
    pub secure_mode_flag: u8,
    pub title_key_flag: u8,
    pub key_flag: u8,
    pub normal_area_end: u32,
}

impl CartridgeImageHeader {
    /// Parse a header from the start of `buf`
    ///
    /// Never validates: check [`valid`](Self::valid) before trusting any
    /// size field.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < IMAGE_HEADER_SIZE {
            return Err(MigError::HeaderTooShort(buf.len()));
        }
        let m = IMAGE_HEADER_MAGIC_OFFSET as usize;

        Ok(Self {
            signature: array(buf, 0),
            magic: array(buf, m),
            secure_area_start: le_u32(buf, 0x104),
            backup_area_start: le_u32(buf, 0x108),
            title_key_dec_index: buf[0x10C],
            capacity_code: buf[0x10D],
            header_version: buf[0x10E],
            flags: buf[0x10F],
            package_id: le_u64(buf, 0x110),
            valid_data_end: le_u64(buf, 0x118),
            iv: array(buf, 0x120),
            partition_table_offset: le_u64(buf, 0x130),
            partition_table_size: le_u64(buf, 0x138),
            partition_table_hash: array(buf, 0x140),
            initial_data_hash: array(buf, 0x160),
            secure_mode_flag: buf[0x180],
            title_key_flag: buf[0x181],
            key_flag: buf[0x182],
            normal_area_end: le_u32(buf, 0x183),
        })
    }

    /// Magic tag matches
    pub fn valid(&self) -> bool {
        self.magic == HEADER_MAGIC
    }

    pub fn capacity_class(&self) -> Option<CapacityClass> {
        CapacityClass::from_code(self.capacity_code)
    }

    /// Declared capacity; zero for an unknown class code
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_class().map_or(0, CapacityClass::bytes)
    }

    /// Bytes actually used by the image
    ///
    /// Not clamped to [`capacity_bytes`](Self::capacity_bytes).
    pub fn used_bytes(&self) -> u64 {
        self.valid_data_end.saturating_mul(SECTOR_SIZE as u64)
    }
}

fn array<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(array(buf, at))
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(array(buf, at))
}
