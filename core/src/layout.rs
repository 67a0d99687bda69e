//! Adapter memory map
//!
//! The adapter exposes everything through fixed byte offsets of one block
//! device. The standard disk structures are confirmed; the cartridge and
//! control-register offsets are estimates and must be checked against real
//! hardware, so the map is a plain value that callers may override.

/// Sector size of the adapter (USB mass storage)
pub const SECTOR_SIZE: usize = 512;

/// Size of the partition signature compared on connect
pub const PARTITION_SIGNATURE_LEN: usize = 16;

/// Maximum length of the firmware version string
pub const FIRMWARE_VERSION_LEN: usize = 16;

/// Size of the cartridge image header
pub const IMAGE_HEADER_SIZE: usize = 0x200;

/// Offset of the header magic inside the image header
pub const IMAGE_HEADER_MAGIC_OFFSET: u64 = 0x100;

/// First GPT partition entry (LBA 2)
pub const GPT_PARTITION_OFFSET: u64 = 0x0000_0400;

/// Firmware blob, ~549 MB into the disk
pub const FIRMWARE_OFFSET: u64 = 0x209A_4000;

/// Cartridge image header area (estimated)
pub const XCI_HEADER_OFFSET: u64 = 0x0010_0000;
/// Cartridge certificate area (estimated)
pub const XCI_CERT_OFFSET: u64 = 0x0010_0200;
/// Certificate area size
pub const XCI_CERT_SIZE: usize = 0x200;
/// First byte of the cartridge image (estimated)
pub const XCI_DATA_OFFSET: u64 = 0x0020_0000;

/// Control area (estimated)
pub const CONTROL_OFFSET: u64 = 0x2000_0000;
/// Status register (estimated)
pub const STATUS_OFFSET: u64 = 0x2000_0200;
/// Command register (estimated)
pub const COMMAND_OFFSET: u64 = 0x2000_0400;
/// Cartridge info block (estimated)
pub const CART_INFO_OFFSET: u64 = 0x2000_1000;

/// Byte offsets of every region the session touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMap {
    /// 16-byte partition signature (first GPT entry type GUID)
    pub partition_signature: u64,
    /// NUL-terminated firmware version string
    pub firmware: u64,
    /// Cartridge image header
    pub image_header: u64,
    /// Cartridge certificate
    pub certificate: u64,
    /// Certificate length
    pub certificate_size: usize,
    /// Base of the sequential image data
    pub image_data: u64,
    /// Control area base
    pub control: u64,
    /// Status register sector
    pub status: u64,
    /// Command register sector
    pub command: u64,
    /// Cartridge info block
    pub cart_info: u64,
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self {
            partition_signature: GPT_PARTITION_OFFSET,
            firmware: FIRMWARE_OFFSET,
            image_header: XCI_HEADER_OFFSET,
            certificate: XCI_CERT_OFFSET,
            certificate_size: XCI_CERT_SIZE,
            image_data: XCI_DATA_OFFSET,
            control: CONTROL_OFFSET,
            status: STATUS_OFFSET,
            command: COMMAND_OFFSET,
            cart_info: CART_INFO_OFFSET,
        }
    }
}

impl MemoryMap {
    /// Absolute offset of the header magic
    pub fn header_magic(&self) -> u64 {
        self.image_header + IMAGE_HEADER_MAGIC_OFFSET
    }

    /// Absolute device offset of an image-relative offset
    pub fn image_offset(&self, offset: u64) -> u64 {
        self.image_data + offset
    }

    /// Move the image header and certificate together
    pub fn with_image_header(mut self, offset: u64) -> Self {
        self.image_header = offset;
        self.certificate = offset + IMAGE_HEADER_SIZE as u64;
        self
    }

    /// Set the image data base
    pub fn with_image_data(mut self, offset: u64) -> Self {
        self.image_data = offset;
        self
    }

    /// Set the firmware string offset
    pub fn with_firmware(mut self, offset: u64) -> Self {
        self.firmware = offset;
        self
    }

    /// Move the control block; status and command keep their relative spacing
    pub fn with_control(mut self, offset: u64) -> Self {
        self.control = offset;
        self.status = offset + (STATUS_OFFSET - CONTROL_OFFSET);
        self.command = offset + (COMMAND_OFFSET - CONTROL_OFFSET);
        self.cart_info = offset + (CART_INFO_OFFSET - CONTROL_OFFSET);
        self
    }
}
