//! gpt_disk_io adapter over a raw device

use gpt_disk_io::BlockIo;
use gpt_disk_types::{BlockSize, Lba};

use super::{sector_to_byte, RawDevice};
use crate::error::{MigError, Result};
use crate::layout::SECTOR_SIZE;

/// Exposes a [`RawDevice`] as 512-byte blocks for `gpt_disk_io::Disk`
pub struct SectorIo<'a> {
    device: &'a mut dyn RawDevice,
}

impl<'a> SectorIo<'a> {
    pub fn new(device: &'a mut dyn RawDevice) -> Self {
        Self { device }
    }

    fn check_buffer(len: usize) -> Result<()> {
        if len == 0 || len % SECTOR_SIZE != 0 {
            return Err(MigError::InvalidSectorSize(len));
        }
        Ok(())
    }
}

impl BlockIo for SectorIo<'_> {
    type Error = MigError;

    fn block_size(&self) -> BlockSize {
        BlockSize::BS_512
    }

    fn num_blocks(&mut self) -> Result<u64> {
        Ok(self.device.size()? / SECTOR_SIZE as u64)
    }

    fn read_blocks(&mut self, start_lba: Lba, dst: &mut [u8]) -> Result<()> {
        Self::check_buffer(dst.len())?;
        self.device.read_at(sector_to_byte(start_lba.to_u64()), dst)
    }

    fn write_blocks(&mut self, start_lba: Lba, src: &[u8]) -> Result<()> {
        Self::check_buffer(src.len())?;
        self.device.write_at(sector_to_byte(start_lba.to_u64()), src)
    }

    fn flush(&mut self) -> Result<()> {
        self.device.flush()
    }
}
