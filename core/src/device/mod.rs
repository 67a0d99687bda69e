//! Raw block device access
//!
//! The adapter is driven entirely through positioned reads and writes on
//! one block device. [`RawDevice`] is the contract every backend satisfies:
//! the OS-backed [`BlockDevice`] in production, in-memory simulations in
//! tests. A device handle is owned by exactly one session and is never
//! shared between concurrent callers.

mod block;
pub mod platform;
mod sector_io;

pub use block::BlockDevice;
pub use sector_io::SectorIo;

use crate::error::{MigError, Result};
use crate::layout::SECTOR_SIZE;

/// Byte-addressed access to an exclusively owned block device
pub trait RawDevice: Send {
    /// Fill `buf` from absolute `offset`
    ///
    /// Fails with [`MigError::ShortRead`] when the device ends early.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data` at absolute `offset`
    ///
    /// Fails with [`MigError::ShortWrite`] when the OS accepts fewer bytes.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Device size in bytes
    fn size(&mut self) -> Result<u64>;

    /// Push buffered writes to the medium
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release the handle; calling it again is a no-op
    fn close(&mut self) -> Result<()>;

    /// Whether the handle is still open
    fn is_open(&self) -> bool;

    /// Whether the underlying device is still attached
    ///
    /// Used by hot-plug monitoring; must not perform data I/O.
    fn is_present(&self) -> bool {
        self.is_open()
    }

    /// Read `len` bytes at `offset` into a fresh buffer
    fn read_vec(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Read one 512-byte sector
    fn read_sector(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        check_sector_len(buf.len())?;
        self.read_at(sector_to_byte(lba), buf)
    }

    /// Write one 512-byte sector
    fn write_sector(&mut self, lba: u64, data: &[u8]) -> Result<()> {
        check_sector_len(data.len())?;
        self.write_at(sector_to_byte(lba), data)
    }
}

impl<D: RawDevice + ?Sized> RawDevice for Box<D> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        (**self).write_at(offset, data)
    }

    fn size(&mut self) -> Result<u64> {
        (**self).size()
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn is_present(&self) -> bool {
        (**self).is_present()
    }
}

fn check_sector_len(len: usize) -> Result<()> {
    if len != SECTOR_SIZE {
        return Err(MigError::InvalidSectorSize(len));
    }
    Ok(())
}

/// Byte offset of a 512-byte sector
pub fn sector_to_byte(lba: u64) -> u64 {
    lba * SECTOR_SIZE as u64
}
