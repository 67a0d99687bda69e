//! OS-backed block device

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::platform::{self, Platform};
use super::RawDevice;
use crate::error::{MigError, Result};

/// Exclusive handle on a raw block device (or an image file)
///
/// The handle is opened once and released by [`RawDevice::close`] or on
/// drop, whichever comes first. Positioned transfers never depend on the
/// stream cursor, so the `Read`/`Seek` view and `read_at` can be mixed.
pub struct BlockDevice {
    file: Option<File>,
    path: PathBuf,
    platform: &'static Platform,
}

impl BlockDevice {
    /// Open `path` for exclusive read/write access
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path.as_ref(), platform::current())
    }

    /// Open through an explicit platform backend
    pub fn open_with(path: &Path, platform: &'static Platform) -> Result<Self> {
        (platform.release_mounts)(path);

        let file = (platform.open)(path).map_err(|e| map_open_error(path, e))?;
        (platform.lock)(&file);

        log::debug!("opened {} ({})", path.display(), platform.name);
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            platform,
        })
    }

    /// Path the device was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or(MigError::NotConnected)
    }

    fn stream(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device closed"))
    }
}

fn map_open_error(path: &Path, err: io::Error) -> MigError {
    let name = path.display().to_string();
    match err.kind() {
        io::ErrorKind::NotFound => MigError::DeviceNotFound(name),
        io::ErrorKind::PermissionDenied => MigError::DeviceBusy(name),
        _ if is_busy_code(err.raw_os_error()) => MigError::DeviceBusy(name),
        _ => err.into(),
    }
}

#[cfg(unix)]
fn is_busy_code(code: Option<i32>) -> bool {
    code == Some(libc::EBUSY)
}

#[cfg(windows)]
fn is_busy_code(code: Option<i32>) -> bool {
    use winapi::shared::winerror::ERROR_SHARING_VIOLATION;
    code == Some(ERROR_SHARING_VIOLATION as i32)
}

impl RawDevice for BlockDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let file = self.file()?;
        let mut done = 0;
        while done < buf.len() {
            match platform::read_at(file, &mut buf[done..], offset + done as u64) {
                Ok(0) => {
                    return Err(MigError::ShortRead {
                        expected: buf.len(),
                        read: done,
                    })
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let file = self.file()?;
        let mut done = 0;
        while done < data.len() {
            match platform::write_at(file, &data[done..], offset + done as u64) {
                Ok(0) => {
                    return Err(MigError::ShortWrite {
                        expected: data.len(),
                        written: done,
                    })
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        let file = self.file.as_mut().ok_or(MigError::NotConnected)?;
        let pos = file.stream_position()?;
        let end = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(pos))?;
        Ok(end)
    }

    fn flush(&mut self) -> Result<()> {
        self.file()?.sync_all()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            (self.platform.unlock)(&file);
            log::debug!("closed {}", self.path.display());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn is_present(&self) -> bool {
        self.file.is_some() && self.path.exists()
    }
}

impl Drop for BlockDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl Read for BlockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }
}

impl Write for BlockDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream()?.flush()
    }
}

impl Seek for BlockDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.stream()?.seek(pos)
    }
}
