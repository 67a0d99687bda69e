// Chunked image transfer

use std::fs::File;
use std::io::Write;
use std::ops::ControlFlow;
use std::path::Path;

use crate::error::MigError;
use crate::layout::SECTOR_SIZE;

/// Why a transfer stopped early
#[derive(Debug)]
pub(crate) enum DumpError {
    /// Reading the cartridge failed
    Device(MigError),
    /// Sink failure or cancellation
    Halted(MigError),
}

impl DumpError {
    pub fn into_inner(self) -> MigError {
        match self {
            Self::Device(e) | Self::Halted(e) => e,
        }
    }
}

pub(crate) type TransferResult = core::result::Result<u64, DumpError>;

/// Copy `size` image bytes into `sink`, `chunk` bytes at a time
///
/// `read(offset, buf)` fills one chunk. It is called once per chunk, so
/// a caller sharing the device may take its lock inside it.
pub(crate) fn stream_image<R, W, F>(
    size: u64,
    chunk: usize,
    mut read: R,
    sink: &mut W,
    on_progress: &mut F,
) -> TransferResult
where
    R: FnMut(u64, &mut [u8]) -> crate::Result<()>,
    W: Write + ?Sized,
    F: FnMut(u64, u64) -> ControlFlow<()>,
{
    let chunk = usize::try_from(size)
        .unwrap_or(usize::MAX)
        .min(chunk.max(SECTOR_SIZE));
    let mut buf = vec![0u8; chunk];
    let mut done = 0u64;

    while done < size {
        let n = (size - done).min(chunk as u64) as usize;
        let block = &mut buf[..n];
        read(done, block).map_err(DumpError::Device)?;
        sink.write_all(block)
            .map_err(|e| DumpError::Halted(e.into()))?;
        done += n as u64;

        if on_progress(done, size).is_break() {
            let _ = sink.flush();
            return Err(DumpError::Halted(MigError::Cancelled));
        }
    }
    sink.flush().map_err(|e| DumpError::Halted(e.into()))?;
    Ok(done)
}

/// [`stream_image`] into a new file at `path`, synced on success
pub(crate) fn stream_to_file<R, F>(
    path: &Path,
    size: u64,
    chunk: usize,
    read: R,
    on_progress: &mut F,
) -> TransferResult
where
    R: FnMut(u64, &mut [u8]) -> crate::Result<()>,
    F: FnMut(u64, u64) -> ControlFlow<()>,
{
    let halted = |e: std::io::Error| DumpError::Halted(e.into());
    let mut file = File::create(path).map_err(halted)?;
    let done = stream_image(size, chunk, read, &mut file, on_progress)?;
    file.sync_all().map_err(halted)?;
    Ok(done)
}
