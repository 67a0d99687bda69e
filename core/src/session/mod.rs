//! Device session
//!
//! One [`DeviceSession`] owns one adapter handle and drives it through
//! connect, cartridge detection, authentication and read-out. Every exchange
//! is a positioned read or write at a [`MemoryMap`](crate::layout::MemoryMap)
//! offset; "sending a command" means writing the command sector and polling
//! the status sector.
//!
//! The session is not thread-safe by itself. Concurrent users go through
//! [`SessionController`](crate::controller::SessionController), which keeps
//! it behind a single lock.

mod command;
mod state;
pub(crate) mod transfer;

pub use command::{Command, Status};
pub use state::{SessionState, StateCell};

use std::io::Write;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::device::{BlockDevice, RawDevice};
use crate::discovery::DeviceDescriptor;
use crate::error::{MigError, Result};
use crate::header::{self, CartridgeImageHeader, PartitionEntry, HEADER_MAGIC};
use crate::layout::{FIRMWARE_VERSION_LEN, IMAGE_HEADER_SIZE, PARTITION_SIGNATURE_LEN, SECTOR_SIZE};
use transfer::{DumpError, TransferResult};

/// Opens the device behind a descriptor
pub trait Connector: Send + Sync {
    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn RawDevice>>;
}

/// Opens real block devices through the platform backend
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemConnector;

impl Connector for SystemConnector {
    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn RawDevice>> {
        Ok(Box::new(BlockDevice::open(descriptor.io_path())?))
    }
}

/// A verified adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub descriptor: DeviceDescriptor,
    pub firmware_version: String,
}

/// What is known about the cartridge in the slot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CartridgeInfo {
    pub inserted: bool,
    pub authenticated: bool,
    /// Declared capacity; zero when the class code is unknown
    pub total_size: u64,
    /// Bytes up to the valid-data end
    pub used_size: u64,
    /// Title metadata, when the adapter provides it
    pub title: Option<String>,
}

/// Result of a completed dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpSummary {
    pub path: PathBuf,
    pub bytes: u64,
    pub trimmed: bool,
    pub elapsed: Duration,
}

/// Protocol driver for a single adapter
pub struct DeviceSession {
    config: Config,
    connector: Arc<dyn Connector>,
    device: Option<Box<dyn RawDevice>>,
    info: Option<DeviceInfo>,
    header: Option<CartridgeImageHeader>,
    cartridge: CartridgeInfo,
    state: StateCell,
}

impl DeviceSession {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            device: None,
            info: None,
            header: None,
            cartridge: CartridgeInfo::default(),
            state: StateCell::default(),
        }
    }

    /// Session opening real devices
    pub fn system(config: Config) -> Self {
        Self::new(config, Arc::new(SystemConnector))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Lock-free handle on the state, for observers on other threads
    pub fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    pub fn firmware_version(&self) -> Option<&str> {
        self.info.as_ref().map(|i| i.firmware_version.as_str())
    }

    pub fn cartridge_info(&self) -> &CartridgeInfo {
        &self.cartridge
    }

    /// Parsed header of the authenticated cartridge
    pub fn image_header(&self) -> Option<&CartridgeImageHeader> {
        self.header.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.device.as_ref().is_some_and(|d| d.is_open())
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        let from = self.state.get();
        if !from.can_transition_to(next) {
            return Err(MigError::InvalidTransition { from, to: next });
        }
        if from != next {
            log::debug!("session: {} -> {}", from.as_str(), next.as_str());
            self.state.set(next);
        }
        Ok(())
    }

    fn device(&mut self) -> Result<&mut dyn RawDevice> {
        match self.device.as_mut() {
            Some(dev) if dev.is_open() => Ok(dev.as_mut()),
            _ => Err(MigError::NotConnected),
        }
    }

    /// Open and verify the adapter behind `descriptor`
    ///
    /// An existing connection is dropped first. Any failure closes the
    /// new handle and leaves the session `Faulted`.
    pub fn connect(&mut self, descriptor: &DeviceDescriptor) -> Result<DeviceInfo> {
        if self.state() != SessionState::Disconnected {
            self.disconnect();
        }
        self.transition(SessionState::Connecting)?;
        log::info!("connecting to {}", descriptor.path.display());

        let mut device = match self.connector.open(descriptor) {
            Ok(device) => device,
            Err(e) => {
                log::warn!("open {} failed: {}", descriptor.path.display(), e);
                self.transition(SessionState::Faulted)?;
                return Err(e);
            }
        };

        let firmware = match self.verify(device.as_mut()) {
            Ok(firmware) => firmware,
            Err(e) => {
                if let Err(close_err) = device.close() {
                    log::debug!("close after failed verify: {}", close_err);
                }
                log::warn!("{} rejected: {}", descriptor.path.display(), e);
                self.transition(SessionState::Faulted)?;
                return Err(e);
            }
        };

        log::info!("connected, firmware {:?}", firmware);
        let info = DeviceInfo {
            descriptor: descriptor.clone(),
            firmware_version: firmware,
        };
        self.device = Some(device);
        self.info = Some(info.clone());
        self.transition(SessionState::Connected)?;
        Ok(info)
    }

    fn verify(&self, device: &mut dyn RawDevice) -> Result<String> {
        let map = &self.config.memory_map;

        let mut signature = [0u8; PARTITION_SIGNATURE_LEN];
        device.read_at(map.partition_signature, &mut signature)?;
        if !header::is_adapter_signature(&signature) {
            return Err(MigError::NotSupportedDevice);
        }

        let mut firmware = [0u8; FIRMWARE_VERSION_LEN];
        device.read_at(map.firmware, &mut firmware)?;
        Ok(header::parse_firmware_version(&firmware))
    }

    /// Release the device and forget the cartridge; safe to repeat
    pub fn disconnect(&mut self) {
        if let Some(mut device) = self.device.take() {
            if let Err(e) = device.close() {
                log::warn!("close failed: {}", e);
            }
            log::info!("disconnected");
        }
        self.info = None;
        self.forget_cartridge();
        self.state.set(SessionState::Disconnected);
    }

    fn forget_cartridge(&mut self) {
        self.header = None;
        self.cartridge = CartridgeInfo::default();
    }

    /// Header magic present in the slot
    ///
    /// Reads four bytes and changes nothing.
    pub fn cartridge_inserted(&mut self) -> Result<bool> {
        let at = self.config.memory_map.header_magic();
        let mut magic = [0u8; 4];
        self.device()?.read_at(at, &mut magic)?;
        Ok(magic == HEADER_MAGIC)
    }

    /// Check the slot and move between the cartridge states
    pub fn poll_cartridge(&mut self) -> Result<bool> {
        let present = self.cartridge_inserted()?;
        self.note_cartridge(present);
        Ok(present)
    }

    /// Apply an observed presence value to the state machine
    ///
    /// A dump in progress keeps its state; a removal is remembered and
    /// applied when the dump ends.
    pub(crate) fn note_cartridge(&mut self, present: bool) {
        use SessionState::*;
        let next = match (self.state(), present) {
            (Dumping, false) => {
                self.cartridge.inserted = false;
                return;
            }
            (Connected | NoCartridge, true) => CartridgeDetected,
            (Connected, false) => NoCartridge,
            (CartridgeDetected | Authenticating | Authenticated, false) => NoCartridge,
            _ => return,
        };
        if next == NoCartridge {
            self.forget_cartridge();
        } else {
            self.cartridge.inserted = true;
        }
        // Only table edges are selected above
        let _ = self.transition(next);
    }

    /// Device handle still attached, without data I/O
    pub(crate) fn probe_presence(&self) -> bool {
        self.device.as_ref().is_some_and(|d| d.is_present())
    }

    /// Read and validate the cartridge header
    ///
    /// Requires a cartridge in the slot. A header with a bad magic, or a
    /// device error on any read, moves the session to `Faulted`.
    pub fn authenticate(&mut self) -> Result<CartridgeInfo> {
        self.device()?;
        if self.state() == SessionState::Faulted {
            return Err(MigError::InvalidTransition {
                from: SessionState::Faulted,
                to: SessionState::Authenticating,
            });
        }

        let inserted = match self.cartridge_inserted() {
            Ok(inserted) => inserted,
            Err(e) => {
                log::warn!("presence check failed: {}", e);
                self.transition(SessionState::Faulted)?;
                return Err(e);
            }
        };
        if !inserted {
            self.note_cartridge(false);
            return Err(MigError::NoCartridge);
        }
        self.note_cartridge(true);
        self.transition(SessionState::Authenticating)?;
        self.forget_cartridge();
        self.cartridge.inserted = true;

        match self.read_header() {
            Ok(header) if header.valid() => {
                self.cartridge = CartridgeInfo {
                    inserted: true,
                    authenticated: true,
                    total_size: header.capacity_bytes(),
                    used_size: header.used_bytes(),
                    title: None,
                };
                log::info!(
                    "cartridge authenticated: {} total, {} used",
                    self.cartridge.total_size,
                    self.cartridge.used_size
                );
                if self.cartridge.total_size == 0 {
                    log::warn!("unknown capacity class {:#04x}", header.capacity_code);
                }
                self.header = Some(header);
                self.transition(SessionState::Authenticated)?;
                Ok(self.cartridge.clone())
            }
            Ok(_) => {
                log::warn!("cartridge header magic mismatch");
                self.transition(SessionState::Faulted)?;
                Err(MigError::AuthenticationFailed)
            }
            Err(e) => {
                self.transition(SessionState::Faulted)?;
                Err(e)
            }
        }
    }

    fn read_header(&mut self) -> Result<CartridgeImageHeader> {
        let at = self.config.memory_map.image_header;
        let mut buf = [0u8; IMAGE_HEADER_SIZE];
        self.device()?.read_at(at, &mut buf)?;
        CartridgeImageHeader::parse(&buf)
    }

    fn require_authenticated(&self) -> Result<()> {
        if self.state().can_read_image() && self.cartridge.authenticated {
            Ok(())
        } else {
            Err(MigError::NotAuthenticated)
        }
    }

    /// `(total, used)` image sizes of the authenticated cartridge
    pub fn xci_size(&self) -> Result<(u64, u64)> {
        self.require_authenticated()?;
        Ok((self.cartridge.total_size, self.cartridge.used_size))
    }

    /// Bytes a dump writes: the used extent when trimmed, never past total
    pub fn dump_size(&self, trimmed: bool) -> Result<u64> {
        let (total, used) = self.xci_size()?;
        Ok(if trimmed { used.min(total) } else { total })
    }

    /// Fill `buf` from image offset `offset`
    ///
    /// Fails with `OutOfRange` when the read would pass the declared size.
    pub fn read_image(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let (total, _) = self.xci_size()?;
        let length = buf.len() as u64;
        let out_of_range = MigError::OutOfRange {
            offset,
            length,
            total,
        };
        match offset.checked_add(length) {
            Some(end) if end <= total => {}
            _ => return Err(out_of_range),
        }
        if buf.is_empty() {
            return Ok(());
        }
        let at = self.config.memory_map.image_offset(offset);
        self.device()?.read_at(at, buf)
    }

    /// Enter `Dumping` and return the number of bytes to transfer
    ///
    /// Fails without a state change when not authenticated or when the
    /// capacity class is unknown.
    pub fn begin_dump(&mut self, trimmed: bool) -> Result<u64> {
        let size = self.dump_size(trimmed)?;
        if self.cartridge.total_size == 0 {
            let code = self.header.as_ref().map_or(0, |h| h.capacity_code);
            return Err(MigError::UnknownCapacity(code));
        }
        self.transition(SessionState::Dumping)?;
        log::info!("dumping {} bytes (trimmed: {})", size, trimmed);
        Ok(size)
    }

    /// Read one chunk of a dump started with [`begin_dump`](Self::begin_dump)
    pub fn dump_chunk(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self.state() {
            SessionState::Dumping => self.read_image(offset, buf),
            SessionState::Disconnected => Err(MigError::NotConnected),
            _ => Err(MigError::NotAuthenticated),
        }
    }

    /// Leave `Dumping` with the transfer's outcome
    ///
    /// The session ends `Authenticated` unless the device itself failed.
    /// A cartridge removed meanwhile is applied now.
    pub(crate) fn finish_dump(&mut self, outcome: TransferResult) -> Result<u64> {
        if self.state() != SessionState::Dumping {
            // Closed underneath the transfer
            return outcome.map_err(DumpError::into_inner);
        }
        let result = match outcome {
            Ok(done) => {
                self.transition(SessionState::Authenticated)?;
                log::info!("dump complete, {} bytes", done);
                Ok(done)
            }
            Err(DumpError::Device(e)) if e.is_transport() => {
                log::error!("device failed during dump: {}", e);
                self.transition(SessionState::Faulted)?;
                return Err(e);
            }
            Err(DumpError::Device(e)) | Err(DumpError::Halted(e)) => {
                log::warn!("dump stopped: {}", e);
                self.transition(SessionState::Authenticated)?;
                Err(e)
            }
        };
        if !self.cartridge.inserted {
            // A cartridge swapped in meanwhile needs its own authentication
            let present = self.cartridge_inserted().unwrap_or(false);
            self.note_cartridge(false);
            if present {
                self.note_cartridge(true);
            }
        }
        result
    }

    /// Stream the image into `sink`
    ///
    /// `on_progress(done, total)` runs after every chunk; returning
    /// `Break` stops the dump with `Cancelled`.
    pub fn dump<W, F>(&mut self, sink: &mut W, trimmed: bool, mut on_progress: F) -> Result<u64>
    where
        W: Write + ?Sized,
        F: FnMut(u64, u64) -> ControlFlow<()>,
    {
        let size = self.begin_dump(trimmed)?;
        let chunk = self.config.chunk_size;
        let streamed = transfer::stream_image(
            size,
            chunk,
            |offset, buf| self.dump_chunk(offset, buf),
            sink,
            &mut on_progress,
        );
        self.finish_dump(streamed)
    }

    /// Dump into a new file at `path`
    ///
    /// Nothing is created when the dump cannot start. A failed or
    /// cancelled dump leaves the partial file in place.
    pub fn dump_to_file<F>(&mut self, path: &Path, trimmed: bool, mut on_progress: F) -> Result<DumpSummary>
    where
        F: FnMut(u64, u64) -> ControlFlow<()>,
    {
        let started = Instant::now();
        let size = self.begin_dump(trimmed)?;
        let chunk = self.config.chunk_size;
        let streamed = transfer::stream_to_file(
            path,
            size,
            chunk,
            |offset, buf| self.dump_chunk(offset, buf),
            &mut on_progress,
        );
        let bytes = self.finish_dump(streamed)?;
        Ok(DumpSummary {
            path: path.to_path_buf(),
            bytes,
            trimmed,
            elapsed: started.elapsed(),
        })
    }

    /// Read the status register
    pub fn read_status(&mut self) -> Result<Status> {
        let at = self.config.memory_map.status;
        let mut sector = [0u8; SECTOR_SIZE];
        self.device()?.read_at(at, &mut sector)?;
        Ok(Status::from_u8(sector[0]))
    }

    /// Write a command and wait until the status register leaves `Busy`
    pub fn send_command(&mut self, command: Command) -> Result<Status> {
        let at = self.config.memory_map.command;
        let mut sector = [0u8; SECTOR_SIZE];
        sector[0] = command.code();
        let device = self.device()?;
        device.write_at(at, &sector)?;
        device.flush()?;

        let deadline = Instant::now() + self.config.command_timeout;
        loop {
            let status = self.read_status()?;
            if status == Status::Error {
                return Err(MigError::DeviceFault(status.code()));
            }
            if !status.is_busy() {
                log::debug!("command {:?} -> {:?}", command, status);
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(MigError::CommandTimeout(command.code()));
            }
            thread::sleep(self.config.command_poll_interval);
        }
    }

    /// Cartridge UID
    ///
    /// The first 16 bytes of the header region, ahead of the magic at
    /// header + 0x100.
    pub fn read_uid(&mut self) -> Result<[u8; 16]> {
        let at = self.config.memory_map.image_header;
        let mut uid = [0u8; 16];
        self.device()?.read_at(at, &mut uid)?;
        Ok(uid)
    }

    /// Cartridge certificate
    pub fn read_certificate(&mut self) -> Result<Vec<u8>> {
        self.require_authenticated()?;
        let map = self.config.memory_map;
        self.device()?.read_vec(map.certificate, map.certificate_size)
    }

    /// Used entries of the adapter's GPT
    pub fn partitions(&mut self) -> Result<Vec<PartitionEntry>> {
        header::partition::scan(self.device()?)
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}
