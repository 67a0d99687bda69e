//! Common test utilities and a simulated adapter

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use migflash_core::device::RawDevice;
use migflash_core::discovery::DeviceDescriptor;
use migflash_core::header::ADAPTER_SIGNATURE;
use migflash_core::layout::{MemoryMap, SECTOR_SIZE};
use migflash_core::session::Connector;
use migflash_core::{Config, MigError, Result};

const SECTOR: u64 = SECTOR_SIZE as u64;

pub const FIRMWARE: &[u8] = b"MIG-1.0.4";

/// Memory map with every register below the image base
pub fn compact_map() -> MemoryMap {
    MemoryMap::default()
        .with_firmware(0x8000)
        .with_control(0x1_0000)
}

/// Config with fast polling for tests
pub fn test_config() -> Config {
    Config::with_memory_map(compact_map())
        .poll_interval(Duration::from_millis(10))
        .command_timing(Duration::from_millis(200), Duration::from_millis(1))
}

/// Byte the simulated cartridge holds at image offset `offset`
pub fn image_byte(offset: u64) -> u8 {
    let sector = offset / SECTOR;
    (sector % 251) as u8 ^ 0xA5
}

/// Build a 0x200-byte cartridge header
pub fn cartridge_header(capacity_code: u8, valid_data_end: u64) -> [u8; 0x200] {
    let mut hdr = [0u8; 0x200];
    hdr[..16].copy_from_slice(b"UID-0123456789AB");
    hdr[0x100..0x104].copy_from_slice(b"HEAD");
    hdr[0x10D] = capacity_code;
    hdr[0x118..0x120].copy_from_slice(&valid_data_end.to_le_bytes());
    hdr
}

/// Shared backing state of the simulated adapter
pub struct SimState {
    pub map: MemoryMap,
    /// Stored sectors (firmware, GPT, header, registers)
    pub sectors: HashMap<u64, [u8; SECTOR_SIZE]>,
    /// Reported device size
    pub size: u64,
    /// Current cartridge presence
    pub inserted: bool,
    /// Presence values consumed by successive magic polls; `None` fails
    /// that poll with an I/O error and leaves presence unchanged
    pub presence_script: VecDeque<Option<bool>>,
    /// Status bytes consumed by successive status reads
    pub status_script: VecDeque<u8>,
    /// Status once the script is exhausted
    pub status_idle: u8,
    /// Command codes written so far
    pub commands: Vec<u8>,
    /// USB link still up
    pub attached: bool,
    /// Delay applied to every image read
    pub read_delay: Option<Duration>,
    /// Image reads fail once this many image bytes were served
    pub fail_image_after: Option<u64>,
    pub image_bytes_read: u64,
    pub magic_polls: usize,
    pub opens: usize,
    pub closes: usize,
}

impl SimState {
    fn sector(&self, lba: u64) -> Option<&[u8; SECTOR_SIZE]> {
        self.sectors.get(&lba)
    }

    fn is_image(&self, at: u64) -> bool {
        at >= self.map.image_data
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.size {
            return Err(MigError::ShortRead {
                expected: buf.len(),
                read: self.size.saturating_sub(offset) as usize,
            });
        }

        let magic_at = self.map.header_magic();
        if offset == magic_at && buf.len() == 4 {
            self.magic_polls += 1;
            match self.presence_script.pop_front() {
                Some(Some(next)) => self.inserted = next,
                Some(None) => return Err(io::Error::from_raw_os_error(5).into()),
                None => {}
            }
            if self.inserted {
                buf.copy_from_slice(b"HEAD");
            } else {
                buf.fill(0);
            }
            return Ok(());
        }

        if offset == self.map.status {
            let code = self.status_script.pop_front().unwrap_or(self.status_idle);
            buf.fill(0);
            buf[0] = code;
            return Ok(());
        }

        if self.is_image(offset) {
            let served = self.image_bytes_read;
            if self.fail_image_after.is_some_and(|limit| served >= limit) {
                return Err(io::Error::from_raw_os_error(5).into());
            }
            self.image_bytes_read += buf.len() as u64;
        }

        let mut at = offset;
        let mut pos = 0;
        while pos < buf.len() {
            let lba = at / SECTOR;
            let within = (at % SECTOR) as usize;
            let n = (SECTOR_SIZE - within).min(buf.len() - pos);
            let dst = &mut buf[pos..pos + n];
            if let Some(stored) = self.sector(lba) {
                dst.copy_from_slice(&stored[within..within + n]);
            } else if self.is_image(at) {
                dst.fill(image_byte(at - self.map.image_data));
            } else {
                dst.fill(0);
            }
            pos += n;
            at += n as u64;
        }

        // An empty slot reads as an erased header
        if !self.inserted && offset <= magic_at && magic_at + 4 <= end {
            let m = (magic_at - offset) as usize;
            buf[m..m + 4].fill(0);
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > self.size {
            return Err(MigError::ShortWrite {
                expected: data.len(),
                written: 0,
            });
        }
        if offset == self.map.command {
            self.commands.push(data[0]);
            return Ok(());
        }
        self.store(offset, data);
        Ok(())
    }

    /// Write bytes into the sparse sector store
    pub fn store(&mut self, offset: u64, data: &[u8]) {
        let mut at = offset;
        let mut pos = 0;
        while pos < data.len() {
            let lba = at / SECTOR;
            let within = (at % SECTOR) as usize;
            let n = (SECTOR_SIZE - within).min(data.len() - pos);
            let sector = self.sectors.entry(lba).or_insert([0u8; SECTOR_SIZE]);
            sector[within..within + n].copy_from_slice(&data[pos..pos + n]);
            pos += n;
            at += n as u64;
        }
    }
}

/// Handle on a simulated adapter; clones share state
#[derive(Clone)]
pub struct Sim {
    pub state: Arc<Mutex<SimState>>,
}

impl Sim {
    /// Verified adapter with an empty slot
    pub fn new(map: MemoryMap) -> Self {
        let mut state = SimState {
            map,
            sectors: HashMap::new(),
            size: 64 * 1024 * 1024 * 1024,
            inserted: false,
            presence_script: VecDeque::new(),
            status_script: VecDeque::new(),
            status_idle: 0x02,
            commands: Vec::new(),
            attached: true,
            read_delay: None,
            fail_image_after: None,
            image_bytes_read: 0,
            magic_polls: 0,
            opens: 0,
            closes: 0,
        };
        state.store(map.partition_signature, &ADAPTER_SIGNATURE);
        let mut firmware = [0u8; 16];
        firmware[..FIRMWARE.len()].copy_from_slice(FIRMWARE);
        state.store(map.firmware, &firmware);
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Adapter using [`compact_map`]
    pub fn compact() -> Self {
        Self::new(compact_map())
    }

    /// Insert a cartridge with the given header fields
    pub fn with_cartridge(self, capacity_code: u8, valid_data_end: u64) -> Self {
        self.insert_header(&cartridge_header(capacity_code, valid_data_end));
        self
    }

    pub fn insert_header(&self, header: &[u8; 0x200]) {
        let mut state = self.lock();
        let at = state.map.image_header;
        state.store(at, header);
        state.inserted = true;
    }

    pub fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn device(&self) -> SimulatedAdapter {
        self.lock().opens += 1;
        SimulatedAdapter {
            state: Arc::clone(&self.state),
            open: true,
        }
    }

    pub fn connector(&self) -> Arc<SimConnector> {
        Arc::new(SimConnector { sim: self.clone() })
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::new("/dev/sim0").with_label("MIG Flash (simulated)")
    }

    pub fn set_presence_script(&self, script: &[bool]) {
        self.lock().presence_script = script.iter().map(|&p| Some(p)).collect();
    }

    /// Like [`set_presence_script`](Self::set_presence_script); `None`
    /// entries are failed polls
    pub fn set_presence_polls(&self, script: &[Option<bool>]) {
        self.lock().presence_script = script.iter().copied().collect();
    }

    pub fn set_inserted(&self, inserted: bool) {
        let mut state = self.lock();
        state.presence_script.clear();
        state.inserted = inserted;
    }

    pub fn set_attached(&self, attached: bool) {
        self.lock().attached = attached;
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.lock().read_delay = Some(delay);
    }

    pub fn image_bytes_read(&self) -> u64 {
        self.lock().image_bytes_read
    }

    pub fn opens_and_closes(&self) -> (usize, usize) {
        let state = self.lock();
        (state.opens, state.closes)
    }
}

/// In-memory [`RawDevice`] backed by a [`Sim`]
pub struct SimulatedAdapter {
    state: Arc<Mutex<SimState>>,
    open: bool,
}

impl SimulatedAdapter {
    fn state(&self) -> Result<MutexGuard<'_, SimState>> {
        if !self.open {
            return Err(MigError::NotConnected);
        }
        Ok(self.state.lock().unwrap())
    }
}

impl RawDevice for SimulatedAdapter {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let delay = {
            let mut state = self.state()?;
            if !state.attached {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
            }
            state.read(offset, buf)?;
            if state.is_image(offset) {
                state.read_delay
            } else {
                None
            }
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state()?;
        if !state.attached {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }
        state.write(offset, data)
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.state()?.size)
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.state.lock().unwrap().closes += 1;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn is_present(&self) -> bool {
        self.open && self.state.lock().unwrap().attached
    }
}

/// Opens the simulated adapter; fails when it is unplugged
pub struct SimConnector {
    pub sim: Sim,
}

impl Connector for SimConnector {
    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn RawDevice>> {
        if !self.sim.lock().attached {
            return Err(MigError::DeviceNotFound(descriptor.path.display().to_string()));
        }
        Ok(Box::new(self.sim.device()))
    }
}

/// Sink that counts bytes and keeps the first `keep` of them
#[derive(Default)]
pub struct PrefixSink {
    pub keep: usize,
    pub prefix: Vec<u8>,
    pub written: u64,
}

impl PrefixSink {
    pub fn new(keep: usize) -> Self {
        Self {
            keep,
            prefix: Vec::with_capacity(keep),
            written: 0,
        }
    }
}

impl Write for PrefixSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.keep - self.prefix.len();
        self.prefix.extend_from_slice(&buf[..room.min(buf.len())]);
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that fails after accepting `limit` bytes
pub struct FailingSink {
    pub limit: u64,
    pub written: u64,
}

impl Write for FailingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written >= self.limit {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Unique scratch path under the system temp directory
pub fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("migflash-{}-{}", std::process::id(), name))
}
