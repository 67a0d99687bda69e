//! Runtime configuration.
//!
//! Tunables for transfers, polling and the event channel.

use std::time::Duration;

use crate::layout::MemoryMap;

/// Dump chunk size (1 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Minimum spacing between progress events
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Hot-plug poll period
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Session configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Region offsets on the adapter.
    pub memory_map: MemoryMap,
    /// Bytes read per dump step; cancellation is checked between chunks.
    pub chunk_size: usize,
    /// Progress events are throttled to one per interval.
    pub progress_interval: Duration,
    /// Monitor poll period.
    pub poll_interval: Duration,
    /// How long a command may keep the status register busy.
    pub command_timeout: Duration,
    /// Delay between status register polls.
    pub command_poll_interval: Duration,
    /// Capacity of the bounded event channel.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory_map: MemoryMap::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            command_timeout: Duration::from_secs(5),
            command_poll_interval: Duration::from_millis(10),
            event_capacity: 64,
        }
    }
}

impl Config {
    /// Config with an overridden memory map.
    pub fn with_memory_map(memory_map: MemoryMap) -> Self {
        Self {
            memory_map,
            ..Default::default()
        }
    }

    /// Set the dump chunk size (clamped to at least one sector).
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(crate::layout::SECTOR_SIZE);
        self
    }

    /// Set the progress throttle.
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Set the monitor poll period.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set command timeout and status poll period.
    pub fn command_timing(mut self, timeout: Duration, poll: Duration) -> Self {
        self.command_timeout = timeout;
        self.command_poll_interval = poll;
        self
    }

    /// Set the event channel capacity.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}
