//! MIG-Flash Core Library
//!
//! Drives a MIG-Flash cartridge dumper that presents itself as a USB block
//! device: device verification, cartridge authentication and image
//! read-out through fixed byte offsets, plus a threaded controller with
//! hot-plug monitoring and an event stream for front ends.
//!
//! Layering, leaves first:
//! - [`device`]: raw positioned I/O on one block device, per-OS backends
//! - [`layout`]: the adapter memory map
//! - [`header`]: partition signature, firmware string, image header codecs
//! - [`session`]: the protocol and lifecycle state machine
//! - [`controller`]: background operations, events, monitoring

#![allow(clippy::new_without_default)]

pub mod config;
pub mod controller;
pub mod device;
pub mod discovery;
pub mod error;
pub mod header;
pub mod layout;
pub mod session;

pub use config::Config;
pub use controller::{Event, EventKind, Operation, Outcome, ProgressSample, SessionController};
pub use device::{BlockDevice, RawDevice};
pub use discovery::{DeviceDescriptor, DeviceDiscovery, SystemDiscovery};
pub use error::{MigError, Result};
pub use layout::MemoryMap;
pub use session::{CartridgeInfo, DeviceInfo, DeviceSession, DumpSummary, SessionState};
