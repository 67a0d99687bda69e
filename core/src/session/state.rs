//! Device/cartridge lifecycle
//!
//! ```text
//! ┌──────────────┐ connect ┌────────────┐  ok   ┌───────────┐
//! │ Disconnected │────────▶│ Connecting │──────▶│ Connected │
//! └──────────────┘         └────────────┘       └───────────┘
//!                                │ error              │ poll
//!                                ▼                    ▼
//!                           ┌─────────┐        ┌─────────────┐
//!                           │ Faulted │        │ NoCartridge │◀──────────┐
//!                           └─────────┘        └─────────────┘           │
//!                             ▲     ▲             │ insert               │ remove
//!                  bad header │     │ I/O error   ▼                      │
//!     ┌────────────────┐      │     │      ┌───────────────────┐         │
//!     │ Authenticating │──────┘     │      │ CartridgeDetected │─────────┤
//!     └────────────────┘◀───────────┼──────└───────────────────┘         │
//!             │ header ok           │         authenticate               │
//!             ▼                     │                                    │
//!     ┌───────────────┐  dump  ┌─────────┐                               │
//!     │ Authenticated │───────▶│ Dumping │                               │
//!     └───────────────┘◀───────└─────────┘                               │
//!             │     done / cancelled                                     │
//!             └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every state returns to `Disconnected` on disconnect. A failed device
//! read during `authenticate` faults from any connected state.
//! `Faulted` is left only through `Disconnected`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// No device handle
    Disconnected = 0,
    /// Opening and verifying the device
    Connecting = 1,
    /// Verified adapter, cartridge slot not yet polled
    Connected = 2,
    /// Slot is empty
    NoCartridge = 3,
    /// Header magic present, not yet authenticated
    CartridgeDetected = 4,
    /// Reading and validating the header
    Authenticating = 5,
    /// Header trusted, image may be read
    Authenticated = 6,
    /// Dump in progress
    Dumping = 7,
    /// Verification or transport failure; requires disconnect
    Faulted = 8,
}

impl SessionState {
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::NoCartridge,
            4 => Self::CartridgeDetected,
            5 => Self::Authenticating,
            6 => Self::Authenticated,
            7 => Self::Dumping,
            8 => Self::Faulted,
            _ => return None,
        })
    }

    /// Whether the state machine allows `self -> next`
    ///
    /// Staying in the same state is always allowed.
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionState::*;
        if self as u8 == next as u8 {
            return true;
        }
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Connected | Faulted)
                | (Connected, NoCartridge | CartridgeDetected | Faulted)
                | (NoCartridge, CartridgeDetected | Faulted)
                | (CartridgeDetected, Authenticating | NoCartridge | Faulted)
                | (Authenticating, Authenticated | Faulted | NoCartridge)
                | (Authenticated, Dumping | Authenticating | NoCartridge | Faulted)
                | (Dumping, Authenticated | Faulted)
        )
    }

    /// A device handle is held
    pub const fn is_connected(self) -> bool {
        !matches!(self, Self::Disconnected | Self::Connecting)
    }

    /// The image may be read
    pub const fn can_read_image(self) -> bool {
        matches!(self, Self::Authenticated | Self::Dumping)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::NoCartridge => "no cartridge",
            Self::CartridgeDetected => "cartridge detected",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Dumping => "dumping",
            Self::Faulted => "faulted",
        }
    }
}

/// Shared, lock-free view of a session's state
///
/// The session owns the writer side; controllers and monitors read it
/// without taking the device lock.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn new(state: SessionState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire)).unwrap_or(SessionState::Faulted)
    }

    pub(crate) fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(SessionState::Disconnected)
    }
}
