//! Controller events and their delivery channel

use std::sync::Mutex;

use flume::{Receiver, Sender, TrySendError};

use super::lock;
use super::progress::ProgressSample;
use crate::error::MigError;
use crate::session::{CartridgeInfo, DeviceInfo, DumpSummary, SessionState};

/// Background operations run by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Authenticate,
    Dump,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Authenticate => "authenticate",
            Self::Dump => "dump",
        }
    }
}

/// Result carried by a success event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Connected {
        device: DeviceInfo,
        cartridge_present: bool,
    },
    Authenticated(CartridgeInfo),
    Dumped(DumpSummary),
}

impl Outcome {
    pub const fn operation(&self) -> Operation {
        match self {
            Self::Connected { .. } => Operation::Connect,
            Self::Authenticated(_) => Operation::Authenticate,
            Self::Dumped(_) => Operation::Dump,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Started(Operation),
    Succeeded(Outcome),
    Failed(Operation, MigError),
    DumpProgress(ProgressSample),
    CartInserted,
    CartRemoved,
    DeviceDisconnected,
}

/// Event with the session state at emission time
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub state: SessionState,
}

impl Event {
    /// Terminal event of `op`
    pub fn finishes(&self, op: Operation) -> bool {
        match &self.kind {
            EventKind::Succeeded(outcome) => outcome.operation() == op,
            EventKind::Failed(failed, _) => *failed == op,
            _ => false,
        }
    }
}

/// Single-subscriber bounded channel
pub(crate) struct EventBus {
    capacity: usize,
    sender: Mutex<Option<Sender<Event>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sender: Mutex::new(None),
        }
    }

    /// Open a new channel, dropping the previous subscriber
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = flume::bounded(self.capacity);
        *lock(&self.sender) = Some(tx);
        rx
    }

    fn current(&self) -> Option<Sender<Event>> {
        lock(&self.sender).clone()
    }

    fn drop_if_current(&self, stale: &Sender<Event>) {
        let mut slot = lock(&self.sender);
        if slot.as_ref().is_some_and(|tx| tx.same_channel(stale)) {
            log::debug!("event subscriber went away");
            *slot = None;
        }
    }

    /// Deliver, waiting for room in the channel
    pub fn emit(&self, event: Event) {
        let Some(tx) = self.current() else {
            return;
        };
        if tx.send(event).is_err() {
            self.drop_if_current(&tx);
        }
    }

    /// Deliver only if there is room; used for progress samples
    pub fn emit_lossy(&self, event: Event) {
        let Some(tx) = self.current() else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => self.drop_if_current(&tx),
        }
    }
}
