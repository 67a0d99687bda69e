//! Hot-plug monitoring
//!
//! A background thread samples device liveness and cartridge presence once
//! per interval and reports edges only. A tick waits for the session lock,
//! which a running dump gives up between chunks. Failed samples count as
//! "no change".

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{RecvTimeoutError, Sender};

use super::events::EventKind;
use super::{lock, Shared};

/// One presence sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub connected: bool,
    pub inserted: bool,
}

/// Change between two samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    CartInserted,
    CartRemoved,
    DeviceDisconnected,
}

/// Edge detector over successive observations
///
/// The first sample after construction or [`reset`](Self::reset) only sets
/// the baseline.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    last: Option<Observation>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn observe(&mut self, now: Observation) -> Option<Edge> {
        let prev = self.last.replace(now)?;
        match (prev.connected, now.connected) {
            (true, false) => Some(Edge::DeviceDisconnected),
            (true, true) => match (prev.inserted, now.inserted) {
                (false, true) => Some(Edge::CartInserted),
                (true, false) => Some(Edge::CartRemoved),
                _ => None,
            },
            // A new connection starts a new baseline
            (false, _) => None,
        }
    }
}

/// Running monitor thread
pub(crate) struct Monitor {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Monitor {
    pub fn spawn(shared: Arc<Shared>, interval: Duration) -> io::Result<Self> {
        let (stop, stopped) = flume::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("migflash-monitor".into())
            .spawn(move || {
                log::debug!("monitor started ({:?})", interval);
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    tick(&shared);
                }
                log::debug!("monitor stopped");
            })?;
        Ok(Self { stop, handle })
    }

    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            log::error!("monitor thread panicked");
        }
    }
}

fn tick(shared: &Shared) {
    let mut session = lock(&shared.session);

    let connected = session.probe_presence();
    let inserted = if connected {
        match session.cartridge_inserted() {
            Ok(inserted) => inserted,
            Err(e) => {
                log::debug!("presence poll failed: {}", e);
                return;
            }
        }
    } else {
        false
    };

    let edge = lock(&shared.presence).observe(Observation { connected, inserted });
    let kind = match edge {
        None => return,
        Some(Edge::DeviceDisconnected) => {
            log::info!("adapter disconnected");
            session.disconnect();
            lock(&shared.presence).reset();
            EventKind::DeviceDisconnected
        }
        Some(Edge::CartInserted) => {
            log::info!("cartridge inserted");
            session.note_cartridge(true);
            EventKind::CartInserted
        }
        Some(Edge::CartRemoved) => {
            log::info!("cartridge removed");
            session.note_cartridge(false);
            EventKind::CartRemoved
        }
    };
    drop(session);
    shared.emit(kind);
}
