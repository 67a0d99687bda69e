//! Session controller
//!
//! Runs connect, authenticate and dump on background threads around one
//! shared [`DeviceSession`], publishes their progress as [`Event`]s and
//! optionally watches the adapter for hot-plug changes.
//!
//! # Concurrency
//!
//! - At most one operation runs at a time; a second request fails
//!   synchronously with [`MigError::Busy`].
//! - Every device access, including monitor polls, holds the session lock.
//!   A dump takes it once per chunk, so the monitor keeps sampling while
//!   it runs.
//! - Events of one operation arrive in order: `Started`, any
//!   `DumpProgress`, then `Succeeded` or `Failed`. Monitor edges may
//!   interleave with them.
//! - The busy flag is cleared before the terminal event is sent, so a
//!   subscriber may chain the next operation from it.

mod events;
mod monitor;
mod progress;

pub use events::{Event, EventKind, Operation, Outcome};
pub use monitor::{Edge, Observation, PresenceTracker};
pub use progress::{ProgressMeter, ProgressSample};

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::Receiver;

use crate::config::Config;
use crate::discovery::{DeviceDescriptor, DeviceDiscovery, SystemDiscovery};
use crate::error::{MigError, Result};
use crate::session::transfer;
use crate::session::{
    CartridgeInfo, Connector, DeviceInfo, DeviceSession, DumpSummary, SessionState, StateCell,
    SystemConnector,
};
use events::EventBus;
use monitor::Monitor;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared with background threads
pub(crate) struct Shared {
    session: Mutex<DeviceSession>,
    state: StateCell,
    config: Config,
    discovery: Arc<dyn DeviceDiscovery>,
    events: EventBus,
    busy: AtomicBool,
    abort: AtomicBool,
    presence: Mutex<PresenceTracker>,
}

impl Shared {
    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn event(&self, kind: EventKind) -> Event {
        Event {
            kind,
            state: self.state.get(),
        }
    }

    fn emit(&self, kind: EventKind) {
        self.events.emit(self.event(kind));
    }

    fn emit_progress(&self, sample: ProgressSample) {
        self.events.emit_lossy(self.event(EventKind::DumpProgress(sample)));
    }
}

/// Clears the busy flag even if the task panics
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Thread-safe front end over a [`DeviceSession`]
pub struct SessionController {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<Monitor>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Controller for real devices found by [`SystemDiscovery`]
    pub fn new(config: Config) -> Self {
        Self::with_parts(config, Arc::new(SystemConnector), Arc::new(SystemDiscovery::new()))
    }

    pub fn with_parts(
        config: Config,
        connector: Arc<dyn Connector>,
        discovery: Arc<dyn DeviceDiscovery>,
    ) -> Self {
        let session = DeviceSession::new(config.clone(), connector);
        let shared = Shared {
            state: session.state_cell(),
            session: Mutex::new(session),
            events: EventBus::new(config.event_capacity),
            config,
            discovery,
            busy: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            presence: Mutex::new(PresenceTracker::new()),
        };
        Self {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
            monitor: Mutex::new(None),
            delivery: Mutex::new(None),
        }
    }

    /// Current session state, without waiting for the device lock
    pub fn state(&self) -> SessionState {
        self.shared.state.get()
    }

    /// An operation is in flight
    pub fn is_busy(&self) -> bool {
        self.shared.is_busy()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Receive all further events on a new bounded channel
    ///
    /// Replaces any previous subscriber. Operations block while the channel
    /// is full, so the receiver must be drained.
    pub fn subscribe(&self) -> Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Deliver events to `callback` on a dedicated thread
    ///
    /// Replaces any previous subscriber. The callback may call back into
    /// the controller.
    pub fn set_event_subscriber<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(Event) + Send + 'static,
    {
        let events = self.subscribe();
        let handle = thread::Builder::new()
            .name("migflash-events".into())
            .spawn(move || {
                for event in events.iter() {
                    callback(event);
                }
            })?;
        // The previous delivery thread ends once its channel is dropped
        *lock(&self.delivery) = Some(handle);
        Ok(())
    }

    fn spawn<F>(&self, op: Operation, task: F) -> Result<()>
    where
        F: FnOnce(&Shared) -> Result<Outcome> + Send + 'static,
    {
        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("{} rejected: busy", op.as_str());
            return Err(MigError::Busy);
        }
        // Only the request that won the busy flag may clear a pending abort
        self.shared.abort.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("migflash-{}", op.as_str()))
            .spawn(move || {
                let busy = BusyGuard(&shared.busy);
                shared.emit(EventKind::Started(op));
                let result = task(&shared);
                drop(busy);

                let kind = match result {
                    Ok(outcome) => EventKind::Succeeded(outcome),
                    Err(e) => {
                        log::warn!("{} failed: {}", op.as_str(), e);
                        EventKind::Failed(op, e)
                    }
                };
                shared.emit(kind);
            });

        match spawned {
            Ok(handle) => {
                *lock(&self.worker) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.busy.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Connect in the background
    ///
    /// Without a descriptor the first discovered device is used.
    pub fn connect_async(&self, descriptor: Option<DeviceDescriptor>) -> Result<()> {
        self.spawn(Operation::Connect, move |shared| {
            let descriptor = match descriptor {
                Some(d) => d,
                None => shared
                    .discovery
                    .devices()?
                    .into_iter()
                    .next()
                    .ok_or_else(|| MigError::DeviceNotFound("no adapter found".into()))?,
            };

            let mut session = lock(&shared.session);
            lock(&shared.presence).reset();
            let device = session.connect(&descriptor)?;
            let cartridge_present = session.poll_cartridge()?;
            lock(&shared.presence).reset();

            Ok(Outcome::Connected {
                device,
                cartridge_present,
            })
        })
    }

    /// Authenticate the inserted cartridge in the background
    pub fn authenticate_async(&self) -> Result<()> {
        self.spawn(Operation::Authenticate, |shared| {
            lock(&shared.session).authenticate().map(Outcome::Authenticated)
        })
    }

    /// Dump the cartridge to `path` in the background
    ///
    /// `trimmed` stops at the used-data extent instead of the full
    /// capacity. [`abort_dump`](Self::abort_dump) cancels at the next
    /// chunk boundary and leaves the partial file.
    pub fn dump_async(&self, path: impl Into<PathBuf>, trimmed: bool) -> Result<()> {
        let path = path.into();
        self.spawn(Operation::Dump, move |shared| {
            let started = Instant::now();
            let (size, chunk) = {
                let mut session = lock(&shared.session);
                (session.begin_dump(trimmed)?, session.config().chunk_size)
            };

            let mut meter = ProgressMeter::new(shared.config.progress_interval);
            let streamed = transfer::stream_to_file(
                &path,
                size,
                chunk,
                |offset, buf| lock(&shared.session).dump_chunk(offset, buf),
                &mut |done, total| {
                    if let Some(sample) = meter.sample(done, total) {
                        shared.emit_progress(sample);
                    }
                    if shared.abort.load(Ordering::Acquire) {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                },
            );
            let bytes = lock(&shared.session).finish_dump(streamed)?;

            Ok(Outcome::Dumped(DumpSummary {
                path,
                bytes,
                trimmed,
                elapsed: started.elapsed(),
            }))
        })
    }

    /// Ask the running dump to stop at the next chunk boundary
    pub fn abort_dump(&self) {
        log::info!("dump abort requested");
        self.shared.abort.store(true, Ordering::Release);
    }

    /// Wait for the most recent background operation to finish
    pub fn wait(&self) {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
    }

    /// Start hot-plug polling, replacing a running monitor
    pub fn start_monitoring(&self, interval: Duration) -> Result<()> {
        self.stop_monitoring();
        lock(&self.shared.presence).reset();
        let monitor = Monitor::spawn(Arc::clone(&self.shared), interval)?;
        *lock(&self.monitor) = Some(monitor);
        Ok(())
    }

    pub fn stop_monitoring(&self) {
        let monitor = lock(&self.monitor).take();
        if let Some(monitor) = monitor {
            monitor.stop();
        }
    }

    pub fn is_monitoring(&self) -> bool {
        lock(&self.monitor).is_some()
    }

    /// Close the device
    ///
    /// A running dump is aborted and fails at its next chunk.
    pub fn disconnect(&self) {
        self.shared.abort.store(true, Ordering::Release);
        let mut session = lock(&self.shared.session);
        session.disconnect();
        lock(&self.shared.presence).reset();
    }

    /// Stop monitoring, disconnect and wait for background work
    pub fn shutdown(&self) {
        self.stop_monitoring();
        self.disconnect();
        self.wait();
    }

    /// Run `f` with exclusive access to the session
    ///
    /// Blocks while another thread holds the device; a running dump
    /// releases it between chunks.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut DeviceSession) -> R) -> R {
        let mut session = lock(&self.shared.session);
        f(&mut session)
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.with_session(|s| s.device_info().cloned())
    }

    pub fn cartridge_info(&self) -> CartridgeInfo {
        self.with_session(|s| s.cartridge_info().clone())
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shared.abort.store(true, Ordering::Release);
        self.stop_monitoring();
    }
}
