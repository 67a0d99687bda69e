//! Controller tests: background operations, events and hot-plug monitoring

mod common;

use std::fs;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use common::{temp_path, test_config, Sim};
use flume::Receiver;
use migflash_core::{
    CartridgeInfo, DeviceDescriptor, Event, EventKind, MigError, Operation, Outcome,
    SessionController, SessionState,
};

const MIB: u64 = 1024 * 1024;
const TIMEOUT: Duration = Duration::from_secs(10);

fn controller(sim: &Sim) -> SessionController {
    SessionController::with_parts(
        test_config().progress_interval(Duration::ZERO),
        sim.connector(),
        Arc::new(Vec::<DeviceDescriptor>::new()),
    )
}

/// Drain events up to and including the terminal event of `op`
fn until_done(rx: &Receiver<Event>, op: Operation) -> Vec<Event> {
    let mut seen = Vec::new();
    loop {
        let event = rx.recv_timeout(TIMEOUT).expect("operation did not finish");
        let done = event.finishes(op);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn connected(sim: &Sim) -> (SessionController, Receiver<Event>) {
    let ctl = controller(sim);
    let rx = ctl.subscribe();
    ctl.connect_async(Some(sim.descriptor())).unwrap();
    until_done(&rx, Operation::Connect);
    (ctl, rx)
}

#[test]
fn test_connect_authenticate_dump_sequence() {
    let used_sectors = 3 * 2048 + 7;
    let sim = Sim::compact().with_cartridge(0xFA, used_sectors);
    let ctl = controller(&sim);
    let rx = ctl.subscribe();

    ctl.connect_async(Some(sim.descriptor())).unwrap();
    let events = until_done(&rx, Operation::Connect);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, EventKind::Started(Operation::Connect));
    match &events[1].kind {
        EventKind::Succeeded(Outcome::Connected {
            device,
            cartridge_present,
        }) => {
            assert_eq!(device.firmware_version, "MIG-1.0.4");
            assert_eq!(device.descriptor, sim.descriptor());
            assert!(*cartridge_present);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(events[1].state, SessionState::CartridgeDetected);
    assert!(!ctl.is_busy());
    assert_eq!(
        ctl.device_info().map(|d| d.firmware_version),
        Some("MIG-1.0.4".to_string())
    );

    ctl.authenticate_async().unwrap();
    let events = until_done(&rx, Operation::Authenticate);
    assert_eq!(events[0].kind, EventKind::Started(Operation::Authenticate));
    match &events.last().unwrap().kind {
        EventKind::Succeeded(Outcome::Authenticated(info)) => {
            assert!(info.authenticated);
            assert_eq!(info.total_size, 1 << 30);
            assert_eq!(info.used_size, used_sectors * 512);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(ctl.state(), SessionState::Authenticated);

    let path = temp_path("ctl-dump.xci");
    ctl.dump_async(&path, true).unwrap();
    let events = until_done(&rx, Operation::Dump);
    ctl.wait();

    assert_eq!(events[0].kind, EventKind::Started(Operation::Dump));
    let progress: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::DumpProgress(sample) => Some(*sample),
            _ => None,
        })
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0].bytes_done < w[1].bytes_done));
    assert!(progress.iter().all(|p| p.bytes_total == used_sectors * 512));

    match &events.last().unwrap().kind {
        EventKind::Succeeded(Outcome::Dumped(summary)) => {
            assert_eq!(summary.bytes, used_sectors * 512);
            assert_eq!(summary.path, path);
            assert!(summary.trimmed);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(fs::metadata(&path).unwrap().len(), used_sectors * 512);
    fs::remove_file(&path).unwrap();
    assert_eq!(ctl.state(), SessionState::Authenticated);
}

#[test]
fn test_second_operation_is_busy() {
    let sim = Sim::compact().with_cartridge(0xFA, 32 * 2048);
    let (ctl, rx) = connected(&sim);
    ctl.authenticate_async().unwrap();
    until_done(&rx, Operation::Authenticate);

    sim.set_read_delay(Duration::from_millis(5));
    let path = temp_path("ctl-busy.xci");
    ctl.dump_async(&path, true).unwrap();
    assert!(ctl.is_busy());

    assert_eq!(ctl.authenticate_async(), Err(MigError::Busy));
    assert_eq!(ctl.dump_async(temp_path("ctl-other.xci"), true), Err(MigError::Busy));
    assert_eq!(ctl.connect_async(Some(sim.descriptor())), Err(MigError::Busy));
    assert!(!temp_path("ctl-other.xci").exists());

    ctl.abort_dump();
    until_done(&rx, Operation::Dump);
    ctl.wait();
    assert!(!ctl.is_busy());
    let _ = fs::remove_file(&path);
}

#[test]
fn test_abort_keeps_partial_file() {
    let sim = Sim::compact().with_cartridge(0xFA, 64 * 2048);
    let (ctl, rx) = connected(&sim);
    ctl.authenticate_async().unwrap();
    until_done(&rx, Operation::Authenticate);

    sim.set_read_delay(Duration::from_millis(5));
    let path = temp_path("ctl-abort.xci");
    ctl.dump_async(&path, true).unwrap();
    wait_until(|| sim.image_bytes_read() >= 2 * MIB);

    let read_at_abort = sim.image_bytes_read();
    ctl.abort_dump();
    let events = until_done(&rx, Operation::Dump);
    ctl.wait();

    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Failed(Operation::Dump, MigError::Cancelled));
    assert_eq!(last.state, SessionState::Authenticated);

    let len = fs::metadata(&path).unwrap().len();
    fs::remove_file(&path).unwrap();
    assert!(len >= MIB);
    assert!(len <= read_at_abort + MIB);
    assert!(len < 64 * MIB);
    assert_eq!(ctl.state(), SessionState::Authenticated);
}

#[test]
fn test_rejected_dump_keeps_pending_abort() {
    let sim = Sim::compact().with_cartridge(0xFA, 64 * 2048);
    let (ctl, rx) = connected(&sim);
    ctl.authenticate_async().unwrap();
    until_done(&rx, Operation::Authenticate);

    sim.set_read_delay(Duration::from_millis(5));
    let path = temp_path("ctl-pending-abort.xci");
    ctl.dump_async(&path, true).unwrap();
    wait_until(|| sim.image_bytes_read() >= MIB);

    ctl.abort_dump();
    assert_eq!(ctl.dump_async(temp_path("ctl-late.xci"), true), Err(MigError::Busy));
    let events = until_done(&rx, Operation::Dump);
    ctl.wait();
    let _ = fs::remove_file(&path);

    assert_eq!(
        events.last().unwrap().kind,
        EventKind::Failed(Operation::Dump, MigError::Cancelled)
    );
    assert!(!temp_path("ctl-late.xci").exists());
}

#[test]
fn test_monitor_sees_removal_during_dump() {
    let sim = Sim::compact().with_cartridge(0xFA, 64 * 2048);
    let (ctl, rx) = connected(&sim);
    ctl.authenticate_async().unwrap();
    until_done(&rx, Operation::Authenticate);

    ctl.start_monitoring(ctl.config().poll_interval).unwrap();
    sim.set_read_delay(Duration::from_millis(5));
    let path = temp_path("ctl-removed.xci");
    ctl.dump_async(&path, true).unwrap();
    wait_until(|| sim.image_bytes_read() >= 2 * MIB);
    let polls = sim.lock().magic_polls;
    sim.set_inserted(false);

    let events = until_done(&rx, Operation::Dump);
    ctl.wait();
    ctl.stop_monitoring();
    let _ = fs::remove_file(&path);

    assert!(sim.lock().magic_polls > polls);
    let removed = events
        .iter()
        .position(|e| e.kind == EventKind::CartRemoved)
        .expect("removal not reported while dumping");
    assert_eq!(events[removed].state, SessionState::Dumping);
    assert!(removed < events.len() - 1);

    // The removal is applied once the dump lets go of the session
    assert_eq!(events.last().unwrap().state, SessionState::NoCartridge);
    assert_eq!(ctl.state(), SessionState::NoCartridge);
    assert_eq!(ctl.cartridge_info(), CartridgeInfo::default());
}

#[test]
fn test_monitor_ignores_failed_polls() {
    let sim = Sim::compact().with_cartridge(0xFA, 10);
    let (ctl, rx) = connected(&sim);
    assert_eq!(ctl.state(), SessionState::CartridgeDetected);

    sim.set_presence_polls(&[Some(true), None, Some(true), None, None, Some(true)]);
    ctl.start_monitoring(ctl.config().poll_interval).unwrap();
    wait_until(|| sim.lock().presence_script.is_empty());

    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(ctl.state(), SessionState::CartridgeDetected);
    assert!(ctl.device_info().is_some());
    ctl.stop_monitoring();
}

#[test]
fn test_monitor_reports_edges_only() {
    let sim = Sim::compact();
    let (ctl, rx) = connected(&sim);
    assert_eq!(ctl.state(), SessionState::NoCartridge);

    sim.set_presence_script(&[false, false, true, true, false]);
    ctl.start_monitoring(ctl.config().poll_interval).unwrap();
    assert!(ctl.is_monitoring());

    let inserted = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(inserted.kind, EventKind::CartInserted);
    assert_eq!(inserted.state, SessionState::CartridgeDetected);

    let removed = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(removed.kind, EventKind::CartRemoved);
    assert_eq!(removed.state, SessionState::NoCartridge);

    // Script exhausted; the slot stays empty
    wait_until(|| sim.lock().presence_script.is_empty());
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    ctl.stop_monitoring();
    assert!(!ctl.is_monitoring());
}

#[test]
fn test_monitor_detects_unplug() {
    let sim = Sim::compact().with_cartridge(0xF8, 100);
    let (ctl, rx) = connected(&sim);

    ctl.start_monitoring(ctl.config().poll_interval).unwrap();
    let polls = sim.lock().magic_polls;
    wait_until(|| sim.lock().magic_polls > polls);

    sim.set_attached(false);
    let event = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(event.kind, EventKind::DeviceDisconnected);
    assert_eq!(event.state, SessionState::Disconnected);
    assert_eq!(ctl.state(), SessionState::Disconnected);
    assert_eq!(sim.opens_and_closes(), (1, 1));

    // No repeated reports while unplugged
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    ctl.shutdown();
}

#[test]
fn test_connect_without_devices() {
    let sim = Sim::compact();
    let ctl = controller(&sim);
    let rx = ctl.subscribe();

    ctl.connect_async(None).unwrap();
    let events = until_done(&rx, Operation::Connect);
    match &events.last().unwrap().kind {
        EventKind::Failed(Operation::Connect, MigError::DeviceNotFound(_)) => {}
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(ctl.state(), SessionState::Disconnected);
}

#[test]
fn test_connect_uses_discovery() {
    let sim = Sim::compact().with_cartridge(0xFA, 10);
    let ctl = SessionController::with_parts(
        test_config(),
        sim.connector(),
        Arc::new(vec![sim.descriptor()]),
    );
    let rx = ctl.subscribe();

    ctl.connect_async(None).unwrap();
    let events = until_done(&rx, Operation::Connect);
    assert!(matches!(
        events.last().unwrap().kind,
        EventKind::Succeeded(Outcome::Connected { .. })
    ));
    assert_eq!(ctl.state(), SessionState::CartridgeDetected);
}

#[test]
fn test_failed_connect_faults() {
    let sim = Sim::compact();
    sim.set_attached(false);
    let ctl = controller(&sim);
    let rx = ctl.subscribe();

    ctl.connect_async(Some(sim.descriptor())).unwrap();
    let events = until_done(&rx, Operation::Connect);
    let last = events.last().unwrap();
    assert!(matches!(
        last.kind,
        EventKind::Failed(Operation::Connect, MigError::DeviceNotFound(_))
    ));
    assert_eq!(last.state, SessionState::Faulted);

    // Reconnecting recovers
    sim.set_attached(true);
    ctl.connect_async(Some(sim.descriptor())).unwrap();
    until_done(&rx, Operation::Connect);
    assert_eq!(ctl.state(), SessionState::NoCartridge);
}

#[test]
fn test_callback_can_chain_operations() {
    let sim = Sim::compact().with_cartridge(0xF0, 10);
    let ctl = Arc::new(controller(&sim));
    let weak: Weak<SessionController> = Arc::downgrade(&ctl);
    let (tx, seen) = flume::unbounded();

    ctl.set_event_subscriber(move |event: Event| {
        if let EventKind::Succeeded(Outcome::Connected { .. }) = event.kind {
            if let Some(ctl) = weak.upgrade() {
                ctl.authenticate_async().unwrap();
            }
        }
        let _ = tx.send(event);
    })
    .unwrap();

    ctl.connect_async(Some(sim.descriptor())).unwrap();
    let events = until_done(&seen, Operation::Authenticate);
    match &events.last().unwrap().kind {
        EventKind::Succeeded(Outcome::Authenticated(info)) => {
            assert_eq!(info.total_size, 4 << 30);
        }
        other => panic!("unexpected {other:?}"),
    }
    ctl.wait();
    assert_eq!(ctl.state(), SessionState::Authenticated);
}

#[test]
fn test_disconnect_and_shutdown() {
    let sim = Sim::compact().with_cartridge(0xFA, 10);
    let (ctl, _rx) = connected(&sim);
    ctl.start_monitoring(Duration::from_millis(5)).unwrap();

    ctl.disconnect();
    ctl.disconnect();
    assert_eq!(ctl.state(), SessionState::Disconnected);
    assert_eq!(sim.opens_and_closes(), (1, 1));
    assert_eq!(ctl.cartridge_info(), CartridgeInfo::default());
    assert!(ctl.device_info().is_none());

    ctl.shutdown();
    assert!(!ctl.is_monitoring());
    assert!(!ctl.is_busy());
}
