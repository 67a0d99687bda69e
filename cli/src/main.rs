//! migflash - command line front end for the MIG-Flash cartridge dumper

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{crate_version, value_parser, Arg, ArgAction, ArgMatches, Command};
use flume::{Receiver, RecvTimeoutError};
use log::LevelFilter;

use migflash_core::{
    Config, DeviceDescriptor, DeviceDiscovery, DeviceSession, Event, EventKind, Operation,
    Outcome, ProgressSample, SessionController, SystemDiscovery,
};

const MIB: f64 = 1024.0 * 1024.0;

fn cli() -> Command {
    let device = Arg::new("device")
        .short('d')
        .long("device")
        .value_name("PATH")
        .value_parser(value_parser!(PathBuf))
        .help("Adapter block device (default: first one found)");

    Command::new("migflash")
        .version(crate_version!())
        .about("Dump Switch cartridges through a MIG-Flash adapter")
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("More log output (-v info, -vv debug)"),
        )
        .subcommand_required(true)
        .subcommand(Command::new("list").about("List candidate adapters"))
        .subcommand(
            Command::new("check")
                .about("Verify the adapter and show what it reports")
                .arg(device.clone()),
        )
        .subcommand(
            Command::new("dump")
                .about("Authenticate the cartridge and write its image to OUTPUT")
                .arg(
                    Arg::new("output")
                        .required(true)
                        .value_name("OUTPUT")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(device)
                .arg(
                    Arg::new("full")
                        .long("full")
                        .action(ArgAction::SetTrue)
                        .help("Dump the full capacity instead of the used data"),
                )
                .arg(
                    Arg::new("cert")
                        .long("cert")
                        .value_name("FILE")
                        .value_parser(value_parser!(PathBuf))
                        .help("Also save the cartridge certificate"),
                ),
        )
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .parse_default_env()
        .init();
}

fn main() {
    let matches = cli().get_matches();
    init_logging(matches.get_count("verbose"));

    let result = match matches.subcommand() {
        Some(("list", _)) => list(),
        Some(("check", sub)) => check(sub),
        Some(("dump", sub)) => dump(sub),
        other => Err(anyhow!("unknown command {:?}", other.map(|(name, _)| name))),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn list() -> Result<()> {
    let devices = SystemDiscovery::new().devices()?;
    if devices.is_empty() {
        println!("no removable disks found");
    }
    for d in devices {
        println!("{:<16} {}", d.path.display(), d.label);
    }
    Ok(())
}

fn descriptor(matches: &ArgMatches) -> Result<DeviceDescriptor> {
    if let Some(path) = matches.get_one::<PathBuf>("device") {
        return Ok(DeviceDescriptor::new(path).with_label(path.display().to_string()));
    }
    SystemDiscovery::new()
        .devices()?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no adapter found; pass --device"))
}

fn check(matches: &ArgMatches) -> Result<()> {
    let descriptor = descriptor(matches)?;
    let mut session = DeviceSession::system(Config::default());
    let info = session
        .connect(&descriptor)
        .with_context(|| format!("connecting to {}", descriptor.path.display()))?;

    println!("device:   {}", info.descriptor.path.display());
    println!("firmware: {}", info.firmware_version);

    match session.read_status() {
        Ok(status) => println!("status:   {:?} (0x{:02x})", status, status.code()),
        Err(e) => println!("status:   unreadable ({e})"),
    }

    let partitions = session.partitions()?;
    if partitions.is_empty() {
        println!("partitions: none");
    }
    for p in &partitions {
        println!(
            "partition {}: {:?} lba {}..={} ({:.1} MiB){}",
            p.index,
            p.name,
            p.first_lba,
            p.last_lba,
            p.size() as f64 / MIB,
            if p.is_basic_data() { " basic data" } else { "" },
        );
    }

    let inserted = session.poll_cartridge()?;
    println!("cartridge: {}", if inserted { "inserted" } else { "empty slot" });
    if inserted {
        let uid = session.read_uid()?;
        println!("uid:      {}", hex(&uid));
    }

    session.disconnect();
    Ok(())
}

fn dump(matches: &ArgMatches) -> Result<()> {
    let descriptor = descriptor(matches)?;
    let output = matches
        .get_one::<PathBuf>("output")
        .cloned()
        .ok_or_else(|| anyhow!("missing OUTPUT"))?;
    let trimmed = !matches.get_flag("full");

    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))
        .context("installing the Ctrl-C handler")?;

    let ctl = SessionController::new(Config::default());
    let events = ctl.subscribe();
    let result = drive(&ctl, &events, &interrupted, descriptor, &output, trimmed, matches);
    ctl.shutdown();
    result
}

fn drive(
    ctl: &SessionController,
    events: &Receiver<Event>,
    interrupted: &AtomicBool,
    descriptor: DeviceDescriptor,
    output: &Path,
    trimmed: bool,
    matches: &ArgMatches,
) -> Result<()> {
    ctl.connect_async(Some(descriptor))?;
    if let Outcome::Connected {
        device,
        cartridge_present,
    } = follow(ctl, events, interrupted, Operation::Connect)?
    {
        println!("firmware {}", device.firmware_version);
        if !cartridge_present {
            bail!("no cartridge in the slot");
        }
    }

    ctl.authenticate_async()?;
    if let Outcome::Authenticated(cart) = follow(ctl, events, interrupted, Operation::Authenticate)? {
        println!(
            "cartridge {:.0} MiB, {:.0} MiB used",
            cart.total_size as f64 / MIB,
            cart.used_size as f64 / MIB
        );
    }

    if let Some(cert_path) = matches.get_one::<PathBuf>("cert") {
        let cert = ctl.with_session(|s| s.read_certificate())?;
        fs::write(cert_path, &cert)
            .with_context(|| format!("writing {}", cert_path.display()))?;
        println!("certificate saved to {}", cert_path.display());
    }

    ctl.dump_async(output, trimmed)?;
    if let Outcome::Dumped(summary) = follow(ctl, events, interrupted, Operation::Dump)? {
        let secs = summary.elapsed.as_secs_f64();
        let rate = if secs > 0.0 { summary.bytes as f64 / MIB / secs } else { 0.0 };
        println!(
            "wrote {} bytes to {} in {:.1}s ({:.1} MiB/s)",
            summary.bytes,
            summary.path.display(),
            secs,
            rate
        );
    }
    Ok(())
}

/// Render events until `op` finishes
fn follow(
    ctl: &SessionController,
    events: &Receiver<Event>,
    interrupted: &AtomicBool,
    op: Operation,
) -> Result<Outcome> {
    let mut progress_shown = false;
    loop {
        if interrupted.swap(false, Ordering::AcqRel) {
            eprintln!("\ninterrupted, stopping");
            ctl.abort_dump();
        }

        let event = match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => bail!("event channel closed"),
        };

        match event.kind {
            EventKind::DumpProgress(sample) => {
                render(&sample);
                progress_shown = true;
            }
            EventKind::Succeeded(outcome) if outcome.operation() == op => {
                if progress_shown {
                    eprintln!();
                }
                return Ok(outcome);
            }
            EventKind::Failed(failed, e) if failed == op => {
                if progress_shown {
                    eprintln!();
                }
                return Err(anyhow::Error::new(e).context(format!("{} failed", op.as_str())));
            }
            EventKind::CartRemoved => log::warn!("cartridge removed"),
            EventKind::DeviceDisconnected => log::warn!("adapter disconnected"),
            other => log::debug!("event {:?} ({})", other, event.state.as_str()),
        }
    }
}

fn render(sample: &ProgressSample) {
    let eta = sample
        .eta
        .map(|d| format!("{}s", d.as_secs()))
        .unwrap_or_else(|| "?".into());
    eprint!(
        "\r{:>6.1}%  {:>8.1} / {:.1} MiB  {:>6.1} MiB/s  eta {:<8}",
        sample.fraction() * 100.0,
        sample.bytes_done as f64 / MIB,
        sample.bytes_total as f64 / MIB,
        sample.rate / MIB,
        eta
    );
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
