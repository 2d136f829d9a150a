//! CLI & process entry point (C15): loads `DaemonConfig`, builds the transport, clock driver
//! registry, and port state machine, takes the singleton lock, and runs the single-threaded
//! cooperative port loop of spec.md §5.
//!
//! Structure (`clap::Parser`, JSON config load, singleton lock via `flock`, `ctrlc`,
//! realtime-priority setup on the calling thread) follows the teacher's `main.rs` directly;
//! generalized from the teacher's fixed NTP-client role to a daemon that runs the full PTP port
//! state machine and may act as master or slave.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use clap::Parser;
use log::{debug, info, warn};

use ptpdrs::acl::AccessList;
use ptpdrs::alarms::{AlarmEntry, AlarmRegistry, ALARM_UPDATE_INTERVAL_SECS};
use ptpdrs::clock::{ClockDriver, ClockDriverKind, ClockDriverRegistry, SystemClock};
use ptpdrs::config::DaemonConfig;
use ptpdrs::lifecycle::RestartController;
use ptpdrs::net::{self, Channel, Transport};
use ptpdrs::port::{Port, PortState};
use ptpdrs::status::PortStatus;
use ptpdrs::wire::{self, Header, MessageType};

#[derive(Parser, Debug, Clone)]
#[command(name = "ptpdrsd", version, about = "IEEE 1588-2008 ordinary/boundary clock daemon")]
struct Args {
    /// Path to the JSON configuration file; falls back to the platform default search path.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network interface to bind to; overrides `DaemonConfig::interface` and the
    /// default-interface heuristic.
    #[arg(short, long)]
    interface: Option<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace); default is the config's
    /// `logging.level`.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[cfg(unix)]
fn acquire_singleton_lock() -> Result<std::fs::File> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    let lock_path = "/var/run/ptpdrsd.lock";
    let file = std::fs::File::create(lock_path)
        .map_err(|e| anyhow!("failed to create lock file {}: {}", lock_path, e))?;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(_) => Ok(file),
        Err(nix::errno::Errno::EAGAIN) => {
            Err(anyhow!("another instance of ptpdrsd is already running (lockfile: {})", lock_path))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn acquire_singleton_lock() -> Result<std::fs::File> {
    Ok(std::fs::File::create("ptpdrsd.lock")?)
}

fn enable_realtime_priority() {
    #[cfg(unix)]
    {
        unsafe {
            let policy = libc::SCHED_FIFO;
            let param = libc::sched_param { sched_priority: 50 };
            if libc::sched_setscheduler(0, policy, &param) == 0 {
                info!("realtime priority (SCHED_FIFO, 50) enabled");
            } else {
                warn!("failed to set realtime priority: {}; latency may suffer", std::io::Error::last_os_error());
            }
        }
    }
}

fn build_clock_registry(config: &DaemonConfig) -> Result<(ClockDriverRegistry, ptpdrs::clock::ClockDriverId)> {
    let mut registry = ClockDriverRegistry::new();
    let mut system_clock_id = None;

    for entry in &config.clock_drivers {
        let backend: Box<dyn SystemClock + Send> = match entry.kind {
            ClockDriverKind::SystemClock => {
                #[cfg(unix)]
                {
                    Box::new(ptpdrs::clock::linux::LinuxClock::new()?)
                }
                #[cfg(windows)]
                {
                    Box::new(ptpdrs::clock::windows::WindowsClock::new()?)
                }
            }
            ClockDriverKind::PhcClock => {
                #[cfg(unix)]
                {
                    let path = entry.device_path.as_deref().ok_or_else(|| anyhow!("PHC driver {} missing device_path", entry.name))?;
                    Box::new(ptpdrs::clock::phc::PhcClock::open(path)?)
                }
                #[cfg(windows)]
                {
                    return Err(anyhow!("PHC clock drivers are not supported on Windows"));
                }
            }
        };
        let mut driver = ClockDriver::new(entry.name.clone(), entry.kind, entry.config, backend);
        if entry.kind == ClockDriverKind::SystemClock && system_clock_id.is_none() {
            driver.is_system_clock = true;
        }
        let id = registry.insert(driver);
        if entry.kind == ClockDriverKind::SystemClock && system_clock_id.is_none() {
            system_clock_id = Some(id);
        }
    }

    let system_clock_id = system_clock_id.ok_or_else(|| anyhow!("configuration must include at least one SystemClock driver"))?;
    Ok((registry, system_clock_id))
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn system_time_to_ptp(ts: SystemTime) -> ptpdrs::time::PtpTimestamp {
    let since_epoch = ts.duration_since(UNIX_EPOCH).unwrap_or_default();
    ptpdrs::time::PtpTimestamp::new(since_epoch.as_secs() as i32, since_epoch.subsec_nanos() as i32)
}

/// Builds the standard alarm set (C11) and returns the registry alongside the indices needed to
/// drive it from the port loop: "no master" latches while the port has no qualified parent,
/// "max delay rejected" fires once per tick while `maxDelay` is actively dropping samples.
fn build_alarm_registry() -> (AlarmRegistry, usize, usize) {
    let mut registry = AlarmRegistry::new();
    let no_master = registry.register(
        AlarmEntry::new("NOMASTER", "no qualified master", "port has no BMCA-qualified parent", 30.0)
            .on_fire(|alarm| warn!("alarm {:?}: {}", alarm.state, alarm.description)),
    );
    let max_delay_rejected = registry.register(
        AlarmEntry::new("MAXDELAY", "maxDelay rejections", "Delay_Resp samples are being dropped by maxDelay", 0.0)
            .event_only()
            .on_fire(|alarm| warn!("alarm: {}", alarm.description)),
    );
    (registry, no_master, max_delay_rejected)
}

/// Single-threaded cooperative port loop (spec.md §5): drain sockets, process timers, run BMCA
/// if flagged, maintain port/clock state, apply clock updates. Suspends only at the socket-wait
/// call, bounded by the soonest timer.
fn run_port_loop(
    mut transport: Transport,
    mut port: Port,
    mut clocks: ClockDriverRegistry,
    system_clock_id: ptpdrs::clock::ClockDriverId,
    mut lifecycle: RestartController,
    running: Arc<AtomicBool>,
    reload_requested: Arc<AtomicBool>,
) -> Result<()> {
    port.transition_to(PortState::Listening);
    let mut status = PortStatus::default();
    let (mut alarms, no_master_alarm, max_delay_alarm) = build_alarm_registry();
    let mut last_max_delay_drops = 0u64;
    let mut last_alarm_tick = now_unix();

    while running.load(Ordering::SeqCst) {
        if reload_requested.swap(false, Ordering::SeqCst) {
            info!("reload signal received, scheduling full restart bitmask");
            #[cfg(unix)]
            let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Reloading]);
            lifecycle.request(
                ptpdrs::lifecycle::PROTOCOL
                    | ptpdrs::lifecycle::NETWORK
                    | ptpdrs::lifecycle::ACLS
                    | ptpdrs::lifecycle::PEIRCE
                    | ptpdrs::lifecycle::DATASETS
                    | ptpdrs::lifecycle::NTPENGINE
                    | ptpdrs::lifecycle::LOGGING,
            );
        }
        if lifecycle.has_pending() {
            for group in lifecycle.drain() {
                debug!("draining lifecycle restart group: {:#x}", group);
                if group & ptpdrs::lifecycle::PROTOCOL != 0 {
                    port.transition_to(PortState::Initializing);
                    port.transition_to(PortState::Listening);
                }
                if group & ptpdrs::lifecycle::NETWORK != 0 {
                    if let Err(e) = transport.refresh_multicast() {
                        warn!("multicast refresh failed: {}", e);
                    }
                }
            }
        }

        for (channel, packet) in transport.drain()? {
            if let Some(sample) = handle_packet(channel, &packet.buf[..packet.len], packet.timestamp, &mut port) {
                status.path_delay_ns = sample.mean_path_delay_ns;
                if sample.is_offset_update {
                    status.offset_ns = sample.offset_ns;
                    if let Some(driver) = clocks.get_mut(system_clock_id) {
                        if let Err(e) = driver.discipline(sample.offset_ns) {
                            warn!("clock discipline failed: {}", e);
                        }
                    }
                }
            }
        }

        let events = port.poll_timers();
        if events.announce_receipt {
            port.on_announce_receipt_timeout();
        }
        if events.net_refresh {
            if let Err(e) = transport.refresh_multicast() {
                warn!("periodic multicast refresh failed: {}", e);
            }
        }

        if events.send_announce {
            let buf = port.build_announce();
            if let Err(e) = transport.send(Channel::General, &buf) {
                warn!("failed to send Announce: {}", e);
            }
        }
        if events.send_sync {
            let sync_buf = port.build_sync();
            match transport.send(Channel::Event, &sync_buf) {
                Ok(tx_time) => {
                    let follow_buf = port.build_follow_up(system_time_to_ptp(tx_time));
                    if let Err(e) = transport.send(Channel::General, &follow_buf) {
                        warn!("failed to send Follow_Up: {}", e);
                    }
                }
                Err(e) => warn!("failed to send Sync: {}", e),
            }
        }
        if events.send_delay_req {
            let buf = port.build_delay_req();
            match transport.send(Channel::Event, &buf) {
                Ok(tx_time) => {
                    // Multicast loopback is disabled on the transport, so this port must
                    // synthesize its own receipt of the request it just sent.
                    if let Ok(header) = wire::unpack_header(&buf) {
                        port.dispatch(&header, &buf, system_time_to_ptp(tx_time));
                    }
                }
                Err(e) => warn!("failed to send Delay_Req: {}", e),
            }
        }
        if events.send_pdelay_req {
            let buf = port.build_pdelay_req();
            if let Err(e) = transport.send(Channel::Event, &buf) {
                warn!("failed to send Pdelay_Req: {}", e);
            }
        }

        clocks.tick_all()?;

        let now = now_unix();
        let no_master = matches!(port.state, PortState::Listening);
        if let Some(alarm) = alarms.get_mut(no_master_alarm) {
            alarm.set_condition(no_master, now as f64);
        }
        if let Some(alarm) = alarms.get_mut(max_delay_alarm) {
            alarm.set_condition(port.max_delay_drops > last_max_delay_drops, now as f64);
        }
        last_max_delay_drops = port.max_delay_drops;
        if now.saturating_sub(last_alarm_tick) as f64 >= ALARM_UPDATE_INTERVAL_SECS {
            alarms.tick_all(ALARM_UPDATE_INTERVAL_SECS);
            last_alarm_tick = now;
        }

        status.port_state = format!("{:?}", port.state);
        status.foreign_master_count = port.foreign_masters.len();
        status.max_delay_drops = port.max_delay_drops;
        status.delay_outlier_rejections = port.delay_outlier_rejections;
        status.message_format_errors = port.message_format_errors;
        status.grandmaster_identity = port.grandmaster_identity;
        status.active_alarm_count = alarms.active_count();
        if let Some(driver) = clocks.get(system_clock_id) {
            status.clock_state = format!("{:?}", driver.state);
            status.is_locked = driver.state == ptpdrs::clock::ClockState::Locked;
            status.in_holdover = driver.state == ptpdrs::clock::ClockState::Holdover;
            status.servo_output_ppb = driver.last_frequency;
            port.set_servo_stability(status.is_locked);
        }
        status.updated_ts = now_unix();

        std::thread::sleep(Duration::from_millis(10));
    }

    info!("shutdown requested, exiting port loop");
    Ok(())
}

fn handle_packet(channel: Channel, buf: &[u8], rx_time: SystemTime, port: &mut Port) -> Option<ptpdrs::port::DisciplineSample> {
    let header = match wire::unpack_header(buf) {
        Ok(h) => h,
        Err(_) => {
            port.message_format_errors += 1;
            return None;
        }
    };
    debug!("{:?} channel: {:?} from {:?}", channel, header.message_type, header.source_port_identity);
    if matches!(header.message_type, MessageType::Sync | MessageType::DelayReq) && channel != Channel::Event {
        port.message_format_errors += 1;
        return None;
    }
    port.dispatch(&header, buf, system_time_to_ptp(rx_time))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(|| PathBuf::from(DaemonConfig::default_path()));
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(iface) = &args.interface {
        config.interface = Some(iface.clone());
    }

    let level_filter = match args.verbose {
        0 => config.logging.level.clone(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let mut builder = env_logger::Builder::from_default_env();
    builder.parse_filters(&level_filter);
    builder.init();

    info!("ptpdrsd starting");

    let _lock_file = acquire_singleton_lock()?;
    enable_realtime_priority();

    let interface_ip: Ipv4Addr = match &config.interface {
        Some(name) => {
            let (_, ip) = net::get_default_interface()
                .map_err(|e| anyhow!("interface '{}' requested but discovery failed: {}", name, e))?;
            ip
        }
        None => {
            let (iface, ip) = net::get_default_interface()?;
            info!("selected interface {} ({})", iface.name, ip);
            ip
        }
    };

    let transport = Transport::new(interface_ip)?;
    let (clocks, system_clock_id) = build_clock_registry(&config)?;
    let mut port_config = config.port.clone();
    port_config.delay_peirce_threshold = config.filter.peirce_threshold;
    port_config.stat_filter_kind = config.filter.kind;
    port_config.stat_filter_window_type = config.filter.window_type;
    port_config.stat_filter_window_size = config.filter.window_size;
    let port = Port::new(port_config);
    let lifecycle = RestartController::new();

    let running = Arc::new(AtomicBool::new(true));
    let running_ctrlc = running.clone();
    ctrlc::set_handler(move || {
        info!("shutdown signal received");
        running_ctrlc.store(false, Ordering::SeqCst);
    })?;

    let reload_requested = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    signal_hook::flag::register(signal_hook::consts::SIGHUP, reload_requested.clone())?;

    #[cfg(unix)]
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        debug!("sd_notify READY failed (not running under systemd?): {}", e);
    }

    run_port_loop(transport, port, clocks, system_clock_id, lifecycle, running, reload_requested)?;

    #[cfg(unix)]
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);

    Ok(())
}
