//! Process entrypoint: CLI parsing, startup sequence, and the main loop
//! that drives the Device Link and the Broker Manager (§4.8, §6b).

use std::io::Write as _;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::Parser;
use log::{debug, error, info, warn};

use meshcoretomqtt::broker_manager::BrokerManager;
use meshcoretomqtt::command::NonceStore;
use meshcoretomqtt::config::Config;
use meshcoretomqtt::constants::{client_version_string, MAIN_LOOP_TICK, STATS_REPORT_INTERVAL};
use meshcoretomqtt::device::DeviceLink;
use meshcoretomqtt::error::BridgeError;
use meshcoretomqtt::identity::NodeIdentity;
use meshcoretomqtt::parser::{self, ParserState};
use meshcoretomqtt::stats::{self, Stats};

#[derive(Debug, Parser)]
#[command(name = "meshcoretomqtt", version, about = "Bridges a MeshCore repeater's serial link to MQTT")]
struct Cli {
    /// Enable debug logging, including raw DEBUG lines from the radio.
    #[arg(long)]
    debug: bool,

    /// Load configuration from this path instead of the default tree. May
    /// be given more than once; paths are merged in order. Passing this at
    /// all skips the default `/etc/mctomqtt` search entirely.
    #[arg(long = "config", value_name = "PATH")]
    config_paths: Vec<PathBuf>,
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();
}

/// Block briefly for the system clock to be NTP-synchronized before the
/// repeater's own clock is set from it. Best-effort: a host with no
/// `timedatectl` (containers, some embedded images) proceeds immediately.
fn wait_for_time_sync() {
    for attempt in 0..60 {
        let output = match Command::new("timedatectl").arg("status").output() {
            Ok(output) => output,
            Err(_) => return,
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("System clock synchronized: yes") {
            if attempt > 0 {
                info!("System clock synchronized after {attempt}s");
            }
            return;
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    warn!("Gave up waiting for system clock synchronization after 60s");
}

fn connect_device(config: &meshcoretomqtt::config::SerialConfig) -> Option<Arc<DeviceLink>> {
    DeviceLink::connect(config).map(Arc::new)
}

/// Query the identity fields off the Device Link per the startup order.
/// Mandatory fields (name, public key, radio info) that never arrive abort
/// startup; optional ones (private key, firmware, board) are logged and
/// left `None`.
fn query_identity(device: &DeviceLink, sync_time: bool) -> anyhow::Result<NodeIdentity> {
    if sync_time {
        device.set_time();
    }

    let name = device
        .get_name()
        .ok_or(BridgeError::MandatoryIdentityMissing("name"))?;
    let public_key = device
        .get_pubkey()
        .ok_or(BridgeError::MandatoryIdentityMissing("public key"))?;
    let radio_info = device.get_radio_info();
    if radio_info.is_none() {
        return Err(BridgeError::MandatoryIdentityMissing("radio info").into());
    }

    let private_key = device.get_privkey();
    if private_key.is_none() {
        warn!("Device did not report a private key — token auth and signed command responses are unavailable");
    }

    let firmware_version = device.get_firmware_version();
    if firmware_version.is_none() {
        warn!("Device did not report a firmware version");
    }

    let board_type = device.get_board_type();
    if board_type.is_none() {
        warn!("Device did not report a board type");
    }

    Ok(NodeIdentity {
        name,
        public_key,
        private_key,
        radio_info,
        firmware_version,
        board_type,
    })
}

fn install_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        let shutdown = shutdown.clone();
        unsafe {
            signal_hook::low_level::register(signal, move || {
                shutdown.store(true, Ordering::Relaxed);
            })?;
        }
    }
    Ok(())
}

fn log_remote_serial_summary(config: &meshcoretomqtt::config::RemoteSerialConfig, companions: &[String]) {
    if !config.enabled {
        info!("Remote serial commands: disabled");
        return;
    }
    info!(
        "Remote serial commands: enabled, {} allowed companion(s), {} disallowed command prefix(es)",
        companions.len(),
        config.disallowed_commands.len()
    );
}

fn run_stats_reporter(
    identity: Arc<NodeIdentity>,
    client_version: String,
    device: meshcoretomqtt::device::SharedDevice,
    brokers: Arc<BrokerManager>,
    stats: Arc<Stats>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let mut waited = Duration::ZERO;
        while waited < STATS_REPORT_INTERVAL {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            let step = Duration::from_millis(200).min(STATS_REPORT_INTERVAL - waited);
            std::thread::sleep(step);
            waited += step;
        }

        let current_device = device.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(link) = &current_device {
            stats.set_device_stats(link.get_device_stats());
        }

        let payload = stats::status_payload(
            &identity,
            &client_version,
            "online",
            Some(&stats.device_stats()),
        );
        brokers.publish_status_broadcast(&payload);

        let (packets_per_min, elapsed) = stats.take_packet_rate();
        let uptime = stats::format_duration_hm(stats.uptime().as_secs());
        let bytes = stats::format_bytes(stats.bytes_processed.load(Ordering::Relaxed));
        let reconnects = brokers.reconnect_summary(&stats);
        let failures = stats.publish_failures.load(Ordering::Relaxed);

        info!(
            "[SERVICE] Uptime: {uptime} | Packets/min: {packets_per_min:.1} | Bytes: {bytes} | \
             MQTT: {}/{} connected | Reconnects/24h: {reconnects} | Publish failures: {failures}",
            brokers.connected_count(),
            brokers.total_broker_count(),
        );

        let current = stats.device_stats();
        let prev = stats.device_stats_prev();
        if let Some(line) = stats::device_stats_log_line(&current, &prev, elapsed) {
            info!("[DEVICE] {line}");
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config_paths)?;
    init_logging(cli.debug);
    config.log_config_sources();

    let client_version = client_version_string();
    info!("meshcoretomqtt {client_version} starting");

    if config.general.sync_time {
        wait_for_time_sync();
    }

    let device = connect_device(&config.serial)
        .ok_or_else(|| anyhow::anyhow!("could not open any configured serial port"))?;

    let identity = Arc::new(query_identity(&device, config.general.sync_time)?);
    info!(
        "Identity: {} ({}...)",
        identity.name,
        &identity.public_key[..identity.public_key.len().min(8)]
    );
    let initial_stats = device.get_device_stats();
    if !initial_stats.is_empty() {
        debug!("Initial device stats: {initial_stats:?}");
    }

    let companions =
        meshcoretomqtt::command::normalize_allowed_companions(&config.remote_serial.allowed_companions);
    let mut config = config;
    config.remote_serial.allowed_companions = companions.clone();
    log_remote_serial_summary(&config.remote_serial, &companions);

    let config = Arc::new(config);
    let stats = Arc::new(Stats::default());
    let nonces = Arc::new(NonceStore::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    let device_slot: meshcoretomqtt::device::SharedDevice = Arc::new(Mutex::new(Some(device)));

    install_signal_handlers(shutdown.clone())?;

    // Built up front and handed out explicitly (rather than relying on
    // `tokio::spawn`'s ambient context) because the websocket keepalive task
    // and paho's publish-delivery confirmation are both scheduled from
    // threads that never entered this runtime: paho's own network callback
    // thread, a detached `std::thread::spawn`'d command handler, and the
    // main loop once `block_on` below has returned.
    let runtime = tokio::runtime::Runtime::new()?;
    let runtime_handle = runtime.handle().clone();

    let brokers = BrokerManager::new(
        identity.clone(),
        config.clone(),
        stats.clone(),
        nonces.clone(),
        device_slot.clone(),
        shutdown.clone(),
        runtime_handle,
    );

    const MAX_INITIAL_CONNECT_ATTEMPTS: u32 = 10;
    let mut attempt = 0;
    loop {
        runtime.block_on(brokers.connect_all());
        if brokers.is_any_connected() {
            break;
        }
        attempt += 1;
        if attempt >= MAX_INITIAL_CONNECT_ATTEMPTS {
            error!(
                "No broker connected after {attempt} attempts, exiting for a supervisor restart"
            );
            return Err(BridgeError::NoBrokerConnected.into());
        }
        let backoff = Duration::from_secs((attempt as u64 * 2).min(30));
        warn!("Initial broker connect failed (attempt {attempt}/{MAX_INITIAL_CONNECT_ATTEMPTS}), retrying in {}s", backoff.as_secs());
        std::thread::sleep(backoff);
    }

    let reporter_handle = {
        let identity = identity.clone();
        let client_version = client_version.clone();
        let device_slot = device_slot.clone();
        let brokers = brokers.clone();
        let stats = stats.clone();
        let shutdown = shutdown.clone();
        std::thread::spawn(move || {
            run_stats_reporter(identity, client_version, device_slot, brokers, stats, shutdown);
        })
    };

    run_main_loop(&config, &identity, device_slot.clone(), &brokers, &stats, &shutdown);

    info!("Shutting down");
    brokers.stop_ping_tasks();
    let _ = reporter_handle.join();

    let offline_payload = stats::status_payload(&identity, &client_version, "offline", None);
    brokers.publish_status_broadcast(&offline_payload);
    brokers.shutdown_all();

    if let Some(link) = device_slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
        link.close();
    }

    drop(runtime);
    Ok(())
}

/// The 100Hz loop: reads one line from the Device Link per tick, advances
/// the reconnect state machine, and watches the serial watchdog. A reopen
/// triggered by the watchdog is rate-limited to once per trip rather than
/// retried every tick, since the device rarely comes back inside a single
/// 10ms window and a busy retry loop only adds log noise.
fn run_main_loop(
    config: &Arc<Config>,
    identity: &Arc<NodeIdentity>,
    device_slot: meshcoretomqtt::device::SharedDevice,
    brokers: &Arc<BrokerManager>,
    stats: &Arc<Stats>,
    shutdown: &Arc<AtomicBool>,
) {
    let parser_state = ParserState::new();
    let mut last_reopen_check = Instant::now();
    let mut watchdog_tripped = false;

    while !shutdown.load(Ordering::Relaxed) {
        let tick_start = Instant::now();

        brokers.reconnect_tick();

        let current = device_slot.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match &current {
            Some(link) if !link.is_closed() => {
                if let Some(line) = link.read_line() {
                    watchdog_tripped = false;
                    if let Some(event) = parser::parse_line(
                        &line,
                        identity,
                        log::log_enabled!(log::Level::Debug),
                        &parser_state,
                        stats,
                    ) {
                        let payload = event.payload().to_string();
                        brokers.publish_packet_or_debug(event.topic_kind(), &payload);
                    }
                }

                if link.seconds_since_activity() > config.serial.watchdog_timeout as f64 && !watchdog_tripped {
                    watchdog_tripped = true;
                    warn!(
                        "Serial watchdog tripped: no activity for over {}s, reopening device",
                        config.serial.watchdog_timeout
                    );
                    link.close();
                    *device_slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
                    last_reopen_check = Instant::now();
                }
            }
            _ => {
                if last_reopen_check.elapsed() >= Duration::from_secs(5) {
                    last_reopen_check = Instant::now();
                    if let Some(link) = connect_device(&config.serial) {
                        match query_identity(&link, false) {
                            Ok(_) => {
                                watchdog_tripped = false;
                                *device_slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(link);
                                info!("Serial link reopened");
                            }
                            Err(e) => {
                                warn!("Reopened serial port failed identity re-check: {e}");
                            }
                        }
                    }
                }
            }
        }

        let elapsed = tick_start.elapsed();
        if elapsed < MAIN_LOOP_TICK {
            std::thread::sleep(MAIN_LOOP_TICK - elapsed);
        }
    }
}
