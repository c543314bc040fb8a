//! Owns every configured broker connection and drives the reconnect state
//! machine (§4.4, §4.5).
//!
//! One [`BrokerRecord`] exists per configured broker, including disabled
//! ones, so indices stay stable across reloads and `client_id_prefix`
//! always resolves against the same "first broker" regardless of which
//! entries are enabled. The manager fans outbound publishes out to every
//! connected broker and routes inbound `serial/commands` traffic to the
//! command handler.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rand::Rng;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::broker_client::{
    BrokerClient, BrokerClientConfig, PahoBrokerClient,
};
use crate::command::{self, NonceStore, ResponsePublisher};
use crate::config::{BrokerConfig, Config, Transport};
use crate::constants::{
    client_version_string, INITIAL_CONNECT_WAIT_SECS, INITIAL_RECONNECT_DELAY_SECS,
    MAX_RECONNECT_ATTEMPTS, MAX_RECONNECT_DELAY_SECS, RECONNECT_BACKOFF_FACTOR,
    RECONNECT_MIN_SPACING_SECS, SHORT_LIVED_CONNECTION_SECS, WEBSOCKET_PING_INTERVAL,
};
use crate::device::SharedDevice;
use crate::identity::NodeIdentity;
use crate::stats::Stats;
use crate::token_service::{self, TokenCache};
use crate::topics;

/// Per-broker connection state. One of these is created for every entry in
/// `config.broker`, enabled or not.
struct BrokerRecord {
    name: String,
    index: usize,
    config: BrokerConfig,
    client: Mutex<Option<Arc<dyn BrokerClient>>>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    /// Set when a connect attempt is dispatched, cleared on success or on
    /// the grace window expiring; guards against recreating a client while
    /// its CONNACK is still in flight.
    connecting_since: Mutex<Option<Instant>>,
    connect_instant: Mutex<Option<Instant>>,
    reconnect_at: Mutex<Instant>,
    failed_attempts: AtomicU32,
    reconnect_delay: Mutex<f64>,
}

impl BrokerRecord {
    fn new(index: usize, config: BrokerConfig) -> Self {
        let name = if config.name.is_empty() {
            format!("broker-{index}")
        } else {
            config.name.clone()
        };
        Self {
            name,
            index,
            config,
            client: Mutex::new(None),
            ping_task: Mutex::new(None),
            connected: AtomicBool::new(false),
            connecting_since: Mutex::new(None),
            connect_instant: Mutex::new(None),
            reconnect_at: Mutex::new(Instant::now()),
            failed_attempts: AtomicU32::new(0),
            reconnect_delay: Mutex::new(INITIAL_RECONNECT_DELAY_SECS),
        }
    }
}

/// Drives every configured broker's connection lifecycle: initial connect,
/// reconnect backoff, publish fan-out, and inbound command routing.
pub struct BrokerManager {
    records: Vec<Arc<BrokerRecord>>,
    identity: Arc<NodeIdentity>,
    config: Arc<Config>,
    token_cache: Arc<TokenCache>,
    stats: Arc<Stats>,
    nonces: Arc<NonceStore>,
    device: SharedDevice,
    shutdown: Arc<AtomicBool>,
    client_version: String,
    /// Explicit handle so the keepalive task and `PahoBrokerClient`'s
    /// delivery-confirmation task can be scheduled from any calling thread
    /// (paho's own network callbacks, a detached command-handler thread, or
    /// the main loop after `block_on` has returned) without relying on
    /// `tokio::spawn`'s ambient thread-local runtime context.
    runtime_handle: tokio::runtime::Handle,
}

fn server_uri(server: &str, port: u16, transport: Transport, tls_enabled: bool) -> String {
    let scheme = match (transport, tls_enabled) {
        (Transport::Tcp, false) => "tcp",
        (Transport::Tcp, true) => "ssl",
        (Transport::Websocket, false) => "ws",
        (Transport::Websocket, true) => "wss",
    };
    format!("{scheme}://{server}:{port}")
}

/// Coerce general-purpose publish QoS 1 down to 0. Command responses and
/// the command subscription are never passed through this — they stay
/// hardcoded at QoS 1 regardless of the configured broker QoS (§9).
fn coerce_qos(configured: u8) -> i32 {
    if configured == 1 {
        0
    } else {
        configured as i32
    }
}

impl BrokerManager {
    pub fn new(
        identity: Arc<NodeIdentity>,
        config: Arc<Config>,
        stats: Arc<Stats>,
        nonces: Arc<NonceStore>,
        device: SharedDevice,
        shutdown: Arc<AtomicBool>,
        runtime_handle: tokio::runtime::Handle,
    ) -> Arc<Self> {
        let records = config
            .broker
            .iter()
            .enumerate()
            .map(|(i, b)| Arc::new(BrokerRecord::new(i, b.clone())))
            .collect();

        Arc::new(Self {
            records,
            identity,
            config,
            token_cache: Arc::new(TokenCache::new()),
            stats,
            nonces,
            device,
            shutdown,
            client_version: client_version_string(),
            runtime_handle,
        })
    }

    pub fn total_count(&self) -> usize {
        self.records.len()
    }

    pub fn connected_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.connected.load(Ordering::Relaxed))
            .count()
    }

    pub fn is_any_connected(&self) -> bool {
        self.connected_count() > 0
    }

    /// Dispatch a connect attempt to every enabled broker, then wait up to
    /// `INITIAL_CONNECT_WAIT_SECS` for at least one to report connected.
    pub async fn connect_all(self: &Arc<Self>) {
        for record in &self.records {
            if record.config.enabled {
                self.connect_record(record.clone(), false);
            }
        }

        let deadline = Instant::now() + Duration::from_secs(INITIAL_CONNECT_WAIT_SECS);
        while Instant::now() < deadline {
            if self.is_any_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn connect_record(self: &Arc<Self>, record: Arc<BrokerRecord>, force_refresh: bool) {
        *record.connecting_since.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

        let credentials = token_service::generate_credentials(
            &self.identity,
            record.index,
            &record.config.auth,
            &record.config.tls,
            &self.token_cache,
            force_refresh,
        );
        let Some(credentials) = credentials else {
            warn!(
                "[{}] token auth requested but no private key is available; skipping connect",
                record.name
            );
            return;
        };

        let client_id = topics::client_id_for_broker(&self.config, record.index, &self.identity.public_key);
        let uri = server_uri(
            &record.config.server,
            record.config.port,
            record.config.transport,
            record.config.tls.enabled,
        );

        let lwt_topic = topics::get_topic(&self.config, record.index, "status", Some(&self.identity.public_key));
        let lwt_payload = crate::stats::status_payload(&self.identity, &self.client_version, "offline", None).to_string();

        let manager = self.clone();
        let record_for_connect = record.clone();
        let on_connect: crate::broker_client::ConnectCallback = Box::new(move |_| {
            manager.handle_connected(&record_for_connect);
        });

        let manager = self.clone();
        let record_for_disconnect = record.clone();
        let on_disconnect: crate::broker_client::DisconnectCallback = Box::new(move || {
            manager.handle_disconnected(&record_for_disconnect);
        });

        let manager = self.clone();
        let on_message: crate::broker_client::MessageCallback = Box::new(move |topic, payload| {
            manager.handle_message(topic, payload);
        });

        let cfg = BrokerClientConfig {
            client_id: &client_id,
            transport: record.config.transport,
            username: credentials.username.as_deref(),
            password: credentials.password.as_deref(),
            lwt_topic: &lwt_topic,
            lwt_payload: &lwt_payload,
            lwt_qos: 1,
            lwt_retain: true,
            tls: &record.config.tls,
        };

        let client = match PahoBrokerClient::new(
            &uri,
            &cfg,
            self.runtime_handle.clone(),
            on_connect,
            on_disconnect,
            on_message,
        ) {
            Ok(c) => c,
            Err(e) => {
                error!("[{}] failed to construct MQTT client: {e}", record.name);
                return;
            }
        };

        let keepalive = Duration::from_secs(record.config.keepalive as u64);
        if let Err(e) = client.connect_with(&uri, &cfg, keepalive) {
            error!("[{}] connect dispatch failed: {e}", record.name);
            return;
        }

        let client: Arc<dyn BrokerClient> = Arc::new(client);
        *record.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);

        if record.config.transport == Transport::Websocket {
            self.spawn_ping_task(record.clone());
        }

        info!("[{}] connecting to {uri}", record.name);
    }

    /// `paho-mqtt`'s Rust binding exposes no way to send a raw wire-level
    /// PING outside the client's own internal keepalive loop. This task
    /// polls liveness at the documented cadence instead; real keepalive
    /// still comes from `keep_alive_interval` on the connect options.
    fn spawn_ping_task(self: &Arc<Self>, record: Arc<BrokerRecord>) {
        let manager = self.clone();
        let handle = self.runtime_handle.spawn(async move {
            loop {
                tokio::time::sleep(WEBSOCKET_PING_INTERVAL).await;
                if manager.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                let connected = record
                    .client
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_ref()
                    .map(|c| c.is_connected())
                    .unwrap_or(false);
                if !connected {
                    return;
                }
                debug!("[{}] websocket keepalive check ok", record.name);
            }
        });
        *record.ping_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn handle_connected(&self, record: &Arc<BrokerRecord>) {
        record.connected.store(true, Ordering::Relaxed);
        *record.connecting_since.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *record.connect_instant.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        record.failed_attempts.store(0, Ordering::Relaxed);
        *record.reconnect_delay.lock().unwrap_or_else(|e| e.into_inner()) = INITIAL_RECONNECT_DELAY_SECS;
        info!("[{}] connected", record.name);

        if let Some(client) = record.client.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let commands_topic = topics::serial_commands_topic(&self.config.general.iata, &self.identity.public_key);
            if let Err(e) = client.subscribe(&commands_topic, 1) {
                warn!("[{}] failed to subscribe to {commands_topic}: {e}", record.name);
            }
        }

        let payload = crate::stats::status_payload(
            &self.identity,
            &self.client_version,
            "online",
            Some(&self.stats.device_stats()),
        );
        self.publish_status_on_connect(record.index, &payload);
    }

    fn handle_disconnected(&self, record: &Arc<BrokerRecord>) {
        if record.connected.swap(false, Ordering::Relaxed) {
            warn!("[{}] disconnected", record.name);
            self.stats.record_reconnect(record.index);
        }
    }

    fn handle_message(self: &Arc<Self>, topic: &str, payload: &[u8]) {
        if !topic.ends_with("/serial/commands") {
            return;
        }
        let Ok(jwt) = std::str::from_utf8(payload) else {
            warn!("[SERIAL] command message was not valid UTF-8");
            return;
        };
        let jwt = jwt.to_string();

        // Spawned off the paho network thread: `execute_command` can block
        // for up to `command_timeout` seconds on the serial round trip.
        let device_slot = self.device.clone();
        let nonces = self.nonces.clone();
        let config = self.config.clone();
        let identity = self.identity.clone();
        let response_topic = topics::serial_responses_topic(&config.general.iata, &identity.public_key);
        let manager = self.clone();

        std::thread::spawn(move || {
            let device = device_slot.lock().unwrap_or_else(|e| e.into_inner()).clone();
            command::handle_serial_command(
                &jwt,
                &config.remote_serial,
                &identity,
                device.as_deref(),
                &nonces,
                manager.as_ref(),
                &response_topic,
            );
        });
    }

    /// Advance the reconnect state machine for every enabled, disconnected
    /// broker. Called once per main-loop tick.
    pub fn reconnect_tick(self: &Arc<Self>) {
        for record in self.records.clone() {
            if !record.config.enabled || record.connected.load(Ordering::Relaxed) {
                continue;
            }

            if let Some(since) = *record.connecting_since.lock().unwrap_or_else(|e| e.into_inner()) {
                if since.elapsed() < Duration::from_secs(RECONNECT_MIN_SPACING_SECS) {
                    continue;
                }
            }

            let reconnect_at = *record.reconnect_at.lock().unwrap_or_else(|e| e.into_inner());
            if Instant::now() < reconnect_at {
                continue;
            }

            let attempts = record.failed_attempts.fetch_add(1, Ordering::Relaxed) + 1;
            if attempts >= MAX_RECONNECT_ATTEMPTS {
                error!(
                    "[{}] exceeded {MAX_RECONNECT_ATTEMPTS} reconnect attempts, giving up",
                    record.name
                );
                self.shutdown.store(true, Ordering::Relaxed);
                return;
            }

            // A connection that was up for longer than the short-lived
            // window resets backoff, since it wasn't really a failed
            // attempt — just a drop after useful service.
            if let Some(connected_at) = record.connect_instant.lock().unwrap_or_else(|e| e.into_inner()).take() {
                if connected_at.elapsed().as_secs() >= SHORT_LIVED_CONNECTION_SECS {
                    record.failed_attempts.store(1, Ordering::Relaxed);
                    *record.reconnect_delay.lock().unwrap_or_else(|e| e.into_inner()) = INITIAL_RECONNECT_DELAY_SECS;
                }
            }

            warn!("[{}] attempting reconnect ({attempts}/{MAX_RECONNECT_ATTEMPTS})", record.name);
            self.stop_client(&record);
            self.token_cache.invalidate(record.index);
            self.connect_record(record.clone(), true);

            let mut delay = record.reconnect_delay.lock().unwrap_or_else(|e| e.into_inner());
            let jitter = rand::rng().random_range(-0.5..=0.5);
            let next_wait = (*delay + jitter).max(0.1);
            *record.reconnect_at.lock().unwrap_or_else(|e| e.into_inner()) =
                Instant::now() + Duration::from_secs_f64(next_wait);
            *delay = (*delay * RECONNECT_BACKOFF_FACTOR).min(MAX_RECONNECT_DELAY_SECS);
        }
    }

    fn stop_client(&self, record: &Arc<BrokerRecord>) {
        if let Some(client) = record.client.lock().unwrap_or_else(|e| e.into_inner()).take() {
            client.disconnect();
        }
        if let Some(handle) = record.ping_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        record.connected.store(false, Ordering::Relaxed);
    }

    /// Abort every broker's keepalive task without touching the client
    /// connections themselves — used at the start of shutdown so the
    /// offline status can still be published before brokers go down.
    pub fn stop_ping_tasks(&self) {
        for record in &self.records {
            if let Some(handle) = record.ping_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
                handle.abort();
            }
        }
    }

    /// Disconnect every broker and clear its client slot.
    pub fn shutdown_all(&self) {
        for record in &self.records {
            self.stop_client(record);
        }
    }

    fn publish_resolved(&self, topic_type: &str, payload: &str, retain: bool, target: Option<usize>) -> bool {
        if !self.is_any_connected() {
            self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut any = false;
        for record in &self.records {
            if let Some(target) = target {
                if record.index != target {
                    continue;
                }
            }
            if !record.connected.load(Ordering::Relaxed) {
                continue;
            }
            let topic = topics::get_topic(&self.config, record.index, topic_type, Some(&self.identity.public_key));
            if topic.is_empty() {
                continue;
            }
            let qos = coerce_qos(record.config.qos);
            if let Some(client) = record.client.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                if client.publish(&topic, payload, qos, retain) {
                    any = true;
                } else {
                    self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        any
    }

    /// Publish a decoded packet (or a raw debug line) to every connected
    /// broker. Retain is always forced off — these are live telemetry, not
    /// a snapshot worth persisting on the broker.
    pub fn publish_packet_or_debug(&self, topic_type: &str, payload: &str) -> bool {
        self.publish_resolved(topic_type, payload, false, None)
    }

    /// Publish the status payload fired right after one broker's own
    /// CONNACK. Retain follows that broker's own configured `retain`.
    pub fn publish_status_on_connect(&self, broker_idx: usize, payload: &Value) {
        let retain = self
            .records
            .iter()
            .find(|r| r.index == broker_idx)
            .map(|r| r.config.retain)
            .unwrap_or(true);
        self.publish_resolved("status", &payload.to_string(), retain, Some(broker_idx));
    }

    /// Publish a status payload to every connected broker (periodic report,
    /// shutdown). Always non-retained, regardless of broker config.
    pub fn publish_status_broadcast(&self, payload: &Value) -> bool {
        self.publish_resolved("status", &payload.to_string(), false, None)
    }

    pub fn total_broker_count(&self) -> usize {
        self.records.len()
    }

    /// `"name:count"` summary of 24h reconnect history per broker, for the
    /// stats reporter's service-uptime line. `"none"` if every broker's
    /// history is empty.
    pub fn reconnect_summary(&self, stats: &Stats) -> String {
        let counts = stats.prune_and_count_reconnects();
        let parts: Vec<String> = self
            .records
            .iter()
            .filter_map(|r| counts.get(&r.index).map(|n| format!("{}:{n}", r.name)))
            .collect();
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(", ")
        }
    }
}

impl ResponsePublisher for BrokerManager {
    /// Command responses are never QoS-coerced or topic-templated — always
    /// QoS 1, non-retained, on the literal serial/responses topic.
    fn publish_to_all(&self, topic: &str, payload: &str) -> bool {
        let mut any = false;
        for record in &self.records {
            if !record.connected.load(Ordering::Relaxed) {
                continue;
            }
            if let Some(client) = record.client.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                if client.publish(topic, payload, 1, false) {
                    any = true;
                }
            }
        }
        any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, TlsConfig, TopicTemplates};

    fn test_identity() -> Arc<NodeIdentity> {
        Arc::new(NodeIdentity {
            name: "Repeater One".to_string(),
            public_key: "A".repeat(64),
            private_key: None,
            radio_info: None,
            firmware_version: None,
            board_type: None,
        })
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            broker: vec![BrokerConfig {
                name: "primary".to_string(),
                enabled: true,
                server: "broker.example".to_string(),
                port: 1883,
                qos: 1,
                auth: AuthConfig::default(),
                tls: TlsConfig::default(),
                topics: TopicTemplates {
                    status: "meshcore/{IATA}/status".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    fn test_runtime_handle() -> tokio::runtime::Handle {
        use std::sync::OnceLock;
        static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
        RUNTIME
            .get_or_init(|| tokio::runtime::Runtime::new().unwrap())
            .handle()
            .clone()
    }

    fn manager() -> Arc<BrokerManager> {
        BrokerManager::new(
            test_identity(),
            test_config(),
            Arc::new(Stats::default()),
            Arc::new(NonceStore::new()),
            Arc::new(Mutex::new(None)),
            Arc::new(AtomicBool::new(false)),
            test_runtime_handle(),
        )
    }

    #[test]
    fn records_are_created_for_every_configured_broker_including_disabled() {
        let manager = manager();
        assert_eq!(manager.total_count(), 1);
        assert_eq!(manager.connected_count(), 0);
    }

    #[test]
    fn qos_one_is_coerced_to_zero_for_general_publishes() {
        assert_eq!(coerce_qos(1), 0);
        assert_eq!(coerce_qos(0), 0);
        assert_eq!(coerce_qos(2), 2);
    }

    #[test]
    fn server_uri_maps_transport_and_tls_to_scheme() {
        assert_eq!(server_uri("h", 1, Transport::Tcp, false), "tcp://h:1");
        assert_eq!(server_uri("h", 1, Transport::Tcp, true), "ssl://h:1");
        assert_eq!(server_uri("h", 1, Transport::Websocket, false), "ws://h:1");
        assert_eq!(server_uri("h", 1, Transport::Websocket, true), "wss://h:1");
    }

    #[test]
    fn publish_with_no_connected_brokers_reports_no_delivery() {
        let manager = manager();
        let payload = Value::String("{}".to_string());
        assert!(!manager.publish_status_broadcast(&payload));
        assert_eq!(manager.stats.publish_failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn repeated_publishes_while_disconnected_bump_failures_once_each() {
        let manager = manager();
        let payload = Value::String("{}".to_string());
        manager.publish_status_broadcast(&payload);
        manager.publish_status_broadcast(&payload);
        assert_eq!(manager.stats.publish_failures.load(Ordering::Relaxed), 2);
    }
}
