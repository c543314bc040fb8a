//! A single MQTT broker connection, wrapped behind a small trait so the
//! broker manager can be tested against an in-memory fake instead of a
//! live broker.
//!
//! `paho-mqtt`'s [`AsyncClient`](paho_mqtt::AsyncClient) already runs its
//! own network thread internally (unlike the synchronous client this
//! abstraction was modeled on), so `loop_start`/`loop_stop` are kept on
//! the trait for symmetry with the original dialogue but are no-ops here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error};

use crate::config::{TlsConfig, Transport};

/// Abstract interface for a single MQTT broker connection. Implemented by
/// [`PahoBrokerClient`] for real use and by recording fakes in tests.
pub trait BrokerClient: Send + Sync {
    fn connect(&self, server: &str, port: u16, keepalive: Duration) -> Result<()>;
    fn disconnect(&self);
    fn publish(&self, topic: &str, payload: &str, qos: i32, retain: bool) -> bool;
    fn subscribe(&self, topic: &str, qos: i32) -> Result<()>;
    fn loop_start(&self) {}
    fn loop_stop(&self) {}
    fn is_connected(&self) -> bool;
}

/// Fired when the broker completes (or fails) a connection attempt.
pub type ConnectCallback = Box<dyn Fn(bool) + Send + Sync>;
/// Fired when an established connection drops.
pub type DisconnectCallback = Box<dyn Fn() + Send + Sync>;
/// Fired for every inbound message: `(topic, payload)`.
pub type MessageCallback = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

#[allow(clippy::too_many_arguments)]
pub struct BrokerClientConfig<'a> {
    pub client_id: &'a str,
    pub transport: Transport,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub lwt_topic: &'a str,
    pub lwt_payload: &'a str,
    pub lwt_qos: i32,
    pub lwt_retain: bool,
    pub tls: &'a TlsConfig,
}

/// Concrete implementation wrapping `paho_mqtt::AsyncClient`.
///
/// Holds an explicit [`tokio::runtime::Handle`] rather than relying on
/// `tokio::spawn`'s ambient thread-local context: `publish` is called from
/// whatever thread paho's own network callbacks run on (or from a plain
/// `std::thread::spawn`'d command handler), none of which ever entered our
/// runtime, so the ambient form would panic there.
pub struct PahoBrokerClient {
    client: paho_mqtt::AsyncClient,
    connected: Arc<AtomicBool>,
    runtime_handle: tokio::runtime::Handle,
}

impl PahoBrokerClient {
    pub fn new(
        server_uri: &str,
        cfg: &BrokerClientConfig,
        runtime_handle: tokio::runtime::Handle,
        on_connect: ConnectCallback,
        on_disconnect: DisconnectCallback,
        on_message: MessageCallback,
    ) -> Result<Self> {
        let create_opts = paho_mqtt::CreateOptionsBuilder::new()
            .server_uri(server_uri)
            .client_id(cfg.client_id)
            .finalize();

        let mut client = paho_mqtt::AsyncClient::new(create_opts)
            .context("failed to construct MQTT client")?;

        let connected = Arc::new(AtomicBool::new(false));

        let connected_for_connect = connected.clone();
        client.set_connected_callback(move |_| {
            connected_for_connect.store(true, Ordering::Relaxed);
            on_connect(true);
        });

        let connected_for_disconnect = connected.clone();
        client.set_connection_lost_callback(move |_| {
            connected_for_disconnect.store(false, Ordering::Relaxed);
            on_disconnect();
        });

        client.set_message_callback(move |_, msg| {
            if let Some(msg) = msg {
                on_message(msg.topic(), msg.payload());
            }
        });

        Ok(Self {
            client,
            connected,
            runtime_handle,
        })
    }

    fn build_connect_options(&self, cfg: &BrokerClientConfig, keepalive: Duration) -> paho_mqtt::ConnectOptions {
        let mut builder = paho_mqtt::ConnectOptionsBuilder::new();
        builder.keep_alive_interval(keepalive).clean_session(true);

        if let (Some(username), password) = (cfg.username, cfg.password) {
            builder.user_name(username);
            if let Some(password) = password {
                builder.password(password);
            }
        }

        if !cfg.lwt_topic.is_empty() {
            let will = paho_mqtt::MessageBuilder::new()
                .topic(cfg.lwt_topic)
                .payload(cfg.lwt_payload.as_bytes())
                .qos(cfg.lwt_qos)
                .retained(cfg.lwt_retain)
                .finalize();
            builder.will_message(will);
        }

        if cfg.tls.enabled {
            let ssl_opts = paho_mqtt::SslOptionsBuilder::new()
                .enable_server_cert_auth(cfg.tls.verify)
                .finalize();
            builder.ssl_options(ssl_opts);
        }

        builder.finalize()
    }

    pub fn connect_with(&self, server_uri: &str, cfg: &BrokerClientConfig, keepalive: Duration) -> Result<()> {
        let _ = server_uri;
        let opts = self.build_connect_options(cfg, keepalive);
        self.client.connect(opts);
        Ok(())
    }
}

impl BrokerClient for PahoBrokerClient {
    fn connect(&self, _server: &str, _port: u16, keepalive: Duration) -> Result<()> {
        // Kept for trait symmetry; real connections go through
        // `connect_with`, which needs the full broker config for auth/TLS.
        // `new` already bound the server URI, so this just reuses default
        // options when called directly (tests exercise fakes instead).
        let opts = paho_mqtt::ConnectOptionsBuilder::new()
            .keep_alive_interval(keepalive)
            .clean_session(true)
            .finalize();
        self.client.connect(opts);
        Ok(())
    }

    fn disconnect(&self) {
        self.client.disconnect(None);
    }

    fn publish(&self, topic: &str, payload: &str, qos: i32, retain: bool) -> bool {
        if !self.is_connected() {
            return false;
        }
        let msg = paho_mqtt::MessageBuilder::new()
            .topic(topic)
            .payload(payload.as_bytes())
            .qos(qos)
            .retained(retain)
            .finalize();
        let token = self.client.publish(msg);
        let topic_owned = topic.to_string();
        self.runtime_handle.spawn(async move {
            if let Err(e) = token.await {
                error!("Publish delivery failed for {topic_owned}: {e}");
            } else {
                debug!("Published to {topic_owned}");
            }
        });
        true
    }

    fn subscribe(&self, topic: &str, qos: i32) -> Result<()> {
        self.client.subscribe(topic, qos);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records publishes and subscriptions instead of touching the network.
    #[derive(Default)]
    pub struct FakeBrokerClient {
        pub connected: AtomicBool,
        pub published: Mutex<Vec<(String, String, i32, bool)>>,
        pub subscribed: Mutex<Vec<(String, i32)>>,
    }

    impl BrokerClient for FakeBrokerClient {
        fn connect(&self, _server: &str, _port: u16, _keepalive: Duration) -> Result<()> {
            self.connected.store(true, Ordering::Relaxed);
            Ok(())
        }

        fn disconnect(&self) {
            self.connected.store(false, Ordering::Relaxed);
        }

        fn publish(&self, topic: &str, payload: &str, qos: i32, retain: bool) -> bool {
            if !self.is_connected() {
                return false;
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_string(), qos, retain));
            true
        }

        fn subscribe(&self, topic: &str, qos: i32) -> Result<()> {
            self.subscribed.lock().unwrap().push((topic.to_string(), qos));
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn fake_client_refuses_to_publish_while_disconnected() {
        let client = FakeBrokerClient::default();
        assert!(!client.publish("topic", "payload", 0, false));
        assert!(client.published.lock().unwrap().is_empty());
    }

    #[test]
    fn fake_client_records_publishes_once_connected() {
        let client = FakeBrokerClient::default();
        client.connect("localhost", 1883, Duration::from_secs(60)).unwrap();
        assert!(client.publish("topic", "payload", 0, true));
        let published = client.published.lock().unwrap();
        assert_eq!(published[0], ("topic".to_string(), "payload".to_string(), 0, true));
    }
}
