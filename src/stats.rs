//! Process-wide counters and the reconnect/device-stats history the stats
//! reporter logs from. Counters are atomics so callbacks running on a
//! broker client's own network task can bump them without a lock; the
//! small amount of structured state (reconnect timestamps, merged device
//! stats) sits behind a mutex.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Local;
use serde_json::{Map, Value};

use crate::constants::RECONNECT_HISTORY_WINDOW_SECS;
use crate::identity::NodeIdentity;

/// Build a status-topic payload: `online`/`offline` plus the node's
/// identity fields and, when given, the current merged device stats.
pub fn status_payload(
    identity: &NodeIdentity,
    client_version: &str,
    status: &str,
    device_stats: Option<&Map<String, Value>>,
) -> Value {
    let mut message = Map::new();
    message.insert("status".to_string(), Value::from(status));
    message.insert("timestamp".to_string(), Value::from(Local::now().to_rfc3339()));
    message.insert("origin".to_string(), Value::from(identity.name.clone()));
    message.insert("origin_id".to_string(), Value::from(identity.public_key.clone()));
    if let Some(radio) = &identity.radio_info {
        message.insert("radio".to_string(), Value::from(radio.clone()));
    }
    if let Some(model) = &identity.board_type {
        message.insert("model".to_string(), Value::from(model.clone()));
    }
    if let Some(firmware) = &identity.firmware_version {
        message.insert("firmware_version".to_string(), Value::from(firmware.clone()));
    }
    message.insert("client_version".to_string(), Value::from(client_version));
    if let Some(stats) = device_stats {
        if !stats.is_empty() {
            message.insert("stats".to_string(), Value::Object(stats.clone()));
        }
    }
    Value::Object(message)
}

#[derive(Debug)]
pub struct Stats {
    start_time: Instant,
    pub packets_rx: AtomicU64,
    pub packets_tx: AtomicU64,
    packets_rx_prev: AtomicU64,
    packets_tx_prev: AtomicU64,
    pub bytes_processed: AtomicU64,
    pub publish_failures: AtomicU64,
    last_report: Mutex<Instant>,
    reconnects: Mutex<BTreeMap<usize, Vec<Instant>>>,
    device: Mutex<Map<String, Value>>,
    device_prev: Mutex<Map<String, Value>>,
}

impl Default for Stats {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            packets_rx: AtomicU64::new(0),
            packets_tx: AtomicU64::new(0),
            packets_rx_prev: AtomicU64::new(0),
            packets_tx_prev: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            last_report: Mutex::new(now),
            reconnects: Mutex::new(BTreeMap::new()),
            device: Mutex::new(Map::new()),
            device_prev: Mutex::new(Map::new()),
        }
    }
}

impl Stats {
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn record_reconnect(&self, broker_idx: usize) {
        self.reconnects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(broker_idx)
            .or_default()
            .push(Instant::now());
    }

    /// Drop reconnect timestamps older than 24 hours and return the
    /// surviving count per broker index.
    pub fn prune_and_count_reconnects(&self) -> BTreeMap<usize, usize> {
        let cutoff = Duration::from_secs(RECONNECT_HISTORY_WINDOW_SECS);
        let mut reconnects = self.reconnects.lock().unwrap_or_else(|e| e.into_inner());
        let mut counts = BTreeMap::new();
        for (broker_idx, timestamps) in reconnects.iter_mut() {
            timestamps.retain(|ts| ts.elapsed() < cutoff);
            if !timestamps.is_empty() {
                counts.insert(*broker_idx, timestamps.len());
            }
        }
        counts
    }

    /// Replace the merged device stats, moving the previous snapshot aside
    /// for delta computations in the next report.
    pub fn set_device_stats(&self, fresh: Map<String, Value>) {
        let mut device = self.device.lock().unwrap_or_else(|e| e.into_inner());
        let mut prev = self.device_prev.lock().unwrap_or_else(|e| e.into_inner());
        *prev = device.clone();
        *device = fresh;
    }

    pub fn device_stats(&self) -> Map<String, Value> {
        self.device.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn device_stats_prev(&self) -> Map<String, Value> {
        self.device_prev
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Packets-per-minute over the window since the last call, and the
    /// elapsed window itself. Also rolls the rx/tx "previous" markers and
    /// the report clock forward.
    pub fn take_packet_rate(&self) -> (f64, Duration) {
        let mut last_report = self.last_report.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = last_report.elapsed();
        *last_report = Instant::now();

        let rx = self.packets_rx.load(Ordering::Relaxed);
        let tx = self.packets_tx.load(Ordering::Relaxed);
        let rx_prev = self.packets_rx_prev.swap(rx, Ordering::Relaxed);
        let tx_prev = self.packets_tx_prev.swap(tx, Ordering::Relaxed);

        let delta = (rx - rx_prev) + (tx - tx_prev);
        let per_minute = if elapsed.as_secs_f64() > 0.0 {
            (delta as f64 / elapsed.as_secs_f64()) * 60.0
        } else {
            0.0
        };
        (per_minute, elapsed)
    }
}

/// Human-scaled byte count, matching the reporter's B/KB/MB/GB formatting.
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let bytes_f = bytes as f64;
    if bytes_f < KB {
        format!("{bytes}B")
    } else if bytes_f < MB {
        format!("{:.1}KB", bytes_f / KB)
    } else if bytes_f < GB {
        format!("{:.1}MB", bytes_f / MB)
    } else {
        format!("{:.2}GB", bytes_f / GB)
    }
}

/// Human-scaled duration, matching the reporter's `"Xh Ym"` / `"Ym"` style.
pub fn format_duration_hm(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

fn as_f64(v: Option<&Value>) -> Option<f64> {
    v.and_then(Value::as_f64)
}

fn as_u64(v: Option<&Value>) -> Option<u64> {
    v.and_then(Value::as_u64)
}

/// Format the "[DEVICE] ..." log line from the merged device-stats map,
/// matching the original reporter's field selection: noise floor, radio
/// airtime over the interval (falling back to a cumulative total when no
/// prior sample exists), battery, device uptime, firmware debug flags,
/// queue length, and RX error rate over the interval. `None` when the
/// current snapshot carries none of these fields.
pub fn device_stats_log_line(
    current: &Map<String, Value>,
    prev: &Map<String, Value>,
    elapsed: Duration,
) -> Option<String> {
    if current.is_empty() {
        return None;
    }
    let mut parts = Vec::new();

    if let Some(noise) = current.get("noise_floor") {
        parts.push(format!("Noise: {noise}dB"));
    }

    if let (Some(tx), Some(rx), Some(uptime)) = (
        as_f64(current.get("tx_air_secs")),
        as_f64(current.get("rx_air_secs")),
        as_f64(current.get("uptime_secs")),
    ) {
        let prior = (
            as_f64(prev.get("tx_air_secs")),
            as_f64(prev.get("rx_air_secs")),
            as_f64(prev.get("uptime_secs")),
        );
        if let (Some(tx_prev), Some(rx_prev), Some(uptime_prev)) = prior {
            let tx_delta = tx - tx_prev;
            let rx_delta = rx - rx_prev;
            let uptime_delta = uptime - uptime_prev;
            if uptime_delta > 0.0 {
                let tx_util = (tx_delta / uptime_delta) * 100.0;
                let rx_util = (rx_delta / uptime_delta) * 100.0;
                parts.push(format!(
                    "Air (5m): Tx {tx_delta:.1}s ({tx_util:.2}%), Rx {rx_delta:.1}s ({rx_util:.2}%)"
                ));
            } else {
                parts.push(format!("Air (5m): Tx {tx_delta:.1}s, Rx {rx_delta:.1}s"));
            }
        } else {
            parts.push(format!("Air (5m): Tx {tx}s, Rx {rx}s"));
        }
    }

    if let Some(battery) = current.get("battery_mv") {
        parts.push(format!("Battery: {battery}mV"));
    }

    if let Some(uptime_secs) = as_u64(current.get("uptime_secs")) {
        parts.push(format!("Uptime: {}", format_duration_hm(uptime_secs)));
    }

    if let Some(flags) = current.get("debug_flags") {
        parts.push(format!("Debug Flags: {flags}"));
    }

    if let Some(queue_len) = current.get("queue_len") {
        parts.push(format!("Queue: {queue_len}"));
    }

    if let Some(errors) = as_f64(current.get("recv_errors")) {
        let prev_errors = as_f64(prev.get("recv_errors")).unwrap_or(0.0);
        let delta = errors - prev_errors;
        let per_min = if elapsed.as_secs_f64() > 0.0 {
            (delta / elapsed.as_secs_f64()) * 60.0
        } else {
            0.0
        };
        parts.push(format!("Err/min (5m): {per_min:.1}"));
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn formats_bytes_across_scales() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.0KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00GB");
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration_hm(90), "1m");
        assert_eq!(format_duration_hm(3700), "1h 1m");
    }

    #[test]
    fn reconnect_pruning_drops_entries_beyond_window() {
        let stats = Stats::default();
        stats.record_reconnect(0);
        let counts = stats.prune_and_count_reconnects();
        assert_eq!(counts.get(&0), Some(&1));
    }

    #[test]
    fn packet_rate_reflects_delta_since_last_call() {
        let stats = Stats::default();
        stats.packets_rx.store(10, Ordering::Relaxed);
        let (_rate, _elapsed) = stats.take_packet_rate();
        stats.packets_rx.store(16, Ordering::Relaxed);
        let (rate, _) = stats.take_packet_rate();
        assert!(rate > 0.0);
    }

    #[test]
    fn device_stats_roundtrip_tracks_previous_snapshot() {
        let stats = Stats::default();
        let mut first = Map::new();
        first.insert("battery_mv".to_string(), Value::from(4000));
        stats.set_device_stats(first.clone());
        assert_eq!(stats.device_stats(), first);

        let mut second = Map::new();
        second.insert("battery_mv".to_string(), Value::from(3900));
        stats.set_device_stats(second.clone());
        assert_eq!(stats.device_stats(), second);
        assert_eq!(stats.device_stats_prev(), first);
    }
}
