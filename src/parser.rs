//! Serial line classification: turns a single line read from the Device
//! Link into a `DEBUG` or `PACKET` event ready for publication, updating
//! the running byte/packet counters along the way.

use std::sync::Mutex;

use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::identity::NodeIdentity;
use crate::stats::Stats;

static PACKET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d{2}:\d{2}:\d{2}) - (\d{1,2}/\d{1,2}/\d{4}) U: (RX|TX), len=(\d+) \(type=(\d+), route=([A-Z]), payload_len=(\d+)\)(?: SNR=(-?\d+) RSSI=(-?\d+) score=(\d+)(?: time=(\d+))? hash=([0-9A-F]+)(?: \[(.*)\])?)?",
    )
    .unwrap()
});

/// A classified serial line, ready to be addressed to a topic and
/// published. Carries its own topic-kind tag so callers don't need to
/// re-derive it from the variant.
#[derive(Debug, Clone)]
pub enum ParsedEvent {
    Debug(Value),
    Packet(Value),
}

impl ParsedEvent {
    pub fn topic_kind(&self) -> &'static str {
        match self {
            ParsedEvent::Debug(_) => "debug",
            ParsedEvent::Packet(_) => "packets",
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            ParsedEvent::Debug(v) | ParsedEvent::Packet(v) => v,
        }
    }
}

/// Holds the one piece of parsing state that spans lines: the most
/// recently seen `RAW` hex blob, attached to the packet line that follows
/// it.
#[derive(Debug, Default)]
pub struct ParserState {
    last_raw: Mutex<Option<String>>,
}

impl ParserState {
    pub fn new() -> Self {
        Self::default()
    }

    fn last_raw(&self) -> Option<String> {
        self.last_raw.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_last_raw(&self, raw: String) {
        *self.last_raw.lock().unwrap_or_else(|e| e.into_inner()) = Some(raw);
    }
}

fn base_message(identity: &NodeIdentity) -> Map<String, Value> {
    let mut message = Map::new();
    message.insert("origin".to_string(), Value::from(identity.name.clone()));
    message.insert("origin_id".to_string(), Value::from(identity.public_key.clone()));
    message.insert(
        "timestamp".to_string(),
        Value::from(Local::now().to_rfc3339()),
    );
    message
}

/// Parse one line from the radio. Returns `None` when the line carries no
/// event worth publishing (a bare `RAW:` line, an unmatched line, or a
/// `DEBUG` line while debug logging is disabled).
pub fn parse_line(
    line: &str,
    identity: &NodeIdentity,
    debug_enabled: bool,
    state: &ParserState,
    stats: &Stats,
) -> Option<ParsedEvent> {
    if line.is_empty() {
        return None;
    }

    log::debug!("From Radio: {line}");

    if let Some((_, raw_part)) = line.split_once("U RAW:") {
        let raw_hex = raw_part.trim().to_string();
        stats
            .bytes_processed
            .fetch_add((raw_hex.len() / 2) as u64, std::sync::atomic::Ordering::Relaxed);
        state.set_last_raw(raw_hex);
        return None;
    }

    if debug_enabled && line.starts_with("DEBUG") {
        let mut message = base_message(identity);
        message.insert("type".to_string(), Value::from("DEBUG"));
        message.insert("message".to_string(), Value::from(line.to_string()));
        return Some(ParsedEvent::Debug(Value::Object(message)));
    }

    let captures = PACKET_PATTERN.captures(line)?;
    let direction = captures.get(3)?.as_str().to_lowercase();

    if direction == "rx" {
        stats.packets_rx.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    } else {
        stats.packets_tx.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    let mut message = base_message(identity);
    message.insert("type".to_string(), Value::from("PACKET"));
    message.insert("direction".to_string(), Value::from(direction.clone()));
    message.insert("time".to_string(), Value::from(captures[1].to_string()));
    message.insert("date".to_string(), Value::from(captures[2].to_string()));
    message.insert("len".to_string(), Value::from(captures[4].to_string()));
    message.insert("packet_type".to_string(), Value::from(captures[5].to_string()));
    let route = captures[6].to_string();
    message.insert("route".to_string(), Value::from(route.clone()));
    message.insert("payload_len".to_string(), Value::from(captures[7].to_string()));
    message.insert(
        "raw".to_string(),
        state
            .last_raw()
            .map(Value::from)
            .unwrap_or(Value::Null),
    );

    if direction == "rx" {
        let group_or_null = |i: usize| {
            captures
                .get(i)
                .map(|m| Value::from(m.as_str().to_string()))
                .unwrap_or(Value::Null)
        };
        message.insert("SNR".to_string(), group_or_null(8));
        message.insert("RSSI".to_string(), group_or_null(9));
        message.insert("score".to_string(), group_or_null(10));
        message.insert("duration".to_string(), group_or_null(11));
        message.insert("hash".to_string(), group_or_null(12));
        if route == "D" {
            if let Some(path) = captures.get(13) {
                message.insert("path".to_string(), Value::from(path.as_str().to_string()));
            }
        }
    }

    Some(ParsedEvent::Packet(Value::Object(message)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> NodeIdentity {
        NodeIdentity {
            name: "Repeater One".to_string(),
            public_key: "ABCD".to_string(),
            private_key: None,
            radio_info: None,
            firmware_version: None,
            board_type: None,
        }
    }

    #[test]
    fn parses_rx_packet_with_telemetry() {
        let state = ParserState::new();
        let stats = Stats::default();
        let line = "12:34:56 - 1/2/2026 U: RX, len=32 (type=1, route=D, payload_len=10) SNR=-5 RSSI=-90 score=80 hash=ABCDEF [AA,BB]";
        let event = parse_line(line, &identity(), false, &state, &stats).unwrap();
        assert_eq!(event.topic_kind(), "packets");
        let payload = event.payload();
        assert_eq!(payload["direction"], "rx");
        assert_eq!(payload["route"], "D");
        assert_eq!(payload["path"], "AA,BB");
        assert_eq!(
            stats.packets_rx.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn parses_tx_packet_without_telemetry_fields() {
        let state = ParserState::new();
        let stats = Stats::default();
        let line = "12:34:56 - 1/2/2026 U: TX, len=32 (type=1, route=F, payload_len=10)";
        let event = parse_line(line, &identity(), false, &state, &stats).unwrap();
        let payload = event.payload();
        assert_eq!(payload["direction"], "tx");
        assert!(payload.get("SNR").is_none());
        assert_eq!(
            stats.packets_tx.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn raw_line_updates_state_and_byte_counter_without_publishing() {
        let state = ParserState::new();
        let stats = Stats::default();
        let line = "12:34:56 - 1/2/2026 U RAW: AABBCCDD";
        let event = parse_line(line, &identity(), false, &state, &stats);
        assert!(event.is_none());
        assert_eq!(state.last_raw(), Some("AABBCCDD".to_string()));
        assert_eq!(
            stats.bytes_processed.load(std::sync::atomic::Ordering::Relaxed),
            4
        );
    }

    #[test]
    fn debug_line_is_dropped_when_debug_disabled() {
        let state = ParserState::new();
        let stats = Stats::default();
        let event = parse_line("DEBUG something happened", &identity(), false, &state, &stats);
        assert!(event.is_none());
    }

    #[test]
    fn debug_line_publishes_when_debug_enabled() {
        let state = ParserState::new();
        let stats = Stats::default();
        let event = parse_line("DEBUG something happened", &identity(), true, &state, &stats).unwrap();
        assert_eq!(event.topic_kind(), "debug");
        assert_eq!(event.payload()["message"], "DEBUG something happened");
    }

    #[test]
    fn raw_blob_is_attached_to_the_following_packet() {
        let state = ParserState::new();
        let stats = Stats::default();
        parse_line(
            "12:34:56 - 1/2/2026 U RAW: AABB",
            &identity(),
            false,
            &state,
            &stats,
        );
        let line = "12:34:57 - 1/2/2026 U: RX, len=32 (type=1, route=F, payload_len=10)";
        let event = parse_line(line, &identity(), false, &state, &stats).unwrap();
        assert_eq!(event.payload()["raw"], "AABB");
    }
}
