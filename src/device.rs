//! The Device Link: a serialized, half-duplex line dialogue with the
//! attached MeshCore repeater over a serial port.
//!
//! Every operation takes the same internal lock for the duration of its
//! write + wait + read, so a background line reader can never interleave
//! with a foreground getter or command execution (§4.1, §5).

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use serialport::{ClearBuffer, SerialPort};

use crate::config::SerialConfig;
use crate::constants::{DEFAULT_READ_DELAY, KEY_READ_DELAY, PROMPT_MARKER, PROMPT_MARKER_NAMED};

/// The runtime's single slot for "the currently open serial link, if any".
/// Swapped to `None` on close and back to `Some` on reopen by the main
/// loop's watchdog; the Broker Manager clones the `Arc` to dispatch a
/// command without holding this outer lock for the duration of the call.
pub type SharedDevice = Arc<Mutex<Option<Arc<DeviceLink>>>>;

struct Inner {
    port: Box<dyn SerialPort>,
    /// Bytes read from the port but not yet split into complete lines.
    line_buffer: String,
}

/// Owns the serial handle. Implementations must never expose it raw —
/// every access goes through a method here, under `lock`.
pub struct DeviceLink {
    inner: Mutex<Inner>,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl DeviceLink {
    /// Try each configured port in order; first success wins.
    pub fn connect(config: &SerialConfig) -> Option<Self> {
        for port_path in &config.ports {
            match open_port(port_path, config.baud_rate, config.timeout) {
                Ok(mut port) => {
                    if let Err(e) = port.write_all(b"\r\n\r\n") {
                        warn!("Failed to resync {port_path}: {e}");
                        continue;
                    }
                    let _ = port.clear(ClearBuffer::All);
                    info!("Connected to {port_path}");
                    return Some(Self {
                        inner: Mutex::new(Inner {
                            port,
                            line_buffer: String::new(),
                        }),
                        last_activity: Mutex::new(Instant::now()),
                        closed: AtomicBool::new(false),
                    });
                }
                Err(e) => {
                    warn!("Failed to connect to {port_path}: {e}");
                }
            }
        }
        error!("Failed to connect to any serial port");
        None
    }

    fn touch_activity(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn seconds_since_activity(&self) -> f64 {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
            .as_secs_f64()
    }

    fn send(&self, cmd: &str, delay: Duration) -> std::io::Result<String> {
        if self.closed.load(Ordering::Relaxed) {
            return Ok(String::new());
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.port.clear(ClearBuffer::All).ok();
        inner.port.write_all(cmd.as_bytes())?;
        drop(inner);
        std::thread::sleep(delay);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let response = read_available(&mut inner.port)?;
        if !response.is_empty() {
            drop(inner);
            self.touch_activity();
        }
        Ok(response)
    }

    pub fn set_time(&self) {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        match self.send(&format!("time {epoch}\r\n"), DEFAULT_READ_DELAY) {
            Ok(resp) => debug!("Set time response: {resp}"),
            Err(e) => warn!("Failed to set device time: {e}"),
        }
    }

    pub fn get_name(&self) -> Option<String> {
        let response = self.send("get name\r\n", DEFAULT_READ_DELAY).ok()?;
        let name = extract_named_prompt_reply(&response)?;
        if name.is_empty() {
            error!("Failed to get repeater name from response");
            return None;
        }
        info!("Repeater name: {name}");
        Some(name)
    }

    pub fn get_pubkey(&self) -> Option<String> {
        let response = self.send("get public.key\r\n", KEY_READ_DELAY).ok()?;
        let raw = extract_named_prompt_reply(&response)?;
        let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        if cleaned.len() != 64 || !is_hex(&cleaned) {
            error!("Invalid public key format: {cleaned:?}");
            return None;
        }
        let upper = cleaned.to_uppercase();
        info!("Repeater pub key: {upper}");
        Some(upper)
    }

    pub fn get_privkey(&self) -> Option<String> {
        let response = self.send("get prv.key\r\n", KEY_READ_DELAY).ok()?;
        let raw = extract_named_prompt_reply(&response)?;
        let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        if cleaned.len() != 128 {
            error!(
                "Private key response wrong length: {} (expected 128)",
                cleaned.len()
            );
            return None;
        }
        if !is_hex(&cleaned) {
            error!("Private key response not valid hex");
            return None;
        }
        info!("Repeater priv key: {}... (truncated for security)", &cleaned[..4.min(cleaned.len())]);
        Some(cleaned)
    }

    pub fn get_radio_info(&self) -> Option<String> {
        let response = self.send("get radio\r\n", DEFAULT_READ_DELAY).ok()?;
        let info = extract_named_prompt_reply(&response)?;
        if info.is_empty() {
            error!("Failed to get radio info from response");
            return None;
        }
        Some(info)
    }

    pub fn get_firmware_version(&self) -> Option<String> {
        let response = self.send("ver\r\n", DEFAULT_READ_DELAY).ok()?;
        let version = extract_plain_prompt_reply(&response)?;
        if version.is_empty() {
            warn!("Failed to get firmware version from response");
            return None;
        }
        info!("Firmware version: {version}");
        Some(version)
    }

    pub fn get_board_type(&self) -> Option<String> {
        let response = self.send("board\r\n", DEFAULT_READ_DELAY).ok()?;
        let mut board = extract_plain_prompt_reply(&response)?;
        if board.is_empty() {
            warn!("Failed to get board type from response");
            return None;
        }
        if board == "Unknown command" {
            board = "unknown".to_string();
        }
        info!("Board type: {board}");
        Some(board)
    }

    /// Issue the three stats subcommands and merge whatever parses. The
    /// `stats-core` subcommand's `errors` field is surfaced under the key
    /// `debug_flags` in the merged map — a firmware naming quirk preserved
    /// verbatim rather than renamed.
    pub fn get_device_stats(&self) -> Map<String, Value> {
        let mut stats = Map::new();

        if let Ok(response) = self.send("stats-core\r\n", DEFAULT_READ_DELAY) {
            if let Some(core) = parse_stats_json(&response) {
                for (src, dst) in [
                    ("battery_mv", "battery_mv"),
                    ("uptime_secs", "uptime_secs"),
                    ("queue_len", "queue_len"),
                ] {
                    if let Some(v) = core.get(src) {
                        stats.insert(dst.to_string(), v.clone());
                    }
                }
                if let Some(v) = core.get("errors") {
                    stats.insert("debug_flags".to_string(), v.clone());
                }
            }
        }

        if let Ok(response) = self.send("stats-radio\r\n", DEFAULT_READ_DELAY) {
            if let Some(radio) = parse_stats_json(&response) {
                for key in ["noise_floor", "tx_air_secs", "rx_air_secs"] {
                    if let Some(v) = radio.get(key) {
                        stats.insert(key.to_string(), v.clone());
                    }
                }
            }
        }

        if let Ok(response) = self.send("stats-packets\r\n", DEFAULT_READ_DELAY) {
            if let Some(packets) = parse_stats_json(&response) {
                if let Some(v) = packets.get("recv_errors") {
                    stats.insert("recv_errors".to_string(), v.clone());
                }
            }
        }

        stats
    }

    /// Write `command`, poll until the device's prompt reappears or
    /// `timeout` elapses, and return the stripped response text.
    pub fn execute_command(&self, command: &str, timeout: Duration) -> (bool, String) {
        if self.closed.load(Ordering::Relaxed) {
            return (false, "Device link closed".to_string());
        }

        let mut cmd = command.trim().to_string();
        if !cmd.ends_with("\r\n") {
            cmd.push_str("\r\n");
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = inner.port.clear(ClearBuffer::All) {
            return (false, format!("Serial error: {e}"));
        }
        if let Err(e) = inner.port.write_all(cmd.as_bytes()) {
            return (false, format!("Serial error: {e}"));
        }
        debug!("[SERIAL] Sent: {}", command.trim());

        let start = Instant::now();
        let mut accumulated = String::new();
        while start.elapsed() < timeout {
            std::thread::sleep(Duration::from_millis(100));
            match read_available(&mut inner.port) {
                Ok(chunk) if !chunk.is_empty() => {
                    accumulated.push_str(&chunk);
                    let trimmed = accumulated.trim_end();
                    if accumulated.contains(PROMPT_MARKER) || trimmed.ends_with('>') {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => return (false, format!("Serial error: {e}")),
            }
        }
        drop(inner);
        if !accumulated.is_empty() {
            self.touch_activity();
        }

        let mut text = if let Some(idx) = accumulated.find(PROMPT_MARKER_NAMED) {
            accumulated[idx + PROMPT_MARKER_NAMED.len()..].trim().to_string()
        } else if let Some(idx) = accumulated.find(PROMPT_MARKER) {
            accumulated[idx + PROMPT_MARKER.len()..].trim().to_string()
        } else if let Some(idx) = accumulated.find("> ") {
            accumulated[idx + 2..].trim().to_string()
        } else {
            accumulated.trim().to_string()
        };

        let trimmed_command = command.trim();
        if text.starts_with(trimmed_command) {
            text = text[trimmed_command.len()..].trim().to_string();
        }
        let text = text.trim_end_matches(['>', ' ']).trim().to_string();

        let text = if text.is_empty() {
            "(no output)".to_string()
        } else {
            text
        };

        debug!(
            "[SERIAL] Response: {}{}",
            &text[..text.len().min(100)],
            if text.len() > 100 { "..." } else { "" }
        );
        (true, text)
    }

    /// Non-blocking: returns the next complete line already buffered or
    /// newly available, or `None` if nothing is ready yet.
    pub fn read_line(&self) -> Option<String> {
        if self.closed.load(Ordering::Relaxed) {
            return None;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let waiting = inner.port.bytes_to_read().unwrap_or(0);
        if waiting > 0 {
            if let Ok(chunk) = read_available(&mut inner.port) {
                inner.line_buffer.push_str(&chunk);
            }
        }

        if let Some(pos) = inner.line_buffer.find('\n') {
            let line: String = inner.line_buffer.drain(..=pos).collect();
            let trimmed = line.trim().to_string();
            drop(inner);
            if !trimmed.is_empty() {
                self.touch_activity();
                return Some(trimmed);
            }
            return None;
        }
        None
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        debug!("Closing serial connection");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

fn open_port(path: &str, baud_rate: u32, timeout_secs: u64) -> serialport::Result<Box<dyn SerialPort>> {
    serialport::new(path, baud_rate)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .data_bits(serialport::DataBits::Eight)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_secs(timeout_secs))
        .open()
}

fn read_available(port: &mut Box<dyn SerialPort>) -> std::io::Result<String> {
    let waiting = port.bytes_to_read().unwrap_or(0) as usize;
    if waiting == 0 {
        return Ok(String::new());
    }
    let mut buf = vec![0u8; waiting];
    let n = port.read(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Extract the first line after a `-> >` prompt.
fn extract_named_prompt_reply(response: &str) -> Option<String> {
    let (_, rest) = response.split_once(PROMPT_MARKER_NAMED)?;
    Some(first_line(rest))
}

/// Extract the first line after a `-> ` prompt.
fn extract_plain_prompt_reply(response: &str) -> Option<String> {
    let (_, rest) = response.split_once(PROMPT_MARKER)?;
    Some(first_line(rest))
}

fn first_line(s: &str) -> String {
    let first = s.split('\n').next().unwrap_or(s);
    first.replace('\r', "").trim().to_string()
}

fn parse_stats_json(response: &str) -> Option<Map<String, Value>> {
    if !response.contains(PROMPT_MARKER) || response.contains("Unknown command") {
        return None;
    }
    let json_str = extract_plain_prompt_reply(response)?;
    serde_json::from_str::<Value>(&json_str)
        .ok()?
        .as_object()
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_line_after_named_prompt() {
        let response = "get name\r\n-> >Repeater One\r\n> ";
        assert_eq!(
            extract_named_prompt_reply(response),
            Some("Repeater One".to_string())
        );
    }

    #[test]
    fn extracts_first_line_after_plain_prompt() {
        let response = "ver\r\n-> 1.2.3\r\n> ";
        assert_eq!(extract_plain_prompt_reply(response), Some("1.2.3".to_string()));
    }

    #[test]
    fn rejects_non_hex_public_key_material() {
        assert!(!is_hex("not-hex-at-all"));
        assert!(is_hex("ABCDEF0123456789"));
    }

    #[test]
    fn parses_stats_json_and_skips_unknown_command() {
        let good = "stats-core\r\n-> {\"battery_mv\": 4000, \"errors\": 2}\r\n> ";
        let parsed = parse_stats_json(good).unwrap();
        assert_eq!(parsed.get("battery_mv").unwrap(), &Value::from(4000));

        let unknown = "stats-core\r\n-> Unknown command\r\n> ";
        assert!(parse_stats_json(unknown).is_none());
    }
}
