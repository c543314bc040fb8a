//! Crate-wide constants: version string, protocol literals, and the handful
//! of timing constants that aren't already attached to `Config` defaults.

use std::time::Duration;

/// Base semantic version, read from `Cargo.toml` at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Device prompt markers that terminate a command/response dialogue.
pub const PROMPT_MARKER: &str = "-> ";
pub const PROMPT_MARKER_NAMED: &str = "-> >";

/// Line terminator the device expects after every command.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Read delay after `get public.key` / `get prv.key`: these two commands are
/// slower to answer on the firmware than the others (grounded in the
/// original serial dialogue).
pub const KEY_READ_DELAY: Duration = Duration::from_millis(1000);

/// Read delay for all other single-shot getters.
pub const DEFAULT_READ_DELAY: Duration = Duration::from_millis(500);

/// How often the main loop ticks.
pub const MAIN_LOOP_TICK: Duration = Duration::from_millis(10);

/// How often the stats reporter wakes up.
pub const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(300);

/// WebSocket keepalive ping cadence.
pub const WEBSOCKET_PING_INTERVAL: Duration = Duration::from_secs(45);

/// Window below which a broker connection counts as "short-lived" (and so a
/// failed attempt) rather than a stable connection.
pub const SHORT_LIVED_CONNECTION_SECS: u64 = 120;

/// How long a reconnect history entry survives before being pruned.
pub const RECONNECT_HISTORY_WINDOW_SECS: u64 = 24 * 3600;

/// Remaining-lifetime floor below which a cached auth token is refreshed
/// rather than reused.
pub const TOKEN_REFRESH_MARGIN_SECS: u64 = 300;

/// Lifetime minted for broker auth tokens.
pub const BROKER_TOKEN_TTL_SECS: u64 = 3600;

/// Lifetime minted for signed command responses.
pub const COMMAND_RESPONSE_TTL_SECS: u64 = 60;

/// Initial delay before the first reconnect attempt on a broker.
pub const INITIAL_RECONNECT_DELAY_SECS: f64 = 1.0;

/// Ceiling the reconnect delay backs off to.
pub const MAX_RECONNECT_DELAY_SECS: f64 = 120.0;

/// Multiplier applied to the reconnect delay after each failed attempt.
pub const RECONNECT_BACKOFF_FACTOR: f64 = 1.5;

/// Consecutive failed reconnect attempts on one broker before the process
/// gives up and exits for a supervisor restart.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 12;

/// How long a freshly created client is given to complete its initial
/// connection attempt before `connect_all` gives up waiting on it.
pub const INITIAL_CONNECT_WAIT_SECS: u64 = 10;

/// Minimum time between recreating a failed client, even once its
/// scheduled `reconnect_at` has passed, to avoid a tight retry loop while
/// a `CONNACK` is still in flight.
pub const RECONNECT_MIN_SPACING_SECS: u64 = 10;

/// Build the `"<app>/<version>[-<git_short>]"` client version string. The
/// git suffix comes from a packaged manifest dropped next to the binary at
/// build/install time; its absence (dev builds, unpackaged runs) is silent.
pub fn client_version_string() -> String {
    match read_git_short_hash() {
        Some(hash) => format!("meshcoretomqtt/{VERSION}-{hash}"),
        None => format!("meshcoretomqtt/{VERSION}"),
    }
}

fn read_git_short_hash() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    let manifest_path = exe.parent()?.join(".version_info");
    let contents = std::fs::read_to_string(manifest_path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&contents).ok()?;
    let hash = value.get("git_hash")?.as_str()?;
    if hash.is_empty() || hash == "unknown" {
        None
    } else {
        Some(hash.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_version_falls_back_to_bare_version_without_manifest() {
        let version = client_version_string();
        assert!(version.starts_with("meshcoretomqtt/"));
    }
}
