//! Configuration loading: TOML parsing, deep merging, and broker list merging.
//!
//! The on-disk format and merge semantics mirror a base file overlaid by an
//! alphabetically-ordered `config.d` directory of drop-in overrides, unless
//! explicit `--config` paths are given, in which case only those paths are
//! loaded, in order, and the default search path is skipped entirely.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Root of the default system configuration (overridable for tests via
/// `MESHCORETOMQTT_CONFIG_ROOT`).
fn config_root() -> PathBuf {
    std::env::var_os("MESHCORETOMQTT_CONFIG_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/mctomqtt"))
}

fn default_base_path() -> PathBuf {
    config_root().join("config.toml")
}

fn default_config_dir() -> PathBuf {
    config_root().join("config.d")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub iata: String,
    pub sync_time: bool,
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            iata: "XXX".to_string(),
            sync_time: true,
            log_level: "INFO".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub ports: Vec<String>,
    pub baud_rate: u32,
    pub timeout: u64,
    pub watchdog_timeout: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            ports: vec!["/dev/ttyACM0".to_string()],
            baud_rate: 115_200,
            timeout: 2,
            watchdog_timeout: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TopicTemplates {
    pub packets: String,
    pub status: String,
    pub debug: String,
    /// Per-broker IATA override. Only meaningful on a broker's own `topics`
    /// table; the global `topics` table leaves this empty and defers to
    /// `general.iata`.
    pub iata: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Websocket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    None,
    Password,
    Token,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub method: AuthMethod,
    pub username: String,
    pub password: String,
    pub audience: String,
    pub owner: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub name: String,
    pub enabled: bool,
    pub server: String,
    pub port: u16,
    pub transport: Transport,
    pub keepalive: u16,
    pub qos: u8,
    pub retain: bool,
    pub client_id_prefix: String,
    pub tls: TlsConfig,
    pub auth: AuthConfig,
    pub topics: TopicTemplates,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: false,
            server: String::new(),
            port: 1883,
            transport: Transport::Tcp,
            keepalive: 60,
            qos: 0,
            retain: true,
            client_id_prefix: "meshcore_".to_string(),
            tls: TlsConfig::default(),
            auth: AuthConfig::default(),
            topics: TopicTemplates::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSerialConfig {
    pub enabled: bool,
    pub allowed_companions: Vec<String>,
    pub disallowed_commands: Vec<String>,
    pub nonce_ttl: u64,
    pub command_timeout: u64,
}

impl Default for RemoteSerialConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_companions: Vec::new(),
            disallowed_commands: vec![
                "get prv.key".to_string(),
                "set prv.key".to_string(),
                "erase".to_string(),
                "password".to_string(),
            ],
            nonce_ttl: 120,
            command_timeout: 10,
        }
    }
}

/// The fully-merged, parsed configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub serial: SerialConfig,
    pub topics: TopicTemplates,
    pub broker: Vec<BrokerConfig>,
    pub remote_serial: RemoteSerialConfig,
}

impl Config {
    /// Load and merge TOML configuration from the given `--config` paths,
    /// or from the default base file + config.d overlay if `config_paths`
    /// is empty.
    pub fn load(config_paths: &[PathBuf]) -> Result<Self> {
        let raw = if config_paths.is_empty() {
            Self::load_default_tree()?
        } else {
            Self::load_explicit_tree(config_paths)
        };

        let config: Config = raw.try_into().context("invalid configuration shape")?;
        Ok(config)
    }

    fn load_default_tree() -> Result<toml::Value> {
        let base_path = default_base_path();
        let mut tree = if base_path.exists() {
            let loaded = load_toml_file(&base_path)?;
            log::info!("Loaded base config from {}", base_path.display());
            loaded
        } else {
            log::warn!(
                "Base config not found at {}, using defaults",
                base_path.display()
            );
            toml::Value::Table(toml::map::Map::new())
        };

        let config_d = default_config_dir();
        if config_d.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&config_d)
                .with_context(|| format!("reading {}", config_d.display()))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
                .collect();
            entries.sort();
            for override_path in entries {
                log::info!("Loading config override: {}", override_path.display());
                let override_tree = load_toml_file(&override_path)?;
                tree = apply_override(tree, override_tree);
            }
        }
        Ok(tree)
    }

    fn load_explicit_tree(config_paths: &[PathBuf]) -> toml::Value {
        let mut tree = toml::Value::Table(toml::map::Map::new());
        for path in config_paths {
            if !path.exists() {
                log::error!("Config file not found: {}", path.display());
                continue;
            }
            log::info!("Loading config: {}", path.display());
            match load_toml_file(path) {
                Ok(override_tree) => tree = apply_override(tree, override_tree),
                Err(e) => log::error!("Failed to load {}: {e}", path.display()),
            }
        }
        tree
    }

    /// Log a one-line summary of the resolved configuration at startup.
    pub fn log_config_sources(&self) {
        log::info!("IATA: {}", self.general.iata);
        log::info!("Serial ports: {:?}", self.serial.ports);
        log::info!("Brokers configured: {}", self.broker.len());
        for (i, broker) in self.broker.iter().enumerate() {
            let name = if broker.name.is_empty() {
                format!("broker-{i}")
            } else {
                broker.name.clone()
            };
            log::debug!(
                "  [{name}] enabled={} server={}:{}",
                broker.enabled,
                broker.server,
                broker.port
            );
        }
    }
}

fn load_toml_file(path: &Path) -> Result<toml::Value> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Deep merge two TOML tables, with broker lists (the `broker` key) merged
/// by name rather than replaced wholesale.
fn apply_override(base: toml::Value, mut override_tree: toml::Value) -> toml::Value {
    let override_brokers = override_tree
        .as_table_mut()
        .and_then(|t| t.remove("broker"));

    let base_brokers = base.as_table().and_then(|t| t.get("broker")).cloned();

    let mut merged = deep_merge(base, override_tree);

    if let Some(override_brokers) = override_brokers {
        let merged_brokers = merge_broker_lists(base_brokers, override_brokers);
        if let Some(table) = merged.as_table_mut() {
            table.insert("broker".to_string(), merged_brokers);
        }
    }

    merged
}

fn deep_merge(base: toml::Value, override_value: toml::Value) -> toml::Value {
    match (base, override_value) {
        (toml::Value::Table(mut base_table), toml::Value::Table(override_table)) => {
            for (key, value) in override_table {
                let merged = match base_table.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, override_value) => override_value,
    }
}

/// Merge broker lists by `name`: an override entry whose name matches a
/// base entry deep-merges into it in place; an unmatched override entry is
/// appended.
fn merge_broker_lists(base: Option<toml::Value>, override_value: toml::Value) -> toml::Value {
    let override_brokers = match override_value {
        toml::Value::Array(a) => a,
        other => return other,
    };
    let mut base_brokers: Vec<toml::Value> = match base {
        Some(toml::Value::Array(a)) => a,
        _ => Vec::new(),
    };

    if base_brokers.is_empty() {
        return toml::Value::Array(override_brokers);
    }
    if override_brokers.is_empty() {
        return toml::Value::Array(base_brokers);
    }

    let mut by_name: BTreeMap<String, usize> = BTreeMap::new();
    for (i, b) in base_brokers.iter().enumerate() {
        if let Some(name) = b
            .as_table()
            .and_then(|t| t.get("name"))
            .and_then(|v| v.as_str())
        {
            by_name.insert(name.to_string(), i);
        }
    }

    for broker in override_brokers {
        let name = broker
            .as_table()
            .and_then(|t| t.get("name"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        match name.and_then(|n| by_name.get(&n).copied()) {
            Some(idx) => {
                let existing = base_brokers[idx].clone();
                base_brokers[idx] = deep_merge(existing, broker);
            }
            None => base_brokers.push(broker),
        }
    }

    toml::Value::Array(base_brokers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.serial.ports, vec!["/dev/ttyACM0".to_string()]);
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.remote_serial.disallowed_commands.len(), 4);
        assert_eq!(config.remote_serial.nonce_ttl, 120);
    }

    #[test]
    fn deep_merge_overrides_nested_scalars_and_keeps_siblings() {
        let base: toml::Value =
            toml::from_str("[general]\niata = \"XXX\"\nsync_time = true\n").unwrap();
        let over: toml::Value = toml::from_str("[general]\niata = \"CDG\"\n").unwrap();
        let merged = deep_merge(base, over);
        let general = merged.as_table().unwrap().get("general").unwrap();
        assert_eq!(general.get("iata").unwrap().as_str(), Some("CDG"));
        assert_eq!(general.get("sync_time").unwrap().as_bool(), Some(true));
    }

    #[test]
    fn broker_lists_merge_by_name_not_position() {
        let base: toml::Value = toml::from_str(
            "[[broker]]\nname = \"primary\"\nserver = \"a.example\"\n[[broker]]\nname = \"secondary\"\nserver = \"b.example\"\n",
        )
        .unwrap();
        let base_brokers = base.as_table().unwrap().get("broker").unwrap().clone();

        let over: toml::Value =
            toml::from_str("[[broker]]\nname = \"primary\"\nport = 8883\n").unwrap();
        let over_brokers = over.as_table().unwrap().get("broker").unwrap().clone();

        let merged = merge_broker_lists(Some(base_brokers), over_brokers);
        let arr = merged.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0].get("server").unwrap().as_str(), Some("a.example"));
        assert_eq!(arr[0].get("port").unwrap().as_integer(), Some(8883));
    }

    #[test]
    fn broker_lists_append_unmatched_names() {
        let base: toml::Value = toml::from_str("[[broker]]\nname = \"primary\"\n").unwrap();
        let base_brokers = base.as_table().unwrap().get("broker").unwrap().clone();
        let over: toml::Value = toml::from_str("[[broker]]\nname = \"tertiary\"\n").unwrap();
        let over_brokers = over.as_table().unwrap().get("broker").unwrap().clone();

        let merged = merge_broker_lists(Some(base_brokers), over_brokers);
        assert_eq!(merged.as_array().unwrap().len(), 2);
    }
}
