//! Persisted gateway configuration and inbound config-topic routing.
//!
//! The config file is JSON under `/etc/sensorgate/` (falling back to the
//! user config dir for development runs). Inbound broker messages on the
//! device config topic are merged recursively into the file so partial
//! updates never wipe unrelated keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

pub const DEFAULT_DNS: &str = "8.8.8.8";
pub const DEFAULT_BROKER_URI: &str = "192.168.7.1";
pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_DEVICE_ID: &str = "1234567890abcdef18";
/// Periodic flush interval in seconds when the config file does not set one.
pub const DEFAULT_POST_TIME: u64 = 30;

const SYSTEM_CONFIG_DIR: &str = "/etc/sensorgate";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0}")]
    Rejected(String),
}

impl ConfigError {
    fn rejected(msg: &str) -> Self {
        Self::Rejected(msg.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostSettings {
    /// Flush-tick period in seconds.
    pub time: u64,
}

impl Default for PostSettings {
    fn default() -> Self {
        Self {
            time: DEFAULT_POST_TIME,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub uri: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub tenant: String,
    pub post: PostSettings,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            uri: DEFAULT_BROKER_URI.to_string(),
            port: DEFAULT_BROKER_PORT,
            user: "user".to_string(),
            password: "1234".to_string(),
            tenant: "atech".to_string(),
            post: PostSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub enabled: bool,
    pub config: BrokerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub dns: String,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            dns: DEFAULT_DNS.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub mqtt_broker: BrokerSection,
    pub network: NetworkSection,
}

impl GatewayConfig {
    /// Loads the config file, filling defaults for anything missing.
    /// A missing file yields the default (disabled) configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Merges `patch` into the `mqtt_broker.config` section of the file and
    /// rewrites it. The rest of the file is left untouched.
    pub fn save_broker_patch(path: &Path, patch: &Value) -> Result<(), ConfigError> {
        let mut root = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                serde_json::to_value(GatewayConfig::default())?
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        let wrapped = serde_json::json!({ "mqtt_broker": { "config": patch } });
        merge_json(&mut root, &wrapped);

        let pretty = serde_json::to_string_pretty(&root)?;
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(path, pretty).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Recursive JSON merge: objects merge key by key, everything else is
/// overwritten by the patch.
pub fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(base_value) => merge_json(base_value, patch_value),
                    None => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Default location of the persisted config file.
pub fn config_path() -> PathBuf {
    let system = Path::new(SYSTEM_CONFIG_DIR);
    if system.is_dir() {
        return system.join("config.json");
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sensorgate")
        .join("config.json")
}

/// Default location of the sample/post-record database.
pub fn store_path() -> PathBuf {
    let system = Path::new(SYSTEM_CONFIG_DIR);
    if system.is_dir() {
        return system.join("telemetry.db");
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sensorgate")
        .join("telemetry.db")
}

/// Device identity, read once at startup from the serial file.
pub fn device_id() -> String {
    let serial = Path::new(SYSTEM_CONFIG_DIR).join("serial");
    match std::fs::read_to_string(serial) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().to_string(),
        _ => DEFAULT_DEVICE_ID.to_string(),
    }
}

/// What an accepted inbound config message asks the gateway to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigDirective {
    /// Persist the broker patch, cancel the flush ticker, reconnect.
    UpdateBroker(Value),
    /// Apply a new DNS server (kept in memory for the running session).
    SetDns(String),
    /// Forward an acquisition period change to the sensor daemon.
    ConfigureSensor { sensor: String, period: u64 },
}

/// Routes one inbound config-topic message into directives.
///
/// Rejections carry the descriptive string reported back to the operator;
/// no gateway state is mutated on rejection.
pub fn parse_inbound(msg: &Value) -> Result<Vec<ConfigDirective>, ConfigError> {
    let obj = msg
        .as_object()
        .ok_or_else(|| ConfigError::rejected("Config must be a JSON object"))?;

    let user = obj
        .get("user")
        .and_then(Value::as_str)
        .ok_or_else(|| ConfigError::rejected("No user defined"))?;

    // Echoes of our own config posts come back on the subscribed wildcard.
    if user == "device" {
        return Err(ConfigError::rejected("Configuration from device"));
    }

    let mut directives = Vec::new();
    for (key, conf) in obj.iter().filter(|(key, _)| *key != "user") {
        match key.as_str() {
            "eth" | "wifi" => {
                let active = conf
                    .get("active")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| ConfigError::rejected("Misconfigured activation"))?;
                if !active {
                    continue;
                }
                if let Some(dns) = conf.get("dns1") {
                    let dns = dns
                        .as_str()
                        .filter(|d| d.parse::<Ipv4Addr>().is_ok())
                        .ok_or_else(|| ConfigError::rejected("Misconfigured dns1"))?;
                    directives.push(ConfigDirective::SetDns(dns.to_string()));
                }
            }
            "broker" => {
                if !conf.is_object() {
                    return Err(ConfigError::rejected("Broker config not accepted"));
                }
                directives.push(ConfigDirective::UpdateBroker(conf.clone()));
            }
            // Any other key is a sensor acquisition period change,
            // including "global".
            _ => {
                let sensor = conf
                    .get("sensor")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ConfigError::rejected("Misconfigured sensor"))?;
                let period = conf
                    .get("period")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| ConfigError::rejected("Misconfigured period"))?;
                conf.get("ts")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| ConfigError::rejected("Misconfigured ts"))?;

                directives.push(ConfigDirective::ConfigureSensor {
                    sensor: sensor.to_string(),
                    period,
                });
            }
        }
    }

    Ok(directives)
}
