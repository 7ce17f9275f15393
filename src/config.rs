//! Client configuration
//!
//! Only the recognized options below are accepted; YAML files with unknown
//! keys are rejected rather than silently ignored.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8080/ws";
const DEFAULT_SIDE_CHANNEL_SUFFIX: &str = "/mcp";

/// Error type for configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value for {key}: '{value}'")]
    InvalidEnv { key: String, value: String },
    #[error("invalid endpoint URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which field name of the welcome payload carries the machine identifier
///
/// Older computers send `hostname`, newer ones `machine_id`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineIdField {
    Hostname,
    MachineId,
    #[default]
    Any,
}

/// How the side-channel URL is derived from the computer endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideChannelPath {
    /// `http(s)://<host>/<path>`
    Suffix { path: String },
    /// `http(s)://<host>/<machine_id>/mcp`, known only after the handshake
    MachineScoped,
}

impl Default for SideChannelPath {
    fn default() -> Self {
        SideChannelPath::Suffix {
            path: DEFAULT_SIDE_CHANNEL_SUFFIX.to_string(),
        }
    }
}

/// Connection and logging settings for a [`crate::computer::Computer`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComputerConfig {
    /// WebSocket endpoint of the remote computer (ws:// or wss://)
    pub endpoint: String,
    /// Bearer token sent in the Authorization header
    pub api_key: String,
    /// Directory for conversation logs and screenshots
    pub log_dir: PathBuf,
    pub log_enabled: bool,
    pub screenshot_log_enabled: bool,
    /// Bound for `wait_for_metadata` when no explicit timeout is given
    pub metadata_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub machine_id_field: MachineIdField,
    pub side_channel: SideChannelPath,
}

impl Default for ComputerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
            log_dir: PathBuf::from("logs"),
            log_enabled: false,
            screenshot_log_enabled: true,
            metadata_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            machine_id_field: MachineIdField::Any,
            side_channel: SideChannelPath::default(),
        }
    }
}

impl ComputerConfig {
    /// Config for an endpoint and key, everything else default
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Load from `VMPILOT_*` environment variables on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (used by `from_env`)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(endpoint) = lookup("VMPILOT_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(key) = lookup("VMPILOT_API_KEY") {
            config.api_key = key;
        }
        if let Some(dir) = lookup("VMPILOT_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup("VMPILOT_LOG_ENABLED") {
            config.log_enabled = parse_bool("VMPILOT_LOG_ENABLED", &value)?;
        }
        if let Some(value) = lookup("VMPILOT_SCREENSHOT_LOG_ENABLED") {
            config.screenshot_log_enabled = parse_bool("VMPILOT_SCREENSHOT_LOG_ENABLED", &value)?;
        }
        if let Some(value) = lookup("VMPILOT_METADATA_TIMEOUT_MS") {
            config.metadata_timeout_ms = value.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "VMPILOT_METADATA_TIMEOUT_MS".to_string(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("VMPILOT_MACHINE_ID_FIELD") {
            config.machine_id_field = match value.as_str() {
                "hostname" => MachineIdField::Hostname,
                "machine_id" => MachineIdField::MachineId,
                "any" => MachineIdField::Any,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: "VMPILOT_MACHINE_ID_FIELD".to_string(),
                        value,
                    })
                }
            };
        }

        Ok(config)
    }

    /// Load from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Check the endpoint scheme and that a token is present
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.endpoint)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ConfigError::Invalid(format!(
                "endpoint must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }
        if self.api_key.is_empty() {
            return Err(ConfigError::Invalid("api_key must not be empty".to_string()));
        }
        Ok(url)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Derive the side-channel HTTP URL from the WebSocket endpoint
    pub fn side_channel_url(&self, machine_id: Option<&str>) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&self.endpoint)?;
        let scheme = match url.scheme() {
            "wss" | "https" => "https",
            _ => "http",
        };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::Invalid(format!("cannot derive {} URL", scheme)))?;
        url.set_query(None);

        match &self.side_channel {
            SideChannelPath::Suffix { path } => {
                url.set_path(path);
            }
            SideChannelPath::MachineScoped => {
                let machine_id = machine_id.filter(|id| !id.is_empty()).ok_or_else(|| {
                    ConfigError::Invalid(
                        "machine-scoped side channel requires a machine id from the handshake"
                            .to_string(),
                    )
                })?;
                url.set_path(&format!("/{}/mcp", machine_id));
            }
        }

        Ok(url)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ComputerConfig::default();
        assert_eq!(config.metadata_timeout(), Duration::from_secs(10));
        assert_eq!(config.machine_id_field, MachineIdField::Any);
        assert!(!config.log_enabled);
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("VMPILOT_ENDPOINT", "wss://computer.example.com/ws"),
            ("VMPILOT_API_KEY", "secret"),
            ("VMPILOT_LOG_ENABLED", "true"),
            ("VMPILOT_METADATA_TIMEOUT_MS", "250"),
            ("VMPILOT_MACHINE_ID_FIELD", "hostname"),
        ]);
        let config =
            ComputerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.endpoint, "wss://computer.example.com/ws");
        assert_eq!(config.api_key, "secret");
        assert!(config.log_enabled);
        assert_eq!(config.metadata_timeout_ms, 250);
        assert_eq!(config.machine_id_field, MachineIdField::Hostname);
    }

    #[test]
    fn test_invalid_env_value() {
        let err = ComputerConfig::from_lookup(|key| {
            (key == "VMPILOT_LOG_ENABLED").then(|| "maybe".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("VMPILOT_LOG_ENABLED"));
    }

    #[test]
    fn test_yaml_rejects_unknown_keys() {
        let ok: ComputerConfig =
            serde_yaml::from_str("endpoint: wss://a.example/ws\napi_key: k\n").unwrap();
        assert_eq!(ok.api_key, "k");

        let bad: Result<ComputerConfig, _> = serde_yaml::from_str("endpoint: x\nretries: 3\n");
        assert!(bad.is_err());
    }

    #[test]
    fn test_validate() {
        assert!(ComputerConfig::new("wss://a.example/ws", "k").validate().is_ok());
        assert!(ComputerConfig::new("https://a.example/ws", "k").validate().is_err());
        assert!(ComputerConfig::new("wss://a.example/ws", "").validate().is_err());
    }

    #[test]
    fn test_side_channel_url_suffix() {
        let config = ComputerConfig::new("wss://a.example/v1/ws?x=1", "k");
        let url = config.side_channel_url(None).unwrap();
        assert_eq!(url.as_str(), "https://a.example/mcp");
    }

    #[test]
    fn test_side_channel_url_machine_scoped() {
        let mut config = ComputerConfig::new("ws://127.0.0.1:9000/ws", "k");
        config.side_channel = SideChannelPath::MachineScoped;

        assert!(config.side_channel_url(None).is_err());
        let url = config.side_channel_url(Some("vm-42")).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/vm-42/mcp");
    }
}
