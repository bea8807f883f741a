//! trawl configuration
//!
//! YAML configuration with defaults for every field. Lookup order:
//! an explicit path, then `$TRAWL_CONFIG`, then
//! `~/.config/trawl/config.yaml`; with none present the defaults apply.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use trawl_core::TrawlError;

pub const CONFIG_ENV: &str = "TRAWL_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for TrawlError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io { path, source } => TrawlError::from_io(source, path.display()),
            other => TrawlError::InvalidInput(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrawlConfig {
    pub capture: CaptureConfig,
    pub store: StoreConfig,
    pub proxy: ProxyConfig,
    pub alerts: AlertConfig,
    pub bridge: BridgeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Read timeout on live interfaces, which bounds how long a stop waits
    pub read_timeout_ms: u64,
    /// Frames buffered between the reader and ingest threads
    pub channel_capacity: usize,
    /// Keep raw frame bytes on packets (hex view, pcap export, payload rules).
    /// Without them the plaintext-credential rule has nothing to scan.
    pub keep_raw: bool,
    pub stop_timeout_ms: u64,
    /// Default directory for ring-buffer files
    pub output_dir: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 100,
            channel_capacity: 8192,
            keep_raw: true,
            stop_timeout_ms: 2000,
            output_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_packets: usize,
    pub max_history: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { max_packets: 1_000_000, max_history: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub port: u16,
    pub intercept_tls: bool,
    /// Where the CA certificate and key live (defaults under the data dir)
    pub ca_dir: Option<PathBuf>,
    pub upstream_timeout_secs: u64,
    pub client_idle_timeout_secs: u64,
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            port: 8080,
            intercept_tls: true,
            ca_dir: None,
            upstream_timeout_secs: 30,
            client_idle_timeout_secs: 60,
            max_header_bytes: 64 * 1024,
            max_body_bytes: 32 * 1024 * 1024,
        }
    }
}

impl ProxyConfig {
    pub fn ca_dir(&self) -> PathBuf {
        self.ca_dir.clone().unwrap_or_else(|| data_dir().join("ca"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub aggregate_interval_secs: u64,
    pub large_packet_threshold: usize,
    pub scan_window_secs: u64,
    pub scan_port_threshold: usize,
    /// Packets up to this size count towards scan detection
    pub scan_small_packet_max: usize,
    pub beacon_min_events: usize,
    /// Maximum coefficient of variation of beacon intervals
    pub beacon_max_jitter: f64,
    pub beacon_min_interval_secs: f64,
    pub broadcast_window_secs: u64,
    pub broadcast_threshold: usize,
    /// A flow silent this long is no longer tracked for beaconing
    pub beacon_idle_secs: u64,
    /// Upper bound on keys each rule table tracks (sources, flows,
    /// conversations, ARP bindings); the least recently active go first
    pub max_tracked: usize,
    /// Upper bound on retained alerts per stream
    pub max_alerts: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            aggregate_interval_secs: 5,
            large_packet_threshold: 1500,
            scan_window_secs: 60,
            scan_port_threshold: 20,
            scan_small_packet_max: 100,
            beacon_min_events: 6,
            beacon_max_jitter: 0.1,
            beacon_min_interval_secs: 1.0,
            broadcast_window_secs: 10,
            broadcast_threshold: 100,
            beacon_idle_secs: 3600,
            max_tracked: 10_000,
            max_alerts: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub listen: String,
    /// Per-subscriber event queue
    pub subscriber_queue: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { listen: "127.0.0.1:9420".to_string(), subscriber_queue: 4096 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: "trawl=info".to_string(), json: false }
    }
}

/// `~/.config/trawl`
pub fn config_dir() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("trawl")
}

/// `~/.local/share/trawl`
pub fn data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("trawl")
}

pub fn default_path() -> PathBuf {
    config_dir().join("config.yaml")
}

impl TrawlConfig {
    /// Resolve and load the configuration.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Self::load_with(explicit, env.as_deref(), &default_path())
    }

    fn load_with(explicit: Option<&Path>, env: Option<&Path>, fallback: &Path) -> Result<Self> {
        // Explicitly named files must exist
        if let Some(path) = explicit.or(env) {
            return Self::from_file(path);
        }
        if fallback.exists() {
            return Self::from_file(fallback);
        }
        tracing::debug!("no configuration file, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let config = Self::from_yaml(&text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        tracing::info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let io_err = |source| ConfigError::Io { path: path.to_path_buf(), source };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let text = serde_yaml::to_string(self)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        std::fs::write(path, text).map_err(io_err)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.capture.channel_capacity == 0 {
            return invalid("capture.channel_capacity must be positive");
        }
        if self.capture.read_timeout_ms == 0 {
            return invalid("capture.read_timeout_ms must be positive");
        }
        if self.store.max_packets == 0 || self.store.max_history == 0 {
            return invalid("store capacities must be positive");
        }
        if self.bridge.subscriber_queue == 0 {
            return invalid("bridge.subscriber_queue must be positive");
        }
        if self.proxy.max_header_bytes < 1024 {
            return invalid("proxy.max_header_bytes must be at least 1024");
        }
        if self.alerts.aggregate_interval_secs == 0 {
            return invalid("alerts.aggregate_interval_secs must be positive");
        }
        if !(0.0..=1.0).contains(&self.alerts.beacon_max_jitter) {
            return invalid("alerts.beacon_max_jitter must be within 0..=1");
        }
        if self.alerts.beacon_min_events < 3 {
            return invalid("alerts.beacon_min_events must be at least 3");
        }
        if self.alerts.max_tracked == 0 {
            return invalid("alerts.max_tracked must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrawlConfig::default();
        config.validate().unwrap();
        assert_eq!(config.store.max_history, 1000);
        assert_eq!(config.proxy.port, 8080);
        assert_eq!(config.logging.filter, "trawl=info");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = TrawlConfig::from_yaml("proxy:\n  port: 9090\nalerts:\n  scan_port_threshold: 5\n").unwrap();
        assert_eq!(config.proxy.port, 9090);
        assert_eq!(config.proxy.listen_addr, "127.0.0.1");
        assert_eq!(config.alerts.scan_port_threshold, 5);
        assert_eq!(config.alerts.broadcast_threshold, 100);
        assert_eq!(config.capture, CaptureConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let mut config = TrawlConfig::default();
        config.bridge.subscriber_queue = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_untracked_rules() {
        let mut config = TrawlConfig::default();
        config.alerts.max_tracked = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(m)) if m.contains("max_tracked")));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.yaml");

        let mut config = TrawlConfig::default();
        config.capture.keep_raw = false;
        config.save(&path).unwrap();

        let loaded = TrawlConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_lookup_order() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("explicit.yaml");
        let env = dir.path().join("env.yaml");
        let fallback = dir.path().join("fallback.yaml");
        std::fs::write(&explicit, "proxy:\n  port: 1001\n").unwrap();
        std::fs::write(&env, "proxy:\n  port: 1002\n").unwrap();

        let config = TrawlConfig::load_with(Some(&explicit), Some(&env), &fallback).unwrap();
        assert_eq!(config.proxy.port, 1001);

        let config = TrawlConfig::load_with(None, Some(&env), &fallback).unwrap();
        assert_eq!(config.proxy.port, 1002);

        // Missing fallback is not an error
        let config = TrawlConfig::load_with(None, None, &fallback).unwrap();
        assert_eq!(config.proxy.port, 8080);

        // Missing explicit file is
        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            TrawlConfig::load_with(Some(&missing), None, &fallback),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_error_codes() {
        let err: TrawlError = ConfigError::Invalid("x".into()).into();
        assert_eq!(err.code(), trawl_core::ErrorCode::InvalidInput);
    }
}
