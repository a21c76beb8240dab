//! Node configuration loading from file and environment variables.

use labshare_crypto::{IvMode, DEFAULT_KEY_BITS};
use labshare_types::{is_valid_node_name, DEFAULT_IDENTITY_TTL_DAYS};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Identity of this laboratory node and where its state lives.
    #[serde(default)]
    pub node: NodeConfig,

    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Payload encryption settings.
    #[serde(default)]
    pub crypto: CryptoConfig,

    /// Peer communication settings.
    #[serde(default)]
    pub federation: FederationConfig,

    /// Background job intervals.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Variant data source.
    #[serde(default)]
    pub variants: VariantsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Name peers know this node by; also the suffix of every identity it
    /// issues.
    #[serde(default = "default_laboratory_name")]
    pub laboratory_name: String,

    /// Base URL peers use to reach this node.
    #[serde(default = "default_public_address")]
    pub public_address: String,

    /// Root of `keys/`, `public_keys/` and `nodes/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// RSA modulus size for generated node keys.
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,

    /// Validity window of a user identity.
    #[serde(default = "default_identity_ttl_days")]
    pub identity_ttl_days: i64,

    /// Oldest request id accepted on freshness-checked endpoints.
    #[serde(default = "default_request_max_age_seconds")]
    pub request_max_age_seconds: i64,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "labshare_federation=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CryptoConfig {
    /// `fixed` (compatible with existing peers) or `random`.
    #[serde(default)]
    pub iv_mode: IvMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Timeout for every call to a peer node.
    #[serde(default = "default_peer_timeout_seconds")]
    pub peer_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_health_probe_seconds")]
    pub health_probe_seconds: u64,

    #[serde(default = "default_expiry_sweep_seconds")]
    pub expiry_sweep_seconds: u64,

    #[serde(default = "default_rotation_interval_seconds")]
    pub rotation_interval_seconds: u64,

    #[serde(default = "default_quota_reset_seconds")]
    pub quota_reset_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariantsConfig {
    /// Tab-separated variant file. Without one the node answers every query
    /// with no rows.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Unauthenticated `/variants` queries allowed per quota period.
    #[serde(default = "default_public_daily_limit")]
    pub public_daily_limit: u32,
}

fn default_laboratory_name() -> String {
    "labshare-node".to_string()
}

fn default_public_address() -> String {
    format!("http://127.0.0.1:{}", default_port())
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_key_bits() -> usize {
    DEFAULT_KEY_BITS
}

fn default_identity_ttl_days() -> i64 {
    DEFAULT_IDENTITY_TTL_DAYS
}

fn default_request_max_age_seconds() -> i64 {
    300
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "labshare.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_peer_timeout_seconds() -> u64 {
    10
}

fn default_health_probe_seconds() -> u64 {
    60
}

fn default_expiry_sweep_seconds() -> u64 {
    60
}

fn default_rotation_interval_seconds() -> u64 {
    24 * 60 * 60
}

fn default_quota_reset_seconds() -> u64 {
    24 * 60 * 60
}

fn default_public_daily_limit() -> u32 {
    1_000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            laboratory_name: default_laboratory_name(),
            public_address: default_public_address(),
            data_dir: default_data_dir(),
            key_bits: default_key_bits(),
            identity_ttl_days: default_identity_ttl_days(),
            request_max_age_seconds: default_request_max_age_seconds(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            peer_timeout_seconds: default_peer_timeout_seconds(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            health_probe_seconds: default_health_probe_seconds(),
            expiry_sweep_seconds: default_expiry_sweep_seconds(),
            rotation_interval_seconds: default_rotation_interval_seconds(),
            quota_reset_seconds: default_quota_reset_seconds(),
        }
    }
}

impl Default for VariantsConfig {
    fn default() -> Self {
        Self {
            path: None,
            public_daily_limit: default_public_daily_limit(),
        }
    }
}

impl FederationConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_seconds)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but cannot be used.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Rejects values the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_node_name(&self.node.laboratory_name) {
            return Err(ConfigError::Invalid(format!(
                "node.laboratory_name '{}' may only contain letters, digits, '-', '_' and '.'",
                self.node.laboratory_name
            )));
        }
        if self.node.key_bits < 1024 {
            return Err(ConfigError::Invalid(format!(
                "node.key_bits must be at least 1024, got {}",
                self.node.key_bits
            )));
        }
        if self.node.identity_ttl_days < 1 {
            return Err(ConfigError::Invalid(
                "node.identity_ttl_days must be positive".to_string(),
            ));
        }
        if self.federation.peer_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "federation.peer_timeout_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `LABSHARE_HOST` overrides `server.host`
/// - `LABSHARE_PORT` overrides `server.port`
/// - `LABSHARE_DB_PATH` overrides `database.path`
/// - `LABSHARE_LOG_LEVEL` overrides `logging.level`
/// - `LABSHARE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `LABSHARE_LAB_NAME` overrides `node.laboratory_name`
/// - `LABSHARE_DATA_DIR` overrides `node.data_dir`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if the resulting configuration is invalid.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("LABSHARE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("LABSHARE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("LABSHARE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("LABSHARE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("LABSHARE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(name) = std::env::var("LABSHARE_LAB_NAME") {
        config.node.laboratory_name = name;
    }
    if let Ok(dir) = std::env::var("LABSHARE_DATA_DIR") {
        config.node.data_dir = PathBuf::from(dir);
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.node.key_bits, 2048);
        assert_eq!(config.node.identity_ttl_days, 30);
        assert_eq!(config.crypto.iv_mode, IvMode::Fixed);
        assert_eq!(config.schedule.health_probe_seconds, 60);
        assert_eq!(config.schedule.rotation_interval_seconds, 86_400);
        assert!(config.variants.path.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn sections_parse() {
        let config: Config = toml::from_str(
            r#"
            [node]
            laboratory_name = "LabA"
            public_address = "http://lab-a:8080"
            data_dir = "/var/lib/labshare"

            [crypto]
            iv_mode = "random"

            [federation]
            peer_timeout_seconds = 3

            [variants]
            path = "variants.tsv"
            public_daily_limit = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.node.laboratory_name, "LabA");
        assert_eq!(config.node.data_dir, PathBuf::from("/var/lib/labshare"));
        assert_eq!(config.crypto.iv_mode, IvMode::Random);
        assert_eq!(config.federation.peer_timeout(), Duration::from_secs(3));
        assert_eq!(config.variants.public_daily_limit, 50);
    }

    #[test]
    fn invalid_lab_name_is_rejected() {
        let mut config = Config::default();
        config.node.laboratory_name = "lab/a".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_iv_mode_fails_to_parse() {
        assert!(toml::from_str::<Config>("[crypto]\niv_mode = \"cbc\"").is_err());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.database.pool_max_size, 8);
    }
}
