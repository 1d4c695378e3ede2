//! Declarative configuration loading from YAML, TOML, and environment variables.
//!
//! The serde mirror [`FileConfig`] uses plain scalar fields (milliseconds,
//! seconds, strings) and is converted into a [`DomainConfig`] through the
//! builder API, so file-based and programmatic configuration share one set
//! of validation rules.
//!
//! # Supported Formats
//!
//! - **YAML** (requires `config-file` feature): `DomainConfig::from_yaml("xatm.yaml")`
//! - **TOML** (requires `config-file` feature): `DomainConfig::from_toml("xatm.toml")`
//! - **Environment Variables** (always available): `DomainConfig::from_env()`
//!
//! # Example YAML
//!
//! ```yaml
//! name: orders
//! transaction:
//!   default-timeout-seconds: 60
//!   reaper-interval-ms: 500
//!   max-timeout-seconds: 600
//! pool:
//!   prune-factor: 0.25
//!   idle-timeout-ms: 120000
//!   prune-interval-ms: 30000
//!   max-connections: 16
//!   login-timeout-seconds: 10
//!   default-isolation: repeatable-read
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, DomainConfig, DomainConfigBuilder};
use crate::pool::IsolationLevel;

/// Top-level file-based configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileConfig {
    /// Domain name.
    pub name: Option<String>,
    /// Transaction settings.
    pub transaction: Option<FileTransactionConfig>,
    /// Connection pool settings.
    pub pool: Option<FilePoolConfig>,
}

/// File-based transaction configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileTransactionConfig {
    /// Default transaction timeout in seconds.
    pub default_timeout_seconds: Option<u64>,
    /// Reaper sweep interval in milliseconds.
    pub reaper_interval_ms: Option<u64>,
    /// Upper bound for requested timeouts, in seconds.
    pub max_timeout_seconds: Option<u64>,
}

/// File-based pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct FilePoolConfig {
    /// Fraction of eligible idle connections evicted per sweep (0.0 to 1.0).
    pub prune_factor: Option<f64>,
    /// Idle time after which a connection becomes eligible, in milliseconds.
    pub idle_timeout_ms: Option<u64>,
    /// Sweep interval in milliseconds.
    pub prune_interval_ms: Option<u64>,
    /// Per data source connection limit (0 = unbounded).
    pub max_connections: Option<usize>,
    /// Timeout for opening a physical connection, in seconds.
    pub login_timeout_seconds: Option<u64>,
    /// Isolation level, e.g. `read-committed` or `SERIALIZABLE`.
    pub default_isolation: Option<String>,
}

impl TryFrom<FileConfig> for DomainConfig {
    type Error = ConfigError;

    fn try_from(file: FileConfig) -> Result<Self, Self::Error> {
        let mut builder = DomainConfigBuilder::new();

        if let Some(name) = file.name {
            builder = builder.name(name);
        }

        if let Some(tx) = file.transaction {
            builder = builder.transaction(|mut t| {
                if let Some(secs) = tx.default_timeout_seconds {
                    t = t.default_timeout(Duration::from_secs(secs));
                }
                if let Some(ms) = tx.reaper_interval_ms {
                    t = t.reaper_interval(Duration::from_millis(ms));
                }
                if let Some(secs) = tx.max_timeout_seconds {
                    t = t.max_timeout(Duration::from_secs(secs));
                }
                t
            });
        }

        if let Some(pool) = file.pool {
            let isolation = pool
                .default_isolation
                .as_deref()
                .map(str::parse::<IsolationLevel>)
                .transpose()?;
            builder = builder.pool(|mut p| {
                if let Some(factor) = pool.prune_factor {
                    p = p.prune_factor(factor);
                }
                if let Some(ms) = pool.idle_timeout_ms {
                    p = p.idle_timeout(Duration::from_millis(ms));
                }
                if let Some(ms) = pool.prune_interval_ms {
                    p = p.prune_interval(Duration::from_millis(ms));
                }
                if let Some(max) = pool.max_connections {
                    p = p.max_connections(max);
                }
                if let Some(secs) = pool.login_timeout_seconds {
                    p = p.login_timeout(Duration::from_secs(secs));
                }
                if let Some(level) = isolation {
                    p = p.default_isolation(level);
                }
                p
            });
        }

        builder.build()
    }
}

impl DomainConfig {
    /// Loads configuration from a YAML file.
    ///
    /// Requires the `config-file` feature.
    #[cfg(feature = "config-file")]
    pub fn from_yaml<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("failed to read YAML config file: {e}")))?;
        Self::from_yaml_str(&content)
    }

    /// Parses configuration from YAML text.
    #[cfg(feature = "config-file")]
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let file_config: FileConfig = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::new(format!("failed to parse YAML config: {e}")))?;
        file_config.try_into()
    }

    /// Loads configuration from a TOML file.
    ///
    /// Requires the `config-file` feature.
    #[cfg(feature = "config-file")]
    pub fn from_toml<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("failed to read TOML config file: {e}")))?;
        Self::from_toml_str(&content)
    }

    /// Parses configuration from TOML text.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file_config: FileConfig = toml_crate::from_str(content)
            .map_err(|e| ConfigError::new(format!("failed to parse TOML config: {e}")))?;
        file_config.try_into()
    }

    /// Loads configuration from environment variables.
    ///
    /// Always available. Unset variables keep their defaults; a variable
    /// that is set but does not parse is an error.
    ///
    /// | Variable | Maps to |
    /// |----------|---------|
    /// | `XATM_DOMAIN_NAME` | `name` |
    /// | `XATM_TRANSACTION_TIMEOUT_SECONDS` | default transaction timeout |
    /// | `XATM_REAPER_INTERVAL_MS` | reaper interval |
    /// | `XATM_PRUNE_FACTOR` | pool prune factor |
    /// | `XATM_IDLE_TIMEOUT_MS` | pool idle timeout |
    /// | `XATM_PRUNE_INTERVAL_MS` | pool sweep interval |
    /// | `XATM_MAX_CONNECTIONS` | per data source limit |
    /// | `XATM_LOGIN_TIMEOUT_SECONDS` | connection open timeout |
    /// | `XATM_DEFAULT_ISOLATION` | isolation level name |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut file_config = FileConfig::default();

        if let Some(val) = lookup("XATM_DOMAIN_NAME") {
            file_config.name = Some(val);
        }

        if let Some(secs) = parse_var(&lookup, "XATM_TRANSACTION_TIMEOUT_SECONDS")? {
            file_config
                .transaction
                .get_or_insert_with(Default::default)
                .default_timeout_seconds = Some(secs);
        }

        if let Some(ms) = parse_var(&lookup, "XATM_REAPER_INTERVAL_MS")? {
            file_config
                .transaction
                .get_or_insert_with(Default::default)
                .reaper_interval_ms = Some(ms);
        }

        if let Some(factor) = parse_var(&lookup, "XATM_PRUNE_FACTOR")? {
            file_config.pool.get_or_insert_with(Default::default).prune_factor = Some(factor);
        }

        if let Some(ms) = parse_var(&lookup, "XATM_IDLE_TIMEOUT_MS")? {
            file_config.pool.get_or_insert_with(Default::default).idle_timeout_ms = Some(ms);
        }

        if let Some(ms) = parse_var(&lookup, "XATM_PRUNE_INTERVAL_MS")? {
            file_config.pool.get_or_insert_with(Default::default).prune_interval_ms = Some(ms);
        }

        if let Some(max) = parse_var(&lookup, "XATM_MAX_CONNECTIONS")? {
            file_config.pool.get_or_insert_with(Default::default).max_connections = Some(max);
        }

        if let Some(secs) = parse_var(&lookup, "XATM_LOGIN_TIMEOUT_SECONDS")? {
            file_config
                .pool
                .get_or_insert_with(Default::default)
                .login_timeout_seconds = Some(secs);
        }

        if let Some(val) = lookup("XATM_DEFAULT_ISOLATION") {
            file_config
                .pool
                .get_or_insert_with(Default::default)
                .default_isolation = Some(val);
        }

        file_config.try_into()
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::new(format!("invalid value '{val}' for {key}"))),
    }
}

/// Loads a configuration file, detecting the format by extension.
///
/// Supports `.yaml`, `.yml`, and `.toml`. Requires the `config-file` feature.
#[cfg(feature = "config-file")]
pub fn load_config<P: AsRef<std::path::Path>>(path: P) -> Result<DomainConfig, ConfigError> {
    let path = path.as_ref();
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => DomainConfig::from_yaml(path),
        Some("toml") => DomainConfig::from_toml(path),
        Some(ext) => Err(ConfigError::new(format!(
            "unsupported config file extension: .{ext} (expected .yaml, .yml, or .toml)"
        ))),
        None => Err(ConfigError::new(
            "config file has no extension; expected .yaml, .yml, or .toml",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_file_config_defaults_produce_default_domain_config() {
        let config: DomainConfig = FileConfig::default().try_into().unwrap();
        assert_eq!(config, DomainConfig::default());
    }

    #[test]
    fn test_file_config_with_transaction_settings() {
        let file_config = FileConfig {
            name: Some("orders".to_string()),
            transaction: Some(FileTransactionConfig {
                default_timeout_seconds: Some(30),
                reaper_interval_ms: Some(250),
                max_timeout_seconds: Some(300),
            }),
            ..Default::default()
        };
        let config: DomainConfig = file_config.try_into().unwrap();
        assert_eq!(config.name(), "orders");
        assert_eq!(config.transaction().default_timeout(), Duration::from_secs(30));
        assert_eq!(config.transaction().reaper_interval(), Duration::from_millis(250));
        assert_eq!(config.transaction().max_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_file_config_with_pool_settings() {
        let file_config = FileConfig {
            pool: Some(FilePoolConfig {
                prune_factor: Some(0.5),
                idle_timeout_ms: Some(5_000),
                max_connections: Some(4),
                default_isolation: Some("SERIALIZABLE".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config: DomainConfig = file_config.try_into().unwrap();
        assert_eq!(config.pool().prune_factor(), 0.5);
        assert_eq!(config.pool().idle_timeout(), Duration::from_secs(5));
        assert_eq!(config.pool().max_connections(), 4);
        assert_eq!(config.pool().default_isolation(), IsolationLevel::Serializable);
    }

    #[test]
    fn test_file_config_rejects_invalid_values() {
        let bad_factor = FileConfig {
            pool: Some(FilePoolConfig {
                prune_factor: Some(1.5),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(DomainConfig::try_from(bad_factor).is_err());

        let bad_isolation = FileConfig {
            pool: Some(FilePoolConfig {
                default_isolation: Some("snapshot".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(DomainConfig::try_from(bad_isolation).is_err());
    }

    #[test]
    fn test_from_lookup_reads_variables() {
        let config = DomainConfig::from_lookup(env(&[
            ("XATM_DOMAIN_NAME", "billing"),
            ("XATM_TRANSACTION_TIMEOUT_SECONDS", "45"),
            ("XATM_PRUNE_FACTOR", "0.2"),
            ("XATM_LOGIN_TIMEOUT_SECONDS", "5"),
            ("XATM_DEFAULT_ISOLATION", "repeatable_read"),
        ]))
        .unwrap();
        assert_eq!(config.name(), "billing");
        assert_eq!(config.transaction().default_timeout(), Duration::from_secs(45));
        assert_eq!(config.pool().prune_factor(), 0.2);
        assert_eq!(config.pool().login_timeout(), Duration::from_secs(5));
        assert_eq!(config.pool().default_isolation(), IsolationLevel::RepeatableRead);
    }

    #[test]
    fn test_from_lookup_rejects_unparseable_value() {
        let err = DomainConfig::from_lookup(env(&[("XATM_MAX_CONNECTIONS", "many")])).unwrap_err();
        assert!(err.message().contains("XATM_MAX_CONNECTIONS"));
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn test_yaml_document() {
        let config = DomainConfig::from_yaml_str(
            "name: orders\npool:\n  prune-factor: 0.25\n  default-isolation: read-uncommitted\n",
        )
        .unwrap();
        assert_eq!(config.name(), "orders");
        assert_eq!(config.pool().prune_factor(), 0.25);
        assert_eq!(config.pool().default_isolation(), IsolationLevel::ReadUncommitted);
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn test_toml_document() {
        let config = DomainConfig::from_toml_str(
            "name = \"orders\"\n[transaction]\ndefault-timeout-seconds = 15\n",
        )
        .unwrap();
        assert_eq!(config.transaction().default_timeout(), Duration::from_secs(15));
    }

    #[cfg(feature = "config-file")]
    #[test]
    fn test_load_config_rejects_unknown_extension() {
        assert!(load_config("xatm.json").is_err());
    }
}
