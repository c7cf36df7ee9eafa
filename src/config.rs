//! Configuration management for the gate service.
//!
//! Settings come from an optional YAML or TOML file overlaid with
//! `QUOTAGATE_*` environment variables, where `__` separates nesting levels
//! (for example `QUOTAGATE_STORE__BACKEND=postgres`).

use std::net::SocketAddr;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};
use crate::ratelimit::{CleanupConfig, DAILY_REQUESTS, DEFAULT_QUOTA_PERIOD};

/// Main configuration for the gate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateSettings {
    /// Server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Store configuration
    #[serde(default)]
    pub store: StoreSettings,

    /// Limit catalogue and quota configuration
    #[serde(default)]
    pub limits: LimitsSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which store backs counters and quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process maps; state is lost on restart
    #[default]
    Memory,
    /// Shared Postgres database
    Postgres,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Postgres connection string, required for the postgres backend
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Deadline for a single store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Create missing tables at startup
    #[serde(default = "default_true")]
    pub migrate: bool,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    #[serde(default = "default_cleanup_grace")]
    pub cleanup_grace_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            database_url: None,
            max_connections: default_max_connections(),
            timeout_ms: default_timeout_ms(),
            migrate: default_true(),
            cleanup_interval_secs: default_cleanup_interval(),
            cleanup_grace_secs: default_cleanup_grace(),
        }
    }
}

impl StoreSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cleanup(&self) -> CleanupConfig {
        CleanupConfig {
            interval: Duration::from_secs(self.cleanup_interval_secs),
            grace: Duration::from_secs(self.cleanup_grace_secs),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_cleanup_grace() -> u64 {
    60
}

/// Limit catalogue and quota configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSettings {
    /// YAML catalogue of subject limits; the postgres backend reads the
    /// `rate_limit_configs` table when unset
    #[serde(default)]
    pub catalog_path: Option<String>,

    /// How long subject limits are cached, in seconds (0 disables caching)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_quota_type")]
    pub quota_type: String,

    #[serde(default = "default_quota_period")]
    pub quota_period_secs: u64,
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            catalog_path: None,
            cache_ttl_secs: default_cache_ttl(),
            quota_type: default_quota_type(),
            quota_period_secs: default_quota_period(),
        }
    }
}

impl LimitsSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn quota_period(&self) -> Duration {
        Duration::from_secs(self.quota_period_secs)
    }
}

fn default_cache_ttl() -> u64 {
    30
}

fn default_quota_type() -> String {
    DAILY_REQUESTS.to_string()
}

fn default_quota_period() -> u64 {
    DEFAULT_QUOTA_PERIOD.as_secs()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GateSettings {
    /// Load settings from an optional file plus environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("QUOTAGATE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: GateSettings = settings.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: GateSettings = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            return Err(GateError::Config(
                "store.database_url is required for the postgres backend".into(),
            ));
        }

        if self.store.timeout_ms == 0 {
            return Err(GateError::Config("store.timeout_ms must be greater than 0".into()));
        }

        if self.store.cleanup_interval_secs == 0 {
            return Err(GateError::Config(
                "store.cleanup_interval_secs must be greater than 0".into(),
            ));
        }

        if self.limits.quota_period_secs == 0 {
            return Err(GateError::Config(
                "limits.quota_period_secs must be greater than 0".into(),
            ));
        }

        if self.limits.quota_type.is_empty() {
            return Err(GateError::Config("limits.quota_type cannot be empty".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = GateSettings::default();
        assert_eq!(settings.server.listen_addr.port(), 8080);
        assert_eq!(settings.store.backend, StoreBackend::Memory);
        assert_eq!(settings.store.timeout(), Duration::from_millis(500));
        assert_eq!(settings.limits.quota_type, "requests_per_day");
        assert_eq!(settings.limits.quota_period(), Duration::from_secs(86400));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:9000"
store:
  backend: postgres
  database_url: "postgres://localhost/quotagate"
  timeout_ms: 250
logging:
  json: true
"#;
        let settings = GateSettings::from_yaml(yaml).unwrap();
        assert_eq!(settings.server.listen_addr.port(), 9000);
        assert_eq!(settings.store.backend, StoreBackend::Postgres);
        assert_eq!(settings.store.max_connections, 10);
        assert_eq!(settings.store.timeout(), Duration::from_millis(250));
        assert!(settings.logging.json);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn test_postgres_requires_url() {
        let result = GateSettings::from_yaml("store:\n  backend: postgres\n");
        assert!(matches!(result, Err(GateError::Config(msg)) if msg.contains("database_url")));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = GateSettings::from_yaml("store:\n  timeout_ms: 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_without_file() {
        let settings = GateSettings::load(None).unwrap();
        assert_eq!(settings.store.cleanup().grace, Duration::from_secs(60));
    }
}
