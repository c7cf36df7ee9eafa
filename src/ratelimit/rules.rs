//! Per-subject limit configuration.
//!
//! Limits are looked up fresh for each request through a [`ConfigSource`].
//! The YAML catalogue holds an optional `default` entry applied to subjects
//! that have no entry of their own:
//!
//! ```yaml
//! default:
//!   requests_per_minute: 60
//!   requests_per_hour: 1000
//!   requests_per_day: 10000
//! subjects:
//!   key_abc:
//!     burst_limit: 2
//!     requests_per_minute: 5
//!     requests_per_hour: 100
//!     requests_per_day: 500
//!     daily_quota: 250
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::window::WindowKind;
use crate::error::{GateError, Result};
use crate::store::{ConfigSource, StoreError};

/// Burst limit applied when a configuration does not set one.
pub const DEFAULT_BURST_LIMIT: u64 = 10;

fn default_burst_limit() -> u64 {
    DEFAULT_BURST_LIMIT
}

/// Limits for a single subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u64,
    pub requests_per_hour: u64,
    pub requests_per_day: u64,
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u64,
    /// Rolling 24h budget; falls back to `requests_per_day`.
    #[serde(default)]
    pub daily_quota: Option<u64>,
}

impl RateLimitConfig {
    pub fn new(requests_per_minute: u64, requests_per_hour: u64, requests_per_day: u64) -> Self {
        Self {
            requests_per_minute,
            requests_per_hour,
            requests_per_day,
            burst_limit: DEFAULT_BURST_LIMIT,
            daily_quota: None,
        }
    }

    pub fn with_burst_limit(mut self, burst_limit: u64) -> Self {
        self.burst_limit = burst_limit;
        self
    }

    pub fn with_daily_quota(mut self, daily_quota: u64) -> Self {
        self.daily_quota = Some(daily_quota);
        self
    }

    /// The limit configured for a window kind.
    pub fn limit_for(&self, kind: WindowKind) -> u64 {
        match kind {
            WindowKind::TenSeconds => self.burst_limit,
            WindowKind::Minute => self.requests_per_minute,
            WindowKind::Hour => self.requests_per_hour,
            WindowKind::Day => self.requests_per_day,
        }
    }

    pub fn quota_limit(&self) -> u64 {
        self.daily_quota.unwrap_or(self.requests_per_day)
    }
}

/// A catalogue of subject limits loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsCatalog {
    /// Applied to subjects without an entry of their own
    #[serde(default)]
    pub default: Option<RateLimitConfig>,
    /// Map of subject id to its limits
    #[serde(default)]
    pub subjects: HashMap<String, RateLimitConfig>,
}

impl LimitsCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the catalogue from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading subject limits");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load the catalogue from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse subject limits: {}", e)))
    }

    pub fn insert(&mut self, subject_id: impl Into<String>, config: RateLimitConfig) {
        self.subjects.insert(subject_id.into(), config);
    }

    /// Find the limits for a subject, falling back to the default entry.
    pub fn find(&self, subject_id: &str) -> Option<&RateLimitConfig> {
        self.subjects.get(subject_id).or(self.default.as_ref())
    }
}

/// Config source backed by an in-memory catalogue.
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    catalog: RwLock<LimitsCatalog>,
}

impl StaticConfigSource {
    pub fn new(catalog: LimitsCatalog) -> Self {
        Self {
            catalog: RwLock::new(catalog),
        }
    }

    /// Replace the catalogue, e.g. after reloading the file.
    pub fn set_catalog(&self, catalog: LimitsCatalog) {
        *self.catalog.write() = catalog;
    }

    pub fn catalog(&self) -> LimitsCatalog {
        self.catalog.read().clone()
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn load(&self, subject_id: &str) -> std::result::Result<Option<RateLimitConfig>, StoreError> {
        Ok(self.catalog.read().find(subject_id).cloned())
    }
}

struct CachedEntry {
    config: Option<RateLimitConfig>,
    fetched_at: Instant,
}

/// Short-lived cache in front of another config source.
///
/// Only limit values are cached, never counters. Negative lookups are
/// cached too so an unknown key cannot hammer the inner source.
pub struct CachedConfigSource<S> {
    inner: Arc<S>,
    ttl: Duration,
    entries: DashMap<String, CachedEntry>,
}

impl<S: ConfigSource> CachedConfigSource<S> {
    pub fn new(inner: Arc<S>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Drop the cached entry for one subject.
    pub fn invalidate(&self, subject_id: &str) {
        if self.entries.remove(subject_id).is_some() {
            debug!(subject = %subject_id, "Invalidated cached limits");
        }
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    pub fn cached_len(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl<S: ConfigSource> ConfigSource for CachedConfigSource<S> {
    async fn load(&self, subject_id: &str) -> std::result::Result<Option<RateLimitConfig>, StoreError> {
        if let Some(entry) = self.entries.get(subject_id) {
            if entry.fetched_at.elapsed() < self.ttl {
                trace!(subject = %subject_id, "Limits served from cache");
                return Ok(entry.config.clone());
            }
        }

        let config = self.inner.load(subject_id).await?;
        self.entries.insert(
            subject_id.to_string(),
            CachedEntry {
                config: config.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_catalog() {
        let yaml = r#"
default:
  requests_per_minute: 60
  requests_per_hour: 1000
  requests_per_day: 10000
subjects:
  key_abc:
    burst_limit: 2
    requests_per_minute: 5
    requests_per_hour: 100
    requests_per_day: 500
    daily_quota: 250
"#;
        let catalog = LimitsCatalog::from_yaml(yaml).unwrap();

        let abc = catalog.find("key_abc").unwrap();
        assert_eq!(abc.burst_limit, 2);
        assert_eq!(abc.quota_limit(), 250);

        let other = catalog.find("key_other").unwrap();
        assert_eq!(other.burst_limit, DEFAULT_BURST_LIMIT);
        assert_eq!(other.quota_limit(), 10000);
    }

    #[test]
    fn test_catalog_without_default() {
        let yaml = r#"
subjects:
  key_abc:
    requests_per_minute: 5
    requests_per_hour: 100
    requests_per_day: 500
"#;
        let catalog = LimitsCatalog::from_yaml(yaml).unwrap();
        assert!(catalog.find("key_abc").is_some());
        assert!(catalog.find("key_missing").is_none());
    }

    #[test]
    fn test_parse_invalid_catalog() {
        let result = LimitsCatalog::from_yaml("subjects: [1, 2");
        assert!(matches!(result, Err(GateError::Config(_))));
    }

    #[test]
    fn test_limit_for_each_window() {
        let config = RateLimitConfig::new(5, 50, 500).with_burst_limit(2);
        assert_eq!(config.limit_for(WindowKind::TenSeconds), 2);
        assert_eq!(config.limit_for(WindowKind::Minute), 5);
        assert_eq!(config.limit_for(WindowKind::Hour), 50);
        assert_eq!(config.limit_for(WindowKind::Day), 500);
    }

    #[tokio::test]
    async fn test_static_source_reload() {
        let source = StaticConfigSource::new(LimitsCatalog::new());
        assert_eq!(source.load("key").await.unwrap(), None);

        let mut catalog = LimitsCatalog::new();
        catalog.insert("key", RateLimitConfig::new(1, 2, 3));
        source.set_catalog(catalog);

        assert_eq!(
            source.load("key").await.unwrap(),
            Some(RateLimitConfig::new(1, 2, 3))
        );
    }

    struct CountingSource {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl ConfigSource for CountingSource {
        async fn load(
            &self,
            _subject_id: &str,
        ) -> std::result::Result<Option<RateLimitConfig>, StoreError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Some(RateLimitConfig::new(1, 2, 3)))
        }
    }

    #[tokio::test]
    async fn test_cached_source_hits_and_invalidation() {
        let inner = Arc::new(CountingSource {
            loads: AtomicUsize::new(0),
        });
        let cached = CachedConfigSource::new(inner.clone(), Duration::from_secs(60));

        cached.load("key").await.unwrap();
        cached.load("key").await.unwrap();
        assert_eq!(inner.loads.load(Ordering::SeqCst), 1);

        cached.invalidate("key");
        cached.load("key").await.unwrap();
        assert_eq!(inner.loads.load(Ordering::SeqCst), 2);

        cached.invalidate_all();
        assert_eq!(cached.cached_len(), 0);
    }

    #[tokio::test]
    async fn test_cached_source_expires() {
        let inner = Arc::new(CountingSource {
            loads: AtomicUsize::new(0),
        });
        let cached = CachedConfigSource::new(inner.clone(), Duration::ZERO);

        cached.load("key").await.unwrap();
        cached.load("key").await.unwrap();
        assert_eq!(inner.loads.load(Ordering::SeqCst), 2);
    }
}
