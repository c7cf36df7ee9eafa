//! Durable state behind the gate.
//!
//! The traits here are the only place the gate touches persistent state.
//! Every mutating operation is a single atomic store primitive so that any
//! number of stateless gate instances can share one store.

mod memory;
mod postgres;

pub use memory::{MemoryStore, DEFAULT_ADMISSION_CAPACITY};
pub use postgres::PgStore;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ratelimit::{RateLimitConfig, WindowKind};

/// Errors surfaced by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A store call exceeded its deadline
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// A row could not be mapped onto the data model
    #[error("malformed row: {0}")]
    Malformed(String),

    /// Conditional writes kept losing races
    #[error("contention on {0}")]
    Contention(String),

    /// Database driver errors
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Run a store call under a deadline, mapping expiry to [`StoreError::Timeout`].
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| StoreError::Timeout(deadline))?
}

/// Key identifying one usage counter row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    /// The subject (API key id) being limited.
    pub subject_id: String,
    /// The window kind.
    pub window: WindowKind,
    /// The floored window boundary.
    pub window_start: DateTime<Utc>,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(subject_id: &str, window: WindowKind, window_start: DateTime<Utc>) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            window,
            window_start,
        }
    }

    /// Whether this counter's window closed more than `grace` before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        (now - self.window_start)
            .to_std()
            .map(|elapsed| elapsed > self.window.duration() + grace)
            .unwrap_or(false)
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.subject_id,
            self.window,
            self.window_start.timestamp()
        )
    }
}

/// A long-horizon quota row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub id: Uuid,
    pub subject_id: String,
    pub quota_type: String,
    pub limit_value: u64,
    pub current_usage: u64,
    pub reset_time: DateTime<Utc>,
}

impl QuotaRecord {
    /// A fresh record that has already been charged one request.
    pub fn first_use(
        subject_id: &str,
        quota_type: &str,
        limit_value: u64,
        reset_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_id: subject_id.to_string(),
            quota_type: quota_type.to_string(),
            limit_value,
            current_usage: 1,
            reset_time,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.limit_value.saturating_sub(self.current_usage)
    }
}

/// A request that passed the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionEvent {
    pub request_id: Uuid,
    pub subject_id: String,
    pub admitted_at: DateTime<Utc>,
}

/// Window-keyed request counters.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Current count for a key; zero when no row exists.
    async fn get_count(&self, key: &CounterKey) -> Result<u64, StoreError>;

    /// Create the row with count 1 or add 1 to it, atomically, returning
    /// the post-increment count.
    async fn increment_and_get(&self, key: &CounterKey) -> Result<u64, StoreError>;

    /// Delete counters whose window closed more than `grace` before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>, grace: Duration) -> Result<u64, StoreError>;
}

/// Quota rows keyed by `(subject_id, quota_type)`.
///
/// The conditional operations return `None` when their guard did not hold,
/// which callers treat as a lost race and answer with a fresh read.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get_quota(
        &self,
        subject_id: &str,
        quota_type: &str,
    ) -> Result<Option<QuotaRecord>, StoreError>;

    /// Insert the record unless one already exists for its key.
    async fn insert_quota(&self, record: &QuotaRecord) -> Result<bool, StoreError>;

    /// Reset usage to 1 and move `reset_time` forward, only if the row is
    /// still expired at `now`.
    async fn rollover_quota(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> Result<Option<QuotaRecord>, StoreError>;

    /// Add 1 to usage, only if the row is unexpired at `now` and below its
    /// limit.
    async fn increment_quota(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaRecord>, StoreError>;
}

/// Source of per-subject limit configuration.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self, subject_id: &str) -> Result<Option<RateLimitConfig>, StoreError>;
}

/// Post-admission bookkeeping.
#[async_trait]
pub trait AdmissionLog: Send + Sync {
    async fn record(&self, event: &AdmissionEvent) -> Result<(), StoreError>;
}
