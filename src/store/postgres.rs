//! Postgres store.
//!
//! Counter increments are a single `INSERT ... ON CONFLICT DO UPDATE ...
//! RETURNING` and every quota mutation is a single conditional `UPDATE ...
//! WHERE ... RETURNING`, so correctness under concurrent gates rests on row
//! locking in the database.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    AdmissionEvent, AdmissionLog, ConfigSource, CounterKey, QuotaRecord, QuotaStore, StoreError,
    UsageStore,
};
use crate::ratelimit::{RateLimitConfig, WindowKind};

const SCHEMA: &str = include_str!("../../migrations/0001_rate_limits.sql");

#[derive(Debug, FromRow)]
struct QuotaRow {
    id: Uuid,
    subject_id: String,
    quota_type: String,
    limit_value: i64,
    current_usage: i64,
    reset_time: DateTime<Utc>,
}

impl TryFrom<QuotaRow> for QuotaRecord {
    type Error = StoreError;

    fn try_from(row: QuotaRow) -> Result<Self, Self::Error> {
        Ok(QuotaRecord {
            limit_value: to_unsigned("limit_value", row.limit_value)?,
            current_usage: to_unsigned("current_usage", row.current_usage)?,
            id: row.id,
            subject_id: row.subject_id,
            quota_type: row.quota_type,
            reset_time: row.reset_time,
        })
    }
}

#[derive(Debug, FromRow)]
struct ConfigRow {
    requests_per_minute: i64,
    requests_per_hour: i64,
    requests_per_day: i64,
    burst_limit: i64,
    daily_quota: Option<i64>,
}

impl TryFrom<ConfigRow> for RateLimitConfig {
    type Error = StoreError;

    fn try_from(row: ConfigRow) -> Result<Self, Self::Error> {
        Ok(RateLimitConfig {
            requests_per_minute: to_unsigned("requests_per_minute", row.requests_per_minute)?,
            requests_per_hour: to_unsigned("requests_per_hour", row.requests_per_hour)?,
            requests_per_day: to_unsigned("requests_per_day", row.requests_per_day)?,
            burst_limit: to_unsigned("burst_limit", row.burst_limit)?,
            daily_quota: row
                .daily_quota
                .map(|q| to_unsigned("daily_quota", q))
                .transpose()?,
        })
    }
}

fn to_unsigned(column: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Malformed(format!("{column} = {value}")))
}

fn to_signed(column: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Malformed(format!("{column} = {value}")))
}

/// Start of the oldest window of `kind` that must be kept at `now`.
fn purge_cutoff(kind: WindowKind, now: DateTime<Utc>, grace: Duration) -> DateTime<Utc> {
    let keep = TimeDelta::from_std(kind.duration() + grace).unwrap_or(TimeDelta::days(365));
    now - keep
}

/// Postgres-backed implementation of every store trait.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool with a short acquire timeout so an unreachable
    /// database surfaces as an error rather than a stalled request.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;
        info!(max_connections, "Connected to Postgres");
        Ok(Self::new(pool))
    }

    /// Like [`PgStore::connect`] but defers connecting until first use.
    pub fn connect_lazy(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)?;
        Ok(Self::new(pool))
    }

    /// Create the tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("Schema is up to date");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn get_count(&self, key: &CounterKey) -> Result<u64, StoreError> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT count FROM usage_counters
            WHERE subject_id = $1 AND window_type = $2 AND window_start = $3
            "#,
        )
        .bind(&key.subject_id)
        .bind(key.window.as_str())
        .bind(key.window_start)
        .fetch_optional(&self.pool)
        .await?;

        count.map(|c| to_unsigned("count", c)).transpose().map(|c| c.unwrap_or(0))
    }

    async fn increment_and_get(&self, key: &CounterKey) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO usage_counters (subject_id, window_type, window_start, count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (subject_id, window_type, window_start) DO UPDATE SET
                count = usage_counters.count + 1
            RETURNING count
            "#,
        )
        .bind(&key.subject_id)
        .bind(key.window.as_str())
        .bind(key.window_start)
        .fetch_one(&self.pool)
        .await?;

        to_unsigned("count", count)
    }

    async fn purge_expired(&self, now: DateTime<Utc>, grace: Duration) -> Result<u64, StoreError> {
        let mut purged = 0;
        for kind in WindowKind::ALL {
            let result = sqlx::query(
                "DELETE FROM usage_counters WHERE window_type = $1 AND window_start < $2",
            )
            .bind(kind.as_str())
            .bind(purge_cutoff(kind, now, grace))
            .execute(&self.pool)
            .await?;
            purged += result.rows_affected();
        }
        debug!(purged, "Purged expired counters");
        Ok(purged)
    }
}

#[async_trait]
impl QuotaStore for PgStore {
    async fn get_quota(
        &self,
        subject_id: &str,
        quota_type: &str,
    ) -> Result<Option<QuotaRecord>, StoreError> {
        let row = sqlx::query_as::<_, QuotaRow>(
            r#"
            SELECT id, subject_id, quota_type, limit_value, current_usage, reset_time
            FROM quotas
            WHERE subject_id = $1 AND quota_type = $2
            "#,
        )
        .bind(subject_id)
        .bind(quota_type)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QuotaRecord::try_from).transpose()
    }

    async fn insert_quota(&self, record: &QuotaRecord) -> Result<bool, StoreError> {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO quotas (id, subject_id, quota_type, limit_value, current_usage, reset_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (subject_id, quota_type) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(record.id)
        .bind(&record.subject_id)
        .bind(&record.quota_type)
        .bind(to_signed("limit_value", record.limit_value)?)
        .bind(to_signed("current_usage", record.current_usage)?)
        .bind(record.reset_time)
        .fetch_optional(&self.pool)
        .await?;

        Ok(inserted.is_some())
    }

    async fn rollover_quota(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> Result<Option<QuotaRecord>, StoreError> {
        let row = sqlx::query_as::<_, QuotaRow>(
            r#"
            UPDATE quotas SET current_usage = 1, reset_time = $3
            WHERE id = $1 AND reset_time <= $2
            RETURNING id, subject_id, quota_type, limit_value, current_usage, reset_time
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(next_reset)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QuotaRecord::try_from).transpose()
    }

    async fn increment_quota(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaRecord>, StoreError> {
        let row = sqlx::query_as::<_, QuotaRow>(
            r#"
            UPDATE quotas SET current_usage = current_usage + 1
            WHERE id = $1 AND reset_time > $2 AND current_usage < limit_value
            RETURNING id, subject_id, quota_type, limit_value, current_usage, reset_time
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QuotaRecord::try_from).transpose()
    }
}

#[async_trait]
impl ConfigSource for PgStore {
    async fn load(&self, subject_id: &str) -> Result<Option<RateLimitConfig>, StoreError> {
        let row = sqlx::query_as::<_, ConfigRow>(
            r#"
            SELECT requests_per_minute, requests_per_hour, requests_per_day,
                   burst_limit, daily_quota
            FROM rate_limit_configs
            WHERE subject_id = $1
            "#,
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RateLimitConfig::try_from).transpose()
    }
}

#[async_trait]
impl AdmissionLog for PgStore {
    async fn record(&self, event: &AdmissionEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO admission_log (request_id, subject_id, admitted_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(event.request_id)
        .bind(&event.subject_id)
        .bind(event.admitted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
