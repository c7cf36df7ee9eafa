//! Rolling daily quota enforcement.
//!
//! A quota row is created on first use, charged once per admitted request,
//! and reset in place once its `reset_time` has passed. Every write is a
//! conditional store primitive; when one loses a race the record is read
//! again and the decision re-evaluated, so an expiry crossing produces
//! exactly one rollover no matter how many callers observe it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::limiter::DEFAULT_STORE_TIMEOUT;
use super::window::seconds_until;
use crate::store::{with_deadline, QuotaRecord, QuotaStore, StoreError};

/// Quota type charged by the gate.
pub const DAILY_REQUESTS: &str = "requests_per_day";

/// Length of a quota period.
pub const DEFAULT_QUOTA_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Attempts before giving up on a contended quota row.
const MAX_ATTEMPTS: usize = 8;

/// Result of checking a quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaOutcome {
    pub allowed: bool,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl QuotaOutcome {
    fn from_record(record: &QuotaRecord, allowed: bool) -> Self {
        Self {
            allowed,
            used: record.current_usage,
            limit: record.limit_value,
            remaining: record.remaining(),
            reset_at: record.reset_time,
        }
    }

    /// Whole seconds from `now` until the quota resets.
    pub fn retry_after(&self, now: DateTime<Utc>) -> u64 {
        seconds_until(now, self.reset_at)
    }
}

/// Enforces long-horizon quotas over a shared [`QuotaStore`].
#[derive(Clone)]
pub struct QuotaEnforcer {
    store: Arc<dyn QuotaStore>,
    period: TimeDelta,
    timeout: Duration,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self {
            store,
            period: TimeDelta::days(1),
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the quota period (24 hours by default).
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = TimeDelta::from_std(period).unwrap_or(TimeDelta::days(1));
        self
    }

    /// Check the quota and charge one request if it allows.
    pub async fn check_and_consume(
        &self,
        subject_id: &str,
        quota_type: &str,
        default_limit: u64,
        now: DateTime<Utc>,
    ) -> Result<QuotaOutcome, StoreError> {
        let next_reset = now + self.period;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                trace!(subject = %subject_id, attempt, "Retrying contended quota");
            }

            let current = with_deadline(
                self.timeout,
                self.store.get_quota(subject_id, quota_type),
            )
            .await?;

            match current {
                None => {
                    if default_limit == 0 {
                        debug!(subject = %subject_id, "Quota disabled by zero limit");
                        return Ok(QuotaOutcome {
                            allowed: false,
                            used: 0,
                            limit: 0,
                            remaining: 0,
                            reset_at: next_reset,
                        });
                    }
                    let record =
                        QuotaRecord::first_use(subject_id, quota_type, default_limit, next_reset);
                    if with_deadline(self.timeout, self.store.insert_quota(&record)).await? {
                        debug!(subject = %subject_id, limit = default_limit, "Created quota");
                        return Ok(QuotaOutcome::from_record(&record, true));
                    }
                }
                Some(record) if now >= record.reset_time => {
                    if record.limit_value == 0 {
                        return Ok(QuotaOutcome::from_record(&record, false));
                    }
                    let rolled = with_deadline(
                        self.timeout,
                        self.store.rollover_quota(record.id, now, next_reset),
                    )
                    .await?;
                    if let Some(rolled) = rolled {
                        debug!(
                            subject = %subject_id,
                            reset_at = %rolled.reset_time,
                            "Quota rolled over"
                        );
                        return Ok(QuotaOutcome::from_record(&rolled, true));
                    }
                }
                Some(record) => {
                    if record.current_usage >= record.limit_value {
                        debug!(
                            subject = %subject_id,
                            used = record.current_usage,
                            limit = record.limit_value,
                            "Quota exhausted"
                        );
                        return Ok(QuotaOutcome::from_record(&record, false));
                    }
                    let bumped =
                        with_deadline(self.timeout, self.store.increment_quota(record.id, now))
                            .await?;
                    if let Some(bumped) = bumped {
                        return Ok(QuotaOutcome::from_record(&bumped, true));
                    }
                }
            }
        }

        warn!(subject = %subject_id, quota_type, "Quota row stayed contended");
        Err(StoreError::Contention(format!("{subject_id}/{quota_type}")))
    }

    /// Read the quota without charging it.
    pub async fn peek(
        &self,
        subject_id: &str,
        quota_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaOutcome>, StoreError> {
        let record =
            with_deadline(self.timeout, self.store.get_quota(subject_id, quota_type)).await?;
        Ok(record.map(|record| {
            if now >= record.reset_time {
                // Expired rows are reset on the next charge.
                QuotaOutcome {
                    allowed: record.limit_value > 0,
                    used: 0,
                    limit: record.limit_value,
                    remaining: record.limit_value,
                    reset_at: now + self.period,
                }
            } else {
                QuotaOutcome::from_record(&record, record.current_usage < record.limit_value)
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use rand::Rng;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 18, 45, 0).unwrap()
    }

    fn enforcer() -> (Arc<MemoryStore>, QuotaEnforcer) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), QuotaEnforcer::new(store))
    }

    #[tokio::test]
    async fn test_first_use_creates_record() {
        let (store, enforcer) = enforcer();

        let outcome = enforcer
            .check_and_consume("k", DAILY_REQUESTS, 3, now())
            .await
            .unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 2);
        assert_eq!(outcome.reset_at, now() + TimeDelta::days(1));

        let record = store.get_quota("k", DAILY_REQUESTS).await.unwrap().unwrap();
        assert_eq!(record.current_usage, 1);
        assert_eq!(record.limit_value, 3);
    }

    #[tokio::test]
    async fn test_exhausted_quota_denies_without_mutating() {
        let (store, enforcer) = enforcer();
        for _ in 0..3 {
            assert!(enforcer
                .check_and_consume("k", DAILY_REQUESTS, 3, now())
                .await
                .unwrap()
                .allowed);
        }

        for _ in 0..3 {
            let outcome = enforcer
                .check_and_consume("k", DAILY_REQUESTS, 3, now())
                .await
                .unwrap();
            assert!(!outcome.allowed);
            assert_eq!(outcome.remaining, 0);
        }
        let record = store.get_quota("k", DAILY_REQUESTS).await.unwrap().unwrap();
        assert_eq!(record.current_usage, 3);
    }

    #[tokio::test]
    async fn test_expired_quota_rolls_over() {
        let (store, enforcer) = enforcer();
        let mut record =
            QuotaRecord::first_use("k", DAILY_REQUESTS, 3, now() - TimeDelta::seconds(1));
        record.current_usage = 3;
        store.put_quota(record.clone());

        let outcome = enforcer
            .check_and_consume("k", DAILY_REQUESTS, 3, now())
            .await
            .unwrap();
        assert!(outcome.allowed);

        let stored = store.get_quota("k", DAILY_REQUESTS).await.unwrap().unwrap();
        assert_eq!(stored.id, record.id);
        assert_eq!(stored.current_usage, 1);
        assert_eq!(stored.reset_time, now() + TimeDelta::days(1));
    }

    #[tokio::test]
    async fn test_reset_instant_counts_as_expired() {
        let (store, enforcer) = enforcer();
        let mut record = QuotaRecord::first_use("k", DAILY_REQUESTS, 1, now());
        record.current_usage = 1;
        store.put_quota(record);

        let outcome = enforcer
            .check_and_consume("k", DAILY_REQUESTS, 1, now())
            .await
            .unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.used, 1);
    }

    #[tokio::test]
    async fn test_stored_limit_wins_over_default() {
        let (store, enforcer) = enforcer();
        let record = QuotaRecord::first_use("k", DAILY_REQUESTS, 1, now() + TimeDelta::hours(1));
        store.put_quota(record);

        let outcome = enforcer
            .check_and_consume("k", DAILY_REQUESTS, 100, now())
            .await
            .unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.limit, 1);
    }

    #[tokio::test]
    async fn test_zero_default_limit_denies() {
        let (store, enforcer) = enforcer();
        let outcome = enforcer
            .check_and_consume("k", DAILY_REQUESTS, 0, now())
            .await
            .unwrap();
        assert!(!outcome.allowed);
        assert!(store.get_quota("k", DAILY_REQUESTS).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rollover_happens_once() {
        let (store, enforcer) = enforcer();
        let mut record =
            QuotaRecord::first_use("k", DAILY_REQUESTS, 10_000, now() - TimeDelta::minutes(5));
        record.current_usage = 9_999;
        store.put_quota(record);

        let callers: u64 = rand::thread_rng().gen_range(20..60);
        let tasks: Vec<_> = (0..callers)
            .map(|_| {
                let enforcer = enforcer.clone();
                tokio::spawn(async move {
                    enforcer
                        .check_and_consume("k", DAILY_REQUESTS, 10_000, now())
                        .await
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            assert!(result.unwrap().unwrap().allowed);
        }

        // A second rollover would have reset the usage again.
        let stored = store.get_quota("k", DAILY_REQUESTS).await.unwrap().unwrap();
        assert_eq!(stored.current_usage, callers);
        assert_eq!(stored.reset_time, now() + TimeDelta::days(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_creates_one_record() {
        let (store, enforcer) = enforcer();

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let enforcer = enforcer.clone();
                tokio::spawn(async move {
                    enforcer
                        .check_and_consume("k", DAILY_REQUESTS, 20, now())
                        .await
                        .unwrap()
                        .allowed
                })
            })
            .collect();

        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 20);

        let stored = store.get_quota("k", DAILY_REQUESTS).await.unwrap().unwrap();
        assert_eq!(stored.current_usage, 20);
    }

    #[tokio::test]
    async fn test_peek_expired_reports_fresh_budget() {
        let (store, enforcer) = enforcer();
        let mut record =
            QuotaRecord::first_use("k", DAILY_REQUESTS, 5, now() - TimeDelta::seconds(1));
        record.current_usage = 5;
        store.put_quota(record);

        let peeked = enforcer.peek("k", DAILY_REQUESTS, now()).await.unwrap().unwrap();
        assert!(peeked.allowed);
        assert_eq!(peeked.remaining, 5);
        assert!(enforcer.peek("other", DAILY_REQUESTS, now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_error_propagates() {
        let (store, enforcer) = enforcer();
        store.fail_next(1);
        let result = enforcer.check_and_consume("k", DAILY_REQUESTS, 5, now()).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
