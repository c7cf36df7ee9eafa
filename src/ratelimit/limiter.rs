//! Single-tier window limiter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};

use super::window::{seconds_until, WindowKind};
use crate::store::{with_deadline, CounterKey, StoreError, UsageStore};

/// Default deadline for a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Result of checking one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierOutcome {
    pub kind: WindowKind,
    pub allowed: bool,
    pub used: u64,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
}

impl TierOutcome {
    /// Remaining budget in the window, floored at zero.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    /// Whole seconds from `now` until the window resets.
    pub fn retry_after(&self, now: DateTime<Utc>) -> u64 {
        seconds_until(now, self.reset_at)
    }
}

/// Fixed-window limiter over a shared [`UsageStore`].
///
/// Holds no counter state of its own; every decision is made against the
/// store so any number of limiters can share it.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn UsageStore>,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self {
            store,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check one tier and consume a unit of its budget if it allows.
    ///
    /// A denied request leaves the counter untouched. A limit of zero denies
    /// without reading the store.
    pub async fn check_and_consume(
        &self,
        subject_id: &str,
        kind: WindowKind,
        limit: u64,
        now: DateTime<Utc>,
    ) -> Result<TierOutcome, StoreError> {
        let key = CounterKey::new(subject_id, kind, kind.window_start(now));
        let reset_at = kind.next_reset(now);

        trace!(key = %key, limit, "Checking tier");

        let denied = |used: u64| TierOutcome {
            kind,
            allowed: false,
            used,
            limit,
            reset_at,
        };

        if limit == 0 {
            debug!(key = %key, "Tier disabled by zero limit");
            return Ok(denied(0));
        }

        let used = with_deadline(self.timeout, self.store.get_count(&key)).await?;
        if used >= limit {
            debug!(key = %key, used, limit, "Tier limit exceeded");
            return Ok(denied(used));
        }

        let used = with_deadline(self.timeout, self.store.increment_and_get(&key)).await?;
        // Concurrent callers can all pass the read above; the post-increment
        // value is authoritative.
        if used > limit {
            debug!(key = %key, used, limit, "Tier limit exceeded by concurrent request");
            return Ok(denied(used));
        }

        Ok(TierOutcome {
            kind,
            allowed: true,
            used,
            limit,
            reset_at,
        })
    }

    /// Read a tier's usage without consuming budget.
    pub async fn peek(
        &self,
        subject_id: &str,
        kind: WindowKind,
        limit: u64,
        now: DateTime<Utc>,
    ) -> Result<TierOutcome, StoreError> {
        let key = CounterKey::new(subject_id, kind, kind.window_start(now));
        let used = with_deadline(self.timeout, self.store.get_count(&key)).await?;
        Ok(TierOutcome {
            kind,
            allowed: used < limit,
            used,
            limit,
            reset_at: kind.next_reset(now),
        })
    }
}
