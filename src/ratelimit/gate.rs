//! Request-facing orchestration of tiers and quota.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::decision::{Admission, Decision, Denial};
use super::limiter::{RateLimiter, TierOutcome, DEFAULT_STORE_TIMEOUT};
use super::quota::{QuotaEnforcer, QuotaOutcome, DAILY_REQUESTS};
use super::rules::RateLimitConfig;
use super::window::WindowKind;
use crate::store::{
    with_deadline, AdmissionEvent, AdmissionLog, ConfigSource, QuotaStore, StoreError, UsageStore,
};

/// Current usage of a subject, read without consuming budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub subject_id: String,
    pub tiers: Vec<TierOutcome>,
    /// `None` until the subject's first admitted request.
    pub quota: Option<QuotaOutcome>,
}

/// The admission gate.
///
/// Evaluates tiers from the smallest window to the largest, stopping at the
/// first that refuses, then charges the daily quota. Any store failure
/// before admission refuses the request.
pub struct Gate {
    configs: Arc<dyn ConfigSource>,
    limiter: RateLimiter,
    quota: QuotaEnforcer,
    admissions: Option<Arc<dyn AdmissionLog>>,
    quota_type: String,
    timeout: Duration,
}

impl Gate {
    pub fn new(
        configs: Arc<dyn ConfigSource>,
        usage: Arc<dyn UsageStore>,
        quotas: Arc<dyn QuotaStore>,
    ) -> Self {
        Self {
            configs,
            limiter: RateLimiter::new(usage),
            quota: QuotaEnforcer::new(quotas),
            admissions: None,
            quota_type: DAILY_REQUESTS.to_string(),
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Record every admitted request in `log`.
    pub fn with_admission_log(mut self, log: Arc<dyn AdmissionLog>) -> Self {
        self.admissions = Some(log);
        self
    }

    /// Deadline applied to each individual store call.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.limiter = self.limiter.with_timeout(timeout);
        self.quota = self.quota.with_timeout(timeout);
        self
    }

    pub fn with_quota_type(mut self, quota_type: impl Into<String>) -> Self {
        self.quota_type = quota_type.into();
        self
    }

    pub fn with_quota_period(mut self, period: Duration) -> Self {
        self.quota = self.quota.with_period(period);
        self
    }

    /// Decide whether `subject_id` may proceed at `now`.
    #[instrument(skip_all, fields(subject = %subject_id))]
    pub async fn check(&self, subject_id: &str, now: DateTime<Utc>) -> Decision {
        let config = match self.load_config(subject_id).await {
            Ok(config) => config,
            Err(denial) => return Decision::Denied(denial),
        };

        let mut tiers = Vec::with_capacity(WindowKind::ALL.len());
        for kind in WindowKind::ALL {
            let limit = config.limit_for(kind);
            match self.limiter.check_and_consume(subject_id, kind, limit, now).await {
                Ok(outcome) if outcome.allowed => tiers.push(outcome),
                Ok(outcome) => {
                    let denial = Denial::from_tier(&outcome, now);
                    warn!(
                        tier = %kind,
                        used = outcome.used,
                        limit,
                        retry_after = ?denial.retry_after(),
                        "Request rejected: rate limit exceeded"
                    );
                    return Decision::Denied(denial);
                }
                Err(e) => return Decision::Denied(internal_error("rate limit tier", e)),
            }
        }

        let quota = match self
            .quota
            .check_and_consume(subject_id, &self.quota_type, config.quota_limit(), now)
            .await
        {
            Ok(outcome) if outcome.allowed => outcome,
            Ok(outcome) => {
                warn!(
                    used = outcome.used,
                    limit = outcome.limit,
                    reset_at = %outcome.reset_at,
                    "Request rejected: quota exceeded"
                );
                return Decision::Denied(Denial::from_quota(&outcome, now));
            }
            Err(e) => return Decision::Denied(internal_error("quota", e)),
        };

        let admission = Admission {
            request_id: Uuid::new_v4(),
            subject_id: subject_id.to_string(),
            tiers,
            quota,
        };
        self.record_admission(&admission, now).await;

        debug!(request_id = %admission.request_id, "Request admitted");
        Decision::Allowed(admission)
    }

    /// [`Gate::check`] against the current wall-clock time.
    pub async fn check_now(&self, subject_id: &str) -> Decision {
        self.check(subject_id, Utc::now()).await
    }

    /// Read the subject's usage of every tier and the quota without
    /// consuming budget.
    pub async fn status(
        &self,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, Denial> {
        let config = self.load_config(subject_id).await?;

        let mut tiers = Vec::with_capacity(WindowKind::ALL.len());
        for kind in WindowKind::ALL {
            let outcome = self
                .limiter
                .peek(subject_id, kind, config.limit_for(kind), now)
                .await
                .map_err(|e| internal_error("rate limit tier", e))?;
            tiers.push(outcome);
        }

        let quota = self
            .quota
            .peek(subject_id, &self.quota_type, now)
            .await
            .map_err(|e| internal_error("quota", e))?;

        Ok(UsageSnapshot {
            subject_id: subject_id.to_string(),
            tiers,
            quota,
        })
    }

    async fn load_config(&self, subject_id: &str) -> Result<RateLimitConfig, Denial> {
        match with_deadline(self.timeout, self.configs.load(subject_id)).await {
            Ok(Some(config)) => Ok(config),
            Ok(None) => {
                info!(subject = %subject_id, "No rate limit configuration for subject");
                Err(Denial::ConfigNotFound {
                    subject_id: subject_id.to_string(),
                })
            }
            Err(e) => Err(internal_error("configuration", e)),
        }
    }

    /// Bookkeeping after admission. Failures never revoke the admission.
    async fn record_admission(&self, admission: &Admission, now: DateTime<Utc>) {
        let Some(log) = &self.admissions else {
            return;
        };
        let event = AdmissionEvent {
            request_id: admission.request_id,
            subject_id: admission.subject_id.clone(),
            admitted_at: now,
        };
        if let Err(e) = with_deadline(self.timeout, log.record(&event)).await {
            warn!(
                request_id = %event.request_id,
                error = %e,
                "Failed to record admission"
            );
        }
    }
}

fn internal_error(stage: &str, err: StoreError) -> Denial {
    error!(stage, error = %err, "Store failure, rejecting request");
    Denial::InternalError
}
