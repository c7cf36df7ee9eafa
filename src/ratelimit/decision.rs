//! Gate outcomes and their client-facing shape.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::limiter::TierOutcome;
use super::quota::QuotaOutcome;
use super::window::WindowKind;

/// Final outcome of a gate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed(Admission),
    Denied(Denial),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Decision::Denied(denial) => Some(denial),
            Decision::Allowed(_) => None,
        }
    }
}

/// Snapshot of an admitted request, used to stamp response headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub request_id: Uuid,
    pub subject_id: String,
    pub tiers: Vec<TierOutcome>,
    pub quota: QuotaOutcome,
}

impl Admission {
    pub fn tier(&self, kind: WindowKind) -> Option<&TierOutcome> {
        self.tiers.iter().find(|t| t.kind == kind)
    }

    /// `RateLimit-*` header pairs for the minute, hour and day tiers and the
    /// quota.
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::with_capacity(12);
        for tier in &self.tiers {
            let Some(label) = header_label(tier.kind) else {
                continue;
            };
            push_header_set(&mut headers, label, tier.limit, tier.remaining(), tier.reset_at);
        }
        push_header_set(
            &mut headers,
            "Quota",
            self.quota.limit,
            self.quota.remaining,
            self.quota.reset_at,
        );
        headers
    }
}

fn header_label(kind: WindowKind) -> Option<&'static str> {
    match kind {
        WindowKind::TenSeconds => None,
        WindowKind::Minute => Some("Minute"),
        WindowKind::Hour => Some("Hour"),
        WindowKind::Day => Some("Day"),
    }
}

fn push_header_set(
    headers: &mut Vec<(String, String)>,
    label: &str,
    limit: u64,
    remaining: u64,
    reset_at: DateTime<Utc>,
) {
    headers.push((format!("RateLimit-Limit-{label}"), limit.to_string()));
    headers.push((format!("RateLimit-Remaining-{label}"), remaining.to_string()));
    headers.push((format!("RateLimit-Reset-{label}"), format_instant(reset_at)));
}

/// ISO-8601 UTC instant with second precision.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A tier that refused the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierDenial {
    pub tier: WindowKind,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after: u64,
}

/// An exhausted quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDenial {
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after: u64,
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// The subject has no limits configured. Not retryable.
    ConfigNotFound { subject_id: String },
    /// No subject was resolved for the request. Reported like
    /// `ConfigNotFound`.
    SubjectMissing,
    /// The ten second burst tier is exhausted.
    BurstLimitExceeded(TierDenial),
    /// The minute, hour or day tier is exhausted.
    RateLimitExceeded(TierDenial),
    /// The daily quota is exhausted until `reset_at`.
    QuotaExceeded(QuotaDenial),
    /// The store failed or timed out; the gate fails closed. The cause is
    /// logged where it happened and never sent to the caller.
    InternalError,
}

impl Denial {
    pub(crate) fn from_tier(outcome: &TierOutcome, now: DateTime<Utc>) -> Self {
        let denial = TierDenial {
            tier: outcome.kind,
            limit: outcome.limit,
            reset_at: outcome.reset_at,
            retry_after: outcome.retry_after(now),
        };
        match outcome.kind {
            WindowKind::TenSeconds => Denial::BurstLimitExceeded(denial),
            _ => Denial::RateLimitExceeded(denial),
        }
    }

    pub(crate) fn from_quota(outcome: &QuotaOutcome, now: DateTime<Utc>) -> Self {
        Denial::QuotaExceeded(QuotaDenial {
            limit: outcome.limit,
            reset_at: outcome.reset_at,
            retry_after: outcome.retry_after(now),
        })
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Denial::ConfigNotFound { .. } | Denial::SubjectMissing => "CONFIG_NOT_FOUND",
            Denial::BurstLimitExceeded(_) => "BURST_RATE_LIMIT_EXCEEDED",
            Denial::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            Denial::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Denial::InternalError => "INTERNAL_ERROR",
        }
    }

    /// HTTP status class of the denial.
    pub fn status(&self) -> u16 {
        match self {
            Denial::ConfigNotFound { .. } | Denial::SubjectMissing => 404,
            Denial::BurstLimitExceeded(_)
            | Denial::RateLimitExceeded(_)
            | Denial::QuotaExceeded(_) => 429,
            Denial::InternalError => 500,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Denial::ConfigNotFound { subject_id } => {
                format!("No rate limit configuration for API key {subject_id}")
            }
            Denial::SubjectMissing => "No API key was provided with the request".to_string(),
            Denial::BurstLimitExceeded(d) => format!(
                "Burst limit of {} requests per 10 seconds exceeded",
                d.limit
            ),
            Denial::RateLimitExceeded(d) => {
                format!("Rate limit of {} requests per {} exceeded", d.limit, d.tier)
            }
            Denial::QuotaExceeded(d) => format!("Daily quota of {} requests exhausted", d.limit),
            Denial::InternalError => "Rate limiting is temporarily unavailable".to_string(),
        }
    }

    /// Seconds the caller should wait before retrying, when retrying helps.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Denial::BurstLimitExceeded(d) | Denial::RateLimitExceeded(d) => Some(d.retry_after),
            Denial::QuotaExceeded(d) => Some(d.retry_after),
            _ => None,
        }
    }

    /// The tier that refused the request, for tier denials.
    pub fn tier(&self) -> Option<WindowKind> {
        match self {
            Denial::BurstLimitExceeded(d) | Denial::RateLimitExceeded(d) => Some(d.tier),
            _ => None,
        }
    }

    pub fn body(&self) -> ErrorBody {
        let (limit, reset_at) = match self {
            Denial::BurstLimitExceeded(d) | Denial::RateLimitExceeded(d) => {
                (Some(d.limit), Some(d.reset_at))
            }
            Denial::QuotaExceeded(d) => (Some(d.limit), Some(d.reset_at)),
            _ => (None, None),
        };

        ErrorBody {
            code: self.code(),
            message: self.message(),
            limit,
            remaining: limit.map(|_| 0),
            reset_time: reset_at.map(format_instant),
            retry_after_seconds: self.retry_after(),
            tier: self.tier(),
        }
    }
}

/// JSON body of a refused request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<WindowKind>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 2).unwrap()
    }

    fn tier(kind: WindowKind, used: u64, limit: u64) -> TierOutcome {
        TierOutcome {
            kind,
            allowed: used <= limit,
            used,
            limit,
            reset_at: kind.next_reset(now()),
        }
    }

    fn admission() -> Admission {
        Admission {
            request_id: Uuid::new_v4(),
            subject_id: "k".to_string(),
            tiers: vec![
                tier(WindowKind::TenSeconds, 1, 10),
                tier(WindowKind::Minute, 4, 5),
                tier(WindowKind::Hour, 4, 100),
                tier(WindowKind::Day, 4, 1000),
            ],
            quota: QuotaOutcome {
                allowed: true,
                used: 4,
                limit: 500,
                remaining: 496,
                reset_at: now() + TimeDelta::days(1),
            },
        }
    }

    #[test]
    fn test_headers_skip_burst_tier() {
        let headers = admission().headers();
        assert_eq!(headers.len(), 12);
        assert!(headers.iter().all(|(name, _)| !name.contains("Burst")));

        let get = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("RateLimit-Limit-Minute"), Some("5"));
        assert_eq!(get("RateLimit-Remaining-Minute"), Some("1"));
        assert_eq!(get("RateLimit-Reset-Minute"), Some("2024-05-01T09:31:00Z"));
        assert_eq!(get("RateLimit-Reset-Day"), Some("2024-05-02T00:00:00Z"));
        assert_eq!(get("RateLimit-Remaining-Quota"), Some("496"));
    }

    #[test]
    fn test_remaining_floors_at_zero() {
        let mut admission = admission();
        admission.tiers[1] = tier(WindowKind::Minute, 9, 5);
        let headers = admission.headers();
        let remaining = headers
            .iter()
            .find(|(n, _)| n == "RateLimit-Remaining-Minute")
            .unwrap();
        assert_eq!(remaining.1, "0");
    }

    #[test]
    fn test_tier_denial_codes() {
        let burst = Denial::from_tier(&tier(WindowKind::TenSeconds, 2, 2), now());
        assert_eq!(burst.code(), "BURST_RATE_LIMIT_EXCEEDED");
        assert_eq!(burst.status(), 429);
        assert_eq!(burst.retry_after(), Some(8));

        let hour = Denial::from_tier(&tier(WindowKind::Hour, 100, 100), now());
        assert_eq!(hour.code(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(hour.tier(), Some(WindowKind::Hour));
        assert_eq!(hour.retry_after(), Some(30 * 60 - 2));
    }

    #[test]
    fn test_denial_body_serialization() {
        let denial = Denial::from_tier(&tier(WindowKind::TenSeconds, 2, 2), now());
        let json = serde_json::to_value(denial.body()).unwrap();

        assert_eq!(json["code"], "BURST_RATE_LIMIT_EXCEEDED");
        assert_eq!(json["limit"], 2);
        assert_eq!(json["remaining"], 0);
        assert_eq!(json["resetTime"], "2024-05-01T09:30:10Z");
        assert_eq!(json["retryAfterSeconds"], 8);
        assert_eq!(json["tier"], "ten_seconds");
    }

    #[test]
    fn test_non_limit_denials_have_minimal_body() {
        let missing = Denial::ConfigNotFound {
            subject_id: "k".to_string(),
        };
        assert_eq!(missing.status(), 404);
        let json = serde_json::to_value(missing.body()).unwrap();
        assert_eq!(json["code"], "CONFIG_NOT_FOUND");
        assert!(json.get("limit").is_none());
        assert!(json.get("retryAfterSeconds").is_none());

        let internal = Denial::InternalError;
        assert_eq!(internal.status(), 500);
        assert_eq!(internal.body().message, "Rate limiting is temporarily unavailable");
    }

    #[test]
    fn test_missing_subject_has_its_own_message() {
        let missing = Denial::SubjectMissing;
        assert_eq!(missing.status(), 404);
        assert_eq!(missing.code(), "CONFIG_NOT_FOUND");

        let body = missing.body();
        assert_eq!(body.message, "No API key was provided with the request");
        assert!(!body.message.ends_with(' '));
        assert!(body.limit.is_none());
    }

    #[test]
    fn test_quota_denial() {
        let outcome = QuotaOutcome {
            allowed: false,
            used: 3,
            limit: 3,
            remaining: 0,
            reset_at: now() + TimeDelta::hours(2),
        };
        let denial = Denial::from_quota(&outcome, now());
        assert_eq!(denial.code(), "QUOTA_EXCEEDED");
        assert_eq!(denial.retry_after(), Some(7200));
        assert_eq!(denial.tier(), None);
    }
}
