//! Rate limiting and quota logic.

mod cleanup;
mod decision;
mod gate;
mod limiter;
mod quota;
mod rules;
mod window;

pub use cleanup::{spawn_cleanup, CleanupConfig};
pub use decision::{format_instant, Admission, Decision, Denial, ErrorBody, QuotaDenial, TierDenial};
pub use gate::{Gate, UsageSnapshot};
pub use limiter::{RateLimiter, TierOutcome, DEFAULT_STORE_TIMEOUT};
pub use quota::{QuotaEnforcer, QuotaOutcome, DAILY_REQUESTS, DEFAULT_QUOTA_PERIOD};
pub use rules::{
    CachedConfigSource, LimitsCatalog, RateLimitConfig, StaticConfigSource, DEFAULT_BURST_LIMIT,
};
pub use window::{seconds_until, WindowKind};
