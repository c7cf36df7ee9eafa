//! Fixed window boundaries.
//!
//! All boundaries are computed in UTC so that every gate instance sharing a
//! store agrees on which counter row a request belongs to.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Kind of rate limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Ten second burst window
    TenSeconds,
    /// Calendar minute
    Minute,
    /// Calendar hour
    Hour,
    /// Calendar day (UTC)
    Day,
}

impl WindowKind {
    /// Every window kind, from the smallest to the largest.
    pub const ALL: [WindowKind; 4] = [
        WindowKind::TenSeconds,
        WindowKind::Minute,
        WindowKind::Hour,
        WindowKind::Day,
    ];

    /// Get the duration of this window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds() as u64)
    }

    fn seconds(&self) -> i64 {
        match self {
            WindowKind::TenSeconds => 10,
            WindowKind::Minute => 60,
            WindowKind::Hour => 3600,
            WindowKind::Day => 86400,
        }
    }

    /// Stable name used in the persisted `window_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::TenSeconds => "ten_seconds",
            WindowKind::Minute => "minute",
            WindowKind::Hour => "hour",
            WindowKind::Day => "day",
        }
    }

    /// Parse the persisted `window_type` column.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ten_seconds" => Some(WindowKind::TenSeconds),
            "minute" => Some(WindowKind::Minute),
            "hour" => Some(WindowKind::Hour),
            "day" => Some(WindowKind::Day),
            _ => None,
        }
    }

    /// Floor `now` to the start of the window containing it.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let size = self.seconds();
        let floored = now.timestamp().div_euclid(size) * size;
        // Every floored value lies within chrono's range because `now` does.
        DateTime::from_timestamp(floored, 0).unwrap_or(now)
    }

    /// The instant the window containing `now` closes.
    pub fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.window_start(now) + TimeDelta::seconds(self.seconds())
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whole seconds from `now` until `reset_at`, rounded up.
pub fn seconds_until(now: DateTime<Utc>, reset_at: DateTime<Utc>) -> u64 {
    let delta = reset_at - now;
    if delta <= TimeDelta::zero() {
        return 0;
    }
    let secs = delta.num_seconds() as u64;
    if delta.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32, ms: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, s).unwrap() + TimeDelta::milliseconds(ms as i64)
    }

    #[test]
    fn test_window_duration() {
        assert_eq!(WindowKind::TenSeconds.duration(), Duration::from_secs(10));
        assert_eq!(WindowKind::Minute.duration(), Duration::from_secs(60));
        assert_eq!(WindowKind::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(WindowKind::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_window_start_floors() {
        let now = at(13, 47, 38, 512);
        assert_eq!(WindowKind::TenSeconds.window_start(now), at(13, 47, 30, 0));
        assert_eq!(WindowKind::Minute.window_start(now), at(13, 47, 0, 0));
        assert_eq!(WindowKind::Hour.window_start(now), at(13, 0, 0, 0));
        assert_eq!(WindowKind::Day.window_start(now), at(0, 0, 0, 0));
    }

    #[test]
    fn test_next_reset_is_start_plus_duration() {
        let now = at(23, 59, 59, 999);
        for kind in WindowKind::ALL {
            let start = kind.window_start(now);
            let reset = kind.next_reset(now);
            assert_eq!((reset - start).num_seconds() as u64, kind.duration().as_secs());
            assert!(start <= now && now < reset, "{kind} window must contain now");
        }
        assert_eq!(
            WindowKind::Day.next_reset(now),
            Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_same_window_same_start() {
        for kind in WindowKind::ALL {
            let start = kind.window_start(at(10, 20, 30, 0));
            let end = kind.next_reset(at(10, 20, 30, 0));
            let mut t = start;
            while t < end {
                assert_eq!(kind.window_start(t), start);
                t += TimeDelta::milliseconds(kind.seconds() * 1000 / 7);
            }
            // The first instant of the next window starts a new one.
            assert_eq!(kind.window_start(end), end);
        }
    }

    #[test]
    fn test_window_start_before_epoch() {
        let t = DateTime::from_timestamp(-5, 0).unwrap();
        assert_eq!(WindowKind::TenSeconds.window_start(t).timestamp(), -10);
    }

    #[test]
    fn test_window_kind_names() {
        for kind in WindowKind::ALL {
            assert_eq!(WindowKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(WindowKind::parse("week"), None);
    }

    #[test]
    fn test_seconds_until_rounds_up() {
        let now = at(12, 0, 0, 200);
        assert_eq!(seconds_until(now, at(12, 0, 10, 0)), 10);
        assert_eq!(seconds_until(at(12, 0, 1, 0), at(12, 0, 10, 0)), 9);
        assert_eq!(seconds_until(at(12, 0, 11, 0), at(12, 0, 10, 0)), 0);
    }
}
