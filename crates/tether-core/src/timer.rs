//! anchored countdown arithmetic
//!
//! Remaining time is always derived from the shared `started_at` anchor, never
//! from a locally decremented counter.

use chrono::{DateTime, Utc};

/// Seconds left in a session that started at `started_at`.
///
/// `max(0, duration*60 - (now - started_at))`, rounded up to whole seconds.
/// An anchor in the future (clock skew between devices) is clamped to the full
/// duration.
pub fn remaining_secs(now: DateTime<Utc>, started_at: DateTime<Utc>, duration_minutes: u32) -> u64 {
    let total_ms = i64::from(duration_minutes) * 60_000;
    let elapsed_ms = (now - started_at).num_milliseconds().max(0);
    let remaining_ms = (total_ms - elapsed_ms).max(0);
    // round up so "0" is only shown once the duration has fully elapsed
    ((remaining_ms + 999) / 1000) as u64
}

/// `MM:SS` display form
pub fn format_remaining(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_full_duration_at_start() {
        assert_eq!(remaining_secs(t0(), t0(), 15), 900);
    }

    #[test]
    fn test_rounds_up_partial_seconds() {
        let now = t0() + Duration::milliseconds(1_500);
        assert_eq!(remaining_secs(now, t0(), 1), 59);

        let now = t0() + Duration::milliseconds(59_001);
        assert_eq!(remaining_secs(now, t0(), 1), 1);
    }

    #[test]
    fn test_exhausted_is_zero() {
        let now = t0() + Duration::minutes(15);
        assert_eq!(remaining_secs(now, t0(), 15), 0);

        let later = t0() + Duration::hours(3);
        assert_eq!(remaining_secs(later, t0(), 15), 0);
    }

    #[test]
    fn test_future_anchor_clamped() {
        let now = t0() - Duration::seconds(30);
        assert_eq!(remaining_secs(now, t0(), 5), 300);
    }

    #[test]
    fn test_pure_function_of_inputs() {
        let now = t0() + Duration::seconds(437);
        let a = remaining_secs(now, t0(), 10);
        let b = remaining_secs(now, t0(), 10);
        assert_eq!(a, b);
        assert_eq!(a, 163);
    }

    #[test]
    fn test_format() {
        assert_eq!(format_remaining(900), "15:00");
        assert_eq!(format_remaining(61), "01:01");
        assert_eq!(format_remaining(0), "00:00");
    }
}
