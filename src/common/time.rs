//! Venue clock helpers (Korea Standard Time, UTC+9)

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, FixedOffset, Offset, Timelike, Utc, Weekday,
};
use std::time::Duration;

/// Offset of the venue's local time from UTC in seconds
const KST_OFFSET_SECS: i32 = 9 * 3600;

/// Longest single sleep while waiting for a wall-clock instant
const MAX_SLEEP_SLICE: Duration = Duration::from_secs(60);

/// The venue's fixed time zone
pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(KST_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Current time in venue local time
pub fn kst_now() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&kst())
}

/// `base` with its wall-clock time replaced by `hour:minute:00`
pub fn at_time(
    base: DateTime<FixedOffset>,
    hour: u32,
    minute: u32,
) -> Option<DateTime<FixedOffset>> {
    base.with_hour(hour)?
        .with_minute(minute)?
        .with_second(0)?
        .with_nanosecond(0)
}

/// Next occurrence of `hour:minute` strictly after `base`
pub fn next_kst_datetime(
    hour: u32,
    minute: u32,
    base: DateTime<FixedOffset>,
) -> Option<DateTime<FixedOffset>> {
    let candidate = at_time(base, hour, minute)?;
    if candidate <= base {
        Some(candidate + ChronoDuration::days(1))
    } else {
        Some(candidate)
    }
}

/// Time left until `deadline`, zero if already past
pub fn until(deadline: DateTime<FixedOffset>) -> Duration {
    (deadline - kst_now()).to_std().unwrap_or(Duration::ZERO)
}

/// Sleep until the wall clock reaches `deadline`
///
/// Sleeps in bounded slices so clock adjustments are picked up.
pub async fn sleep_until(deadline: DateTime<FixedOffset>) {
    loop {
        let remaining = until(deadline);
        if remaining.is_zero() {
            return;
        }
        tokio::time::sleep(remaining.min(MAX_SLEEP_SLICE)).await;
    }
}

/// Saturday or Sunday
pub fn is_weekend(dt: DateTime<FixedOffset>) -> bool {
    matches!(dt.weekday(), Weekday::Sat | Weekday::Sun)
}
