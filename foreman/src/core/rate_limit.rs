//! Rate-limit notice detection and reset-time parsing.
//!
//! Agents announce quota exhaustion with a line such as
//! `You've hit your limit · resets 1pm (Asia/Taipei)`. The reset time is a
//! 12-hour wall-clock time in the named IANA zone; it always refers to the next
//! occurrence of that time, so a time already past today rolls to tomorrow.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;

use crate::core::types::RateLimitHit;

static QUOTA_NOTICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:hit your limit|limit reached|usage limit|rate limit|quota exceeded|out of extra usage).*\bresets?\b",
    )
    .expect("valid regex")
});
static RESET_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bresets?\s+(?:at\s+)?(\d{1,2})(?::(\d{2}))?\s*([ap]m)\s*\(([^)\s]+)\)")
        .expect("valid regex")
});

/// Scan one output line for a rate-limit notice.
///
/// Returns `None` if the line is not a notice. A notice whose time or zone cannot
/// be parsed yields a hit with `reset_at: None`.
pub fn detect_rate_limit(line: &str, now: DateTime<Utc>) -> Option<RateLimitHit> {
    if !QUOTA_NOTICE.is_match(line) {
        return None;
    }
    Some(RateLimitHit {
        reset_at: parse_reset_time(line, now),
    })
}

/// Parse the `resets H[:MM]am|pm (Zone/Name)` clause into the next matching instant.
pub fn parse_reset_time(line: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let caps = RESET_CLAUSE.captures(line)?;
    let hour12: u32 = caps[1].parse().ok()?;
    let minute: u32 = match caps.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    if !(1..=12).contains(&hour12) {
        return None;
    }
    let pm = caps[3].eq_ignore_ascii_case("pm");
    let hour24 = match (hour12, pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, false) => h,
        (h, true) => h + 12,
    };
    let time = NaiveTime::from_hms_opt(hour24, minute, 0)?;
    let tz = Tz::from_str(&caps[4]).ok()?;

    let local_now = now.with_timezone(&tz);
    let today = local_now.date_naive().and_time(time);
    let candidate = tz.from_local_datetime(&today).earliest()?;
    if candidate > local_now {
        return Some(candidate.with_timezone(&Utc));
    }
    let tomorrow = today.checked_add_days(Days::new(1))?;
    let next = tz.from_local_datetime(&tomorrow).earliest()?;
    Some(next.with_timezone(&Utc))
}
