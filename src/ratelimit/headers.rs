//! Rate limit response headers.
//!
//! Lookups are case-insensitive through [`HeaderMap`]. A missing header is
//! never an error; a present header that does not parse always is.

use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use http::HeaderMap;
use tokio::time::Instant;

use crate::error::{Error, Result};

pub const DATE: &str = "date";
pub const RESET: &str = "x-ratelimit-reset";
pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const REMAINING: &str = "x-ratelimit-remaining";
pub const GLOBAL: &str = "x-ratelimit-global";
/// Standard HTTP back-off header, in seconds. Proxies send it on 429s.
pub const RETRY_AFTER: &str = "retry-after";

/// Headers that can move a bucket's reset time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetHeader {
    /// Seconds from now until the bucket resets
    ResetAfter,
    /// Epoch seconds at which the bucket resets, relative to `Date`
    Reset,
}

impl ResetHeader {
    pub fn name(&self) -> &'static str {
        match self {
            ResetHeader::ResetAfter => RESET_AFTER,
            ResetHeader::Reset => RESET,
        }
    }
}

/// Reset headers in precedence order. The first one present is applied.
pub const RESET_PRECEDENCE: [ResetHeader; 2] = [ResetHeader::ResetAfter, ResetHeader::Reset];

/// Fetch a header as a string, or `None` if absent.
pub fn get<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(Some)
            .map_err(|_| Error::NonAsciiHeader { header: name }),
    }
}

/// The first reset header present in `headers`, with its value.
pub fn first_reset(headers: &HeaderMap) -> Result<Option<(ResetHeader, &str)>> {
    for header in RESET_PRECEDENCE {
        if let Some(value) = get(headers, header.name())? {
            return Ok(Some((header, value)));
        }
    }
    Ok(None)
}

/// Parse a finite seconds value such as `"1.25"`.
pub fn parse_seconds(header: &'static str, value: &str) -> Result<f64> {
    let secs: f64 = value.trim().parse().map_err(|source| Error::InvalidFloat {
        header,
        value: value.to_string(),
        source,
    })?;

    if !secs.is_finite() {
        return Err(Error::NonFiniteFloat {
            header,
            value: value.to_string(),
        });
    }
    Ok(secs)
}

/// Convert a seconds value to a duration, clamping negatives to zero.
///
/// Values too large for a [`Duration`] are reported against `field`.
pub fn seconds_to_duration(field: &'static str, secs: f64) -> Result<Duration> {
    if secs <= 0.0 {
        return Ok(Duration::ZERO);
    }
    Duration::try_from_secs_f64(secs).map_err(|_| Error::OutOfRange {
        field,
        value: secs.to_string(),
    })
}

/// The instant `wait` after `now`, or an error if the clock cannot hold it.
pub fn deadline_after(field: &'static str, now: Instant, wait: Duration) -> Result<Instant> {
    now.checked_add(wait).ok_or_else(|| Error::OutOfRange {
        field,
        value: format!("{}ms", wait.as_millis()),
    })
}

/// Parse a remaining-requests count.
pub fn parse_remaining(value: &str) -> Result<u64> {
    let remaining: i64 = value.trim().parse().map_err(|source| Error::InvalidInteger {
        header: REMAINING,
        value: value.to_string(),
        source,
    })?;
    Ok(remaining.max(0) as u64)
}

/// Parse an HTTP `Date` header (`Mon, 12 Jun 2023 03:33:35 GMT`).
pub fn parse_date(value: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc2822(value.trim()).map_err(|source| Error::InvalidDate {
        value: value.to_string(),
        source,
    })
}

/// Whether the response reports a global rate limit.
pub fn is_global(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}
