//! Per-route rate limit buckets.

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::global::GlobalLimit;
use super::headers::{self, ResetHeader};
use super::rules::CustomRateLimit;
use crate::error::{Error, Result};

/// Where a bucket is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketPhase {
    /// No response has updated the bucket yet
    Fresh,
    /// Quota is available, or the last reset has passed
    Active,
    /// Quota is spent until `reset`
    Exhausted,
}

/// Mutable rate limit state for one route.
///
/// Only ever touched while the bucket's lock is held.
#[derive(Debug, Clone)]
pub struct BucketState {
    /// Calls permitted before the next reset
    pub remaining: u64,
    /// When `remaining` is expected to refill
    pub reset: Option<Instant>,
    /// When a custom rule last refilled the bucket
    pub last_reset: Option<Instant>,
}

impl BucketState {
    fn new(remaining: u64) -> Self {
        Self {
            remaining,
            reset: None,
            last_reset: None,
        }
    }

    /// Classify the state as seen at `now`.
    pub fn phase(&self, now: Instant) -> BucketPhase {
        match (self.reset, self.last_reset) {
            (None, None) => BucketPhase::Fresh,
            (Some(reset), _) if self.remaining == 0 && reset > now => BucketPhase::Exhausted,
            _ => BucketPhase::Active,
        }
    }
}

/// Rate limit tracking for a single route key.
#[derive(Debug)]
pub struct Bucket {
    key: String,
    rule: Option<CustomRateLimit>,
    global: Arc<GlobalLimit>,
    reset_skew: Duration,
    state: Arc<Mutex<BucketState>>,
}

impl Bucket {
    /// Create a bucket. A custom rule seeds the quota with its request count;
    /// otherwise a single request is allowed until the server reports back.
    pub(crate) fn new(
        key: String,
        rule: Option<CustomRateLimit>,
        global: Arc<GlobalLimit>,
        reset_skew: Duration,
    ) -> Self {
        let remaining = rule.as_ref().map_or(1, |rule| rule.requests);
        Self {
            key,
            rule,
            global,
            reset_skew,
            state: Arc::new(Mutex::new(BucketState::new(remaining))),
        }
    }

    /// The route key this bucket governs.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The custom rule overriding server headers, if any.
    pub fn custom_rule(&self) -> Option<&CustomRateLimit> {
        self.rule.as_ref()
    }

    /// Copy of the current state, or `None` while a lease is held.
    pub fn try_snapshot(&self) -> Option<BucketState> {
        self.state.try_lock().ok().map(|state| state.clone())
    }

    /// Wait for the bucket's lock and wrap it in a lease.
    pub(crate) async fn lock(self: Arc<Self>) -> BucketLease {
        let state = Arc::clone(&self.state).lock_owned().await;
        BucketLease {
            bucket: self,
            state,
        }
    }
}

/// Exclusive access to a bucket for one in-flight request.
///
/// Obtained from [`RateLimiter::lock_bucket`](super::RateLimiter::lock_bucket).
/// Call [`release`](Self::release) with the response headers once the
/// request completes. Dropping the lease unlocks the bucket without
/// applying any update.
#[derive(Debug)]
pub struct BucketLease {
    bucket: Arc<Bucket>,
    state: OwnedMutexGuard<BucketState>,
}

impl BucketLease {
    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        self.bucket.key()
    }

    pub fn state(&self) -> &BucketState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut BucketState {
        &mut self.state
    }

    /// Apply a response to the bucket and unlock it.
    ///
    /// A bucket with a custom rule ignores the headers. `None` means there is
    /// nothing to apply. Errors from malformed headers are returned after the
    /// lock has been released.
    pub fn release(mut self, headers: Option<&HeaderMap>) -> Result<()> {
        if let Some(rule) = self.bucket.rule.clone() {
            return self.check_custom_limit(&rule);
        }

        let Some(headers) = headers else {
            trace!(key = %self.key(), "Released bucket without headers");
            return Ok(());
        };

        match headers::first_reset(headers)? {
            Some((ResetHeader::ResetAfter, value)) => {
                let global = headers::get(headers, headers::GLOBAL)?;
                self.check_reset_after(value, global)?;
            }
            Some((ResetHeader::Reset, value)) => {
                let date = headers::get(headers, headers::DATE)?.unwrap_or_default();
                self.check_reset(date, value)?;
            }
            None => {}
        }

        if let Some(value) = headers::get(headers, headers::REMAINING)? {
            self.state.remaining = headers::parse_remaining(value)?;
        }

        trace!(
            key = %self.key(),
            remaining = self.state.remaining,
            "Released bucket"
        );
        Ok(())
    }

    /// Enforce a custom rule in place of the server's headers.
    ///
    /// Refills the bucket once the rule's window has passed since the last
    /// refill, then schedules a reset if the quota is spent.
    pub fn check_custom_limit(&mut self, rule: &CustomRateLimit) -> Result<()> {
        rule.validate()?;

        let now = Instant::now();
        let window_end = headers::deadline_after("reset_ms", now, rule.reset)?;
        let window_elapsed = self
            .state
            .last_reset
            .map_or(true, |last| now.saturating_duration_since(last) >= rule.reset);

        if window_elapsed {
            // The request being released used one unit of the new window.
            self.state.remaining = rule.requests - 1;
            self.state.last_reset = Some(now);
        }

        if self.state.remaining == 0 {
            self.state.reset = Some(window_end);
            debug!(
                key = %self.key(),
                suffix = %rule.suffix,
                window_ms = rule.reset.as_millis() as u64,
                "Custom rate limit exhausted"
            );
        }
        Ok(())
    }

    /// Set the reset time from an absolute epoch-seconds value.
    ///
    /// The server's `Date` header is the clock reference, so local clock skew
    /// does not shift the result. The bucket's reset skew is added on top of
    /// the difference. Nothing is changed unless both values parse.
    pub fn check_reset(&mut self, date: &str, reset: &str) -> Result<()> {
        let server_now = headers::parse_date(date)?;
        let reset_at = headers::parse_seconds(headers::RESET, reset)?;

        let server_now = server_now.timestamp_millis() as f64 / 1000.0;
        let delta = headers::seconds_to_duration(headers::RESET, reset_at - server_now)?
            .checked_add(self.bucket.reset_skew)
            .ok_or_else(|| Error::OutOfRange {
                field: headers::RESET,
                value: reset.to_string(),
            })?;
        self.state.reset = Some(headers::deadline_after(headers::RESET, Instant::now(), delta)?);

        trace!(
            key = %self.key(),
            delta_ms = delta.as_millis() as u64,
            "Bucket reset from absolute time"
        );
        Ok(())
    }

    /// Set the reset time from a relative seconds value.
    ///
    /// When the response was globally limited, the shared global deadline is
    /// pushed out as well.
    pub fn check_reset_after(&mut self, reset_after: &str, global: Option<&str>) -> Result<()> {
        let after = headers::parse_seconds(headers::RESET_AFTER, reset_after)?;
        let wait = headers::seconds_to_duration(headers::RESET_AFTER, after)?;
        let deadline = headers::deadline_after(headers::RESET_AFTER, Instant::now(), wait)?;

        self.state.reset = Some(deadline);
        if headers::is_global(global) {
            debug!(
                key = %self.key(),
                reset_after = after,
                "Global rate limit reported"
            );
            self.bucket.global.extend_to(deadline);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn bucket(rule: Option<CustomRateLimit>) -> Arc<Bucket> {
        skewed_bucket(rule, Duration::ZERO)
    }

    fn skewed_bucket(rule: Option<CustomRateLimit>, skew: Duration) -> Arc<Bucket> {
        Arc::new(Bucket::new(
            "channels/1/messages".to_string(),
            rule,
            Arc::new(GlobalLimit::new()),
            skew,
        ))
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_bucket_is_fresh() {
        let bucket = bucket(None);
        let state = bucket.try_snapshot().unwrap();

        assert_eq!(state.remaining, 1);
        assert_eq!(state.phase(Instant::now()), BucketPhase::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_bucket_seeds_quota() {
        let bucket = bucket(Some(CustomRateLimit::new("s", 5, Duration::from_secs(1))));
        assert_eq!(bucket.try_snapshot().unwrap().remaining, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_sets_remaining() {
        let bucket = bucket(None);
        let lease = Arc::clone(&bucket).lock().await;

        lease
            .release(Some(&headers(&[(headers::REMAINING, "4")])))
            .unwrap();
        assert_eq!(bucket.try_snapshot().unwrap().remaining, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_bad_remaining_still_unlocks() {
        let bucket = bucket(None);
        let lease = Arc::clone(&bucket).lock().await;

        let err = lease
            .release(Some(&headers(&[(headers::REMAINING, "Potato")])))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInteger { .. }));
        assert!(bucket.try_snapshot().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_without_headers_keeps_state() {
        let bucket = bucket(None);
        let before = bucket.try_snapshot().unwrap();

        let lease = Arc::clone(&bucket).lock().await;
        lease.release(None).unwrap();

        let after = bucket.try_snapshot().unwrap();
        assert_eq!(after.remaining, before.remaining);
        assert_eq!(after.reset, before.reset);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_reset_with_date() {
        let bucket = bucket(None);
        let mut lease = Arc::clone(&bucket).lock().await;

        lease
            .check_reset("Mon, 12 Jun 2023 03:33:35 GMT", "25")
            .unwrap();

        // A reset long before the server's clock has already passed.
        let reset = lease.state().reset.unwrap();
        assert_eq!(reset, Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_reset_uses_server_clock() {
        let bucket = skewed_bucket(None, Duration::from_millis(250));
        let mut lease = Arc::clone(&bucket).lock().await;
        let now = Instant::now();

        // Server says it is 03:33:35 and the bucket resets 2.5s later.
        lease
            .check_reset("Mon, 12 Jun 2023 03:33:35 GMT", "1686540817.5")
            .unwrap();

        assert_eq!(lease.state().reset.unwrap(), now + Duration::from_millis(2750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_reset_bad_date_leaves_state() {
        let bucket = bucket(None);
        let mut lease = Arc::clone(&bucket).lock().await;

        let err = lease.check_reset("", "25").unwrap_err();
        assert!(matches!(err, Error::InvalidDate { .. }));
        assert!(lease.state().reset.is_none());

        let err = lease
            .check_reset("Mon, 12 Jun 2023 03:33:35 GMT", "later")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFloat { .. }));
        assert!(lease.state().reset.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_reset_after_local() {
        let bucket = bucket(None);
        let mut lease = Arc::clone(&bucket).lock().await;
        let now = Instant::now();

        lease.check_reset_after("1.5", None).unwrap();

        assert_eq!(lease.state().reset.unwrap(), now + Duration::from_millis(1500));
        assert!(bucket.global.until().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_reset_after_global() {
        let bucket = bucket(None);
        let mut lease = Arc::clone(&bucket).lock().await;
        let now = Instant::now();

        lease.check_reset_after("3", Some("true")).unwrap();

        assert_eq!(bucket.global.wait_time_at(now), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_reset_after_rejects_garbage() {
        let bucket = bucket(None);
        let mut lease = Arc::clone(&bucket).lock().await;

        assert!(lease.check_reset_after("Potato", Some("true")).is_err());
        assert!(lease.state().reset.is_none());
        assert!(bucket.global.until().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_huge_reset_after_is_error() {
        let bucket = bucket(None);
        let lease = Arc::clone(&bucket).lock().await;

        let err = lease
            .release(Some(&headers(&[
                (headers::RESET_AFTER, "1e300"),
                (headers::GLOBAL, "true"),
            ])))
            .unwrap_err();

        assert!(matches!(err, Error::OutOfRange { field: headers::RESET_AFTER, .. }));
        let state = bucket.try_snapshot().unwrap();
        assert!(state.reset.is_none());
        assert!(bucket.global.until().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_reset_far_future_is_error() {
        let bucket = skewed_bucket(None, Duration::from_millis(250));
        let mut lease = Arc::clone(&bucket).lock().await;

        let err = lease
            .check_reset("Mon, 12 Jun 2023 03:33:35 GMT", "1e300")
            .unwrap_err();
        assert!(matches!(err, Error::OutOfRange { field: headers::RESET, .. }));
        assert!(lease.state().reset.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_prefers_reset_after() {
        let bucket = bucket(None);
        let lease = Arc::clone(&bucket).lock().await;
        let now = Instant::now();

        lease
            .release(Some(&headers(&[
                (headers::RESET_AFTER, "2"),
                (headers::RESET, "not-a-number"),
                (headers::REMAINING, "0"),
            ])))
            .unwrap();

        let state = bucket.try_snapshot().unwrap();
        assert_eq!(state.reset.unwrap(), now + Duration::from_secs(2));
        assert_eq!(state.phase(now), BucketPhase::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_reset_without_date_fails() {
        let bucket = bucket(None);
        let lease = Arc::clone(&bucket).lock().await;

        let err = lease
            .release(Some(&headers(&[(headers::RESET, "1686540817.5")])))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDate { .. }));
        assert!(bucket.try_snapshot().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_limit_ignores_headers() {
        let rule = CustomRateLimit::new("s", 1, Duration::from_millis(200));
        let bucket = bucket(Some(rule));
        let lease = Arc::clone(&bucket).lock().await;
        let now = Instant::now();

        lease
            .release(Some(&headers(&[(headers::REMAINING, "10")])))
            .unwrap();

        let state = bucket.try_snapshot().unwrap();
        assert_eq!(state.remaining, 0);
        assert_eq!(state.reset.unwrap(), now + Duration::from_millis(200));
        assert_eq!(state.last_reset.unwrap(), now);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_limit_refills_after_window() {
        let rule = CustomRateLimit::new("s", 3, Duration::from_millis(100));
        let bucket = bucket(Some(rule.clone()));

        let mut lease = Arc::clone(&bucket).lock().await;
        lease.check_custom_limit(&rule).unwrap();
        assert_eq!(lease.state().remaining, 2);

        lease.state_mut().remaining = 0;
        tokio::time::advance(Duration::from_millis(50)).await;
        lease.check_custom_limit(&rule).unwrap();
        assert_eq!(lease.state().remaining, 0);

        tokio::time::advance(Duration::from_millis(60)).await;
        lease.check_custom_limit(&rule).unwrap();
        assert_eq!(lease.state().remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_limit_rejects_malformed_rule() {
        let bucket = bucket(None);
        let mut lease = Arc::clone(&bucket).lock().await;

        let rule = CustomRateLimit::new("s", 0, Duration::from_millis(100));
        let err = lease.check_custom_limit(&rule).unwrap_err();
        assert!(matches!(err, Error::InvalidCustomRule { .. }));
        assert_eq!(lease.state().remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_transitions() {
        let mut state = BucketState::new(1);
        let now = Instant::now();
        assert_eq!(state.phase(now), BucketPhase::Fresh);

        state.remaining = 0;
        state.reset = Some(now + Duration::from_secs(1));
        assert_eq!(state.phase(now), BucketPhase::Exhausted);

        assert_eq!(
            state.phase(now + Duration::from_secs(2)),
            BucketPhase::Active
        );
    }
}
