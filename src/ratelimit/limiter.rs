//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::bucket::{Bucket, BucketLease, BucketState};
use super::global::GlobalLimit;
use super::rules::CustomRules;
use crate::config::RateLimitingConfig;
use crate::error::Result;

/// Allowance added to reset deltas derived from the `Date` header.
pub const DEFAULT_RESET_SKEW: Duration = Duration::from_millis(250);

/// The rate limiter that owns every route bucket and the global gate.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug)]
pub struct RateLimiter {
    /// Buckets indexed by route key
    buckets: DashMap<String, Arc<Bucket>>,
    /// Deadline shared by every bucket
    global: Arc<GlobalLimit>,
    /// Suffix overrides, first match wins
    rules: CustomRules,
    reset_skew: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter with the built-in custom rules.
    pub fn new() -> Self {
        Self::with_rules(CustomRules::builtin())
    }

    /// Create a rate limiter with exactly `rules`.
    pub fn with_rules(rules: CustomRules) -> Self {
        Self {
            buckets: DashMap::new(),
            global: Arc::new(GlobalLimit::new()),
            rules,
            reset_skew: DEFAULT_RESET_SKEW,
        }
    }

    /// Build a limiter from configuration.
    ///
    /// Rules from the rules file come first, then inline rules, then the
    /// built-in table, so configured suffixes shadow the defaults.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let file_rules = match &config.rules_path {
            Some(path) => CustomRules::from_file(path)?,
            None => CustomRules::new(),
        };
        let inline = CustomRules {
            rules: config.rules.clone(),
        };
        inline.validate()?;

        let rules = file_rules.then(inline).then(CustomRules::builtin());
        debug!(rules = rules.len(), "Custom rate limits loaded");

        Ok(Self::with_rules(rules).with_reset_skew(config.reset_skew()))
    }

    /// Override the allowance added to `X-RateLimit-Reset` deltas.
    pub fn with_reset_skew(mut self, reset_skew: Duration) -> Self {
        self.reset_skew = reset_skew;
        self
    }

    /// Get the bucket for `key`, creating it on first use.
    ///
    /// Concurrent callers with the same key always receive the same bucket.
    pub fn get_bucket(&self, key: &str) -> Arc<Bucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        let entry = self.buckets.entry(key.to_string()).or_insert_with(|| {
            let rule = self.rules.find(key).cloned();
            debug!(
                key = %key,
                custom = rule.as_ref().map(|r| r.suffix.as_str()),
                "Creating new rate limit bucket"
            );
            Arc::new(Bucket::new(
                key.to_string(),
                rule,
                Arc::clone(&self.global),
                self.reset_skew,
            ))
        });
        Arc::clone(entry.value())
    }

    /// How long to wait before `state` can be expected to allow
    /// `min_remaining` more requests.
    ///
    /// The bucket's own reset only matters when it is short on quota; the
    /// global deadline always applies. The longer of the two waits wins.
    pub fn wait_time(&self, state: &BucketState, min_remaining: u64) -> Duration {
        self.wait_time_at(state, min_remaining, Instant::now())
    }

    fn wait_time_at(&self, state: &BucketState, min_remaining: u64, now: Instant) -> Duration {
        let bucket_wait = match state.reset {
            Some(reset) if state.remaining < min_remaining => reset.saturating_duration_since(now),
            _ => Duration::ZERO,
        };
        bucket_wait.max(self.global.wait_time_at(now))
    }

    /// Lock the bucket for `key`, waiting out any rate limit.
    pub async fn lock_bucket(&self, key: &str) -> BucketLease {
        self.lock_bucket_object(self.get_bucket(key)).await
    }

    /// Lock `bucket`, waiting out any rate limit, and take one request from
    /// its quota.
    ///
    /// Blocks behind any other lease on the same bucket. Dropping the
    /// returned future cancels the wait.
    pub async fn lock_bucket_object(&self, bucket: Arc<Bucket>) -> BucketLease {
        let mut lease = bucket.lock().await;

        let wait = self.wait_time(lease.state(), 1);
        if !wait.is_zero() {
            debug!(
                key = %lease.key(),
                wait_ms = wait.as_millis() as u64,
                "Waiting for rate limit"
            );
            tokio::time::sleep(wait).await;
        }

        let state = lease.state_mut();
        state.remaining = state.remaining.saturating_sub(1);
        trace!(key = %lease.key(), remaining = lease.state().remaining, "Bucket locked");
        lease
    }

    /// The global gate shared by every bucket.
    pub fn global(&self) -> &Arc<GlobalLimit> {
        &self.global
    }

    /// The custom rule table.
    pub fn rules(&self) -> &CustomRules {
        &self.rules
    }

    /// Get the number of buckets created so far.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Forget every bucket.
    ///
    /// Outstanding leases keep their bucket alive but it is no longer
    /// reachable by key.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
