//! Route bucket rate limiting driven by response headers.

mod bucket;
mod global;
pub mod headers;
mod limiter;
mod rules;

pub use bucket::{Bucket, BucketLease, BucketPhase, BucketState};
pub use global::GlobalLimit;
pub use limiter::{RateLimiter, DEFAULT_RESET_SKEW};
pub use rules::{CustomRateLimit, CustomRules, REACTIONS_SUFFIX};
