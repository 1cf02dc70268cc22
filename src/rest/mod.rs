//! REST plumbing around the rate limiter.

mod client;
mod transport;

pub use client::{RestClient, TooManyRequests};
pub use transport::{HttpTransport, ReqwestTransport, RestRequest, RestResponse, AUDIT_LOG_REASON};
