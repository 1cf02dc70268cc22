//! Rate limited REST client.

use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::transport::{HttpTransport, RestRequest, RestResponse};
use crate::config::RestConfig;
use crate::error::{Error, Result};
use crate::ratelimit::{headers, RateLimiter};

/// Body of a `429 Too Many Requests` response.
#[derive(Debug, Clone, Deserialize)]
pub struct TooManyRequests {
    #[serde(default)]
    pub message: String,
    /// Seconds to wait before retrying
    pub retry_after: f64,
    #[serde(default)]
    pub global: bool,
}

impl TooManyRequests {
    /// Decode a 429 response.
    ///
    /// A body that is not Discord's JSON (an HTML page from a proxy, say)
    /// falls back to `X-RateLimit-Reset-After`, then `Retry-After`. Without
    /// either header the decode error is returned.
    pub fn from_response(response: &RestResponse) -> Result<Self> {
        let err = match response.json::<Self>() {
            Ok(body) => return Ok(body),
            Err(e) => e,
        };

        let map = &response.headers;
        let header = match headers::get(map, headers::RESET_AFTER)? {
            Some(value) => Some((headers::RESET_AFTER, value)),
            None => headers::get(map, headers::RETRY_AFTER)?.map(|value| (headers::RETRY_AFTER, value)),
        };
        let Some((name, value)) = header else {
            return Err(err);
        };

        debug!(header = name, error = %err, "429 body did not decode, using header");
        Ok(Self {
            message: String::new(),
            retry_after: headers::parse_seconds(name, value)?,
            global: headers::is_global(headers::get(map, headers::GLOBAL)?),
        })
    }
}

/// Sends requests through a [`HttpTransport`], holding the route's bucket
/// for the duration of each call.
pub struct RestClient<T: HttpTransport> {
    transport: Arc<T>,
    limiter: Arc<RateLimiter>,
    config: RestConfig,
}

impl<T: HttpTransport> RestClient<T> {
    /// Create a new client.
    pub fn new(transport: Arc<T>, limiter: Arc<RateLimiter>, config: RestConfig) -> Self {
        Self {
            transport,
            limiter,
            config,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Full URL for an API path such as `channels/1/messages`.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.api_base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Send a request on `bucket_key`, retrying 429 and 502 responses.
    ///
    /// Returns the first 2xx response. Any other status is an error.
    #[instrument(skip_all, fields(method = %method, path = %path, bucket = %bucket_key))]
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        bucket_key: &str,
        body: Option<serde_json::Value>,
        reason: Option<String>,
    ) -> Result<RestResponse> {
        let request = RestRequest {
            method,
            url: self.url(path),
            body,
            reason,
        };
        let bucket = self.limiter.get_bucket(bucket_key);

        let mut attempt = 0;
        loop {
            let lease = self.limiter.lock_bucket_object(Arc::clone(&bucket)).await;

            let response = match self.transport.execute(request.clone()).await {
                Ok(response) => response,
                Err(e) => {
                    // No headers to learn from; unlock and leave state as is.
                    drop(lease);
                    return Err(e);
                }
            };
            lease.release(Some(&response.headers))?;

            match response.status {
                status if status.is_success() => return Ok(response),
                StatusCode::TOO_MANY_REQUESTS | StatusCode::BAD_GATEWAY
                    if attempt >= self.config.max_retries =>
                {
                    warn!(
                        bucket = %bucket_key,
                        attempts = attempt + 1,
                        "Giving up after repeated rate limits"
                    );
                    return Err(Error::TooManyRetries {
                        route: bucket_key.to_string(),
                        attempts: attempt + 1,
                    });
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    let wait = self.handle_too_many_requests(bucket_key, &response)?;
                    tokio::time::sleep(wait).await;
                }
                StatusCode::BAD_GATEWAY => {
                    debug!(bucket = %bucket_key, "Bad gateway, retrying");
                }
                status => {
                    return Err(Error::UnsuccessfulResponse {
                        status,
                        body: response.text(),
                    });
                }
            }
            attempt += 1;
        }
    }

    /// Send a request and decode the JSON response body.
    pub async fn request_json<R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        bucket_key: &str,
        body: Option<serde_json::Value>,
    ) -> Result<R> {
        self.request(method, path, bucket_key, body, None)
            .await?
            .json()
    }

    /// Work out how long a 429 asks us to back off, pushing the global gate
    /// out when the limit was global.
    fn handle_too_many_requests(&self, bucket_key: &str, response: &RestResponse) -> Result<Duration> {
        let body = TooManyRequests::from_response(response)?;
        let wait = headers::seconds_to_duration("retry_after", body.retry_after)?;

        warn!(
            bucket = %bucket_key,
            retry_after = body.retry_after,
            global = body.global,
            message = %body.message,
            "Rate limited"
        );
        if body.global {
            let deadline = headers::deadline_after("retry_after", Instant::now(), wait)?;
            self.limiter.global().extend_to(deadline);
        }
        Ok(wait)
    }
}
