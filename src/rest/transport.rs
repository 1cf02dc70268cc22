//! HTTP transport abstraction.

use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::config::RestConfig;
use crate::error::{Error, Result};

/// Header carrying the audit log reason for moderation actions.
pub const AUDIT_LOG_REASON: &str = "x-audit-log-reason";

/// One outbound API call.
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<serde_json::Value>,
    /// Audit log reason, sent percent-encoded
    pub reason: Option<String>,
}

impl RestRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            reason: None,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// What came back from the server.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RestResponse {
    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// The body as lossy UTF-8, for error messages.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Trait for anything that can carry a [`RestRequest`] to the API.
///
/// Transport failures are returned as errors; every HTTP status, including
/// 4xx and 5xx, is a successful response at this level.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: RestRequest) -> Result<RestResponse>;
}

/// [`HttpTransport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    authorization: String,
}

impl ReqwestTransport {
    /// Create a transport authenticating as a bot with `token`.
    pub fn new(token: &str, config: &RestConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            authorization: bot_authorization(token),
        })
    }
}

/// `Authorization` value for a bot token, adding the `Bot ` scheme if absent.
fn bot_authorization(token: &str) -> String {
    let token = token.trim();
    if token.starts_with("Bot ") || token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bot {}", token)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: RestRequest) -> Result<RestResponse> {
        trace!(method = %request.method, url = %request.url, "Sending request");

        let mut builder = self
            .client
            .request(request.method, &request.url)
            .header(http::header::AUTHORIZATION, &self.authorization);

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(reason) = &request.reason {
            builder = builder.header(AUDIT_LOG_REASON, urlencoding::encode(reason).into_owned());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        trace!(status = %status, bytes = body.len(), "Received response");
        Ok(RestResponse {
            status,
            headers,
            body,
        })
    }
}
