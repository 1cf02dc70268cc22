//! Configuration management for ratecord.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ratelimit::CustomRateLimit;

/// Prefix for environment variable overrides, e.g. `RATECORD__REST__MAX_RETRIES`.
pub const ENV_PREFIX: &str = "RATECORD";

/// Main configuration for a ratecord client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// REST transport configuration
    #[serde(default)]
    pub rest: RestConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// REST transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// Base URL every route is appended to
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// User-Agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Retries after a 429 or 502 before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            user_agent: default_user_agent(),
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl RestConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_user_agent() -> String {
    format!(
        "DiscordBot (https://github.com/ratecord/ratecord, {})",
        env!("CARGO_PKG_VERSION")
    )
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    20
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a YAML file of custom rate limit rules
    pub rules_path: Option<String>,

    /// Custom rules given inline, checked after the rules file
    #[serde(default)]
    pub rules: Vec<CustomRateLimit>,

    /// Milliseconds added to reset times derived from `X-RateLimit-Reset`
    #[serde(default = "default_reset_skew")]
    pub reset_skew_ms: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            rules: Vec::new(),
            reset_skew_ms: default_reset_skew(),
        }
    }
}

impl RateLimitingConfig {
    pub fn reset_skew(&self) -> Duration {
        Duration::from_millis(self.reset_skew_ms)
    }
}

fn default_reset_skew() -> u64 {
    250
}

impl ClientConfig {
    /// Load configuration from an optional file plus `RATECORD__*`
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))
    }
}
