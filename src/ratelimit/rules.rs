//! Custom rate limit rules and suffix matching.
//!
//! Some endpoints are limited more tightly by the server than their
//! advertised headers suggest. A custom rule overrides the headers for every
//! route key ending in its suffix. Rules are checked in order and the first
//! match wins.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};

/// Route key suffix the resource layer uses for message reaction endpoints.
pub const REACTIONS_SUFFIX: &str = "//reactions//";

/// A fixed quota for route keys ending in `suffix`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomRateLimit {
    /// Tail of the route key this rule applies to
    pub suffix: String,
    /// Requests allowed per window
    pub requests: u64,
    /// Length of the window
    #[serde(rename = "reset_ms", with = "millis")]
    pub reset: Duration,
}

impl CustomRateLimit {
    /// Create a new rule.
    pub fn new(suffix: impl Into<String>, requests: u64, reset: Duration) -> Self {
        Self {
            suffix: suffix.into(),
            requests,
            reset,
        }
    }

    /// Whether this rule governs `key`.
    pub fn matches(&self, key: &str) -> bool {
        key.ends_with(&self.suffix)
    }

    /// Reject rules that could never let a request through.
    pub fn validate(&self) -> Result<()> {
        let reason = if self.suffix.is_empty() {
            "suffix is empty"
        } else if self.requests == 0 {
            "requests must be at least 1"
        } else if self.reset.is_zero() {
            "reset window must be non-zero"
        } else {
            return Ok(());
        };

        Err(Error::InvalidCustomRule {
            suffix: self.suffix.clone(),
            reason: reason.to_string(),
        })
    }
}

/// An ordered table of custom rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomRules {
    #[serde(default)]
    pub rules: Vec<CustomRateLimit>,
}

impl CustomRules {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The rules every limiter starts with.
    pub fn builtin() -> Self {
        Self {
            rules: vec![CustomRateLimit::new(
                REACTIONS_SUFFIX,
                1,
                Duration::from_millis(200),
            )],
        }
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading custom rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string and validate them.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: CustomRules = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse custom rate limits: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Validate every rule in the table.
    pub fn validate(&self) -> Result<()> {
        self.rules.iter().try_for_each(CustomRateLimit::validate)
    }

    /// Append `other`'s rules after this table's rules.
    pub fn then(mut self, other: CustomRules) -> Self {
        self.rules.extend(other.rules);
        self
    }

    /// Find the first rule whose suffix ends `key`.
    pub fn find(&self, key: &str) -> Option<&CustomRateLimit> {
        self.rules.iter().find(|rule| rule.matches(key))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_reaction_rule() {
        let rules = CustomRules::builtin();
        let rule = rules
            .find("channels/1/messages/2/reactions//reactions//")
            .unwrap();

        assert_eq!(rule.requests, 1);
        assert_eq!(rule.reset, Duration::from_millis(200));
    }

    #[test]
    fn test_suffix_must_be_at_end() {
        let rules = CustomRules::builtin();
        assert!(rules.find("channels/1//reactions//extra").is_none());
        assert!(rules.find("guilds/1/messages").is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let rules = CustomRules {
            rules: vec![
                CustomRateLimit::new("/pins", 2, Duration::from_secs(1)),
                CustomRateLimit::new("s", 9, Duration::from_secs(9)),
            ],
        };

        assert_eq!(rules.find("channels/1/pins").unwrap().requests, 2);
        assert_eq!(rules.find("channels/1/messages").unwrap().requests, 9);
    }

    #[test]
    fn test_parse_yaml_rules() {
        let yaml = r#"
rules:
  - suffix: "/pins"
    requests: 5
    reset_ms: 5000
  - suffix: "//reactions//"
    requests: 1
    reset_ms: 250
"#;
        let rules = CustomRules::from_yaml(yaml).unwrap();

        assert_eq!(rules.len(), 2);
        assert_eq!(rules.rules[0].reset, Duration::from_secs(5));
        assert_eq!(
            rules.find("x//reactions//").unwrap().reset,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_yaml_rejects_zero_requests() {
        let yaml = r#"
rules:
  - suffix: "/pins"
    requests: 0
    reset_ms: 5000
"#;
        let err = CustomRules::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, Error::InvalidCustomRule { .. }));
    }

    #[test]
    fn test_yaml_rejects_garbage() {
        let err = CustomRules::from_yaml("rules: 12").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_zero_window() {
        let rule = CustomRateLimit::new("/x", 1, Duration::ZERO);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_then_keeps_order() {
        let user = CustomRules {
            rules: vec![CustomRateLimit::new(
                REACTIONS_SUFFIX,
                3,
                Duration::from_secs(1),
            )],
        };
        let rules = user.then(CustomRules::builtin());

        assert_eq!(rules.len(), 2);
        assert_eq!(rules.find("a//reactions//").unwrap().requests, 3);
    }
}
