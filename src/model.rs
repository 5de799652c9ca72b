//! Records shared between the registry and the routing core.
//!
//! The registry owns these records; the core reads them and only ever
//! touches the usage counters on [`Rule`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::ApiKey;

/// Timeout applied to a rule that does not configure one.
pub const DEFAULT_RULE_TIMEOUT_MS: u64 = 300_000;

/// Milliseconds in one hour, the unit of [`Rule::reset_interval`].
pub const MS_PER_HOUR: i64 = 3_600_000;

/// The client protocols a route can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetType {
    ClaudeCode,
    Codex,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::ClaudeCode => "claude-code",
            TargetType::Codex => "codex",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of request intent used to pick the applicable rule subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    Default,
    Background,
    Thinking,
    LongContext,
    ImageUnderstanding,
    ModelMapping,
}

impl ContentType {
    pub const ALL: [ContentType; 6] = [
        ContentType::Default,
        ContentType::Background,
        ContentType::Thinking,
        ContentType::LongContext,
        ContentType::ImageUnderstanding,
        ContentType::ModelMapping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Default => "default",
            ContentType::Background => "background",
            ContentType::Thinking => "thinking",
            ContentType::LongContext => "long-context",
            ContentType::ImageUnderstanding => "image-understanding",
            ContentType::ModelMapping => "model-mapping",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentType::ALL
            .iter()
            .find(|ct| ct.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown content type '{}'", s))
    }
}

/// A vendor grouping one or more API services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vendor {
    pub id: String,
    pub name: String,
}

/// A named configuration scoping which rules apply to a client protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub name: String,
    pub target_type: TargetType,
    #[serde(default)]
    pub is_active: bool,
}

/// An upstream endpoint of a vendor.
#[derive(Debug, Clone, Serialize)]
pub struct ApiService {
    pub id: String,
    pub vendor_id: String,
    /// Upstream wire flavour, e.g. "claude" or "openai".
    pub source_type: String,
    pub api_url: String,
    pub api_key: Option<ApiKey>,
    /// Allow-list of models; empty means any model.
    pub supported_models: Vec<String>,
}

impl ApiService {
    pub fn supports(&self, model: &str) -> bool {
        self.supported_models.is_empty() || self.supported_models.iter().any(|m| m == model)
    }
}

/// A prioritized binding from a content type to a target service/model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub route_id: String,
    pub content_type: ContentType,
    pub target_service_id: String,
    /// Empty or absent means the caller's model passes through.
    #[serde(default)]
    pub target_model: Option<String>,
    /// Caller model matched by model-mapping rules.
    #[serde(default)]
    pub replaced_model: Option<String>,
    /// Higher sorts first.
    #[serde(default)]
    pub sort_order: i64,
    /// Per-attempt timeout in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub token_limit: Option<u64>,
    /// Budget reset interval in hours.
    #[serde(default)]
    pub reset_interval: Option<u32>,
    #[serde(default)]
    pub total_tokens_used: u64,
    #[serde(default)]
    pub total_requests_used: u64,
    /// Epoch ms; zero until the registry stamps it on load.
    #[serde(default)]
    pub last_reset_at: i64,
    /// Epoch ms, the tie-break key among equal sort orders.
    #[serde(default)]
    pub created_at: i64,
}

impl Rule {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout.unwrap_or(DEFAULT_RULE_TIMEOUT_MS))
    }

    /// The configured target model, treating an empty string as unset.
    pub fn target_model(&self) -> Option<&str> {
        self.target_model.as_deref().filter(|m| !m.is_empty())
    }

    pub fn reset_interval_ms(&self) -> Option<i64> {
        self.reset_interval
            .filter(|hours| *hours > 0)
            .map(|hours| hours as i64 * MS_PER_HOUR)
    }

    /// When the next interval reset is due, if the rule has an interval.
    pub fn next_reset_at(&self, last_reset_at: i64) -> Option<i64> {
        self.reset_interval_ms()
            .map(|interval| last_reset_at + interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_round_trips_through_str() {
        for ct in ContentType::ALL {
            assert_eq!(ct.as_str().parse::<ContentType>().unwrap(), ct);
        }
        assert!("unknown".parse::<ContentType>().is_err());
    }

    #[test]
    fn test_content_type_serde_is_kebab_case() {
        let json = serde_json::to_string(&ContentType::ImageUnderstanding).unwrap();
        assert_eq!(json, "\"image-understanding\"");
        let ct: ContentType = serde_json::from_str("\"long-context\"").unwrap();
        assert_eq!(ct, ContentType::LongContext);
    }

    #[test]
    fn test_rule_timeout_defaults() {
        let rule: Rule = serde_json::from_value(serde_json::json!({
            "id": "r1",
            "route_id": "route",
            "content_type": "default",
            "target_service_id": "svc"
        }))
        .unwrap();
        assert_eq!(rule.timeout(), Duration::from_millis(300_000));
        assert_eq!(rule.target_model(), None);
        assert_eq!(rule.reset_interval_ms(), None);
    }

    #[test]
    fn test_empty_target_model_is_pass_through() {
        let rule: Rule = serde_json::from_value(serde_json::json!({
            "id": "r1",
            "route_id": "route",
            "content_type": "default",
            "target_service_id": "svc",
            "target_model": "",
            "reset_interval": 24
        }))
        .unwrap();
        assert_eq!(rule.target_model(), None);
        assert_eq!(rule.next_reset_at(1_000), Some(1_000 + 24 * MS_PER_HOUR));
    }

    #[test]
    fn test_service_allow_list() {
        let service = ApiService {
            id: "svc".to_string(),
            vendor_id: "v".to_string(),
            source_type: "claude".to_string(),
            api_url: "https://example.com".to_string(),
            api_key: None,
            supported_models: vec!["claude-sonnet-4".to_string()],
        };
        assert!(service.supports("claude-sonnet-4"));
        assert!(!service.supports("gpt-4o"));
    }
}
