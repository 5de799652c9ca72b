//! Content-type classification of inbound requests.
//!
//! Picks the rule subset a request should be routed through, based on
//! cheap structural traits of the request body. A content type without any
//! rules on the route falls back to [`ContentType::Default`].

use regex::Regex;
use serde_json::Value;

use crate::config::{ClassifierConfig, ConfigError};
use crate::model::{ContentType, Rule};

/// Structural traits of a request relevant to classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestTraits {
    pub model: String,
    pub thinking: bool,
    pub has_images: bool,
    /// Rough token count (characters / 4).
    pub estimated_tokens: u64,
}

impl RequestTraits {
    /// Extract traits from a Claude Messages or OpenAI-style request body.
    pub fn from_body(body: &Value) -> Self {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let thinking = body
            .get("thinking")
            .and_then(|t| t.get("type"))
            .and_then(Value::as_str)
            .is_some_and(|t| t == "enabled")
            || body.get("reasoning").is_some_and(|r| !r.is_null())
            || body.get("reasoning_effort").is_some_and(|r| !r.is_null());

        let mut chars = 0u64;
        let mut has_images = false;
        for key in ["system", "messages", "input", "instructions"] {
            if let Some(section) = body.get(key) {
                walk(section, &mut chars, &mut has_images);
            }
        }

        Self {
            model,
            thinking,
            has_images,
            estimated_tokens: chars / 4,
        }
    }
}

fn walk(value: &Value, chars: &mut u64, has_images: &mut bool) {
    match value {
        Value::String(s) => *chars += s.chars().count() as u64,
        Value::Array(items) => items.iter().for_each(|v| walk(v, chars, has_images)),
        Value::Object(map) => {
            if let Some(kind) = map.get("type").and_then(Value::as_str) {
                if matches!(kind, "image" | "image_url" | "input_image") {
                    *has_images = true;
                    // Base64 payloads would dominate the estimate.
                    return;
                }
            }
            map.values().for_each(|v| walk(v, chars, has_images));
        }
        _ => {}
    }
}

/// Maps request traits to a content type.
#[derive(Debug, Clone)]
pub struct ContentClassifier {
    background_model: Regex,
    long_context_threshold: u64,
}

impl ContentClassifier {
    pub fn new(background_pattern: &str, long_context_threshold: u64) -> Result<Self, ConfigError> {
        let background_model = Regex::new(background_pattern).map_err(|e| {
            ConfigError::Validation(format!("Invalid background_model_pattern: {}", e))
        })?;
        Ok(Self {
            background_model,
            long_context_threshold,
        })
    }

    pub fn from_config(config: &ClassifierConfig) -> Result<Self, ConfigError> {
        Self::new(
            &config.background_model_pattern,
            config.long_context_threshold,
        )
    }

    /// Classify a request against the rules of its route.
    ///
    /// Precedence: model-mapping, image-understanding, long-context,
    /// thinking, background, default. A type is only chosen when the route
    /// has at least one rule for it.
    pub fn classify(&self, traits: &RequestTraits, route_rules: &[Rule]) -> ContentType {
        let has_rules = |ct: ContentType| route_rules.iter().any(|r| r.content_type == ct);

        let mapped = route_rules.iter().any(|r| {
            r.content_type == ContentType::ModelMapping
                && r.replaced_model.as_deref() == Some(traits.model.as_str())
        });

        let content_type = if mapped {
            ContentType::ModelMapping
        } else if traits.has_images && has_rules(ContentType::ImageUnderstanding) {
            ContentType::ImageUnderstanding
        } else if traits.estimated_tokens > self.long_context_threshold
            && has_rules(ContentType::LongContext)
        {
            ContentType::LongContext
        } else if traits.thinking && has_rules(ContentType::Thinking) {
            ContentType::Thinking
        } else if self.background_model.is_match(&traits.model)
            && has_rules(ContentType::Background)
        {
            ContentType::Background
        } else {
            ContentType::Default
        };

        tracing::debug!(
            model = %traits.model,
            estimated_tokens = traits.estimated_tokens,
            content_type = %content_type,
            "Classified request"
        );
        content_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(id: &str, ct: ContentType) -> Rule {
        Rule {
            id: id.to_string(),
            route_id: "route".to_string(),
            content_type: ct,
            target_service_id: "svc".to_string(),
            target_model: None,
            replaced_model: None,
            sort_order: 0,
            timeout: None,
            token_limit: None,
            reset_interval: None,
            total_tokens_used: 0,
            total_requests_used: 0,
            last_reset_at: 0,
            created_at: 0,
        }
    }

    fn all_rules() -> Vec<Rule> {
        let mut mapping = rule("map", ContentType::ModelMapping);
        mapping.replaced_model = Some("claude-opus-4".to_string());
        vec![
            rule("d", ContentType::Default),
            rule("b", ContentType::Background),
            rule("t", ContentType::Thinking),
            rule("l", ContentType::LongContext),
            rule("i", ContentType::ImageUnderstanding),
            mapping,
        ]
    }

    fn classifier() -> ContentClassifier {
        ContentClassifier::new("(?i)haiku", 1_000).unwrap()
    }

    #[test]
    fn test_traits_from_claude_body() {
        let body = json!({
            "model": "claude-sonnet-4",
            "thinking": {"type": "enabled", "budget_tokens": 1024},
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "abcdefgh"},
                    {"type": "image", "source": {"type": "base64", "data": "AAAA"}}
                ]
            }]
        });
        let traits = RequestTraits::from_body(&body);
        assert_eq!(traits.model, "claude-sonnet-4");
        assert!(traits.thinking);
        assert!(traits.has_images);
        // "user" + "text" + "abcdefgh" = 16 chars
        assert_eq!(traits.estimated_tokens, 4);
    }

    #[test]
    fn test_traits_from_openai_body() {
        let body = json!({
            "model": "gpt-5",
            "reasoning_effort": "high",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let traits = RequestTraits::from_body(&body);
        assert!(traits.thinking);
        assert!(!traits.has_images);
    }

    #[test]
    fn test_model_mapping_wins() {
        let traits = RequestTraits {
            model: "claude-opus-4".to_string(),
            thinking: true,
            has_images: true,
            estimated_tokens: 5_000,
        };
        assert_eq!(
            classifier().classify(&traits, &all_rules()),
            ContentType::ModelMapping
        );
    }

    #[test]
    fn test_precedence_chain() {
        let c = classifier();
        let rules = all_rules();
        let mut traits = RequestTraits {
            model: "claude-3-5-haiku".to_string(),
            thinking: true,
            has_images: true,
            estimated_tokens: 5_000,
        };
        assert_eq!(c.classify(&traits, &rules), ContentType::ImageUnderstanding);
        traits.has_images = false;
        assert_eq!(c.classify(&traits, &rules), ContentType::LongContext);
        traits.estimated_tokens = 10;
        assert_eq!(c.classify(&traits, &rules), ContentType::Thinking);
        traits.thinking = false;
        assert_eq!(c.classify(&traits, &rules), ContentType::Background);
        traits.model = "claude-sonnet-4".to_string();
        assert_eq!(c.classify(&traits, &rules), ContentType::Default);
    }

    #[test]
    fn test_falls_back_to_default_without_rules() {
        let traits = RequestTraits {
            model: "claude-3-5-haiku".to_string(),
            thinking: true,
            has_images: false,
            estimated_tokens: 0,
        };
        let rules = vec![rule("d", ContentType::Default)];
        assert_eq!(classifier().classify(&traits, &rules), ContentType::Default);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(ContentClassifier::new("(unclosed", 10).is_err());
    }
}
