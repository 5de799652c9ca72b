//! Delivery of one attempt to an upstream service.

use axum::http::header;
use futures::future::BoxFuture;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use crate::model::{ApiService, Rule};

/// Anthropic API version sent to `claude` sources.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One attempt: the body with its `model` field already substituted.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub service: ApiService,
    pub rule: Rule,
    pub model: String,
    /// Path appended to the service's base URL, e.g. `/v1/messages`.
    pub path: String,
    pub payload: Value,
}

/// A successful upstream answer.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
    pub tokens_used: u64,
}

/// Why an attempt failed. Every variant marks the service unhealthy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("no response within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("failed to reach upstream: {0}")]
    Connect(String),

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    /// HTTP status returned by the upstream, if it answered at all.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            UpstreamError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn marks_unhealthy(&self) -> bool {
        match self {
            UpstreamError::Status { status, .. } => *status >= 400,
            _ => true,
        }
    }
}

/// Executes attempts. The dispatcher owns the timeout.
pub trait Transport: Send + Sync {
    fn send<'a>(
        &'a self,
        request: &'a TransportRequest,
    ) -> BoxFuture<'a, Result<TransportResponse, UpstreamError>>;
}

/// Total tokens reported in a response's `usage` object.
///
/// Understands Anthropic (`input_tokens`/`output_tokens`), OpenAI chat
/// (`prompt_tokens`/`completion_tokens`) and `total_tokens`. Missing usage
/// counts as zero.
pub fn extract_tokens(body: &Value) -> u64 {
    let Some(usage) = body.get("usage") else {
        return 0;
    };
    if let Some(total) = usage.get("total_tokens").and_then(Value::as_u64) {
        return total;
    }
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
    field("input_tokens")
        + field("output_tokens")
        + field("prompt_tokens")
        + field("completion_tokens")
        + field("cache_creation_input_tokens")
        + field("cache_read_input_tokens")
}

/// `reqwest`-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }

    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, UpstreamError> {
        let service = &request.service;
        let url = format!(
            "{}{}",
            service.api_url.trim_end_matches('/'),
            request.path
        );

        let mut upstream = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request.payload);

        if let Some(api_key) = &service.api_key {
            upstream = if service.source_type == "claude" {
                upstream
                    .header("x-api-key", api_key.expose_secret())
                    .header("anthropic-version", ANTHROPIC_VERSION)
            } else {
                upstream.header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", api_key.expose_secret()),
                )
            };
        }

        let response = upstream
            .send()
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;
        let tokens_used = extract_tokens(&body);

        Ok(TransportResponse {
            status: status.as_u16(),
            body,
            tokens_used,
        })
    }
}

impl Transport for HttpTransport {
    fn send<'a>(
        &'a self,
        request: &'a TransportRequest,
    ) -> BoxFuture<'a, Result<TransportResponse, UpstreamError>> {
        Box::pin(self.execute(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header as match_header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(source_type: &str, api_url: &str) -> TransportRequest {
        TransportRequest {
            service: ApiService {
                id: "svc".to_string(),
                vendor_id: "v".to_string(),
                source_type: source_type.to_string(),
                api_url: api_url.to_string(),
                api_key: Some("sk-test".into()),
                supported_models: Vec::new(),
            },
            rule: Rule {
                id: "r1".to_string(),
                route_id: "route".to_string(),
                content_type: crate::model::ContentType::Default,
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
            },
            model: "m".to_string(),
            path: "/v1/messages".to_string(),
            payload: json!({"model": "m"}),
        }
    }

    #[test]
    fn test_extract_tokens_shapes() {
        assert_eq!(
            extract_tokens(&json!({"usage": {"input_tokens": 10, "output_tokens": 5}})),
            15
        );
        assert_eq!(
            extract_tokens(&json!({"usage": {"prompt_tokens": 7, "completion_tokens": 3}})),
            10
        );
        assert_eq!(
            extract_tokens(&json!({"usage": {"input_tokens": 1, "total_tokens": 99}})),
            99
        );
        assert_eq!(extract_tokens(&json!({"id": "x"})), 0);
    }

    #[test]
    fn test_marks_unhealthy() {
        assert!(UpstreamError::Status {
            status: 404,
            body: String::new()
        }
        .marks_unhealthy());
        assert!(UpstreamError::Timeout { timeout_ms: 1 }.marks_unhealthy());
        assert!(UpstreamError::Connect("refused".to_string()).marks_unhealthy());
    }

    #[tokio::test]
    async fn test_claude_source_uses_api_key_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(match_header("x-api-key", "sk-test"))
            .and(match_header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"id": "msg", "usage": {"input_tokens": 20, "output_tokens": 22}}),
            ))
            .mount(&server)
            .await;

        let transport = HttpTransport::new().unwrap();
        let response = transport.send(&request("claude", &server.uri())).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.tokens_used, 42);
    }

    #[tokio::test]
    async fn test_other_sources_use_bearer_and_surface_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(match_header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new().unwrap();
        let err = transport
            .send(&request("openai", &format!("{}/", server.uri())))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(500));
        assert!(err.to_string().contains("boom"));
    }
}
