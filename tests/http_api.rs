//! Integration tests for the HTTP surface.
//!
//! Drives the axum router with `oneshot` against wiremock upstreams:
//! - client entry points classify, dispatch and fail over
//! - admin endpoints reset budgets, list usage and toggle failover
//! - errors use the JSON error body

use std::sync::Arc;

use axum::body::Body;
use http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use routelane::clock::{ManualClock, SharedClock};
use routelane::config::Config;
use routelane::dispatch::HttpTransport;
use routelane::proxy::{
    create_router, AppState, ROUTELANE_CONTENT_TYPE_HEADER, ROUTELANE_MODEL_HEADER,
    ROUTELANE_RULE_HEADER,
};
use routelane::status::RuleStatus;

const T: i64 = 1_700_000_000_000;

fn config_for(upstream: &str, failover: bool) -> Config {
    Config::parse_str(&format!(
        r#"
[failover]
enabled = {failover}

[[vendors]]
id = "anthropic"
name = "Anthropic"

[[services]]
id = "s1"
vendor_id = "anthropic"
source_type = "claude"
api_url = "{upstream}/s1"
api_key = "sk-one"

[[services]]
id = "s2"
vendor_id = "anthropic"
source_type = "claude"
api_url = "{upstream}/s2"
api_key = "sk-two"

[[routes]]
id = "main"
name = "Main"
target_type = "claude-code"
is_active = true

[[rules]]
id = "a"
route_id = "main"
content_type = "default"
target_service_id = "s1"
sort_order = 10

[[rules]]
id = "b"
route_id = "main"
content_type = "default"
target_service_id = "s2"
target_model = "claude-sonnet-fallback"
sort_order = 5

[[rules]]
id = "map"
route_id = "main"
content_type = "model-mapping"
target_service_id = "s1"
replaced_model = "claude-3-5-haiku"
target_model = "claude-opus-4"
sort_order = 1

[[rules]]
id = "think"
route_id = "main"
content_type = "thinking"
target_service_id = "s2"
sort_order = 1
token_limit = 1000
reset_interval = 24
"#
    ))
    .expect("valid test config")
}

async fn setup(upstream: &MockServer, failover: bool) -> (axum::Router, AppState) {
    let clock: SharedClock = Arc::new(ManualClock::new(T));
    let state = AppState::build(
        &config_for(&upstream.uri(), failover),
        clock,
        Arc::new(HttpTransport::new().unwrap()),
        None,
    )
    .await
    .unwrap();
    (create_router(state.clone()), state)
}

fn ok_body(tokens: u64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "id": "msg_1",
        "content": [{"type": "text", "text": "hi"}],
        "usage": {"input_tokens": tokens / 2, "output_tokens": tokens - tokens / 2}
    }))
}

async fn mount(upstream: &MockServer, service: &str, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path(format!("/{}/v1/messages", service)))
        .respond_with(response)
        .mount(upstream)
        .await;
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn parse_body(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
        .await
        .expect("read body");
    let json: Value = serde_json::from_slice(&body_bytes).unwrap_or_default();
    (status, json)
}

fn message(model: &str) -> Value {
    json!({
        "model": model,
        "max_tokens": 128,
        "messages": [{"role": "user", "content": "hello"}]
    })
}

#[tokio::test]
async fn test_claude_code_request_served_by_top_rule() {
    let upstream = MockServer::start().await;
    mount(&upstream, "s1", ok_body(40)).await;
    let (app, _) = setup(&upstream, true).await;

    let response = app
        .oneshot(post_json("/claude-code/v1/messages", message("claude-sonnet-4")))
        .await
        .unwrap();
    assert_eq!(response.headers()[ROUTELANE_RULE_HEADER], "a");
    assert_eq!(response.headers()[ROUTELANE_CONTENT_TYPE_HEADER], "default");

    let (status, body) = parse_body(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "msg_1");

    let requests = upstream.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].headers["x-api-key"], "sk-one");
    let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(sent["model"], "claude-sonnet-4");
}

#[tokio::test]
async fn test_upstream_failure_fails_over_and_marks_service() {
    let upstream = MockServer::start().await;
    mount(&upstream, "s1", ResponseTemplate::new(500)).await;
    mount(&upstream, "s2", ok_body(10)).await;
    let (app, _) = setup(&upstream, true).await;

    let response = app
        .clone()
        .oneshot(post_json("/claude-code/v1/messages", message("claude-sonnet-4")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[ROUTELANE_RULE_HEADER], "b");

    // Rule b substitutes its target model.
    let requests = upstream.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(sent["model"], "claude-sonnet-fallback");

    let (_, health) = parse_body(app.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(health["unavailableServices"][0]["serviceId"], "s1");
    assert_eq!(
        health["unavailableServices"][0]["expiresAt"],
        T + 600_000
    );
}

#[tokio::test]
async fn test_failover_disabled_passes_upstream_status() {
    let upstream = MockServer::start().await;
    mount(&upstream, "s1", ResponseTemplate::new(429)).await;
    mount(&upstream, "s2", ok_body(10)).await;
    let (app, _) = setup(&upstream, false).await;

    let (status, body) = parse_body(
        app.oneshot(post_json("/claude-code/v1/messages", message("claude-sonnet-4")))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["type"], "routelane_error");
    assert_eq!(upstream.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_exhausted_route_returns_503() {
    let upstream = MockServer::start().await;
    mount(&upstream, "s1", ResponseTemplate::new(502)).await;
    mount(&upstream, "s2", ResponseTemplate::new(503)).await;
    let (app, _) = setup(&upstream, true).await;

    let (status, body) = parse_body(
        app.oneshot(post_json("/claude-code/v1/messages", message("claude-sonnet-4")))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], 503);
    assert!(body["error"]["message"].as_str().unwrap().contains("failed: 2"));
}

#[tokio::test]
async fn test_mapped_model_sent_upstream_as_target_model() {
    let upstream = MockServer::start().await;
    mount(&upstream, "s1", ok_body(20)).await;
    let (app, _) = setup(&upstream, true).await;

    let response = app
        .clone()
        .oneshot(post_json("/claude-code/v1/messages", message("claude-3-5-haiku")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[ROUTELANE_RULE_HEADER], "map");
    assert_eq!(response.headers()[ROUTELANE_CONTENT_TYPE_HEADER], "model-mapping");
    assert_eq!(response.headers()[ROUTELANE_MODEL_HEADER], "claude-opus-4");

    let requests = upstream.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(sent["model"], "claude-opus-4");
    assert_eq!(sent["messages"][0]["content"], "hello");

    // Other models skip the mapping rule and keep their name.
    let response = app
        .oneshot(post_json("/claude-code/v1/messages", message("claude-sonnet-4")))
        .await
        .unwrap();
    assert_eq!(response.headers()[ROUTELANE_RULE_HEADER], "a");
    let requests = upstream.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(sent["model"], "claude-sonnet-4");
}

#[tokio::test]
async fn test_thinking_request_uses_thinking_rules() {
    let upstream = MockServer::start().await;
    mount(&upstream, "s2", ok_body(10)).await;
    let (app, _) = setup(&upstream, true).await;

    let mut body = message("claude-sonnet-4");
    body["thinking"] = json!({"type": "enabled", "budget_tokens": 1024});
    let response = app
        .oneshot(post_json("/claude-code/v1/messages", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[ROUTELANE_RULE_HEADER], "think");
    assert_eq!(response.headers()[ROUTELANE_CONTENT_TYPE_HEADER], "thinking");
}

#[tokio::test]
async fn test_bad_requests_rejected() {
    let upstream = MockServer::start().await;
    let (app, _) = setup(&upstream, true).await;

    let (status, body) = parse_body(
        app.clone()
            .oneshot(post_json("/claude-code/v1/messages", json!({"messages": []})))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("model"));

    let mut streaming = message("claude-sonnet-4");
    streaming["stream"] = json!(true);
    let response = app
        .oneshot(post_json("/claude-code/v1/messages", streaming))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(upstream.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_codex_without_active_route() {
    let upstream = MockServer::start().await;
    let (app, _) = setup(&upstream, true).await;

    let (status, body) = parse_body(
        app.oneshot(post_json(
            "/codex/v1/chat/completions",
            json!({"model": "gpt-5", "messages": []}),
        ))
        .await
        .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"]["message"].as_str().unwrap().contains("codex"));
}

#[tokio::test]
async fn test_reset_tokens_zeroes_usage_and_broadcasts_idle() {
    let upstream = MockServer::start().await;
    mount(&upstream, "s1", ok_body(40)).await;
    let (app, state) = setup(&upstream, true).await;
    let mut events = state.dispatcher.status().subscribe();

    app.clone()
        .oneshot(post_json("/claude-code/v1/messages", message("claude-sonnet-4")))
        .await
        .unwrap();
    let in_use = events.recv().await.unwrap();
    assert_eq!(in_use.status, RuleStatus::InUse);
    assert_eq!(in_use.total_tokens_used, Some(40));

    let (_, usage) = parse_body(app.clone().oneshot(get("/api/rules/usage")).await.unwrap()).await;
    let rule_a = usage["rules"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["ruleId"] == "a")
        .unwrap()
        .clone();
    assert_eq!(rule_a["totalTokensUsed"], 40);
    assert_eq!(rule_a["totalRequestsUsed"], 1);

    let (status, reset) = parse_body(
        app.clone()
            .oneshot(post_json("/api/rules/a/reset-tokens", json!({})))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reset["totalTokensUsed"], 0);
    assert_eq!(reset["lastResetAt"], T);

    let idle = events.recv().await.unwrap();
    assert_eq!(idle.rule_id, "a");
    assert_eq!(idle.status, RuleStatus::Idle);
    assert_eq!(idle.total_tokens_used, Some(0));
}

#[tokio::test]
async fn test_reset_unknown_rule_is_404() {
    let upstream = MockServer::start().await;
    let (app, _) = setup(&upstream, true).await;

    let (status, body) = parse_body(
        app.oneshot(post_json("/api/rules/missing/reset-tokens", json!({})))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], 404);
}

#[tokio::test]
async fn test_usage_lists_budget_settings() {
    let upstream = MockServer::start().await;
    let (app, _) = setup(&upstream, true).await;

    let (status, usage) = parse_body(app.oneshot(get("/api/rules/usage")).await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let rules = usage["rules"].as_array().unwrap();
    assert_eq!(rules.len(), 4);
    let think = rules.iter().find(|r| r["ruleId"] == "think").unwrap();
    assert_eq!(think["tokenLimit"], 1000);
    assert_eq!(think["contentType"], "thinking");
    assert_eq!(think["nextResetAt"], T + 24 * 3_600_000);
}

#[tokio::test]
async fn test_failover_toggle() {
    let upstream = MockServer::start().await;
    let (app, state) = setup(&upstream, true).await;

    let (_, body) = parse_body(app.clone().oneshot(get("/api/settings/failover")).await.unwrap()).await;
    assert_eq!(body, json!({"enabled": true}));

    let request = Request::builder()
        .method("PUT")
        .uri("/api/settings/failover")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"enabled":false}"#))
        .unwrap();
    let (status, body) = parse_body(app.oneshot(request).await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"enabled": false}));
    assert!(!state.dispatcher.failover_enabled());
}
