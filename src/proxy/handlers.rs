//! HTTP request handlers.

use axum::{
    extract::{Path, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::server::AppState;
use crate::budget::RuleUsage;
use crate::dispatch::{DispatchOutcome, DispatchRequest};
use crate::error::Error;
use crate::model::{ContentType, Rule, TargetType};
use crate::router::RequestTraits;
use crate::status::RuleStatus;

/// Response header: correlation ID (UUID v4).
pub const ROUTELANE_REQUEST_ID_HEADER: &str = "x-routelane-request-id";
/// Response header: id of the rule that served the request.
pub const ROUTELANE_RULE_HEADER: &str = "x-routelane-rule";
/// Response header: model requested upstream.
pub const ROUTELANE_MODEL_HEADER: &str = "x-routelane-model";
/// Response header: content type the request was classified as.
pub const ROUTELANE_CONTENT_TYPE_HEADER: &str = "x-routelane-content-type";

/// Handle POST /claude-code/v1/messages
pub async fn claude_code_messages(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, Error> {
    route_request(&state, TargetType::ClaudeCode, "/v1/messages", body).await
}

/// Handle POST /codex/v1/chat/completions
pub async fn codex_chat_completions(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, Error> {
    route_request(&state, TargetType::Codex, "/v1/chat/completions", body).await
}

/// Handle POST /codex/v1/responses
pub async fn codex_responses(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, Error> {
    route_request(&state, TargetType::Codex, "/v1/responses", body).await
}

/// Classify a client request and dispatch it on the protocol's active route.
async fn route_request(
    state: &AppState,
    target: TargetType,
    path: &str,
    body: Value,
) -> Result<Response, Error> {
    if !body.is_object() {
        return Err(Error::BadRequest("Request body must be a JSON object".to_string()));
    }
    let caller_model = body
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| Error::BadRequest("Missing 'model' field".to_string()))?
        .to_string();
    if body.get("stream").and_then(Value::as_bool).unwrap_or(false) {
        return Err(Error::BadRequest(
            "Streaming responses are not supported".to_string(),
        ));
    }

    let registry = state.dispatcher.registry();
    let route = registry
        .active_route(target)
        .ok_or(Error::NoActiveRoute { target })?;

    let traits = RequestTraits::from_body(&body);
    let content_type = state
        .classifier
        .classify(&traits, &registry.route_rules(&route.id));

    tracing::info!(
        target = %target,
        route = %route.id,
        model = %caller_model,
        content_type = %content_type,
        "Received request"
    );

    let outcome = state
        .dispatcher
        .dispatch(DispatchRequest {
            route_id: route.id,
            content_type,
            caller_model,
            path: path.to_string(),
            payload: body,
        })
        .await?;

    Ok(into_response(outcome, content_type))
}

fn into_response(outcome: DispatchOutcome, content_type: ContentType) -> Response {
    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::OK);
    let mut response = (status, Json(outcome.body)).into_response();

    let headers = response.headers_mut();
    for (name, value) in [
        (ROUTELANE_REQUEST_ID_HEADER, outcome.correlation_id.as_str()),
        (ROUTELANE_RULE_HEADER, outcome.rule_id.as_str()),
        (ROUTELANE_MODEL_HEADER, outcome.model.as_str()),
        (ROUTELANE_CONTENT_TYPE_HEADER, content_type.as_str()),
    ] {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
    response
}

/// Usage of one rule as exposed by the admin endpoints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleUsageView {
    pub rule_id: String,
    pub route_id: String,
    pub content_type: ContentType,
    pub token_limit: Option<u64>,
    pub reset_interval: Option<u32>,
    pub next_reset_at: Option<i64>,
    #[serde(flatten)]
    pub usage: RuleUsage,
}

impl RuleUsageView {
    fn new(rule: &Rule, usage: RuleUsage) -> Self {
        Self {
            rule_id: rule.id.clone(),
            route_id: rule.route_id.clone(),
            content_type: rule.content_type,
            token_limit: rule.token_limit,
            reset_interval: rule.reset_interval,
            next_reset_at: rule.next_reset_at(usage.last_reset_at),
            usage,
        }
    }
}

/// Handle POST /api/rules/:id/reset-tokens
pub async fn reset_rule_tokens(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
) -> Result<Json<RuleUsageView>, Error> {
    let dispatcher = &state.dispatcher;
    let rule = dispatcher
        .registry()
        .rule(&rule_id)
        .ok_or_else(|| Error::RuleNotFound {
            rule_id: rule_id.clone(),
        })?;

    let usage = dispatcher.budget().reset_manually_with(&rule.id, |usage| {
        dispatcher.status().publish(&rule.id, RuleStatus::Idle, Some(usage));
    });

    Ok(Json(RuleUsageView::new(&rule, usage)))
}

/// Handle GET /api/rules/usage
pub async fn rule_usage(State(state): State<AppState>) -> impl IntoResponse {
    let budget = state.dispatcher.budget();
    let rules: Vec<RuleUsageView> = state
        .dispatcher
        .registry()
        .rules()
        .iter()
        .map(|rule| {
            budget.maybe_reset(rule);
            let usage = budget.usage(&rule.id).unwrap_or_else(|| RuleUsage::from(rule));
            RuleUsageView::new(rule, usage)
        })
        .collect();

    Json(serde_json::json!({ "rules": rules }))
}

/// Body of the failover settings endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct FailoverSetting {
    pub enabled: bool,
}

/// Handle GET /api/settings/failover
pub async fn get_failover(State(state): State<AppState>) -> Json<FailoverSetting> {
    Json(FailoverSetting {
        enabled: state.dispatcher.failover_enabled(),
    })
}

/// Handle PUT /api/settings/failover
pub async fn put_failover(
    State(state): State<AppState>,
    Json(setting): Json<FailoverSetting>,
) -> Json<FailoverSetting> {
    state.dispatcher.set_failover_enabled(setting.enabled);
    Json(setting)
}

/// Handle GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "routelane",
        "failoverEnabled": state.dispatcher.failover_enabled(),
        "unavailableServices": state.dispatcher.health().snapshot(),
        "statusSubscribers": state.dispatcher.status().subscriber_count(),
    }))
}
