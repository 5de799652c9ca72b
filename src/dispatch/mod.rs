//! Rule dispatch with health-aware failover.
//!
//! For one request the [`Dispatcher`] walks the selector's candidates in
//! priority order:
//! - services marked unavailable are skipped
//! - rules over their token budget are skipped
//! - the first eligible rule is attempted, bounded by its timeout
//!
//! A failed attempt marks its service unavailable and moves on to the next
//! candidate, unless failover is switched off.

mod transport;

pub use transport::{
    extract_tokens, HttpTransport, Transport, TransportRequest, TransportResponse, UpstreamError,
    ANTHROPIC_VERSION,
};

use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::budget::{BudgetTracker, RuleUsage};
use crate::error::{Error, Result};
use crate::health::HealthTracker;
use crate::model::{ContentType, Rule};
use crate::registry::RuleRegistry;
use crate::router::{resolve_model, Selector};
use crate::status::{RuleStatus, StatusBroadcaster};
use crate::storage::{spawn_attempt_write, AttemptRecord};

/// A request to route through one route's rules.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub route_id: String,
    pub content_type: ContentType,
    pub caller_model: String,
    /// Upstream path, e.g. `/v1/messages`.
    pub path: String,
    pub payload: Value,
}

/// A successful dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub correlation_id: String,
    pub rule_id: String,
    pub service_id: String,
    /// Model actually requested upstream.
    pub model: String,
    pub status: u16,
    pub body: Value,
    pub tokens_used: u64,
    /// Rule counters after this request was recorded.
    pub usage: RuleUsage,
    /// Attempts made, including the successful one.
    pub attempts: usize,
}

#[derive(Debug, Default)]
struct SkipCounts {
    health: usize,
    budget: usize,
    unsupported: usize,
    failed: usize,
}

/// Walks candidates and delivers requests.
pub struct Dispatcher {
    selector: Selector,
    registry: Arc<dyn RuleRegistry>,
    health: Arc<HealthTracker>,
    budget: Arc<BudgetTracker>,
    status: StatusBroadcaster,
    transport: Arc<dyn Transport>,
    failover_enabled: AtomicBool,
    attempt_log: Option<SqlitePool>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn RuleRegistry>,
        health: Arc<HealthTracker>,
        budget: Arc<BudgetTracker>,
        status: StatusBroadcaster,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            selector: Selector::new(Arc::clone(&registry)),
            registry,
            health,
            budget,
            status,
            transport,
            failover_enabled: AtomicBool::new(true),
            attempt_log: None,
        }
    }

    /// Record every attempt in the `dispatch_attempts` table.
    pub fn with_attempt_log(mut self, pool: SqlitePool) -> Self {
        self.attempt_log = Some(pool);
        self
    }

    pub fn with_failover(self, enabled: bool) -> Self {
        self.set_failover_enabled(enabled);
        self
    }

    pub fn failover_enabled(&self) -> bool {
        self.failover_enabled.load(Ordering::Relaxed)
    }

    pub fn set_failover_enabled(&self, enabled: bool) {
        let previous = self.failover_enabled.swap(enabled, Ordering::Relaxed);
        if previous != enabled {
            tracing::info!(enabled, "Failover setting changed");
        }
    }

    pub fn registry(&self) -> &Arc<dyn RuleRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn budget(&self) -> &Arc<BudgetTracker> {
        &self.budget
    }

    pub fn status(&self) -> &StatusBroadcaster {
        &self.status
    }

    /// Deliver `request` through the first eligible rule that succeeds.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome> {
        let correlation_id = Uuid::new_v4().to_string();
        let candidates = self
            .selector
            .select_candidates(&request.route_id, request.content_type)?;

        let mut skipped = SkipCounts::default();
        let mut attempts = 0;

        for rule in &candidates {
            if !self.health.is_available(&rule.target_service_id) {
                tracing::debug!(
                    rule = %rule.id,
                    service = %rule.target_service_id,
                    "Skipping rule: service unavailable"
                );
                skipped.health += 1;
                continue;
            }

            if self.budget.is_over_budget(rule) {
                tracing::debug!(rule = %rule.id, "Skipping rule: token budget exhausted");
                skipped.budget += 1;
                continue;
            }

            let model = resolve_model(rule, &request.caller_model);
            let Some(service) = self
                .registry
                .service(&rule.target_service_id)
                .filter(|service| service.supports(&model))
            else {
                tracing::debug!(
                    rule = %rule.id,
                    service = %rule.target_service_id,
                    model = %model,
                    "Skipping rule: service missing or model unsupported"
                );
                skipped.unsupported += 1;
                continue;
            };

            let transport_request = TransportRequest {
                payload: with_model(&request.payload, &model),
                service,
                rule: rule.clone(),
                model,
                path: request.path.clone(),
            };

            attempts += 1;
            let start = Instant::now();
            let result = self.attempt(rule, &transport_request).await;
            let latency_ms = start.elapsed().as_millis() as i64;
            self.log_attempt(&correlation_id, &request, &transport_request, &result, latency_ms);

            match result {
                Ok(response) => {
                    let usage = self.budget.record_usage_with(rule, response.tokens_used, |usage| {
                        self.status.publish(&rule.id, RuleStatus::InUse, Some(usage));
                    });

                    tracing::info!(
                        correlation_id = %correlation_id,
                        rule = %rule.id,
                        service = %transport_request.service.id,
                        model = %transport_request.model,
                        tokens = response.tokens_used,
                        attempts,
                        latency_ms,
                        "Request dispatched"
                    );

                    return Ok(DispatchOutcome {
                        correlation_id,
                        rule_id: rule.id.clone(),
                        service_id: transport_request.service.id,
                        model: transport_request.model,
                        status: response.status,
                        body: response.body,
                        tokens_used: response.tokens_used,
                        usage,
                        attempts,
                    });
                }
                Err(err) => {
                    if err.marks_unhealthy() {
                        self.health.mark_unavailable(&rule.target_service_id);
                    }
                    skipped.failed += 1;

                    if !self.failover_enabled() {
                        tracing::warn!(
                            rule = %rule.id,
                            error = %err,
                            "Attempt failed and failover is disabled"
                        );
                        return Err(Error::Upstream {
                            rule_id: rule.id.clone(),
                            source: err,
                        });
                    }

                    tracing::warn!(
                        rule = %rule.id,
                        service = %rule.target_service_id,
                        error = %err,
                        "Attempt failed, failing over to next rule"
                    );
                }
            }
        }

        tracing::warn!(
            route = %request.route_id,
            content_type = %request.content_type,
            candidates = candidates.len(),
            skipped_health = skipped.health,
            skipped_budget = skipped.budget,
            skipped_unsupported = skipped.unsupported,
            failed = skipped.failed,
            "Route exhausted"
        );

        Err(Error::RouteExhausted {
            route_id: request.route_id,
            content_type: request.content_type,
            skipped_health: skipped.health,
            skipped_budget: skipped.budget,
            skipped_unsupported: skipped.unsupported,
            failed: skipped.failed,
        })
    }

    async fn attempt(
        &self,
        rule: &Rule,
        request: &TransportRequest,
    ) -> std::result::Result<TransportResponse, UpstreamError> {
        let timeout = rule.timeout();
        match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn log_attempt(
        &self,
        correlation_id: &str,
        request: &DispatchRequest,
        attempt: &TransportRequest,
        result: &std::result::Result<TransportResponse, UpstreamError>,
        latency_ms: i64,
    ) {
        let Some(pool) = &self.attempt_log else {
            return;
        };

        let (success, status_code, tokens_used, error_message) = match result {
            Ok(response) => (true, Some(response.status), Some(response.tokens_used), None),
            Err(err) => (false, err.status_code(), None, Some(err.to_string())),
        };

        spawn_attempt_write(
            pool,
            AttemptRecord {
                correlation_id: correlation_id.to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                route_id: request.route_id.clone(),
                rule_id: attempt.rule.id.clone(),
                service_id: attempt.service.id.clone(),
                model: attempt.model.clone(),
                content_type: request.content_type.to_string(),
                success,
                status_code,
                tokens_used,
                latency_ms,
                error_message,
            },
        );
    }
}

/// Copy of `payload` with its `model` field set to `model`.
fn with_model(payload: &Value, model: &str) -> Value {
    let mut payload = payload.clone();
    if let Some(object) = payload.as_object_mut() {
        object.insert("model".to_string(), Value::String(model.to_string()));
    }
    payload
}
