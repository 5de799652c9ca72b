//! HTTP server setup and configuration.

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use super::{handlers, ws};
use crate::budget::{BudgetTracker, UsageSink};
use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::dispatch::{Dispatcher, HttpTransport, Transport};
use crate::error::Result;
use crate::health::HealthTracker;
use crate::registry::{MemoryRegistry, RuleRegistry};
use crate::router::ContentClassifier;
use crate::status::{StatusBroadcaster, STATUS_CHANNEL_PATH};
use crate::storage::{init_pool, UsageStore};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub classifier: Arc<ContentClassifier>,
}

impl AppState {
    /// Wire registry, trackers and dispatcher from configuration.
    ///
    /// With a pool, persisted usage is restored into the budget tracker and
    /// every later change is written back.
    pub async fn build(
        config: &Config,
        clock: SharedClock,
        transport: Arc<dyn Transport>,
        pool: Option<SqlitePool>,
    ) -> Result<Self> {
        let registry = Arc::new(MemoryRegistry::from_config(config, clock.as_ref()));
        let mut budget =
            BudgetTracker::new(clock.clone()).with_sink(registry.clone() as Arc<dyn UsageSink>);

        if let Some(pool) = &pool {
            let store = UsageStore::new(pool.clone());
            let mut restored = 0;
            for (rule_id, usage, revision) in store.load_all().await? {
                if registry.rule(&rule_id).is_none() {
                    continue;
                }
                budget.seed(&rule_id, usage, revision);
                registry.persist(&rule_id, usage, revision);
                restored += 1;
            }
            tracing::info!(restored, "Restored rule usage from database");
            budget = budget.with_sink(Arc::new(store));
        }

        let mut dispatcher = Dispatcher::new(
            registry,
            Arc::new(HealthTracker::new(clock.clone())),
            Arc::new(budget),
            StatusBroadcaster::new(clock),
            transport,
        )
        .with_failover(config.failover.enabled);

        if let Some(pool) = pool.filter(|_| config.logging.log_attempts) {
            dispatcher = dispatcher.with_attempt_log(pool);
        }

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            classifier: Arc::new(ContentClassifier::from_config(&config.classifier)?),
        })
    }
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Client protocol entry points
        .route("/claude-code/v1/messages", post(handlers::claude_code_messages))
        .route("/codex/v1/chat/completions", post(handlers::codex_chat_completions))
        .route("/codex/v1/responses", post(handlers::codex_responses))
        // Rule administration
        .route(STATUS_CHANNEL_PATH, get(ws::rule_status_socket))
        .route("/api/rules/usage", get(handlers::rule_usage))
        .route("/api/rules/:id/reset-tokens", post(handlers::reset_rule_tokens))
        .route(
            "/api/settings/failover",
            get(handlers::get_failover).put(handlers::put_failover),
        )
        .route("/health", get(handlers::health))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();

    let pool = match &config.database {
        Some(db) => {
            let pool = init_pool(&db.path).await?;
            tracing::info!(path = %db.path, "Usage store ready");
            Some(pool)
        }
        None => None,
    };

    let clock: SharedClock = Arc::new(SystemClock);
    let transport = Arc::new(HttpTransport::new()?);
    let state = AppState::build(&config, clock, transport, pool).await?;

    let _sweep = (config.budget.sweep_interval_secs > 0).then(|| {
        let dispatcher = &state.dispatcher;
        dispatcher.budget().spawn_reset_sweep(
            Arc::clone(dispatcher.registry()),
            Duration::from_secs(config.budget.sweep_interval_secs),
        )
    });

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(
        address = %listen_addr,
        failover = config.failover.enabled,
        rules = config.rules.len(),
        "Starting routelane server"
    );

    axum::serve(listener, app).await?;

    Ok(())
}
