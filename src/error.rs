//! Error types for routelane.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::dispatch::UpstreamError;
use crate::model::{ContentType, TargetType};

/// Result type alias for routelane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for routelane.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Route '{route_id}' not found")]
    RouteNotFound { route_id: String },

    #[error("Route '{route_id}' is not active")]
    RouteInactive { route_id: String },

    #[error("No active route for {target}")]
    NoActiveRoute { target: TargetType },

    #[error("Rule '{rule_id}' not found")]
    RuleNotFound { rule_id: String },

    #[error(
        "No eligible rule left on route '{route_id}' for {content_type} \
         (unavailable: {skipped_health}, over budget: {skipped_budget}, \
         unsupported: {skipped_unsupported}, failed: {failed})"
    )]
    RouteExhausted {
        route_id: String,
        content_type: ContentType,
        skipped_health: usize,
        skipped_budget: usize,
        skipped_unsupported: usize,
        failed: usize,
    },

    #[error("Upstream request for rule '{rule_id}' failed: {source}")]
    Upstream {
        rule_id: String,
        #[source]
        source: UpstreamError,
    },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Error::RouteInactive { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::NoActiveRoute { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::RuleNotFound { .. } => StatusCode::NOT_FOUND,
            Error::RouteExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            // Upstream client/server errors pass through; the rest is a bad gateway.
            Error::Upstream { source, .. } => source
                .status_code()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .filter(|code| code.is_client_error() || code.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": "routelane_error",
                "code": status.as_u16()
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
