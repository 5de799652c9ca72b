//! HTTP surface.
//!
//! This module exposes the client protocol entry points, the rule status
//! channel and the rule administration endpoints.

mod handlers;
mod server;
mod ws;

pub use handlers::{
    FailoverSetting, RuleUsageView, ROUTELANE_CONTENT_TYPE_HEADER, ROUTELANE_MODEL_HEADER,
    ROUTELANE_REQUEST_ID_HEADER, ROUTELANE_RULE_HEADER,
};
pub use server::{create_router, run_server, AppState};
