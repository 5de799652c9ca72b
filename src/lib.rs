//! routelane - rule-based request routing for coding-assistant clients
//!
//! This library provides the core of the routelane server: the rule
//! registry, candidate selection, health-aware failover, token budgets and
//! the live rule status channel.

pub mod budget;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod model;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod status;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};
