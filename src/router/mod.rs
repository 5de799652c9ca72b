//! Router module for rule selection.
//!
//! This module handles choosing which rules may serve a request:
//! - Content-type classification of the request
//! - Priority ordering of the route's rules
//! - Model substitution for the chosen rule

mod classify;
mod selector;

pub use classify::{ContentClassifier, RequestTraits};
pub use selector::{priority_order, resolve_model, Selector};
