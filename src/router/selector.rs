//! Candidate rule selection.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::{ContentType, Rule};
use crate::registry::RuleRegistry;

/// Orders the rules of a route into a failover chain.
#[derive(Clone)]
pub struct Selector {
    registry: Arc<dyn RuleRegistry>,
}

impl Selector {
    pub fn new(registry: Arc<dyn RuleRegistry>) -> Self {
        Self { registry }
    }

    /// All rules of `route_id` with `content_type`, highest priority first.
    ///
    /// The route must exist and be active. Eligibility (health, budget) is
    /// not considered here; the dispatcher filters while walking the list.
    pub fn select_candidates(&self, route_id: &str, content_type: ContentType) -> Result<Vec<Rule>> {
        let route = self
            .registry
            .route(route_id)
            .ok_or_else(|| Error::RouteNotFound {
                route_id: route_id.to_string(),
            })?;

        if !route.is_active {
            return Err(Error::RouteInactive {
                route_id: route_id.to_string(),
            });
        }

        let mut candidates = self.registry.rules_for(route_id, content_type);
        candidates.sort_by(priority_order);

        tracing::debug!(
            route = %route_id,
            content_type = %content_type,
            candidates = ?candidates.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            "Selected candidate rules"
        );

        Ok(candidates)
    }
}

/// sort_order descending, then creation time ascending, then id.
pub fn priority_order(a: &Rule, b: &Rule) -> Ordering {
    b.sort_order
        .cmp(&a.sort_order)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// The model to request upstream when `rule` serves a call for `caller_model`.
///
/// A model-mapping rule substitutes its target only when its replaced model
/// matches the caller's model exactly (case-sensitive). Any other rule with a
/// target model always substitutes it. Otherwise the caller's model passes
/// through.
pub fn resolve_model(rule: &Rule, caller_model: &str) -> String {
    let substitute = match rule.content_type {
        ContentType::ModelMapping => rule
            .replaced_model
            .as_deref()
            .filter(|replaced| *replaced == caller_model)
            .and_then(|_| rule.target_model()),
        _ => rule.target_model(),
    };
    substitute.unwrap_or(caller_model).to_string()
}
