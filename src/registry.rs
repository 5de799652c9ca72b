//! Read access to routes, rules and services.
//!
//! The routing core only sees the [`RuleRegistry`] trait. [`MemoryRegistry`]
//! is the configuration-backed implementation used by the server.

use dashmap::DashMap;
use std::collections::HashMap;

use crate::budget::{RuleUsage, UsageSink};
use crate::clock::Clock;
use crate::config::Config;
use crate::model::{ApiService, ContentType, Route, Rule, TargetType};

/// Accessors the selector and dispatcher need from the rule store.
pub trait RuleRegistry: Send + Sync {
    fn route(&self, route_id: &str) -> Option<Route>;

    /// The active route for a client protocol, if any.
    fn active_route(&self, target: TargetType) -> Option<Route>;

    /// All rules of a route with the given content type, in no particular order.
    fn rules_for(&self, route_id: &str, content_type: ContentType) -> Vec<Rule>;

    /// All rules of a route regardless of content type.
    fn route_rules(&self, route_id: &str) -> Vec<Rule>;

    fn rule(&self, rule_id: &str) -> Option<Rule>;

    fn rules(&self) -> Vec<Rule>;

    fn service(&self, service_id: &str) -> Option<ApiService>;
}

/// In-memory registry loaded from configuration.
///
/// Rules live in a [`DashMap`] so usage write-backs for one rule never
/// contend with reads of another.
pub struct MemoryRegistry {
    routes: Vec<Route>,
    services: HashMap<String, ApiService>,
    rules: DashMap<String, Rule>,
    /// Rule ids in declaration order, for stable listings.
    rule_order: Vec<String>,
}

impl MemoryRegistry {
    pub fn new(
        routes: Vec<Route>,
        services: Vec<ApiService>,
        rules: Vec<Rule>,
        clock: &dyn Clock,
    ) -> Self {
        let now = clock.now_ms();
        let rule_order = rules.iter().map(|r| r.id.clone()).collect();
        let rules = rules
            .into_iter()
            .enumerate()
            .map(|(index, mut rule)| {
                // Declaration order stands in for creation order.
                if rule.created_at == 0 {
                    rule.created_at = now + index as i64;
                }
                if rule.last_reset_at == 0 {
                    rule.last_reset_at = now;
                }
                (rule.id.clone(), rule)
            })
            .collect();

        Self {
            routes,
            services: services.into_iter().map(|s| (s.id.clone(), s)).collect(),
            rules,
            rule_order,
        }
    }

    pub fn from_config(config: &Config, clock: &dyn Clock) -> Self {
        Self::new(
            config.routes.clone(),
            config.services.clone(),
            config.rules.clone(),
            clock,
        )
    }
}

impl RuleRegistry for MemoryRegistry {
    fn route(&self, route_id: &str) -> Option<Route> {
        self.routes.iter().find(|r| r.id == route_id).cloned()
    }

    fn active_route(&self, target: TargetType) -> Option<Route> {
        self.routes
            .iter()
            .find(|r| r.is_active && r.target_type == target)
            .cloned()
    }

    fn rules_for(&self, route_id: &str, content_type: ContentType) -> Vec<Rule> {
        self.route_rules(route_id)
            .into_iter()
            .filter(|r| r.content_type == content_type)
            .collect()
    }

    fn route_rules(&self, route_id: &str) -> Vec<Rule> {
        self.rules()
            .into_iter()
            .filter(|r| r.route_id == route_id)
            .collect()
    }

    fn rule(&self, rule_id: &str) -> Option<Rule> {
        self.rules.get(rule_id).map(|entry| entry.value().clone())
    }

    fn rules(&self) -> Vec<Rule> {
        self.rule_order
            .iter()
            .filter_map(|id| self.rules.get(id).map(|entry| entry.value().clone()))
            .collect()
    }

    fn service(&self, service_id: &str) -> Option<ApiService> {
        self.services.get(service_id).cloned()
    }
}

impl UsageSink for MemoryRegistry {
    fn persist(&self, rule_id: &str, usage: RuleUsage, _revision: u64) {
        if let Some(mut rule) = self.rules.get_mut(rule_id) {
            rule.total_tokens_used = usage.total_tokens_used;
            rule.total_requests_used = usage.total_requests_used;
            rule.last_reset_at = usage.last_reset_at;
        }
    }
}
