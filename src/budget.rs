//! Per-rule token budgets with lazy interval resets.
//!
//! Resets are evaluated at selection time ([`BudgetTracker::is_over_budget`])
//! rather than by a timer: the next reset instant is pure arithmetic on
//! `last_reset_at + reset_interval`. A background sweep calling the same
//! idempotent [`BudgetTracker::maybe_reset`] can be enabled with
//! [`BudgetTracker::spawn_reset_sweep`].

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::model::Rule;
use crate::registry::RuleRegistry;

/// Usage counters of one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleUsage {
    pub total_tokens_used: u64,
    pub total_requests_used: u64,
    pub last_reset_at: i64,
}

impl RuleUsage {
    fn zeroed(now: i64) -> Self {
        Self {
            total_tokens_used: 0,
            total_requests_used: 0,
            last_reset_at: now,
        }
    }
}

impl From<&Rule> for RuleUsage {
    fn from(rule: &Rule) -> Self {
        Self {
            total_tokens_used: rule.total_tokens_used,
            total_requests_used: rule.total_requests_used,
            last_reset_at: rule.last_reset_at,
        }
    }
}

/// Destination for usage write-backs.
///
/// `revision` increases by one on every mutation of a rule's counters, so
/// sinks that apply writes out of order can discard stale ones.
pub trait UsageSink: Send + Sync {
    fn persist(&self, rule_id: &str, usage: RuleUsage, revision: u64);
}

#[derive(Debug)]
struct UsageEntry {
    usage: RuleUsage,
    revision: u64,
}

/// Concurrent budget tracker with one mutex per rule.
///
/// Entries are seeded from the rule record the first time a rule is seen.
pub struct BudgetTracker {
    entries: DashMap<String, Mutex<UsageEntry>>,
    clock: SharedClock,
    sinks: Vec<Arc<dyn UsageSink>>,
}

fn lock(entry: &Mutex<UsageEntry>) -> MutexGuard<'_, UsageEntry> {
    entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BudgetTracker {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            sinks: Vec::new(),
        }
    }

    /// Add a write-back destination for usage changes.
    pub fn with_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Restore previously persisted counters for a rule.
    pub fn seed(&self, rule_id: &str, usage: RuleUsage, revision: u64) {
        self.entries
            .insert(rule_id.to_string(), Mutex::new(UsageEntry { usage, revision }));
    }

    /// Current counters for a rule, if the tracker has seen it.
    pub fn usage(&self, rule_id: &str) -> Option<RuleUsage> {
        self.entries
            .get(rule_id)
            .map(|entry| lock(entry.value()).usage)
    }

    /// Run `f` with the rule's entry locked, creating the entry if needed.
    fn with_entry<R>(&self, rule: &Rule, f: impl FnOnce(&mut UsageEntry) -> R) -> R {
        if let Some(entry) = self.entries.get(&rule.id) {
            let mut guard = lock(entry.value());
            return f(&mut guard);
        }

        let entry = self
            .entries
            .entry(rule.id.clone())
            .or_insert_with(|| {
                Mutex::new(UsageEntry {
                    usage: RuleUsage::from(rule),
                    revision: 0,
                })
            })
            .downgrade();
        let mut guard = lock(entry.value());
        f(&mut guard)
    }

    fn persist(&self, rule_id: &str, entry: &UsageEntry) {
        for sink in &self.sinks {
            sink.persist(rule_id, entry.usage, entry.revision);
        }
    }

    /// Zero the rule's counters if its reset interval has elapsed.
    ///
    /// Returns whether a reset happened. Idempotent within one interval.
    pub fn maybe_reset(&self, rule: &Rule) -> bool {
        let Some(interval_ms) = rule.reset_interval_ms() else {
            return false;
        };
        let now = self.clock.now_ms();

        self.with_entry(rule, |entry| {
            if now < entry.usage.last_reset_at + interval_ms {
                return false;
            }
            let previous = entry.usage.total_tokens_used;
            entry.usage = RuleUsage::zeroed(now);
            entry.revision += 1;
            self.persist(&rule.id, entry);

            tracing::info!(
                rule = %rule.id,
                previous_tokens = previous,
                reset_interval_hours = rule.reset_interval.unwrap_or_default(),
                "Token budget reset by interval"
            );
            true
        })
    }

    /// Whether the rule has used up its token limit. Applies a due reset first.
    pub fn is_over_budget(&self, rule: &Rule) -> bool {
        self.maybe_reset(rule);

        let Some(limit) = rule.token_limit else {
            return false;
        };
        self.with_entry(rule, |entry| entry.usage.total_tokens_used >= limit)
    }

    /// Add `tokens` to the rule's usage and count one served request.
    pub fn record_usage(&self, rule: &Rule, tokens: u64) -> RuleUsage {
        self.record_usage_with(rule, tokens, |_| ())
    }

    /// [`record_usage`](Self::record_usage), running `then` on the new counters
    /// before the rule's entry is released.
    ///
    /// Status events published from `then` leave in mutation order.
    pub fn record_usage_with(
        &self,
        rule: &Rule,
        tokens: u64,
        then: impl FnOnce(RuleUsage),
    ) -> RuleUsage {
        self.with_entry(rule, |entry| {
            entry.usage.total_tokens_used = entry.usage.total_tokens_used.saturating_add(tokens);
            entry.usage.total_requests_used += 1;
            entry.revision += 1;
            self.persist(&rule.id, entry);

            tracing::debug!(
                rule = %rule.id,
                tokens,
                total_tokens_used = entry.usage.total_tokens_used,
                "Usage recorded"
            );
            then(entry.usage);
            entry.usage
        })
    }

    /// Unconditionally zero the rule's counters, independent of its interval.
    pub fn reset_manually(&self, rule_id: &str) -> RuleUsage {
        self.reset_manually_with(rule_id, |_| ())
    }

    /// [`reset_manually`](Self::reset_manually) with `then` run under the
    /// rule's lock.
    pub fn reset_manually_with(&self, rule_id: &str, then: impl FnOnce(RuleUsage)) -> RuleUsage {
        let now = self.clock.now_ms();
        let entry = self
            .entries
            .entry(rule_id.to_string())
            .or_insert_with(|| {
                Mutex::new(UsageEntry {
                    usage: RuleUsage::zeroed(now),
                    revision: 0,
                })
            })
            .downgrade();

        let mut guard = lock(entry.value());
        guard.usage = RuleUsage::zeroed(now);
        guard.revision += 1;
        self.persist(rule_id, &guard);

        tracing::info!(rule = %rule_id, "Token budget reset manually");
        then(guard.usage);
        guard.usage
    }

    /// Apply due interval resets to every given rule. Returns how many reset.
    pub fn sweep(&self, rules: &[Rule]) -> usize {
        rules.iter().filter(|rule| self.maybe_reset(rule)).count()
    }

    /// Periodically sweep all registry rules for due resets.
    pub fn spawn_reset_sweep(
        self: &Arc<Self>,
        registry: Arc<dyn RuleRegistry>,
        every: Duration,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reset = tracker.sweep(&registry.rules());
                if reset > 0 {
                    tracing::debug!(reset, "Budget sweep applied interval resets");
                }
            }
        })
    }
}
