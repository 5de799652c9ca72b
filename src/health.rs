//! Time-bounded unavailability marks on upstream services.
//!
//! A failed delivery marks its service unavailable. Marks are never cleared
//! explicitly: a mark older than [`HEALTH_MARK_TTL_MS`] is simply ignored by
//! readers. Re-marking before expiry restarts the window.

use dashmap::DashMap;
use serde::Serialize;

use crate::clock::SharedClock;

/// How long a service stays unavailable after its most recent failure.
pub const HEALTH_MARK_TTL_MS: i64 = 10 * 60 * 1000;

/// A live unavailability mark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMark {
    pub service_id: String,
    pub marked_at: i64,
    pub expires_at: i64,
}

/// Concurrent health tracker keyed by service id.
///
/// Backed by [`DashMap`] so marks on one service never block reads of
/// another. Concurrent marks of the same service are last-write-wins.
#[derive(Debug)]
pub struct HealthTracker {
    marks: DashMap<String, i64>,
    clock: SharedClock,
}

impl HealthTracker {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            marks: DashMap::new(),
            clock,
        }
    }

    /// Record that `service_id` failed just now.
    pub fn mark_unavailable(&self, service_id: &str) {
        let now = self.clock.now_ms();
        let previous = self.marks.insert(service_id.to_string(), now);
        tracing::warn!(
            service = %service_id,
            marked_at = now,
            already_marked = previous.is_some_and(|at| !is_expired(at, now)),
            "Service marked unavailable"
        );
    }

    /// Whether `service_id` may receive traffic.
    pub fn is_available(&self, service_id: &str) -> bool {
        match self.marks.get(service_id) {
            None => true,
            Some(marked_at) => is_expired(*marked_at, self.clock.now_ms()),
        }
    }

    /// Live marks, sorted by service id. Expired marks are pruned as a side effect.
    pub fn snapshot(&self) -> Vec<HealthMark> {
        let now = self.clock.now_ms();
        self.marks.retain(|_, marked_at| !is_expired(*marked_at, now));

        let mut marks: Vec<HealthMark> = self
            .marks
            .iter()
            .map(|entry| HealthMark {
                service_id: entry.key().clone(),
                marked_at: *entry.value(),
                expires_at: *entry.value() + HEALTH_MARK_TTL_MS,
            })
            .collect();
        marks.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        marks
    }
}

fn is_expired(marked_at: i64, now: i64) -> bool {
    now - marked_at > HEALTH_MARK_TTL_MS
}
