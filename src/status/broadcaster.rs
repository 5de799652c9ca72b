//! Server-side fan-out of rule status events.
//!
//! Publishing never blocks: events go into a bounded
//! [`tokio::sync::broadcast`] ring. A subscriber that falls more than
//! [`STATUS_CHANNEL_CAPACITY`] events behind loses the oldest ones and is
//! told how many it missed; its connection stays open.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::event::{RuleStatus, RuleStatusEvent};
use crate::budget::RuleUsage;
use crate::clock::SharedClock;

/// Per-subscriber backlog before the oldest events are dropped.
pub const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Cloneable handle to the status fan-out.
#[derive(Clone)]
pub struct StatusBroadcaster {
    inner: Arc<BroadcasterInner>,
}

struct BroadcasterInner {
    tx: broadcast::Sender<RuleStatusEvent>,
    /// Last timestamp handed out per rule.
    last_timestamps: DashMap<String, i64>,
    clock: SharedClock,
}

impl StatusBroadcaster {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_capacity(clock, STATUS_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(clock: SharedClock, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BroadcasterInner {
                tx,
                last_timestamps: DashMap::new(),
                clock,
            }),
        }
    }

    /// Stamp and publish a status event for `rule_id`.
    ///
    /// The timestamp is clamped so it never goes backwards for a rule, and
    /// it is sent while the rule's slot is held, so two publishers for the
    /// same rule cannot interleave out of order.
    pub fn publish(&self, rule_id: &str, status: RuleStatus, usage: Option<RuleUsage>) -> RuleStatusEvent {
        let mut last = self
            .inner
            .last_timestamps
            .entry(rule_id.to_string())
            .or_insert(i64::MIN);
        let timestamp = self.inner.clock.now_ms().max(*last);
        *last = timestamp;

        let event = RuleStatusEvent::new(rule_id, status, usage, timestamp);
        // Err only means nobody is listening.
        let receivers = self.inner.tx.send(event.clone()).unwrap_or(0);
        drop(last);

        tracing::trace!(rule = %rule_id, ?status, receivers, "Status event published");
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuleStatusEvent> {
        self.inner.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let clock = Arc::new(ManualClock::new(1_000));
        let broadcaster = StatusBroadcaster::new(clock);
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        broadcaster.publish("r1", RuleStatus::InUse, None);

        assert_eq!(a.recv().await.unwrap().rule_id, "r1");
        assert_eq!(b.recv().await.unwrap().timestamp, 1_000);
    }

    #[test]
    fn test_publish_without_subscribers_does_not_fail() {
        let clock = Arc::new(ManualClock::new(1_000));
        let broadcaster = StatusBroadcaster::new(clock);
        let event = broadcaster.publish("r1", RuleStatus::Idle, None);
        assert_eq!(event.timestamp, 1_000);
    }

    #[test]
    fn test_timestamps_never_go_backwards_per_rule() {
        let clock = Arc::new(ManualClock::new(10_000));
        let broadcaster = StatusBroadcaster::new(clock.clone());

        assert_eq!(broadcaster.publish("r1", RuleStatus::InUse, None).timestamp, 10_000);

        // Wall clock stepped back.
        clock.set(9_000);
        assert_eq!(broadcaster.publish("r1", RuleStatus::InUse, None).timestamp, 10_000);
        assert_eq!(broadcaster.publish("r2", RuleStatus::InUse, None).timestamp, 9_000);

        clock.set(11_000);
        assert_eq!(broadcaster.publish("r1", RuleStatus::Idle, None).timestamp, 11_000);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let clock = Arc::new(ManualClock::new(1));
        let broadcaster = StatusBroadcaster::with_capacity(clock, 2);
        let mut slow = broadcaster.subscribe();

        for i in 0..5 {
            broadcaster.publish(&format!("r{}", i), RuleStatus::InUse, None);
        }

        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(slow.recv().await.unwrap().rule_id, "r3");
        assert_eq!(slow.recv().await.unwrap().rule_id, "r4");
    }
}
