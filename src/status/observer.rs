//! Observer side of the status channel: one shared, ref-counted connection.
//!
//! [`StatusConnectionManager::subscribe`] hands out [`StatusSubscription`]
//! guards. The first subscriber opens the physical connection; dropping the
//! last one closes it with [`NORMAL_CLOSE`] and cancels every timer that
//! belongs to it.
//!
//! Lifecycle of the connection:
//! - **Disconnected**: no link; either idle or waiting to reconnect
//! - **Connecting**: a connect attempt is in flight
//! - **Connected**: frames flow, a ping goes out every [`HEARTBEAT_INTERVAL`]
//!
//! Any close other than [`NORMAL_CLOSE`] (including a failed connect or a
//! link that vanished without a close frame) schedules one reconnect after
//! [`RECONNECT_DELAY`].

use dashmap::DashMap;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::event::{ClientFrame, RuleStatus, RuleStatusEvent, ServerFrame, NORMAL_CLOSE};

/// Interval between heartbeat pings while connected.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30_000);

/// Delay before reconnecting after an abnormal close.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(5_000);

/// Interval of the stale-entry sweep.
pub const STALE_SWEEP_INTERVAL: Duration = Duration::from_millis(10_000);

/// Age after which an `in_use` entry without news is downgraded to idle.
pub const STALE_AFTER: Duration = Duration::from_millis(60_000);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Observer-side errors.
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    #[error("Failed to connect to status channel: {0}")]
    Connect(String),
}

/// Frame received from the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    /// The link closed. `None` means no close frame was received.
    Closed(Option<u16>),
}

/// Frame to send over the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close(u16),
}

/// One physical connection, as a pair of channels.
pub struct ChannelLink {
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub inbound: mpsc::Receiver<InboundFrame>,
}

/// Opens physical connections to the status channel.
pub trait StatusConnector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<ChannelLink, ObserverError>>;
}

/// Locally cached state of one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRuleStatus {
    pub status: RuleStatus,
    pub total_tokens_used: Option<u64>,
    pub total_requests_used: Option<u64>,
    /// Server timestamp of the last applied event.
    pub timestamp: i64,
    /// Local receipt time of the last update.
    pub last_update: Instant,
}

/// Per-rule status cache fed by received events.
#[derive(Debug, Default)]
pub struct RuleStatusCache {
    entries: DashMap<String, CachedRuleStatus>,
}

impl RuleStatusCache {
    /// Apply an event received at `now`. Events older than the cached one
    /// are ignored; absent usage fields keep their previous values.
    pub fn apply(&self, event: RuleStatusEvent, now: Instant) {
        let mut entry = self
            .entries
            .entry(event.rule_id)
            .or_insert_with(|| CachedRuleStatus {
                status: RuleStatus::Idle,
                total_tokens_used: None,
                total_requests_used: None,
                timestamp: i64::MIN,
                last_update: now,
            });

        if event.timestamp < entry.timestamp {
            return;
        }
        entry.status = event.status;
        entry.total_tokens_used = event.total_tokens_used.or(entry.total_tokens_used);
        entry.total_requests_used = event.total_requests_used.or(entry.total_requests_used);
        entry.timestamp = event.timestamp;
        entry.last_update = now;
    }

    /// Downgrade `in_use` entries not updated for longer than [`STALE_AFTER`].
    /// Returns the ids that changed.
    pub fn sweep_stale(&self, now: Instant) -> Vec<String> {
        let mut downgraded = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if entry.status == RuleStatus::InUse
                && now.saturating_duration_since(entry.last_update) > STALE_AFTER
            {
                entry.status = RuleStatus::Idle;
                downgraded.push(entry.key().clone());
            }
        }
        downgraded
    }

    pub fn get(&self, rule_id: &str) -> Option<CachedRuleStatus> {
        self.entries.get(rule_id).map(|e| e.value().clone())
    }

    pub fn snapshot(&self) -> HashMap<String, CachedRuleStatus> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

/// Shared connection manager. Clone freely; all clones share one connection.
#[derive(Clone)]
pub struct StatusConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    connector: Arc<dyn StatusConnector>,
    cache: RuleStatusCache,
    state_tx: watch::Sender<ConnectionState>,
    /// Bumped on every open/teardown; stale tasks stop touching state.
    generation: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Default)]
struct Lifecycle {
    subscribers: usize,
    active: Option<ActiveConnection>,
}

/// Tasks and link owned by the open connection.
struct ActiveConnection {
    driver: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    outbound: Arc<Mutex<Option<mpsc::Sender<OutboundFrame>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StatusConnectionManager {
    pub fn new(connector: Arc<dyn StatusConnector>) -> Self {
        let (state_tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                cache: RuleStatusCache::default(),
                state_tx,
                generation: AtomicU64::new(0),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// Attach a logical observer. Must be called within a Tokio runtime.
    pub fn subscribe(&self) -> StatusSubscription {
        let mut lifecycle = lock(&self.inner.lifecycle);
        lifecycle.subscribers += 1;
        if lifecycle.subscribers == 1 {
            lifecycle.active = Some(self.inner.open());
        }
        tracing::debug!(subscribers = lifecycle.subscribers, "Status observer subscribed");

        StatusSubscription {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.lifecycle).subscribers
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn rule_status(&self, rule_id: &str) -> Option<CachedRuleStatus> {
        self.inner.cache.get(rule_id)
    }

    pub fn snapshot(&self) -> HashMap<String, CachedRuleStatus> {
        self.inner.cache.snapshot()
    }
}

impl ManagerInner {
    fn open(self: &Arc<Self>) -> ActiveConnection {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let outbound = Arc::new(Mutex::new(None));

        let driver = tokio::spawn(drive(Arc::clone(self), generation, Arc::clone(&outbound)));
        let sweeper = tokio::spawn(sweep_loop(Arc::clone(self)));

        ActiveConnection {
            driver,
            sweeper,
            outbound,
        }
    }

    fn release(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        lifecycle.subscribers = lifecycle.subscribers.saturating_sub(1);
        tracing::debug!(subscribers = lifecycle.subscribers, "Status observer unsubscribed");
        if lifecycle.subscribers > 0 {
            return;
        }

        let Some(active) = lifecycle.active.take() else {
            return;
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        active.driver.abort();
        active.sweeper.abort();
        if let Some(outbound) = lock(&active.outbound).take() {
            // Queued ahead of the sender drop, so the link sees it first.
            let _ = outbound.try_send(OutboundFrame::Close(NORMAL_CLOSE));
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        tracing::info!("Status channel closed: last observer left");
    }

    fn set_state(&self, generation: u64, state: ConnectionState) {
        if self.generation.load(Ordering::SeqCst) == generation {
            self.state_tx.send_replace(state);
        }
    }

    fn handle_text(&self, text: &str) {
        match serde_json::from_str::<ServerFrame>(text) {
            Ok(ServerFrame::RuleStatus(event)) => self.cache.apply(event, Instant::now()),
            Err(e) => {
                tracing::warn!(error = %e, frame = %text, "Dropping malformed status frame");
            }
        }
    }
}

/// Connect, serve, and reconnect after abnormal closes until aborted.
async fn drive(
    inner: Arc<ManagerInner>,
    generation: u64,
    slot: Arc<Mutex<Option<mpsc::Sender<OutboundFrame>>>>,
) {
    loop {
        inner.set_state(generation, ConnectionState::Connecting);

        match inner.connector.connect().await {
            Ok(link) => {
                *lock(&slot) = Some(link.outbound.clone());
                inner.set_state(generation, ConnectionState::Connected);
                tracing::info!("Status channel connected");

                let code = serve_link(&inner, link).await;
                lock(&slot).take();
                inner.set_state(generation, ConnectionState::Disconnected);

                if code == Some(NORMAL_CLOSE) {
                    tracing::info!("Status channel closed normally");
                    return;
                }
                tracing::warn!(
                    code = ?code,
                    delay_ms = RECONNECT_DELAY.as_millis() as u64,
                    "Status channel closed abnormally, reconnecting"
                );
            }
            Err(e) => {
                inner.set_state(generation, ConnectionState::Disconnected);
                tracing::warn!(
                    error = %e,
                    delay_ms = RECONNECT_DELAY.as_millis() as u64,
                    "Status channel connect failed, reconnecting"
                );
            }
        }

        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Pump one link until it closes. Returns the close code, if any.
async fn serve_link(inner: &ManagerInner, mut link: ChannelLink) -> Option<u16> {
    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    let ping = serde_json::to_string(&ClientFrame::Ping).unwrap_or_default();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if link.outbound.send(OutboundFrame::Text(ping.clone())).await.is_err() {
                    return None;
                }
            }
            frame = link.inbound.recv() => match frame {
                Some(InboundFrame::Text(text)) => inner.handle_text(&text),
                Some(InboundFrame::Closed(code)) => return code,
                None => return None,
            }
        }
    }
}

async fn sweep_loop(inner: Arc<ManagerInner>) {
    let mut ticker =
        tokio::time::interval_at(Instant::now() + STALE_SWEEP_INTERVAL, STALE_SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let downgraded = inner.cache.sweep_stale(Instant::now());
        if !downgraded.is_empty() {
            tracing::debug!(rules = ?downgraded, "Stale in_use entries downgraded to idle");
        }
    }
}

/// A logical observer. Dropping it unsubscribes.
pub struct StatusSubscription {
    inner: Arc<ManagerInner>,
}

impl StatusSubscription {
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn rule_status(&self, rule_id: &str) -> Option<CachedRuleStatus> {
        self.inner.cache.get(rule_id)
    }

    pub fn snapshot(&self) -> HashMap<String, CachedRuleStatus> {
        self.inner.cache.snapshot()
    }

    /// Explicit form of dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        self.inner.release();
    }
}
