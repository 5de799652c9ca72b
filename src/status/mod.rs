//! Rule status channel.
//!
//! The server publishes `in_use`/`idle` events through a
//! [`StatusBroadcaster`]; observers attach through a shared
//! [`StatusConnectionManager`].

mod broadcaster;
mod event;
mod observer;
mod ws_connector;

pub use broadcaster::{StatusBroadcaster, STATUS_CHANNEL_CAPACITY};
pub use event::{
    ClientFrame, RuleStatus, RuleStatusEvent, ServerFrame, NORMAL_CLOSE, STATUS_CHANNEL_PATH,
};
pub use observer::{
    CachedRuleStatus, ChannelLink, ConnectionState, InboundFrame, ObserverError, OutboundFrame,
    RuleStatusCache, StatusConnectionManager, StatusConnector, StatusSubscription,
    HEARTBEAT_INTERVAL, RECONNECT_DELAY, STALE_AFTER, STALE_SWEEP_INTERVAL,
};
pub use ws_connector::WsConnector;
