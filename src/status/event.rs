//! Wire frames of the rule status channel.

use serde::{Deserialize, Serialize};

use crate::budget::RuleUsage;

/// Path of the status channel endpoint.
pub const STATUS_CHANNEL_PATH: &str = "/api/rules/status";

/// Close code of an intentional shutdown. Any other code is abnormal.
pub const NORMAL_CLOSE: u16 = 1000;

/// Activity state of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    InUse,
    Idle,
}

/// Rule activity broadcast to observers. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleStatusEvent {
    pub rule_id: String,
    pub status: RuleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_requests_used: Option<u64>,
    /// Epoch ms, non-decreasing per rule.
    pub timestamp: i64,
}

impl RuleStatusEvent {
    pub fn new(rule_id: &str, status: RuleStatus, usage: Option<RuleUsage>, timestamp: i64) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            status,
            total_tokens_used: usage.map(|u| u.total_tokens_used),
            total_requests_used: usage.map(|u| u.total_requests_used),
            timestamp,
        }
    }
}

/// Server → observer frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    RuleStatus(RuleStatusEvent),
}

/// Observer → server frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
}
