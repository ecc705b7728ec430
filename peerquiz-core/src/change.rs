//! Backend Change-Feed Types
//!
//! The backend store publishes a per-table notification for every row
//! mutation. The bridge turns each notification into a transient
//! [`ChangeEvent`] that is broadcast once and never stored.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::protocol::ServerMessage;

/// Row mutation kind, as the backend feed spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "INSERT",
            ChangeOp::Update => "UPDATE",
            ChangeOp::Delete => "DELETE",
        }
    }
}

/// One notification as received from the backend change feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNotification {
    #[serde(rename = "eventType")]
    pub event_type: ChangeOp,
    pub table: String,
    /// Row state before the mutation (deletes and updates).
    #[serde(default)]
    pub old: Option<JsonValue>,
    /// Row state after the mutation (inserts and updates).
    #[serde(default)]
    pub new: Option<JsonValue>,
}

/// A change ready for fanout, tagged with the topic clients filter on.
///
/// Transient: constructed per notification, serialized once by the
/// fanout, then dropped.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub table: String,
    pub row: JsonValue,
}

impl ChangeEvent {
    /// Pick the relevant row image: the new state when one exists,
    /// otherwise the old state (deletes).
    pub fn from_notification(notification: ChangeNotification) -> Self {
        let row = notification
            .new
            .or(notification.old)
            .unwrap_or(JsonValue::Null);
        Self {
            op: notification.event_type,
            table: notification.table,
            row,
        }
    }

    /// The topic broadcast subscribers filter on. Coarse by design:
    /// the table name, not the row's natural key.
    pub fn topic(&self) -> &str {
        &self.table
    }

    /// Wire message for connected clients.
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::RealtimeUpdate {
            event: self.op.as_str().to_string(),
            data: self.row.clone(),
            table: self.table.clone(),
            timestamp: Utc::now(),
        }
    }
}
