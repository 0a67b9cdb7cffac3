use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::filter::RowFilter;

/// Kind of row change emitted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Which change kinds a binding listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangeFilter {
    #[serde(rename = "*")]
    All,
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl ChangeFilter {
    pub fn accepts(self, kind: ChangeKind) -> bool {
        matches!(
            (self, kind),
            (ChangeFilter::All, _)
                | (ChangeFilter::Insert, ChangeKind::Insert)
                | (ChangeFilter::Update, ChangeKind::Update)
                | (ChangeFilter::Delete, ChangeKind::Delete)
        )
    }
}

/// A row-change event as delivered by the realtime transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowChange {
    pub event_type: ChangeKind,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
    pub commit_timestamp: DateTime<Utc>,
}

impl RowChange {
    pub fn insert(table: impl Into<String>, new: Value) -> Self {
        Self::build(ChangeKind::Insert, table, Some(new), None)
    }

    pub fn update(table: impl Into<String>, new: Value) -> Self {
        Self::build(ChangeKind::Update, table, Some(new), None)
    }

    pub fn delete(table: impl Into<String>, old: Value) -> Self {
        Self::build(ChangeKind::Delete, table, None, Some(old))
    }

    fn build(kind: ChangeKind, table: impl Into<String>, new: Option<Value>, old: Option<Value>) -> Self {
        Self {
            event_type: kind,
            schema: DEFAULT_SCHEMA.to_string(),
            table: table.into(),
            new,
            old,
            commit_timestamp: Utc::now(),
        }
    }

    /// The row a filter should be evaluated against: the new row, or the old
    /// one for deletes.
    pub fn record(&self) -> Option<&Value> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

pub const DEFAULT_SCHEMA: &str = "public";

/// A row-change listener: table, change kinds and an optional row filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeBinding {
    pub event: ChangeFilter,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub filter: Option<RowFilter>,
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

impl ChangeBinding {
    pub fn new(table: impl Into<String>, event: ChangeFilter) -> Self {
        Self {
            event,
            schema: default_schema(),
            table: table.into(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn matches(&self, change: &RowChange) -> bool {
        if change.schema != self.schema || change.table != self.table {
            return false;
        }
        if !self.event.accepts(change.event_type) {
            return false;
        }
        match &self.filter {
            Some(filter) => change.record().is_some_and(|row| filter.matches(row)),
            None => true,
        }
    }
}

/// Ephemeral signal sent over a channel (typing state and the like).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: String,
    pub payload: Value,
}

/// One presence entry for a key. A key is online while it has at least one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub presence_ref: Uuid,
    pub online_at: DateTime<Utc>,
}

/// Authoritative presence state of a topic: key -> entries.
pub type PresenceSnapshot = HashMap<String, Vec<PresenceMeta>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum PresenceMessage {
    Sync { state: PresenceSnapshot },
    Join { key: String, meta: PresenceMeta },
    Leave { key: String, meta: PresenceMeta },
}

/// Lifecycle status of a channel subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChannelStatus {
    Subscribed,
    Closed,
    ChannelError { message: String },
}

/// Everything a channel can yield to its consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RealtimeMessage {
    RowChange(RowChange),
    Broadcast(BroadcastMessage),
    Presence(PresenceMessage),
    Status(ChannelStatus),
}

/// Events sent FROM server TO client over the websocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Connection authenticated
    Ready { user_id: Uuid, username: String },

    /// A topic join succeeded
    Joined { topic: String },

    /// A topic was left (explicitly or because the channel closed)
    Left { topic: String },

    /// A realtime message on a joined topic
    Message { topic: String, message: RealtimeMessage },

    /// A command failed
    Error {
        topic: Option<String>,
        message: String,
    },
}

/// Commands sent FROM client TO server over the websocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Open a channel on a topic with optional row-change bindings.
    Join {
        topic: String,
        #[serde(default)]
        changes: Vec<ChangeBinding>,
        #[serde(default)]
        presence: bool,
        #[serde(default)]
        self_broadcast: bool,
    },

    /// Release the channel on a topic
    Leave { topic: String },

    /// Send an ephemeral broadcast on a joined topic
    Broadcast {
        topic: String,
        event: String,
        payload: Value,
    },

    /// Track this connection's user in the topic's presence
    Track { topic: String },

    /// Stop tracking presence on a topic
    Untrack { topic: String },
}
