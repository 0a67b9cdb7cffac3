use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;

use futures_util::Stream;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use nest_types::events::{
    ChangeBinding, ChannelStatus, PresenceMessage, PresenceMeta, PresenceSnapshot, RealtimeMessage,
    RowChange,
};

use crate::error::RealtimeError;
use crate::hub::{Hub, TopicMessage};

/// What a channel listens to.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub topic: String,
    pub bindings: Vec<ChangeBinding>,
    /// Deliver presence sync/join/leave messages.
    pub presence: bool,
    /// Deliver this channel's own broadcasts back to it.
    pub self_broadcast: bool,
}

impl ChannelConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            bindings: Vec::new(),
            presence: false,
            self_broadcast: false,
        }
    }

    pub fn with_binding(mut self, binding: ChangeBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn with_bindings(mut self, bindings: impl IntoIterator<Item = ChangeBinding>) -> Self {
        self.bindings.extend(bindings);
        self
    }

    pub fn with_presence(mut self) -> Self {
        self.presence = true;
        self
    }

    pub fn with_self_broadcast(mut self) -> Self {
        self.self_broadcast = true;
        self
    }
}

/// Non-owning handle to an open channel. Clones can be moved into dispatch
/// tasks; they stop working once the owning [`Channel`] is dropped.
#[derive(Clone)]
pub struct ChannelHandle {
    hub: Hub,
    id: Uuid,
    topic: Arc<str>,
}

impl ChannelHandle {
    pub(crate) fn new(hub: Hub, id: Uuid, topic: &str) -> Self {
        Self {
            hub,
            id,
            topic: Arc::from(topic),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_open(&self) -> bool {
        self.hub.is_open(self.id)
    }

    pub fn broadcast(&self, event: &str, payload: Value) -> Result<usize, RealtimeError> {
        self.hub.broadcast(self.id, event, payload)
    }

    pub fn track(&self, key: &str) -> Result<PresenceMeta, RealtimeError> {
        self.hub.track(self.id, key)
    }

    pub fn untrack(&self) -> Result<bool, RealtimeError> {
        self.hub.untrack(self.id)
    }

    pub fn presence_state(&self) -> PresenceSnapshot {
        self.hub.presence_state(&self.topic)
    }
}

/// Owning handle of a channel registration; dropping it releases the
/// registration, untracks presence and ends the paired [`ChannelEvents`].
pub struct Channel {
    handle: ChannelHandle,
}

impl Channel {
    pub(crate) fn new(handle: ChannelHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }
}

impl Deref for Channel {
    type Target = ChannelHandle;

    fn deref(&self) -> &ChannelHandle {
        &self.handle
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.handle.hub.release(self.handle.id) {
            debug!("channel {} on {} released", self.handle.id, self.handle.topic);
        }
    }
}

enum Incoming {
    Topic(Result<TopicMessage, RecvError>),
    Change(Result<Arc<RowChange>, RecvError>),
}

/// The typed event sequence of one channel, consumed by a single dispatch
/// loop. Starts with `Status(Subscribed)` (and a presence `Sync` snapshot
/// when presence is enabled) and ends once the channel is released.
pub struct ChannelEvents {
    id: Uuid,
    topic: Arc<str>,
    bindings: Vec<ChangeBinding>,
    presence: bool,
    self_broadcast: bool,
    topic_rx: broadcast::Receiver<TopicMessage>,
    changes_rx: Option<broadcast::Receiver<Arc<RowChange>>>,
    cancel: CancellationToken,
    pending: VecDeque<RealtimeMessage>,
}

impl ChannelEvents {
    pub(crate) fn new(
        id: Uuid,
        config: ChannelConfig,
        topic_rx: broadcast::Receiver<TopicMessage>,
        changes_rx: Option<broadcast::Receiver<Arc<RowChange>>>,
        cancel: CancellationToken,
        snapshot: Option<PresenceSnapshot>,
    ) -> Self {
        let mut pending = VecDeque::new();
        pending.push_back(RealtimeMessage::Status(ChannelStatus::Subscribed));
        if let Some(state) = snapshot {
            pending.push_back(RealtimeMessage::Presence(PresenceMessage::Sync { state }));
        }

        Self {
            id,
            topic: Arc::from(config.topic.trim()),
            bindings: config.bindings,
            presence: config.presence,
            self_broadcast: config.self_broadcast,
            topic_rx,
            changes_rx,
            cancel,
            pending,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event, or `None` once the channel has been released.
    pub async fn next(&mut self) -> Option<RealtimeMessage> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(message);
            }

            let incoming = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                result = self.topic_rx.recv() => Incoming::Topic(result),
                result = recv_change(&mut self.changes_rx) => Incoming::Change(result),
            };

            match incoming {
                Incoming::Topic(Ok(msg)) => {
                    if let Some(message) = self.accept(msg) {
                        return Some(message);
                    }
                }
                Incoming::Topic(Err(RecvError::Lagged(n))) => {
                    warn!("channel {} on {} lagged by {} messages", self.id, self.topic, n);
                }
                Incoming::Topic(Err(RecvError::Closed)) => return None,
                Incoming::Change(Ok(change)) => {
                    if self.bindings.iter().any(|b| b.matches(&change)) {
                        return Some(RealtimeMessage::RowChange(change.as_ref().clone()));
                    }
                }
                Incoming::Change(Err(RecvError::Lagged(n))) => {
                    warn!("channel {} on {} missed {} row changes", self.id, self.topic, n);
                }
                Incoming::Change(Err(RecvError::Closed)) => self.changes_rx = None,
            }
        }
    }

    fn accept(&self, msg: TopicMessage) -> Option<RealtimeMessage> {
        let keep = match &msg.message {
            RealtimeMessage::Broadcast(_) => msg.from != self.id || self.self_broadcast,
            RealtimeMessage::Presence(_) => self.presence,
            _ => true,
        };
        keep.then_some(msg.message)
    }

    /// Lazy stream view of the same sequence.
    pub fn into_stream(mut self) -> impl Stream<Item = RealtimeMessage> + Send {
        async_stream::stream! {
            while let Some(message) = self.next().await {
                yield message;
            }
        }
    }
}

async fn recv_change(
    rx: &mut Option<broadcast::Receiver<Arc<RowChange>>>,
) -> Result<Arc<RowChange>, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
