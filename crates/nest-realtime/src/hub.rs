use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use nest_types::events::{
    BroadcastMessage, PresenceMessage, PresenceMeta, PresenceSnapshot, RealtimeMessage, RowChange,
};

use crate::channel::{Channel, ChannelConfig, ChannelEvents, ChannelHandle};
use crate::error::RealtimeError;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-topic broadcast buffer (broadcast + presence messages).
    pub topic_capacity: usize,
    /// Buffer of the shared row-change feed.
    pub change_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            topic_capacity: 256,
            change_capacity: 1024,
        }
    }
}

/// A message on a topic, stamped with the channel that produced it.
#[derive(Debug, Clone)]
pub(crate) struct TopicMessage {
    pub from: Uuid,
    pub message: RealtimeMessage,
}

/// In-process realtime transport.
///
/// Row changes go out on one shared feed and every channel filters them
/// against its own bindings. Broadcast and presence messages are scoped to a
/// topic. Every open channel holds a registration here until its [`Channel`]
/// handle is dropped.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: HubConfig,
    changes_tx: broadcast::Sender<Arc<RowChange>>,
    state: Mutex<HubState>,
    closed: AtomicBool,
}

#[derive(Default)]
struct HubState {
    topics: HashMap<String, Topic>,
    /// channel_id -> registration
    channels: HashMap<Uuid, Registration>,
}

struct Topic {
    tx: broadcast::Sender<TopicMessage>,
    presence: PresenceSnapshot,
    members: usize,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            presence: PresenceSnapshot::new(),
            members: 0,
        }
    }

    fn send(&self, from: Uuid, message: RealtimeMessage) -> usize {
        self.tx.send(TopicMessage { from, message }).unwrap_or(0)
    }
}

struct Registration {
    topic: String,
    presence_key: Option<String>,
    cancel: CancellationToken,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        let (changes_tx, _) = broadcast::channel(config.change_capacity);
        Self {
            inner: Arc::new(HubInner {
                config,
                changes_tx,
                state: Mutex::new(HubState::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a channel. Returns the owning handle (releases on drop) and the
    /// event sequence for the consumer's dispatch loop.
    pub fn open(&self, config: ChannelConfig) -> Result<(Channel, ChannelEvents), RealtimeError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RealtimeError::TransportClosed);
        }
        let topic = config.topic.trim().to_string();
        if topic.is_empty() {
            return Err(RealtimeError::InvalidTopic(config.topic));
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let (topic_rx, snapshot) = {
            let mut state = self.state();
            let capacity = self.inner.config.topic_capacity;
            let entry = state
                .topics
                .entry(topic.clone())
                .or_insert_with(|| Topic::new(capacity));
            entry.members += 1;
            let rx = entry.tx.subscribe();
            let snapshot = config.presence.then(|| entry.presence.clone());

            state.channels.insert(
                id,
                Registration {
                    topic: topic.clone(),
                    presence_key: None,
                    cancel: cancel.clone(),
                },
            );
            (rx, snapshot)
        };

        let changes_rx = (!config.bindings.is_empty()).then(|| self.inner.changes_tx.subscribe());

        debug!(
            "channel {} opened on {} ({} bindings, presence={})",
            id,
            topic,
            config.bindings.len(),
            config.presence
        );

        let events = ChannelEvents::new(id, config, topic_rx, changes_rx, cancel, snapshot);
        let channel = Channel::new(ChannelHandle::new(self.clone(), id, &topic));
        Ok((channel, events))
    }

    /// Drop a channel's registration: untrack its presence, end its event
    /// sequence and forget the topic once nobody is on it. Returns `false`
    /// when the channel was already released.
    pub(crate) fn release(&self, id: Uuid) -> bool {
        let mut state = self.state();
        let Some(registration) = state.channels.remove(&id) else {
            return false;
        };
        registration.cancel.cancel();

        let mut empty = false;
        if let Some(topic) = state.topics.get_mut(&registration.topic) {
            if let Some(key) = registration.presence_key {
                if let Some(meta) = remove_meta(&mut topic.presence, &key, id) {
                    topic.send(id, RealtimeMessage::Presence(PresenceMessage::Leave { key, meta }));
                }
            }
            topic.members = topic.members.saturating_sub(1);
            empty = topic.members == 0;
        }
        if empty {
            state.topics.remove(&registration.topic);
        }
        true
    }

    /// Track `key` in the channel's topic presence. Re-tracking replaces the
    /// channel's previous entry.
    pub(crate) fn track(&self, id: Uuid, key: &str) -> Result<PresenceMeta, RealtimeError> {
        let mut state = self.state();
        let (topic_name, previous) = {
            let registration = state
                .channels
                .get_mut(&id)
                .ok_or(RealtimeError::ChannelReleased(id))?;
            let previous = registration.presence_key.replace(key.to_string());
            (registration.topic.clone(), previous)
        };
        let topic = state
            .topics
            .get_mut(&topic_name)
            .ok_or(RealtimeError::ChannelReleased(id))?;

        if let Some(previous) = previous.filter(|p| p != key) {
            if let Some(meta) = remove_meta(&mut topic.presence, &previous, id) {
                topic.send(
                    id,
                    RealtimeMessage::Presence(PresenceMessage::Leave { key: previous, meta }),
                );
            }
        }

        let meta = PresenceMeta {
            presence_ref: id,
            online_at: Utc::now(),
        };
        let metas = topic.presence.entry(key.to_string()).or_default();
        metas.retain(|m| m.presence_ref != id);
        metas.push(meta.clone());

        topic.send(
            id,
            RealtimeMessage::Presence(PresenceMessage::Join {
                key: key.to_string(),
                meta: meta.clone(),
            }),
        );
        Ok(meta)
    }

    /// Remove the channel's presence entry. Returns whether anything was tracked.
    pub(crate) fn untrack(&self, id: Uuid) -> Result<bool, RealtimeError> {
        let mut state = self.state();
        let (topic_name, key) = {
            let registration = state
                .channels
                .get_mut(&id)
                .ok_or(RealtimeError::ChannelReleased(id))?;
            (registration.topic.clone(), registration.presence_key.take())
        };
        let Some(key) = key else {
            return Ok(false);
        };
        let Some(topic) = state.topics.get_mut(&topic_name) else {
            return Ok(false);
        };
        match remove_meta(&mut topic.presence, &key, id) {
            Some(meta) => {
                topic.send(id, RealtimeMessage::Presence(PresenceMessage::Leave { key, meta }));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Send an ephemeral broadcast on the channel's topic. Returns the number
    /// of receivers it reached.
    pub(crate) fn broadcast(&self, id: Uuid, event: &str, payload: Value) -> Result<usize, RealtimeError> {
        let state = self.state();
        let topic = state
            .channels
            .get(&id)
            .and_then(|registration| state.topics.get(&registration.topic))
            .ok_or(RealtimeError::ChannelReleased(id))?;

        Ok(topic.send(
            id,
            RealtimeMessage::Broadcast(BroadcastMessage {
                event: event.to_string(),
                payload,
            }),
        ))
    }

    pub(crate) fn is_open(&self, id: Uuid) -> bool {
        self.state().channels.contains_key(&id)
    }

    /// Publish a row change to every channel with a matching binding.
    ///
    /// Returns the number of change subscribers it was handed to: every open
    /// channel with at least one binding. Each channel filters on its own
    /// bindings afterwards, so this is not the number of matches.
    pub fn publish_change(&self, change: RowChange) -> usize {
        if self.inner.closed.load(Ordering::Acquire) {
            return 0;
        }
        debug!(
            "row change {:?} on {}.{}",
            change.event_type, change.schema, change.table
        );
        self.inner.changes_tx.send(Arc::new(change)).unwrap_or(0)
    }

    /// Current presence state of a topic.
    pub fn presence_state(&self, topic: &str) -> PresenceSnapshot {
        self.state()
            .topics
            .get(topic)
            .map(|t| t.presence.clone())
            .unwrap_or_default()
    }

    /// Number of open channel registrations across all topics.
    pub fn active_channels(&self) -> usize {
        self.state().channels.len()
    }

    /// Number of open channels on one topic.
    pub fn topic_members(&self, topic: &str) -> usize {
        self.state().topics.get(topic).map_or(0, |t| t.members)
    }

    /// Refuse new channels and end every open channel's event sequence.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let state = self.state();
        for registration in state.channels.values() {
            registration.cancel.cancel();
        }
        info!("Realtime hub shut down ({} channels open)", state.channels.len());
    }
}

fn remove_meta(presence: &mut PresenceSnapshot, key: &str, id: Uuid) -> Option<PresenceMeta> {
    let metas = presence.get_mut(key)?;
    let pos = metas.iter().position(|m| m.presence_ref == id)?;
    let meta = metas.remove(pos);
    if metas.is_empty() {
        presence.remove(key);
    }
    Some(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nest_types::events::{ChangeBinding, ChangeFilter, ChannelStatus};
    use nest_types::filter::RowFilter;
    use serde_json::json;

    #[tokio::test]
    async fn open_and_drop_leaves_no_registrations() {
        let hub = Hub::default();
        let (channel, mut events) = hub.open(ChannelConfig::new("room:1")).unwrap();
        assert_eq!(hub.active_channels(), 1);
        assert_eq!(hub.topic_members("room:1"), 1);
        assert_eq!(
            events.next().await,
            Some(RealtimeMessage::Status(ChannelStatus::Subscribed))
        );

        drop(channel);
        assert_eq!(hub.active_channels(), 0);
        assert_eq!(hub.topic_members("room:1"), 0);
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn rejects_blank_topic_and_closed_hub() {
        let hub = Hub::default();
        assert!(matches!(
            hub.open(ChannelConfig::new("  ")),
            Err(RealtimeError::InvalidTopic(_))
        ));

        hub.shutdown();
        assert!(matches!(
            hub.open(ChannelConfig::new("room")),
            Err(RealtimeError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn broadcasts_skip_sender_unless_requested() {
        let hub = Hub::default();
        let (a, mut a_events) = hub.open(ChannelConfig::new("room")).unwrap();
        let (_b, mut b_events) = hub.open(ChannelConfig::new("room")).unwrap();
        let (c, mut c_events) = hub
            .open(ChannelConfig::new("room").with_self_broadcast())
            .unwrap();
        for events in [&mut a_events, &mut b_events, &mut c_events] {
            events.next().await; // Subscribed
        }

        a.broadcast("ping", json!({ "n": 1 })).unwrap();
        c.broadcast("pong", json!({})).unwrap();

        match b_events.next().await {
            Some(RealtimeMessage::Broadcast(msg)) => assert_eq!(msg.event, "ping"),
            other => panic!("unexpected {other:?}"),
        }
        match c_events.next().await {
            Some(RealtimeMessage::Broadcast(msg)) => assert_eq!(msg.event, "ping"),
            other => panic!("unexpected {other:?}"),
        }
        // c asked for its own broadcasts back
        match c_events.next().await {
            Some(RealtimeMessage::Broadcast(msg)) => assert_eq!(msg.event, "pong"),
            other => panic!("unexpected {other:?}"),
        }
        // a only sees c's pong, never its own ping
        match a_events.next().await {
            Some(RealtimeMessage::Broadcast(msg)) => assert_eq!(msg.event, "pong"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn row_changes_are_filtered_per_binding() {
        let hub = Hub::default();
        let binding = ChangeBinding::new("notifications", ChangeFilter::Insert)
            .with_filter(RowFilter::eq("user_id", "u1"));
        let (_channel, mut events) = hub
            .open(ChannelConfig::new("notifications:u1").with_binding(binding))
            .unwrap();
        events.next().await; // Subscribed

        hub.publish_change(RowChange::insert("notifications", json!({ "user_id": "u2" })));
        hub.publish_change(RowChange::insert("notifications", json!({ "user_id": "u1", "id": 7 })));

        match events.next().await {
            Some(RealtimeMessage::RowChange(change)) => {
                assert_eq!(change.new.unwrap()["id"], 7);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_counts_change_subscribers_not_matches() {
        let hub = Hub::default();
        let (_orders, _) = hub
            .open(ChannelConfig::new("a").with_bindings([ChangeBinding::new("orders", ChangeFilter::All)]))
            .unwrap();
        let (_questions, _) = hub
            .open(ChannelConfig::new("b").with_bindings([ChangeBinding::new("questions", ChangeFilter::All)]))
            .unwrap();
        let (_chat, _) = hub.open(ChannelConfig::new("c")).unwrap();

        assert_eq!(hub.publish_change(RowChange::insert("orders", json!({ "id": 1 }))), 2);
    }

    #[tokio::test]
    async fn release_untracks_presence() {
        let hub = Hub::default();
        let (watcher, mut watcher_events) = hub
            .open(ChannelConfig::new("online").with_presence())
            .unwrap();
        let (peer, _peer_events) = hub.open(ChannelConfig::new("online").with_presence()).unwrap();

        assert_eq!(
            watcher_events.next().await,
            Some(RealtimeMessage::Status(ChannelStatus::Subscribed))
        );
        assert!(matches!(
            watcher_events.next().await,
            Some(RealtimeMessage::Presence(PresenceMessage::Sync { .. }))
        ));

        peer.track("bob").unwrap();
        assert!(hub.presence_state("online").contains_key("bob"));
        assert!(matches!(
            watcher_events.next().await,
            Some(RealtimeMessage::Presence(PresenceMessage::Join { key, .. })) if key == "bob"
        ));

        drop(peer);
        assert!(!hub.presence_state("online").contains_key("bob"));
        assert!(matches!(
            watcher_events.next().await,
            Some(RealtimeMessage::Presence(PresenceMessage::Leave { key, .. })) if key == "bob"
        ));
        drop(watcher);
        assert_eq!(hub.active_channels(), 0);
    }

    #[tokio::test]
    async fn operations_on_released_channel_fail() {
        let hub = Hub::default();
        let (channel, _events) = hub.open(ChannelConfig::new("room")).unwrap();
        let handle = channel.handle();
        drop(channel);
        assert!(!handle.is_open());
        assert!(matches!(
            handle.broadcast("x", json!({})),
            Err(RealtimeError::ChannelReleased(_))
        ));
        assert!(matches!(handle.track("k"), Err(RealtimeError::ChannelReleased(_))));
    }
}
