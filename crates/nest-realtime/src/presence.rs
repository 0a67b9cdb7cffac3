use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use nest_types::events::{ChannelStatus, PresenceMessage, PresenceSnapshot, RealtimeMessage};

use crate::channel::{Channel, ChannelConfig, ChannelEvents, ChannelHandle};
use crate::error::RealtimeError;
use crate::hub::Hub;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Disconnected,
    Subscribing,
    Synced,
}

/// Client-side view of a topic's presence.
///
/// A key is online while it has at least one entry. `sync` replaces the
/// whole state; `join` and `leave` apply on top of it.
#[derive(Debug, Clone, Default)]
pub struct PresenceSet {
    state: PresenceSnapshot,
    last_seen: HashMap<String, DateTime<Utc>>,
}

impl PresenceSet {
    pub fn apply(&mut self, message: &PresenceMessage) {
        let now = Utc::now();
        match message {
            PresenceMessage::Sync { state } => {
                for key in self.state.keys() {
                    if !state.get(key).is_some_and(|metas| !metas.is_empty()) {
                        self.last_seen.insert(key.clone(), now);
                    }
                }
                self.state = state
                    .iter()
                    .filter(|(_, metas)| !metas.is_empty())
                    .map(|(key, metas)| (key.clone(), metas.clone()))
                    .collect();
            }
            PresenceMessage::Join { key, meta } => {
                let metas = self.state.entry(key.clone()).or_default();
                metas.retain(|m| m.presence_ref != meta.presence_ref);
                metas.push(meta.clone());
            }
            PresenceMessage::Leave { key, meta } => {
                if let Some(metas) = self.state.get_mut(key) {
                    metas.retain(|m| m.presence_ref != meta.presence_ref);
                    if metas.is_empty() {
                        self.state.remove(key);
                        self.last_seen.insert(key.clone(), now);
                    }
                }
            }
        }
    }

    pub fn is_online(&self, key: &str) -> bool {
        self.state.contains_key(key)
    }

    pub fn online_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// When `key` was last seen going offline.
    pub fn last_seen(&self, key: &str) -> Option<DateTime<Utc>> {
        self.last_seen.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

/// Tracks the local user on a presence topic and keeps the set of online
/// users current. Dropping it untracks and releases the channel.
pub struct PresenceTracker {
    channel: Channel,
    user_id: Uuid,
    set: watch::Receiver<PresenceSet>,
    status: watch::Receiver<PresenceStatus>,
    task: JoinHandle<()>,
}

impl PresenceTracker {
    pub fn start(hub: &Hub, topic: &str, user_id: Uuid) -> Result<Self, RealtimeError> {
        let (status_tx, status) = watch::channel(PresenceStatus::Disconnected);
        let (set_tx, set) = watch::channel(PresenceSet::default());

        let (channel, events) = hub.open(ChannelConfig::new(topic).with_presence())?;
        status_tx.send_replace(PresenceStatus::Subscribing);

        let task = tokio::spawn(run(events, channel.handle(), user_id, set_tx, status_tx));
        Ok(Self {
            channel,
            user_id,
            set,
            status,
            task,
        })
    }

    pub fn status(&self) -> PresenceStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<PresenceStatus> {
        self.status.clone()
    }

    /// Change notifications for the online set.
    pub fn watch(&self) -> watch::Receiver<PresenceSet> {
        self.set.clone()
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.set.borrow().is_online(&user_id.to_string())
    }

    pub fn online_users(&self) -> Vec<Uuid> {
        self.set
            .borrow()
            .online_keys()
            .iter()
            .filter_map(|key| key.parse().ok())
            .collect()
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.task.abort();
        if let Ok(true) = self.channel.untrack() {
            debug!("user {} left presence on {}", self.user_id, self.channel.topic());
        }
    }
}

async fn run(
    mut events: ChannelEvents,
    handle: ChannelHandle,
    user_id: Uuid,
    set_tx: watch::Sender<PresenceSet>,
    status_tx: watch::Sender<PresenceStatus>,
) {
    let key = user_id.to_string();
    while let Some(message) = events.next().await {
        match message {
            RealtimeMessage::Presence(presence) => {
                let first_sync = matches!(presence, PresenceMessage::Sync { .. })
                    && *status_tx.borrow() != PresenceStatus::Synced;
                set_tx.send_modify(|set| set.apply(&presence));

                if first_sync {
                    if let Err(e) = handle.track(&key) {
                        warn!("failed to track presence on {}: {}", handle.topic(), e);
                    }
                    status_tx.send_replace(PresenceStatus::Synced);
                }
            }
            RealtimeMessage::Status(ChannelStatus::ChannelError { message }) => {
                warn!("presence channel {} error: {}", handle.topic(), message);
            }
            RealtimeMessage::Status(ChannelStatus::Closed) => break,
            _ => {}
        }
    }
    status_tx.send_replace(PresenceStatus::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use nest_types::events::PresenceMeta;
    use std::time::Duration;

    fn meta(n: u128) -> PresenceMeta {
        PresenceMeta {
            presence_ref: Uuid::from_u128(n),
            online_at: Utc::now(),
        }
    }

    fn join(key: &str, n: u128) -> PresenceMessage {
        PresenceMessage::Join { key: key.into(), meta: meta(n) }
    }

    fn leave(key: &str, n: u128) -> PresenceMessage {
        PresenceMessage::Leave { key: key.into(), meta: meta(n) }
    }

    #[test]
    fn online_while_any_entry_remains() {
        let mut set = PresenceSet::default();
        for msg in [join("ann", 1), join("ann", 2), join("bo", 3), leave("ann", 1)] {
            set.apply(&msg);
        }
        assert_eq!(set.online_keys(), vec!["ann", "bo"]);

        set.apply(&leave("ann", 2));
        assert!(!set.is_online("ann"));
        assert!(set.last_seen("ann").is_some());
        assert_eq!(set.online_keys(), vec!["bo"]);
    }

    #[test]
    fn leave_for_unknown_entry_is_ignored() {
        let mut set = PresenceSet::default();
        set.apply(&join("ann", 1));
        set.apply(&leave("ann", 9));
        set.apply(&leave("zed", 1));
        assert!(set.is_online("ann"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn sync_replaces_state() {
        let mut set = PresenceSet::default();
        set.apply(&join("ann", 1));
        set.apply(&join("bo", 2));

        let mut state = PresenceSnapshot::new();
        state.insert("bo".into(), vec![meta(2)]);
        state.insert("cy".into(), vec![meta(3)]);
        state.insert("ghost".into(), vec![]);
        set.apply(&PresenceMessage::Sync { state });

        assert_eq!(set.online_keys(), vec!["bo", "cy"]);
        assert!(set.last_seen("ann").is_some());
        assert!(set.last_seen("bo").is_none());
    }

    #[tokio::test]
    async fn trackers_see_each_other_and_drop_untracks() {
        let hub = Hub::default();
        let ann = Uuid::new_v4();
        let bo = Uuid::new_v4();

        let ann_tracker = PresenceTracker::start(&hub, "online", ann).unwrap();
        let bo_tracker = PresenceTracker::start(&hub, "online", bo).unwrap();

        let mut ann_view = ann_tracker.watch();
        tokio::time::timeout(
            Duration::from_secs(1),
            ann_view.wait_for(|set| set.is_online(&ann.to_string()) && set.is_online(&bo.to_string())),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(ann_tracker.status(), PresenceStatus::Synced);

        drop(bo_tracker);
        tokio::time::timeout(
            Duration::from_secs(1),
            ann_view.wait_for(|set| !set.is_online(&bo.to_string())),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(ann_tracker.online_users(), vec![ann]);

        drop(ann_tracker);
        assert_eq!(hub.active_channels(), 0);
        assert!(hub.presence_state("online").is_empty());
    }
}
