use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use nest_db::Database;
use nest_realtime::typing::{TYPING_EVENT, typing_topic};
use nest_realtime::{
    ChannelConfig, ChannelRegistry, Hub, LocalAlert, LocalNotifier, LocationStore, LocationTarget,
    LocationUpdater, ManualLocationProvider, NotificationPermission, NotificationRelay,
    PresenceSet, PresenceTracker, QueryCache, QueryKey, RealtimeError, SqliteStore, Subscription,
    Toast, TrackingRequest, TypingConfig, TypingIndicator, TypingSignal, TypingState,
    WatchOptions,
};
use nest_types::events::{
    ChangeBinding, ChangeFilter, PresenceMessage, PresenceMeta, PresenceSnapshot, RealtimeMessage,
    RowChange,
};
use nest_types::models::{AlertRole, LocationSample};

fn start_signal(user_id: Uuid, name: &str) -> serde_json::Value {
    serde_json::to_value(TypingSignal {
        user_id,
        display_name: name.to_string(),
        state: TypingState::Start,
    })
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn typing_peer_disappears_three_seconds_after_last_start() {
    let hub = Hub::default();
    let conversation = Uuid::new_v4();
    let bob = TypingIndicator::start(&hub, conversation, Uuid::new_v4(), "Bob", TypingConfig::default())
        .unwrap();
    let mut names = bob.watch();

    // Alice's client sends start and then goes silent
    let (alice, _alice_events) = hub.open(ChannelConfig::new(typing_topic(conversation))).unwrap();
    alice.broadcast(TYPING_EVENT, start_signal(Uuid::new_v4(), "Alice")).unwrap();

    names
        .wait_for(|names| names.iter().any(|n| n == "Alice"))
        .await
        .unwrap();
    let shown_at = Instant::now();

    names.wait_for(|names| names.is_empty()).await.unwrap();
    let elapsed = shown_at.elapsed();
    assert!(elapsed >= Duration::from_millis(2900), "expired early: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(3), "expired late: {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn keystroke_burst_sends_one_start_then_debounced_stop() {
    let hub = Hub::default();
    let conversation = Uuid::new_v4();
    let alice = TypingIndicator::start(&hub, conversation, Uuid::new_v4(), "Alice", TypingConfig::default())
        .unwrap();
    let bob = TypingIndicator::start(&hub, conversation, Uuid::new_v4(), "Bob", TypingConfig::default())
        .unwrap();
    let (_observer, mut observed) = hub.open(ChannelConfig::new(typing_topic(conversation))).unwrap();
    let mut bob_sees = bob.watch();

    for _ in 0..2 {
        alice.keystroke();
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    alice.keystroke();
    let last_keystroke = Instant::now();

    bob_sees
        .wait_for(|names| names.iter().any(|n| n == "Alice"))
        .await
        .unwrap();
    bob_sees.wait_for(|names| names.is_empty()).await.unwrap();
    let quiet = last_keystroke.elapsed();
    assert!(quiet >= Duration::from_secs(2) && quiet < Duration::from_secs(3), "{quiet:?}");

    let mut states = Vec::new();
    while let Ok(Some(message)) = tokio::time::timeout(Duration::from_millis(50), observed.next()).await {
        if let RealtimeMessage::Broadcast(msg) = message {
            let signal: TypingSignal = serde_json::from_value(msg.payload).unwrap();
            states.push(signal.state);
        }
    }
    assert_eq!(states, vec![TypingState::Start, TypingState::Stop]);
}

#[tokio::test]
async fn helper_location_targets_own_row_for_that_alert() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let hub = Hub::default();
    let store = Arc::new(SqliteStore::new(db.clone()).with_feed(hub.clone()));

    let requester = Uuid::new_v4();
    let helper = Uuid::new_v4();
    let alert_x = db
        .create_alert(Uuid::new_v4(), requester, Some(1.0), Some(1.0), Some("help"))
        .unwrap();
    let alert_y = db
        .create_alert(Uuid::new_v4(), requester, Some(2.0), Some(2.0), None)
        .unwrap();
    db.add_alert_helper(Uuid::new_v4(), alert_x.id, helper).unwrap();
    db.add_alert_helper(Uuid::new_v4(), alert_y.id, helper).unwrap();

    let (_watch, mut changes) = hub
        .open(
            ChannelConfig::new("alert-map")
                .with_binding(ChangeBinding::new("alert_helpers", ChangeFilter::Update))
                .with_binding(ChangeBinding::new("emergency_alerts", ChangeFilter::Update)),
        )
        .unwrap();
    changes.next().await; // Subscribed

    let provider = Arc::new(ManualLocationProvider::new());
    let _updater = LocationUpdater::start(
        provider.clone(),
        store,
        TrackingRequest {
            enabled: true,
            alert_id: Some(alert_x.id),
            role: AlertRole::Helper,
            actor_id: Some(helper),
        },
        WatchOptions::default(),
    )
    .unwrap()
    .unwrap();

    provider.push(LocationSample::new(5.0, 6.0).with_accuracy(3.0));

    match changes.next().await {
        Some(RealtimeMessage::RowChange(change)) => {
            assert_eq!(change.table, "alert_helpers");
            let row = change.new.unwrap();
            assert_eq!(row["alert_id"], json!(alert_x.id.to_string()));
            assert_eq!(row["helper_id"], json!(helper.to_string()));
        }
        other => panic!("unexpected {other:?}"),
    }

    let on_x = db.list_alert_helpers(alert_x.id).unwrap();
    assert_eq!((on_x[0].latitude, on_x[0].longitude, on_x[0].accuracy), (Some(5.0), Some(6.0), Some(3.0)));
    let on_y = db.list_alert_helpers(alert_y.id).unwrap();
    assert_eq!(on_y[0].latitude, None);
    let requester_row = db.get_alert(alert_x.id).unwrap().unwrap();
    assert_eq!(requester_row.latitude, Some(1.0));
}

struct FlakyStore {
    attempts: AtomicUsize,
    failures: usize,
    outcomes: mpsc::UnboundedSender<bool>,
}

#[async_trait]
impl LocationStore for FlakyStore {
    async fn write_location(&self, _target: &LocationTarget, _sample: &LocationSample) -> Result<(), RealtimeError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let ok = attempt >= self.failures;
        let _ = self.outcomes.send(ok);
        if ok { Ok(()) } else { Err(RealtimeError::store("write timed out")) }
    }
}

#[tokio::test]
async fn failed_location_write_keeps_tracking() {
    let (outcomes, mut outcome_rx) = mpsc::unbounded_channel();
    let store = Arc::new(FlakyStore {
        attempts: AtomicUsize::new(0),
        failures: 1,
        outcomes,
    });
    let provider = Arc::new(ManualLocationProvider::new());
    let updater = LocationUpdater::start(
        provider.clone(),
        store.clone(),
        TrackingRequest {
            enabled: true,
            alert_id: Some(Uuid::new_v4()),
            role: AlertRole::Requester,
            actor_id: Some(Uuid::new_v4()),
        },
        WatchOptions::default(),
    )
    .unwrap()
    .unwrap();

    provider.push(LocationSample::new(1.0, 1.0));
    assert_eq!(outcome_rx.recv().await, Some(false));
    assert!(updater.is_tracking());

    provider.push(LocationSample::new(1.1, 1.1));
    assert_eq!(outcome_rx.recv().await, Some(true));
    assert!(updater.is_tracking());
    assert_eq!(updater.samples(), 2);
    assert_eq!(updater.writes_failed(), 1);
    assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
}

struct QuietNotifier;

#[async_trait]
impl LocalNotifier for QuietNotifier {
    fn permission(&self) -> NotificationPermission {
        NotificationPermission::Denied
    }

    async fn request_permission(&self) -> NotificationPermission {
        NotificationPermission::Denied
    }

    fn show_alert(&self, _alert: LocalAlert) {}

    fn toast(&self, _toast: Toast) {}
}

#[tokio::test]
async fn mounting_and_unmounting_leaves_zero_channels() {
    let hub = Hub::default();
    let registry = ChannelRegistry::new(hub.clone(), QueryCache::new());
    let store = Arc::new(SqliteStore::new(Arc::new(Database::open_in_memory().unwrap())));
    let user = Uuid::new_v4();

    for round in 0..5 {
        let orders = registry
            .mount(
                "orders",
                vec![Subscription::new("orders", ChangeFilter::All).invalidate(QueryKey::new(["orders"]))],
            )
            .unwrap();
        let shared = registry
            .mount(
                "orders",
                vec![Subscription::new("orders", ChangeFilter::All).invalidate(QueryKey::new(["orders"]))],
            )
            .unwrap();
        let replaced = registry
            .mount(
                "orders",
                vec![Subscription::new("orders", ChangeFilter::Insert)
                    .invalidate(QueryKey::new(["orders".to_string(), round.to_string()]))],
            )
            .unwrap();
        let relay =
            NotificationRelay::start(&registry, store.clone(), Arc::new(QuietNotifier), Some(user)).unwrap();
        let presence = PresenceTracker::start(&hub, "online", user).unwrap();
        let typing =
            TypingIndicator::start(&hub, Uuid::new_v4(), user, "Me", TypingConfig::default()).unwrap();
        assert_eq!(hub.active_channels(), 4);

        drop(orders);
        drop(shared);
        drop(replaced);
        drop(relay);
        drop(presence);
        drop(typing);
        assert_eq!(hub.active_channels(), 0);
        assert_eq!(registry.active_feeds(), 0);
    }
}

#[tokio::test]
async fn unread_count_follows_the_last_fetch() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let hub = Hub::default();
    let registry = ChannelRegistry::new(hub.clone(), QueryCache::new());
    let store = Arc::new(SqliteStore::new(db.clone()).with_feed(hub.clone()));
    let user = Uuid::new_v4();

    let first = db
        .insert_notification(Uuid::new_v4(), user, "Welcome", "Hi", &json!({}))
        .unwrap();
    db.insert_notification(Uuid::new_v4(), user, "Reply", "Someone answered", &json!({}))
        .unwrap();

    let relay = NotificationRelay::start(&registry, store, Arc::new(QuietNotifier), Some(user)).unwrap();
    assert_eq!(relay.unread_count().await.unwrap(), 2);

    relay.mark_read(first.id).await.unwrap();
    assert_eq!(relay.unread_count().await.unwrap(), 1);

    let mut invalidated = registry.cache().subscribe();
    let pushed = db
        .insert_notification(Uuid::new_v4(), user, "Alert", "Nearby", &json!({}))
        .unwrap();
    hub.publish_change(RowChange::insert("notifications", serde_json::to_value(&pushed).unwrap()));
    loop {
        let key = tokio::time::timeout(Duration::from_secs(1), invalidated.recv())
            .await
            .unwrap()
            .unwrap();
        if &key == relay.cache_key() {
            break;
        }
    }
    assert_eq!(relay.unread_count().await.unwrap(), 2);

    relay.mark_all_read().await.unwrap();
    assert_eq!(relay.unread_count().await.unwrap(), 0);
}

const PRESENCE_KEYS: [&str; 4] = ["ann", "bo", "cy", "di"];

fn presence_meta(presence_ref: u8) -> PresenceMeta {
    PresenceMeta {
        presence_ref: Uuid::from_u128(presence_ref as u128),
        online_at: chrono::Utc::now(),
    }
}

proptest! {
    /// After any join/leave sequence the online set is exactly the keys with
    /// at least one entry, and a sync of the same state agrees.
    #[test]
    fn presence_online_set_matches_keys_with_entries(
        steps in prop::collection::vec((0..PRESENCE_KEYS.len(), 0u8..3, any::<bool>()), 0..300)
    ) {
        let mut set = PresenceSet::default();
        let mut model: HashMap<&str, BTreeSet<u8>> = HashMap::new();

        for (key_idx, presence_ref, join) in steps {
            let key = PRESENCE_KEYS[key_idx];
            let meta = presence_meta(presence_ref);
            if join {
                model.entry(key).or_default().insert(presence_ref);
                set.apply(&PresenceMessage::Join { key: key.to_string(), meta });
            } else {
                if let Some(refs) = model.get_mut(key) {
                    refs.remove(&presence_ref);
                }
                set.apply(&PresenceMessage::Leave { key: key.to_string(), meta });
            }

            let mut expected: Vec<String> = model
                .iter()
                .filter(|(_, refs)| !refs.is_empty())
                .map(|(key, _)| key.to_string())
                .collect();
            expected.sort();
            prop_assert_eq!(set.online_keys(), expected);
        }

        // Sync replay of the model is authoritative and lands on the same set.
        let snapshot: PresenceSnapshot = model
            .iter()
            .map(|(key, refs)| (key.to_string(), refs.iter().map(|r| presence_meta(*r)).collect()))
            .collect();
        let mut replayed = PresenceSet::default();
        replayed.apply(&PresenceMessage::Join { key: "ghost".into(), meta: presence_meta(0) });
        replayed.apply(&PresenceMessage::Sync { state: snapshot });
        prop_assert_eq!(replayed.online_keys(), set.online_keys());
    }
}

#[tokio::test]
async fn late_joiner_sync_matches_hub_state() {
    let hub = Hub::default();
    let mut peers = Vec::new();
    for name in ["ann", "bo", "cy"] {
        let (channel, _events) = hub.open(ChannelConfig::new("online").with_presence()).unwrap();
        channel.track(name).unwrap();
        peers.push(channel);
    }
    peers.remove(1); // bo goes offline

    let me = Uuid::new_v4();
    let tracker = PresenceTracker::start(&hub, "online", me).unwrap();
    let mut view = tracker.watch();
    view.wait_for(|set| set.is_online(&me.to_string())).await.unwrap();

    let mut expected: Vec<String> = hub.presence_state("online").into_keys().collect();
    expected.sort();
    assert_eq!(view.borrow().online_keys(), expected);
    assert!(!view.borrow().is_online("bo"));
}
