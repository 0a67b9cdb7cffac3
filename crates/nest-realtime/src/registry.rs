use std::collections::btree_map::{BTreeMap, Entry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use nest_types::events::{ChangeBinding, ChangeFilter, ChannelStatus, RealtimeMessage, RowChange};
use nest_types::filter::RowFilter;

use crate::bridge::CacheBridge;
use crate::cache::{QueryCache, QueryKey};
use crate::channel::{Channel, ChannelConfig, ChannelEvents};
use crate::error::RealtimeError;
use crate::hub::Hub;

pub type ChangeCallback = Arc<dyn Fn(&RowChange) + Send + Sync>;

/// One row-change listener of a feed: what to listen to, which cache keys
/// go stale when it fires, and what else to run.
#[derive(Clone)]
pub struct Subscription {
    pub binding: ChangeBinding,
    pub invalidates: Vec<QueryKey>,
    pub on_change: Vec<ChangeCallback>,
}

impl Subscription {
    pub fn new(table: impl Into<String>, event: ChangeFilter) -> Self {
        Self {
            binding: ChangeBinding::new(table, event),
            invalidates: Vec::new(),
            on_change: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: RowFilter) -> Self {
        self.binding.filter = Some(filter);
        self
    }

    pub fn invalidate(mut self, key: QueryKey) -> Self {
        if !self.invalidates.contains(&key) {
            self.invalidates.push(key);
        }
        self
    }

    pub fn on_change(mut self, callback: impl Fn(&RowChange) + Send + Sync + 'static) -> Self {
        self.on_change.push(Arc::new(callback));
        self
    }
}

/// Opens and closes the realtime channel behind each named feed.
///
/// A feed is one view's set of subscriptions. Mounting the same set again
/// shares the live channel; mounting a different set releases the old
/// channel first and then opens the replacement, so a feed never has two
/// channels delivering the same rows.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    hub: Hub,
    bridge: CacheBridge,
    feeds: Mutex<HashMap<String, ActiveFeed>>,
    generations: AtomicU64,
}

struct ActiveFeed {
    generation: u64,
    signature: Vec<ChangeBinding>,
    mounts: Mounts,
    task: JoinHandle<()>,
    channel: Channel,
}

/// Subscriptions of every live guard on a feed, keyed by mount id. The
/// dispatch task reads it on each row change.
type Mounts = Arc<Mutex<BTreeMap<u64, Vec<Subscription>>>>;

fn lock_mounts(mounts: &Mounts) -> MutexGuard<'_, BTreeMap<u64, Vec<Subscription>>> {
    mounts.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for ActiveFeed {
    fn drop(&mut self) {
        self.task.abort();
        debug!("releasing feed channel {}", self.channel.id());
    }
}

impl ChannelRegistry {
    pub fn new(hub: Hub, cache: QueryCache) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                hub,
                bridge: CacheBridge::new(cache),
                feeds: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn cache(&self) -> &QueryCache {
        self.inner.bridge.cache()
    }

    /// Mount `subscriptions` as feed `feed`. The feed stays subscribed until
    /// every returned guard has been dropped or a different binding set
    /// replaces it.
    ///
    /// Mounts with the same bindings share one channel, but each keeps its
    /// own cache keys and callbacks; they stop firing once its guard drops.
    /// Subscription failures are logged and returned; nothing retries them.
    pub fn mount(&self, feed: &str, subscriptions: Vec<Subscription>) -> Result<FeedGuard, RealtimeError> {
        let subscriptions = merge(subscriptions);
        let signature: Vec<ChangeBinding> = subscriptions.iter().map(|s| s.binding.clone()).collect();
        let mount = self.next_id();

        let mut feeds = self.inner.feeds();
        if let Some(active) = feeds.get_mut(feed) {
            if active.signature == signature {
                let mut mounts = lock_mounts(&active.mounts);
                mounts.insert(mount, subscriptions);
                debug!("feed {} shared ({} mounts)", feed, mounts.len());
                return Ok(self.guard(feed, active.generation, mount));
            }
        }

        // Stale channel goes first
        if let Some(stale) = feeds.remove(feed) {
            debug!("feed {} subscription set changed, replacing", feed);
            drop(stale);
        }

        let config = ChannelConfig::new(format!("feed:{feed}")).with_bindings(signature.iter().cloned());
        let (channel, events) = self.inner.hub.open(config).inspect_err(|e| {
            warn!("feed {} failed to subscribe: {}", feed, e);
        })?;

        let generation = self.next_id();
        debug!(
            "feed {} mounted on channel {} ({} subscriptions)",
            feed,
            channel.id(),
            subscriptions.len()
        );
        let mounts: Mounts = Arc::new(Mutex::new(BTreeMap::from([(mount, subscriptions)])));
        let task = tokio::spawn(dispatch(
            feed.to_string(),
            events,
            mounts.clone(),
            self.inner.bridge.clone(),
        ));

        feeds.insert(
            feed.to_string(),
            ActiveFeed {
                generation,
                signature,
                mounts,
                task,
                channel,
            },
        );
        Ok(self.guard(feed, generation, mount))
    }

    fn next_id(&self) -> u64 {
        self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn guard(&self, feed: &str, generation: u64, mount: u64) -> FeedGuard {
        FeedGuard {
            registry: Arc::downgrade(&self.inner),
            feed: feed.to_string(),
            generation,
            mount,
        }
    }

    pub fn active_feeds(&self) -> usize {
        self.inner.feeds().len()
    }

    pub fn is_mounted(&self, feed: &str) -> bool {
        self.inner.feeds().contains_key(feed)
    }
}

impl RegistryInner {
    fn feeds(&self) -> MutexGuard<'_, HashMap<String, ActiveFeed>> {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unmount(&self, feed: &str, generation: u64, mount: u64) {
        let released = {
            let mut feeds = self.feeds();
            let remaining = match feeds.get_mut(feed) {
                Some(active) if active.generation == generation => {
                    let mut mounts = lock_mounts(&active.mounts);
                    mounts.remove(&mount);
                    mounts.len()
                }
                // Already replaced by a newer mount
                _ => return,
            };
            if remaining == 0 { feeds.remove(feed) } else { None }
        };

        if let Some(active) = released {
            debug!("feed {} unmounted", feed);
            drop(active);
        }
    }
}

/// Keeps a feed mounted. Dropping it is the unmount.
pub struct FeedGuard {
    registry: Weak<RegistryInner>,
    feed: String,
    generation: u64,
    mount: u64,
}

impl FeedGuard {
    pub fn feed(&self) -> &str {
        &self.feed
    }
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unmount(&self.feed, self.generation, self.mount);
        }
    }
}

/// Identical bindings collapse into one subscription with the union of
/// their keys and callbacks.
fn merge(subscriptions: Vec<Subscription>) -> Vec<Subscription> {
    let mut merged: BTreeMap<ChangeBinding, Subscription> = BTreeMap::new();
    for sub in subscriptions {
        match merged.entry(sub.binding.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(sub);
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                for key in sub.invalidates {
                    if !existing.invalidates.contains(&key) {
                        existing.invalidates.push(key);
                    }
                }
                existing.on_change.extend(sub.on_change);
            }
        }
    }
    merged.into_values().collect()
}

async fn dispatch(feed: String, mut events: ChannelEvents, mounts: Mounts, bridge: CacheBridge) {
    while let Some(message) = events.next().await {
        match message {
            RealtimeMessage::RowChange(change) => {
                // Snapshot so callbacks may mount or unmount feeds.
                let matched: Vec<Subscription> = lock_mounts(&mounts)
                    .values()
                    .flatten()
                    .filter(|s| s.binding.matches(&change))
                    .cloned()
                    .collect();

                let mut keys: Vec<QueryKey> = Vec::new();
                for key in matched.iter().flat_map(|s| &s.invalidates) {
                    if !keys.contains(key) {
                        keys.push(key.clone());
                    }
                }
                bridge.apply(&keys);
                for callback in matched.iter().flat_map(|s| &s.on_change) {
                    callback(&change);
                }
            }
            RealtimeMessage::Status(ChannelStatus::Subscribed) => {
                debug!("feed {} subscribed", feed);
            }
            RealtimeMessage::Status(ChannelStatus::ChannelError { message }) => {
                warn!("feed {} channel error: {}", feed, message);
            }
            RealtimeMessage::Status(ChannelStatus::Closed) => break,
            RealtimeMessage::Broadcast(_) | RealtimeMessage::Presence(_) => {}
        }
    }
    debug!("feed {} dispatch loop ended", feed);
}
