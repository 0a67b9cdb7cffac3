use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::trace;

/// Hierarchical cache key, e.g. `["notifications", "<user id>"]`.
/// Invalidation matches by prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

#[derive(Default)]
struct Entry {
    value: Option<Arc<dyn Any + Send + Sync>>,
    stale: bool,
    /// Bumped by every invalidation that covers this key.
    epoch: u64,
}

/// Shared query cache. The only ways to change it are [`QueryCache::fetch`]
/// (by the query's owner) and key-scoped [`QueryCache::invalidate`].
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    entries: Mutex<HashMap<QueryKey, Entry>>,
    invalidations: AtomicU64,
    events: broadcast::Sender<QueryKey>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                invalidations: AtomicU64::new(0),
                events,
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<QueryKey, Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached value for `key` if it is fresh, otherwise run
    /// `fetcher` and cache its result.
    ///
    /// If the key is invalidated while the fetch is in flight, the result is
    /// still returned but is cached as stale, so the next read fetches again.
    /// A failed first fetch leaves no entry behind.
    pub async fn fetch<T, E, F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let epoch = {
            let mut entries = self.entries();
            let entry = entries.entry(key.clone()).or_default();
            if !entry.stale {
                if let Some(value) = entry.value.as_ref().and_then(|v| (**v).downcast_ref::<T>()) {
                    trace!("cache hit {}", key);
                    return Ok(value.clone());
                }
            }
            entry.epoch
        };

        let value = match fetcher().await {
            Ok(value) => value,
            Err(e) => {
                let mut entries = self.entries();
                if entries.get(key).is_some_and(|entry| entry.value.is_none()) {
                    entries.remove(key);
                }
                return Err(e);
            }
        };

        let mut entries = self.entries();
        let entry = entries.entry(key.clone()).or_default();
        entry.stale = entry.epoch != epoch;
        entry.value = Some(Arc::new(value.clone()));
        if entry.stale {
            trace!("cache {} invalidated during fetch, kept stale", key);
        }
        Ok(value)
    }

    /// Cached value regardless of staleness.
    pub fn peek<T: Clone + 'static>(&self, key: &QueryKey) -> Option<T> {
        self.entries()
            .get(key)
            .and_then(|entry| entry.value.as_ref())
            .and_then(|v| (**v).downcast_ref::<T>())
            .cloned()
    }

    /// `Some(stale)` for a cached key, `None` if nothing was ever fetched.
    pub fn is_stale(&self, key: &QueryKey) -> Option<bool> {
        self.entries()
            .get(key)
            .filter(|entry| entry.value.is_some())
            .map(|entry| entry.stale)
    }

    /// Drop every entry under `prefix`, e.g. when its view goes away for good.
    pub fn remove(&self, prefix: &QueryKey) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark every entry under `prefix` stale. Each call counts as one
    /// invalidation and is announced to subscribers, even if no entry matched.
    /// Returns the number of entries covered.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let covered = {
            let mut entries = self.entries();
            let mut covered = 0;
            for (key, entry) in entries.iter_mut() {
                if key.starts_with(prefix) {
                    entry.stale = true;
                    entry.epoch += 1;
                    covered += 1;
                }
            }
            covered
        };

        self.inner.invalidations.fetch_add(1, Ordering::Relaxed);
        let _ = self.inner.events.send(prefix.clone());
        trace!("invalidated {} ({} entries)", prefix, covered);
        covered
    }

    /// Total invalidation calls so far.
    pub fn invalidation_count(&self) -> u64 {
        self.inner.invalidations.load(Ordering::Relaxed)
    }

    /// Receive each invalidated prefix, e.g. to trigger a refetch.
    pub fn subscribe(&self) -> broadcast::Receiver<QueryKey> {
        self.inner.events.subscribe()
    }
}
