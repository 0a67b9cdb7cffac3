use nest_types::events::RowChange;

use crate::cache::{QueryCache, QueryKey};
use crate::registry::Subscription;

/// Turns row-change events into cache invalidations.
///
/// Every matching subscription contributes its keys and every key gets its
/// own `invalidate` call; bursts are not coalesced.
#[derive(Clone)]
pub struct CacheBridge {
    cache: QueryCache,
}

impl CacheBridge {
    pub fn new(cache: QueryCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Keys to invalidate for `change`, in subscription order.
    pub fn invalidations<'a>(subscriptions: &'a [Subscription], change: &RowChange) -> Vec<&'a QueryKey> {
        subscriptions
            .iter()
            .filter(|sub| sub.binding.matches(change))
            .flat_map(|sub| sub.invalidates.iter())
            .collect()
    }

    pub fn apply<'a>(&self, keys: impl IntoIterator<Item = &'a QueryKey>) -> usize {
        let mut calls = 0;
        for key in keys {
            self.cache.invalidate(key);
            calls += 1;
        }
        calls
    }
}
