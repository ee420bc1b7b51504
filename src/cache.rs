//! # Shared Object/Metadata Cache
//!
//! Each connection holds two cache views: the **object view** caches user
//! values (potentially large), the **metadata view** caches the small
//! per-row sidecar blobs. The views belong to the process-wide
//! [`SharedCache`], which fixes their capacities; separating the limits lets
//! the engine retain metadata aggressively while shedding values.
//!
//! ## Coherence
//!
//! A view is only ever touched from its connection's lane. Coherence across
//! connections comes from changeset blocks: after every commit the
//! coordinator broadcasts a block to every sibling lane, and each view drops
//! the entries the block reports as modified or deleted
//! ([`CacheView::apply`]). A view whose connection's snapshot equals the
//! coordinator's `lastWriteTimestamp` is guaranteed coherent.
//!
//! ## Eviction Order
//!
//! Invalidation always runs before LRU pressure: `apply` removes entries
//! without consulting capacity, and only `put` evicts. The two never race —
//! both run on the owning lane.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::types::{CacheKey, ChangeHint, FlushLevel};

// =============================================================================
// Shared Cache
// =============================================================================

/// The process-wide two-tier cache: fixes the capacities handed to each
/// connection's views.
#[derive(Debug, Clone, Copy)]
pub struct SharedCache {
    object_limit: usize,
    metadata_limit: usize,
}

impl SharedCache {
    /// Creates the cache with per-connection view capacities.
    ///
    /// A limit of 0 disables that tier entirely.
    pub fn new(object_limit: usize, metadata_limit: usize) -> Self {
        Self {
            object_limit,
            metadata_limit,
        }
    }

    /// Creates a fresh object-tier view for one connection.
    pub fn object_view(&self) -> CacheView<Vec<u8>> {
        CacheView::new(self.object_limit)
    }

    /// Creates a fresh metadata-tier view for one connection.
    ///
    /// The value is `Option<Vec<u8>>`: rows may exist with no metadata, and
    /// that absence is itself worth caching.
    pub fn metadata_view(&self) -> CacheView<Option<Vec<u8>>> {
        CacheView::new(self.metadata_limit)
    }

    /// The object-tier capacity.
    pub fn object_limit(&self) -> usize {
        self.object_limit
    }

    /// The metadata-tier capacity.
    pub fn metadata_limit(&self) -> usize {
        self.metadata_limit
    }
}

// =============================================================================
// Cache View
// =============================================================================

/// One connection's bounded view onto a cache tier.
///
/// Plain LRU semantics: `get` promotes, `put` evicts the least-recently-used
/// entry at capacity. A view with limit 0 holds nothing — every `get`
/// misses and `put` is a no-op.
#[derive(Debug)]
pub struct CacheView<V> {
    /// `None` when the limit is 0 (tier disabled).
    entries: Option<LruCache<CacheKey, V>>,
}

impl<V> CacheView<V> {
    /// Creates a view with the given LRU capacity.
    pub fn new(limit: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(limit).map(LruCache::new),
        }
    }

    /// Looks up a key, promoting it to most-recently-used on a hit.
    pub fn get(&mut self, key: &CacheKey) -> Option<&V> {
        self.entries.as_mut()?.get(key)
    }

    /// Inserts or replaces an entry, evicting the LRU entry at capacity.
    pub fn put(&mut self, key: CacheKey, value: V) {
        if let Some(entries) = self.entries.as_mut() {
            entries.put(key, value);
        }
    }

    /// Removes a single entry, if present.
    pub fn remove(&mut self, key: &CacheKey) {
        if let Some(entries) = self.entries.as_mut() {
            entries.pop(key);
        }
    }

    /// Applies a cache-changeset block: drops every held entry the block
    /// reports as modified (`+1`) or deleted (`-1`).
    pub fn apply(&mut self, block: impl Fn(&CacheKey) -> ChangeHint) {
        let Some(entries) = self.entries.as_mut() else {
            return;
        };
        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| block(key).invalidates())
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
        }
    }

    /// Unconditionally flushes the view.
    pub fn drop_all(&mut self) {
        if let Some(entries) = self.entries.as_mut() {
            entries.clear();
        }
    }

    /// Sheds entries according to a memory-pressure level.
    pub fn shrink(&mut self, level: FlushLevel) {
        match level {
            FlushLevel::None => {}
            FlushLevel::Soft => {
                let Some(entries) = self.entries.as_mut() else {
                    return;
                };
                let target = entries.len() / 2;
                while entries.len() > target {
                    entries.pop_lru();
                }
            }
            FlushLevel::Full => self.drop_all(),
        }
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |e| e.len())
    }

    /// Whether the view holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the view currently holds `key` (no LRU promotion).
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.as_ref().is_some_and(|e| e.contains(key))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> CacheKey {
        CacheKey::new("c", k)
    }

    #[test]
    fn test_get_put() {
        let mut view: CacheView<Vec<u8>> = CacheView::new(4);
        assert!(view.get(&key("a")).is_none());

        view.put(key("a"), b"v1".to_vec());
        assert_eq!(view.get(&key("a")), Some(&b"v1".to_vec()));
        assert_eq!(view.len(), 1);
    }

    /// Limit 0: no entries are retained; every get misses.
    #[test]
    fn test_zero_limit_disables() {
        let mut view: CacheView<Vec<u8>> = CacheView::new(0);
        view.put(key("a"), b"v".to_vec());
        assert!(view.get(&key("a")).is_none());
        assert_eq!(view.len(), 0);
        // The maintenance operations are no-ops, not panics.
        view.apply(|_| ChangeHint::Updated);
        view.shrink(FlushLevel::Soft);
        view.drop_all();
    }

    /// At capacity, a new insertion evicts exactly the LRU entry.
    #[test]
    fn test_lru_eviction() {
        let mut view: CacheView<Vec<u8>> = CacheView::new(2);
        view.put(key("a"), b"1".to_vec());
        view.put(key("b"), b"2".to_vec());
        view.put(key("c"), b"3".to_vec());

        assert!(!view.contains(&key("a")), "oldest entry should be evicted");
        assert!(view.contains(&key("b")));
        assert!(view.contains(&key("c")));
        assert_eq!(view.len(), 2);
    }

    /// A get promotes the entry, changing the eviction victim.
    #[test]
    fn test_get_promotes() {
        let mut view: CacheView<Vec<u8>> = CacheView::new(2);
        view.put(key("a"), b"1".to_vec());
        view.put(key("b"), b"2".to_vec());

        view.get(&key("a"));
        view.put(key("c"), b"3".to_vec());

        assert!(view.contains(&key("a")));
        assert!(!view.contains(&key("b")));
    }

    /// apply drops modified and deleted entries, keeps unchanged ones.
    #[test]
    fn test_apply_changeset_block() {
        let mut view: CacheView<Vec<u8>> = CacheView::new(8);
        view.put(key("stale"), b"1".to_vec());
        view.put(key("gone"), b"2".to_vec());
        view.put(key("fresh"), b"3".to_vec());

        view.apply(|k| match k.key.as_str() {
            "stale" => ChangeHint::Updated,
            "gone" => ChangeHint::Removed,
            _ => ChangeHint::Unchanged,
        });

        assert!(!view.contains(&key("stale")));
        assert!(!view.contains(&key("gone")));
        assert!(view.contains(&key("fresh")));
    }

    #[test]
    fn test_drop_all() {
        let mut view: CacheView<Vec<u8>> = CacheView::new(4);
        view.put(key("a"), b"1".to_vec());
        view.put(key("b"), b"2".to_vec());
        view.drop_all();
        assert!(view.is_empty());
    }

    /// Soft shrink halves the population, dropping the LRU half.
    #[test]
    fn test_shrink_levels() {
        let mut view: CacheView<Vec<u8>> = CacheView::new(8);
        for k in ["a", "b", "c", "d"] {
            view.put(key(k), k.as_bytes().to_vec());
        }

        view.shrink(FlushLevel::None);
        assert_eq!(view.len(), 4);

        view.shrink(FlushLevel::Soft);
        assert_eq!(view.len(), 2);
        // LRU half ("a", "b") went first.
        assert!(view.contains(&key("c")));
        assert!(view.contains(&key("d")));

        view.shrink(FlushLevel::Full);
        assert!(view.is_empty());
    }

    /// Metadata views cache known-absent sidecars.
    #[test]
    fn test_metadata_view_caches_absence() {
        let cache = SharedCache::new(250, 500);
        let mut view = cache.metadata_view();
        view.put(key("a"), None);
        assert_eq!(view.get(&key("a")), Some(&None));
    }
}
