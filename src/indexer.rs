//! String indexer: tag keys, tag values and metric names as integer ids
//!
//! The tag-indexed metrics backend stores every string as a stable integer.
//! The mapping service itself is external; this module defines the seam the
//! builders depend on plus a process-wide read-through cache. Mappings are
//! immutable once assigned, so the cache is append-only and never
//! invalidated — callers needing freshness must not rely on it.
//!
//! # Thread Safety
//!
//! The cache uses a double-checked `parking_lot::RwLock` pattern: reads take
//! only the read lock when the string is already cached. Concurrent misses
//! for the same string may race; both writers store the same immutable
//! mapping, so last-writer-wins is harmless.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Resolution seam for the external string-interning service
pub trait StringIndexer: Send + Sync {
    /// Resolve a string to its id, if it has ever been interned
    fn lookup(&self, s: &str) -> Option<u64>;

    /// Reverse-resolve an id back to its string
    fn reverse(&self, id: u64) -> Option<String>;
}

// ============================================================================
// In-memory indexer
// ============================================================================

/// An append-only in-memory indexer
///
/// Doubles as the test stand-in for the external service and as the backing
/// table of the process cache. Ids are assigned once and never reused.
#[derive(Debug, Default)]
pub struct MemoryIndexer {
    string_to_id: RwLock<HashMap<String, u64>>,
    id_to_string: RwLock<HashMap<u64, String>>,
    next_id: AtomicU64,
}

impl MemoryIndexer {
    /// Create an empty indexer
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string, returning its id
    ///
    /// Returns the existing id when the string was recorded before. Safe to
    /// call concurrently for the same string.
    pub fn record(&self, s: &str) -> u64 {
        // Fast path: read lock only
        {
            let map = self.string_to_id.read();
            if let Some(&id) = map.get(s) {
                return id;
            }
        }

        let mut map = self.string_to_id.write();
        // Double-check after acquiring the write lock
        if let Some(&id) = map.get(s) {
            return id;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        map.insert(s.to_string(), id);
        self.id_to_string.write().insert(id, s.to_string());
        id
    }

    /// Intern a batch of strings
    pub fn bulk_record<'a, I>(&self, strings: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for s in strings {
            self.record(s);
        }
    }

    /// Number of interned strings
    pub fn len(&self) -> usize {
        self.string_to_id.read().len()
    }

    /// Whether nothing has been interned yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StringIndexer for MemoryIndexer {
    fn lookup(&self, s: &str) -> Option<u64> {
        self.string_to_id.read().get(s).copied()
    }

    fn reverse(&self, id: u64) -> Option<String> {
        self.id_to_string.read().get(&id).cloned()
    }
}

// ============================================================================
// Read-through cache
// ============================================================================

/// Process-wide read-through cache in front of a backing indexer
///
/// Negative results are not cached: a string missing from the backing service
/// now may be interned later, and the next lookup must see it.
pub struct CachedIndexer<B> {
    backing: B,
    forward: RwLock<HashMap<String, u64>>,
    backward: RwLock<HashMap<u64, String>>,
}

impl<B: StringIndexer> CachedIndexer<B> {
    /// Wrap a backing indexer
    pub fn new(backing: B) -> Self {
        Self {
            backing,
            forward: RwLock::new(HashMap::new()),
            backward: RwLock::new(HashMap::new()),
        }
    }

    /// Number of cached forward mappings
    pub fn cached_len(&self) -> usize {
        self.forward.read().len()
    }
}

impl<B: StringIndexer> StringIndexer for CachedIndexer<B> {
    fn lookup(&self, s: &str) -> Option<u64> {
        {
            let cache = self.forward.read();
            if let Some(&id) = cache.get(s) {
                return Some(id);
            }
        }

        let id = self.backing.lookup(s)?;
        self.forward.write().insert(s.to_string(), id);
        self.backward.write().insert(id, s.to_string());
        Some(id)
    }

    fn reverse(&self, id: u64) -> Option<String> {
        {
            let cache = self.backward.read();
            if let Some(s) = cache.get(&id) {
                return Some(s.clone());
            }
        }

        let s = self.backing.reverse(id)?;
        self.backward.write().insert(id, s.clone());
        self.forward.write().insert(s.clone(), id);
        Some(s)
    }
}

impl<B: StringIndexer> StringIndexer for std::sync::Arc<B> {
    fn lookup(&self, s: &str) -> Option<u64> {
        (**self).lookup(s)
    }

    fn reverse(&self, id: u64) -> Option<String> {
        (**self).reverse(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_is_idempotent() {
        let indexer = MemoryIndexer::new();
        let id1 = indexer.record("transaction");
        let id2 = indexer.record("transaction");
        assert_eq!(id1, id2);
        assert_eq!(indexer.len(), 1);
    }

    #[test]
    fn test_lookup_never_interns() {
        let indexer = MemoryIndexer::new();
        assert_eq!(indexer.lookup("never_seen"), None);
        assert!(indexer.is_empty());
    }

    #[test]
    fn test_reverse() {
        let indexer = MemoryIndexer::new();
        let id = indexer.record("foo_transaction");
        assert_eq!(indexer.reverse(id), Some("foo_transaction".to_string()));
        assert_eq!(indexer.reverse(id + 999), None);
    }

    #[test]
    fn test_cache_read_through() {
        let backing = MemoryIndexer::new();
        let id = backing.record("transaction");
        let cached = CachedIndexer::new(backing);

        assert_eq!(cached.cached_len(), 0);
        assert_eq!(cached.lookup("transaction"), Some(id));
        assert_eq!(cached.cached_len(), 1);
        // Second hit served from cache
        assert_eq!(cached.lookup("transaction"), Some(id));
        assert_eq!(cached.reverse(id), Some("transaction".to_string()));
    }

    #[test]
    fn test_cache_does_not_store_misses() {
        let backing = Arc::new(MemoryIndexer::new());
        let cached = CachedIndexer::new(backing.clone());

        assert_eq!(cached.lookup("late"), None);
        let id = backing.record("late");
        // Visible on the next lookup because misses are not cached
        assert_eq!(cached.lookup("late"), Some(id));
    }

    #[test]
    fn test_concurrent_record_same_string() {
        let indexer = Arc::new(MemoryIndexer::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let indexer = indexer.clone();
                std::thread::spawn(move || indexer.record("contended"))
            })
            .collect();
        let ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }
}
