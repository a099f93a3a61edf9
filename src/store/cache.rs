//! Two bounded, time-expiring mappings sitting in front of the document
//! store: an inode cache keyed by `(parent_id, filename)`, and a
//! chunk-range cache keyed by `(files_id, n_lo, n_hi)`. See spec §4.2.
//!
//! Grounded on the two-tier `AttrCache`/chunk cache pattern used by
//! teleport-daemon's cache layer: a `parking_lot::RwLock<HashMap<K,
//! CacheEntry<V>>>` with manual expiry, not a third-party TTL-map crate,
//! since the eviction policy here (coarse invalidation on writes, not
//! pure LRU) doesn't fit an off-the-shelf cache's API. Chunk ranges use
//! `lru::LruCache` underneath since that axis genuinely wants
//! least-recently-used eviction once a file is read sequentially.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::RwLock;

use crate::inode::Inode;
use crate::store::ChunkDoc;

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn fresh(value: T, ttl: Duration) -> Self {
        Entry {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Metadata cache: `"<parent_id>/<filename>"` -> inode document.
pub struct MetadataCache {
    entries: RwLock<HashMap<String, Entry<Inode>>>,
    ttl: Duration,
    max_elements: usize,
}

impl MetadataCache {
    pub fn new(ttl: Duration, max_elements: usize) -> Self {
        MetadataCache {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_elements,
        }
    }

    fn key(parent_id: &str, filename: &str) -> String {
        format!("{parent_id}/{filename}")
    }

    pub fn get(&self, parent_id: &str, filename: &str) -> Option<Inode> {
        if self.ttl.is_zero() {
            return None;
        }
        let key = Self::key(parent_id, filename);
        let entries = self.entries.read();
        let entry = entries.get(&key)?;
        if entry.is_expired() {
            None
        } else {
            Some(entry.value.clone())
        }
    }

    pub fn put(&self, parent_id: &str, filename: &str, inode: Inode) {
        if self.ttl.is_zero() {
            return;
        }
        let key = Self::key(parent_id, filename);
        let mut entries = self.entries.write();
        if self.max_elements > 0 && entries.len() >= self.max_elements && !entries.contains_key(&key) {
            entries.retain(|_, v| !v.is_expired());
            if entries.len() >= self.max_elements {
                if let Some(stale_key) = entries.keys().next().cloned() {
                    entries.remove(&stale_key);
                }
            }
        }
        entries.insert(key, Entry::fresh(inode, self.ttl));
    }

    /// Invalidate a single key, used when a mutation is known to apply to
    /// one specific `(parent_id, filename)` pair (e.g. rename's old name).
    pub fn invalidate(&self, parent_id: &str, filename: &str) {
        self.entries.write().remove(&Self::key(parent_id, filename));
    }

    /// Coarse reset, used on insert/delete/drop/reconnect. See spec §4.2:
    /// "the cache is explicitly not a coherence layer".
    pub fn reset(&self) {
        self.entries.write().clear();
    }
}

/// Chunk-range cache: `(files_id, n_lo, n_hi)` -> chunk documents.
pub struct ChunkRangeCache {
    entries: RwLock<LruCache<(String, i64, i64), Entry<Vec<ChunkDoc>>>>,
    ttl: Duration,
}

impl ChunkRangeCache {
    pub fn new(ttl: Duration, max_elements: usize) -> Self {
        let capacity = NonZeroUsize::new(max_elements.max(1)).unwrap();
        ChunkRangeCache {
            entries: RwLock::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, files_id: &str, lo: i64, hi: i64) -> Option<Vec<ChunkDoc>> {
        if self.ttl.is_zero() {
            return None;
        }
        let mut entries = self.entries.write();
        let key = (files_id.to_string(), lo, hi);
        match entries.get(&key) {
            Some(entry) if !entry.is_expired() => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, files_id: &str, lo: i64, hi: i64, chunks: Vec<ChunkDoc>) {
        if self.ttl.is_zero() {
            return;
        }
        let key = (files_id.to_string(), lo, hi);
        self.entries.write().put(key, Entry::fresh(chunks, self.ttl));
    }

    /// Coarse reset performed after any successful write to a file's
    /// chunks, and on reconnection. See spec §4.2.
    pub fn reset(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::{InodeType, Metadata};
    use bson::oid::ObjectId;
    use std::collections::HashMap as Map;

    fn sample_inode() -> Inode {
        Inode {
            id: ObjectId::new(),
            parent_id: None,
            filename: "f".into(),
            kind: InodeType::Regular,
            chunk_size: 1024,
            length: 0,
            metadata: Metadata {
                size: 0,
                ctime: 0,
                mtime: 0,
                atime: 0,
                uid: 0,
                gid: 0,
                mode: 0o644,
                nlink: 1,
                blocks: 0,
            },
            attrs: Map::new(),
            lock: Vec::new(),
            lock_version: 0,
            target: None,
            host: "h".into(),
            uname: "u".into(),
            gname: "g".into(),
        }
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let cache = MetadataCache::new(Duration::ZERO, 10);
        cache.put("p", "f", sample_inode());
        assert!(cache.get("p", "f").is_none());
    }

    #[test]
    fn put_then_get_round_trips_until_reset() {
        let cache = MetadataCache::new(Duration::from_secs(30), 10);
        cache.put("p", "f", sample_inode());
        assert!(cache.get("p", "f").is_some());
        cache.reset();
        assert!(cache.get("p", "f").is_none());
    }

    #[test]
    fn chunk_range_cache_round_trips() {
        let cache = ChunkRangeCache::new(Duration::from_secs(30), 4);
        cache.put("id", 0, 1, vec![]);
        assert!(cache.get("id", 0, 1).is_some());
        cache.reset();
        assert!(cache.get("id", 0, 1).is_none());
    }
}
