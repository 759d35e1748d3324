//! Size and LRU bookkeeping for completed cache entries

use lru::LruCache;
use std::collections::HashMap;
use std::path::PathBuf;

/// A completed, byte-complete entry on disk
#[derive(Debug, Clone)]
pub(crate) struct EntryMeta {
    pub size: u64,
    pub path: PathBuf,
}

/// Ready entries in LRU order plus the readers currently holding them.
///
/// Entries with readers are never chosen for eviction; they are reconsidered
/// every time a reader leaves.
pub(crate) struct CacheIndex {
    entries: LruCache<String, EntryMeta>,
    /// Active readers per entry name, including readers of in-flight entries
    leases: HashMap<String, usize>,
    total_bytes: u64,
    max_size: u64,
    /// 0 means unbounded
    max_items: usize,
}

impl CacheIndex {
    pub fn new(max_size: u64, max_items: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            leases: HashMap::new(),
            total_bytes: 0,
            max_size,
            max_items,
        }
    }

    pub fn insert(&mut self, name: String, meta: EntryMeta) {
        self.total_bytes += meta.size;
        if let Some(old) = self.entries.put(name, meta) {
            self.total_bytes -= old.size;
        }
    }

    /// Look up an entry and mark it most recently used
    pub fn get(&mut self, name: &str) -> Option<&EntryMeta> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<EntryMeta> {
        let meta = self.entries.pop(name)?;
        self.total_bytes -= meta.size;
        Some(meta)
    }

    pub fn acquire(&mut self, name: &str) {
        *self.leases.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn release(&mut self, name: &str) {
        if let Some(count) = self.leases.get_mut(name) {
            *count -= 1;
            if *count == 0 {
                self.leases.remove(name);
            }
        }
    }

    pub fn readers(&self, name: &str) -> usize {
        self.leases.get(name).copied().unwrap_or(0)
    }

    fn over_limits(&self) -> bool {
        self.total_bytes > self.max_size
            || (self.max_items > 0 && self.entries.len() > self.max_items)
    }

    /// Drop least recently used entries without readers until the limits
    /// hold again. Returns the removed entries so their files can be deleted
    /// outside the lock.
    pub fn evict(&mut self) -> Vec<(String, EntryMeta)> {
        let mut evicted = Vec::new();

        while self.over_limits() {
            let victim = self
                .entries
                .iter()
                .rev()
                .map(|(name, _)| name)
                .find(|name| !self.leases.contains_key(*name))
                .cloned();

            // Everything left is being read
            let Some(name) = victim else { break };

            if let Some(meta) = self.remove(&name) {
                evicted.push((name, meta));
            }
        }

        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}
