//! Chunk cache: bounded resource -> chunk map with FIFO eviction.

use std::collections::{HashMap, VecDeque};

/// Default number of chunks kept in memory.
pub const MAX_CACHE_SIZE: usize = 4;

/// Bounded chunk store. Eviction removes the earliest-inserted entry regardless of how
/// often it was read (FIFO, not LRU).
#[derive(Debug, Clone)]
pub struct ChunkCache {
    /// Insertion order; front is the oldest resource.
    order: VecDeque<String>,
    entries: HashMap<String, Vec<u8>>,
    capacity: usize,
}

impl Default for ChunkCache {
    fn default() -> Self {
        Self::new(MAX_CACHE_SIZE)
    }
}

impl ChunkCache {
    /// Create a cache holding at most `capacity` chunks (0 is treated as 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity + 1),
            entries: HashMap::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn get(&self, resource: &str) -> Option<&[u8]> {
        self.entries.get(resource).map(Vec::as_slice)
    }

    pub fn contains(&self, resource: &str) -> bool {
        self.entries.contains_key(resource)
    }

    /// Insert a chunk. Returns the evicted resource when the cache was over capacity.
    /// Replacing an existing resource keeps its original position in the eviction order.
    pub fn put(&mut self, resource: impl Into<String>, chunk: Vec<u8>) -> Option<String> {
        let resource = resource.into();
        if let Some(existing) = self.entries.get_mut(&resource) {
            *existing = chunk;
            return None;
        }
        self.order.push_back(resource.clone());
        self.entries.insert(resource, chunk);
        self.evict_overflow()
    }

    fn evict_overflow(&mut self) -> Option<String> {
        if self.entries.len() <= self.capacity {
            return None;
        }
        let oldest = self.order.pop_front()?;
        self.entries.remove(&oldest);
        Some(oldest)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cached resources, oldest first.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_evicts_first_inserted() {
        let mut cache = ChunkCache::new(4);
        for (i, r) in ["A", "B", "C", "D"].iter().enumerate() {
            assert_eq!(cache.put(*r, vec![i as u8]), None);
        }
        assert_eq!(cache.put("E", vec![4]), Some("A".to_string()));
        assert!(!cache.contains("A"));
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.keys().collect::<Vec<_>>(), vec!["B", "C", "D", "E"]);
    }

    #[test]
    fn reads_do_not_promote() {
        let mut cache = ChunkCache::new(2);
        cache.put("A", vec![1]);
        cache.put("B", vec![2]);
        for _ in 0..10 {
            assert_eq!(cache.get("A"), Some(&[1u8][..]));
        }
        assert_eq!(cache.put("C", vec![3]), Some("A".to_string()));
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut cache = ChunkCache::default();
        for i in 0..50 {
            cache.put(format!("seg-{i}.ts"), vec![i as u8; 16]);
            assert!(cache.len() <= MAX_CACHE_SIZE);
        }
        assert_eq!(
            cache.keys().collect::<Vec<_>>(),
            vec!["seg-46.ts", "seg-47.ts", "seg-48.ts", "seg-49.ts"]
        );
    }

    #[test]
    fn replace_keeps_position() {
        let mut cache = ChunkCache::new(2);
        cache.put("A", vec![1]);
        cache.put("B", vec![2]);
        assert_eq!(cache.put("A", vec![7]), None);
        assert_eq!(cache.get("A"), Some(&[7u8][..]));
        assert_eq!(cache.put("C", vec![3]), Some("A".to_string()));
    }

    #[test]
    fn zero_capacity_clamped() {
        let mut cache = ChunkCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.put("A", vec![]);
        assert_eq!(cache.put("B", vec![]), Some("A".to_string()));
        assert_eq!(cache.len(), 1);
    }
}
