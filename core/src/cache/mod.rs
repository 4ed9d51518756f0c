//! # Partition Cache
//!
//! In-memory record log per topic partition, shared by the fans of one
//! shard. Producers append entries tagged with their member stream id and the
//! produce fan drains them through per-member cursors; fetched records are
//! appended by the fetch fan and every member reads them back from its own
//! cursor.
//!
//! Cursors are absolute positions. Entries beyond the partition capacity are
//! evicted from the head; a cursor pointing before the head continues from
//! the oldest retained entry.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

use crate::frame::KafkaHeader;

/// Default number of entries retained per partition.
pub const DEFAULT_PARTITION_CAPACITY: usize = 64 * 1024;

/// Offset requesting the oldest retained entry.
pub const OFFSET_EARLIEST: i64 = -2;
/// Offset requesting only entries appended from now on.
pub const OFFSET_LATEST: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Produce,
    Fetch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Kafka offset, `-1` until the broker assigned one.
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<KafkaHeader>,
    /// Stream that appended the entry, `0` for upstream records.
    pub owner: u64,
}

impl CacheEntry {
    pub fn new(offset: i64, timestamp: i64, key: Option<Bytes>, value: Option<Bytes>) -> Self {
        Self {
            offset,
            timestamp,
            key,
            value,
            headers: Vec::new(),
            owner: 0,
        }
    }

    pub fn with_headers(mut self, headers: Vec<KafkaHeader>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_owner(mut self, owner: u64) -> Self {
        self.owner = owner;
        self
    }

    /// Bytes charged against a window when the entry is delivered.
    pub fn size(&self) -> usize {
        self.value.as_ref().map_or(0, Bytes::len)
    }
}

#[derive(Debug)]
pub struct CachePartition {
    entries: VecDeque<CacheEntry>,
    head: u64,
    capacity: usize,
}

impl CachePartition {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            head: 0,
            capacity: capacity.max(1),
        }
    }

    /// Position of the oldest retained entry.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Position the next appended entry will take.
    pub fn tail(&self) -> u64 {
        self.head + self.entries.len() as u64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, entry: CacheEntry) -> u64 {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.head += 1;
        }
        self.entries.push_back(entry);
        self.tail() - 1
    }

    pub fn get(&self, position: u64) -> Option<&CacheEntry> {
        position
            .checked_sub(self.head)
            .and_then(|index| self.entries.get(index as usize))
    }

    pub fn get_mut(&mut self, position: u64) -> Option<&mut CacheEntry> {
        position
            .checked_sub(self.head)
            .and_then(|index| self.entries.get_mut(index as usize))
    }

    /// Cursor for a Kafka offset: earliest, latest, or the first entry at or
    /// after `offset`.
    pub fn seek(&self, offset: i64) -> u64 {
        match offset {
            OFFSET_EARLIEST => self.head,
            OFFSET_LATEST => self.tail(),
            offset => self
                .entries
                .iter()
                .position(|entry| entry.offset >= offset)
                .map_or(self.tail(), |index| self.head + index as u64),
        }
    }

    /// Next offset expected from upstream, `None` while empty.
    pub fn next_offset(&self) -> Option<i64> {
        self.entries.back().map(|entry| entry.offset + 1)
    }

    /// First entry at or after `cursor` appended by `owner`.
    pub fn next_for(&self, cursor: u64, owner: u64) -> Option<(u64, &CacheEntry)> {
        let start = cursor.max(self.head);
        (start..self.tail())
            .filter_map(|position| self.get(position).map(|entry| (position, entry)))
            .find(|(_, entry)| entry.owner == owner)
    }

    /// First entry at or after `cursor`, whoever appended it.
    pub fn next(&self, cursor: u64) -> Option<(u64, &CacheEntry)> {
        let position = cursor.max(self.head);
        self.get(position).map(|entry| (position, entry))
    }

    /// Drops every entry appended by `owner`.
    pub fn evict_owner(&mut self, owner: u64) {
        for entry in self.entries.iter_mut().filter(|entry| entry.owner == owner) {
            entry.owner = 0;
            entry.value = None;
        }
    }

    pub fn clear(&mut self) {
        self.head = self.tail();
        self.entries.clear();
    }
}

#[derive(Debug)]
pub struct PartitionCache {
    partitions: HashMap<(CacheKind, String, i32), CachePartition>,
    capacity: usize,
}

impl Default for PartitionCache {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITION_CAPACITY)
    }
}

impl PartitionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            partitions: HashMap::new(),
            capacity,
        }
    }

    pub fn partition(&self, kind: CacheKind, topic: &str, partition_id: i32) -> Option<&CachePartition> {
        self.partitions.get(&(kind, topic.to_string(), partition_id))
    }

    pub fn partition_mut(
        &mut self,
        kind: CacheKind,
        topic: &str,
        partition_id: i32,
    ) -> &mut CachePartition {
        let capacity = self.capacity;
        self.partitions
            .entry((kind, topic.to_string(), partition_id))
            .or_insert_with(|| CachePartition::new(capacity))
    }

    pub fn remove(&mut self, kind: CacheKind, topic: &str, partition_id: i32) {
        self.partitions.remove(&(kind, topic.to_string(), partition_id));
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(offset: i64, owner: u64) -> CacheEntry {
        CacheEntry::new(offset, 0, None, Some(Bytes::from_static(b"v"))).with_owner(owner)
    }

    #[test]
    fn test_cursor_per_owner() {
        let mut cache = PartitionCache::new(16);
        let partition = cache.partition_mut(CacheKind::Produce, "events", 0);
        partition.append(entry(-1, 3));
        partition.append(entry(-1, 5));
        partition.append(entry(-1, 3));

        let (first, _) = partition.next_for(0, 3).unwrap();
        assert_eq!(first, 0);
        let (second, _) = partition.next_for(first + 1, 3).unwrap();
        assert_eq!(second, 2);
        assert!(partition.next_for(second + 1, 3).is_none());
        assert_eq!(partition.next_for(0, 5).unwrap().0, 1);
    }

    #[test]
    fn test_eviction_moves_head() {
        let mut cache = PartitionCache::new(2);
        let partition = cache.partition_mut(CacheKind::Fetch, "events", 1);
        for offset in 10..13 {
            partition.append(entry(offset, 0));
        }
        assert_eq!(partition.head(), 1);
        assert_eq!(partition.tail(), 3);
        assert!(partition.get(0).is_none());
        assert_eq!(partition.next(0).unwrap().1.offset, 11);
        assert_eq!(partition.next_offset(), Some(13));
    }

    #[test]
    fn test_seek() {
        let mut cache = PartitionCache::default();
        let partition = cache.partition_mut(CacheKind::Fetch, "events", 0);
        for offset in [5, 6, 8] {
            partition.append(entry(offset, 0));
        }
        assert_eq!(partition.seek(OFFSET_EARLIEST), 0);
        assert_eq!(partition.seek(OFFSET_LATEST), 3);
        assert_eq!(partition.seek(7), 2);
        assert_eq!(partition.seek(100), 3);
    }

    #[test]
    fn test_kinds_are_separate() {
        let mut cache = PartitionCache::default();
        cache.partition_mut(CacheKind::Produce, "events", 0).append(entry(-1, 3));
        assert!(cache.partition(CacheKind::Fetch, "events", 0).is_none());
        assert_eq!(cache.partition(CacheKind::Produce, "events", 0).map(|p| p.len()), Some(1));
    }
}
