use bytes::Bytes;
use std::collections::btree_map::{self, BTreeMap};

/// How many distinct keys the memtable holds before it is flushed into a table.
pub const MEMTABLE_ENTRIES: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub enum MemTableSize {
    Default,
    Is(usize),
}

impl MemTableSize {
    pub fn entries(self) -> usize {
        match self {
            MemTableSize::Default => MEMTABLE_ENTRIES,
            MemTableSize::Is(entries) => entries,
        }
    }
}

/// Sorted in-memory buffer of the most recent writes.
#[derive(Debug, Clone)]
pub struct MemTable {
    map: BTreeMap<Bytes, Bytes>,
    limit: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertResult {
    Full,
    Available,
}

impl MemTable {
    pub fn new(size: MemTableSize) -> MemTable {
        MemTable {
            map: BTreeMap::new(),
            limit: size.entries(),
        }
    }

    /// Inserts or overwrites the key. Reports `Full` once the table holds more
    /// keys than its limit.
    pub fn insert(&mut self, key: Bytes, value: Bytes) -> InsertResult {
        self.map.insert(key, value);
        if self.is_full() {
            return InsertResult::Full;
        }

        InsertResult::Available
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.map.get(key).cloned()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn is_full(&self) -> bool {
        self.map.len() > self.limit
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Entries in ascending key order.
    pub fn iter(&self) -> btree_map::Iter<'_, Bytes, Bytes> {
        self.map.iter()
    }
}
