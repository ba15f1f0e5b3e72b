mod index;
pub mod memtable;
pub mod sstable;

use crate::kvfile::KvFile;
use crate::Result;
use bytes::Bytes;
use index::Index;
use memtable::{InsertResult, MemTable, MemTableSize};
use parking_lot::Mutex;
use sstable::SsTable;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Name of the write-ahead log inside the data directory.
pub const WAL_FILENAME: &str = "wal.kv";

/// Engine is a working horse of the database. Writes go to the WAL first and
/// then to the memtable, a memtable that grew over its limit is written out as
/// a new SSTable. Every public call holds the engine lock for its whole
/// duration, flush included.
#[derive(Debug)]
pub struct Engine {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    data_path: PathBuf,
    wal: KvFile,
    memtable: MemTable,
    index: Index,
}

/// Entries counters, for introspection only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub memtable_entries: usize,
    pub table_entries: usize,
    pub tables: usize,
}

impl Engine {
    /// Opens the store in the given directory, creating it if it is missing.
    /// The memtable is rebuilt by replaying the WAL and the tables found in the
    /// directory are loaded oldest to newest.
    pub fn open(data_path: impl AsRef<Path>, size: MemTableSize) -> Result<Self> {
        let start = Instant::now();
        let data_path = data_path.as_ref().to_path_buf();

        if !data_path.exists() {
            fs::create_dir_all(&data_path)?;
        }

        let wal = KvFile::open(data_path.join(WAL_FILENAME))?;

        let mut memtable = MemTable::new(size);
        let mut replayed = 0;
        for record in wal.reader()? {
            let record = record.map_err(|e| {
                io::Error::new(e.kind(), format!("replaying {}: {}", WAL_FILENAME, e))
            })?;
            memtable.insert(record.key, record.value);
            replayed += 1;
        }

        let index = Index::init(&data_path)?;

        let mut inner = Inner {
            data_path,
            wal,
            memtable,
            index,
        };

        // The limit may have been lowered since the log was written.
        if inner.memtable.is_full() {
            inner.flush()?;
        }

        info!(
            "engine opened in {} ms: {} WAL records replayed into {} keys, {} tables",
            start.elapsed().as_millis(),
            replayed,
            inner.memtable.len(),
            inner.index.len()
        );

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Persists the pair in the WAL and makes it visible. If the memtable
    /// grows over its limit it is flushed before returning.
    pub fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
        let mut inner = self.inner.lock();

        inner.wal.append(&key, &value)?;

        if inner.memtable.insert(key, value) == InsertResult::Full {
            inner.flush()?;
        }

        Ok(())
    }

    /// Returns the most recent value of the key: memtable first, then tables
    /// from the newest to the oldest.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let mut inner = self.inner.lock();

        if let Some(value) = inner.memtable.get(key) {
            return Ok(Some(value));
        }

        Ok(inner.index.lookup(key)?)
    }

    /// Writes out the memtable even if it is not full yet. Does nothing for an
    /// empty memtable.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.memtable.is_empty() {
            return Ok(());
        }

        Ok(inner.flush()?)
    }

    pub fn stats(&self) -> Stats {
        let inner = self.inner.lock();

        Stats {
            memtable_entries: inner.memtable.len(),
            table_entries: inner.index.entries(),
            tables: inner.index.len(),
        }
    }
}

impl Inner {
    /// The table has to be on disk before the memtable is dropped and the WAL
    /// is truncated. An error at any step leaves the data in the WAL, in the
    /// new table, or in both.
    fn flush(&mut self) -> io::Result<()> {
        let start = Instant::now();

        let seq = self.index.reserve_seq();
        let path = sstable::table_path(&self.data_path, seq);

        let table = SsTable::write(&path, seq, &self.memtable)?;
        let entries = table.entry_count();
        self.index.push(table);

        self.memtable.clear();
        self.wal.truncate()?;

        debug!(
            "flushed {} entries into {} in {} ms",
            entries,
            path.display(),
            start.elapsed().as_millis()
        );

        Ok(())
    }
}
