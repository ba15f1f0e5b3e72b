use super::sstable::{self, SsTable};
use bytes::Bytes;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Index holding all the SSTables, oldest first and newest last. It is built
/// from the data folder at startup and extended by every flush.
#[derive(Debug)]
pub struct Index {
    tables: Vec<SsTable>,
    next_seq: u64,
}

impl Index {
    /// Reads the data folder looking for table files and loads them in the
    /// order of their sequence numbers. Leftovers of interrupted flushes are
    /// removed.
    pub fn init(data_path: &Path) -> io::Result<Self> {
        let mut found: Vec<(u64, PathBuf)> = Vec::new();

        for entry in fs::read_dir(data_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }

            let filename = entry.file_name();
            let filename = match filename.to_str() {
                Some(name) => name,
                None => continue,
            };

            if filename.ends_with(sstable::TMP_SUFFIX) {
                warn!("removing unfinished table {}", filename);
                fs::remove_file(entry.path())?;
                continue;
            }

            if !filename.ends_with(sstable::TABLE_SUFFIX) {
                continue;
            }

            match sstable::parse_seq(filename) {
                Some(seq) => found.push((seq, entry.path())),
                None => warn!("skipping {}: no sequence number in the name", filename),
            }
        }

        // Directory listing comes in no particular order.
        found.sort_unstable_by_key(|(seq, _)| *seq);

        let mut tables = Vec::with_capacity(found.len());
        for (seq, path) in found {
            let table = SsTable::load(&path, seq).map_err(|e| {
                io::Error::new(e.kind(), format!("loading {}: {}", path.display(), e))
            })?;
            tables.push(table);
        }

        let next_seq = tables.last().map_or(0, |t| t.seq() + 1);

        info!("loaded {} tables, next sequence number {}", tables.len(), next_seq);

        Ok(Self { tables, next_seq })
    }

    /// Hands out the sequence number for the next table.
    pub fn reserve_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Appends a table as the newest one.
    pub fn push(&mut self, table: SsTable) {
        self.tables.push(table);
    }

    /// Searches the tables from the newest to the oldest.
    pub fn lookup(&mut self, key: &[u8]) -> io::Result<Option<Bytes>> {
        for table in self.tables.iter_mut().rev() {
            if let Some(value) = table.lookup(key)? {
                return Ok(Some(value));
            }
        }

        Ok(None)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Number of keys over all the tables, the same key counted once per table.
    pub fn entries(&self) -> usize {
        self.tables.iter().map(|t| t.entry_count()).sum()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}
