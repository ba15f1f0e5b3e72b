use super::memtable::MemTable;
use crate::kvfile::{self, KvFile, Reader};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/*
SST layout schema. A table is a regular record file, the first record is the
index header and the rest are the data records in ascending key order.
------------------------------------------------------------------------
|            Header Record            |          Data Section          |
------------------------------------------------------------------------
| key "index" | value: encoded index  | Record #1 | ... | Record #N    |
------------------------------------------------------------------------

Index value layout. Offsets are relative to the start of the data section.
-------------------------------------------------------------------------
| Entries num (4B) | key_len (4B) | key | offset (8B) | ... | Entry #N |
-------------------------------------------------------------------------
All integers are little endian.
*/

/// Key of the header record. Header is located by position, so data keys
/// equal to it are stored and looked up like any other.
pub const INDEX_KEY: &[u8] = b"index";

/// Extension of a complete table file.
pub const TABLE_SUFFIX: &str = ".sst.kv";

/// Extension of a table that is still being written.
pub const TMP_SUFFIX: &str = ".sst.kv.tmp";

/// Immutable on-disk snapshot of one memtable generation. Lifecycle is either
/// write -> many lookups or load -> many lookups.
#[derive(Debug)]
pub struct SsTable {
    seq: u64,
    path: PathBuf,
    reader: Reader,
    index: HashMap<Bytes, u64>,
    data_start: u64,
}

impl SsTable {
    /// Writes every memtable entry into a new table file. The table is
    /// assembled in a temporary file which replaces the target path only once
    /// it is synced, so the target is either absent or complete.
    pub fn write(path: &Path, seq: u64, src: &MemTable) -> io::Result<Self> {
        let tmp_path = tmp_path(path);
        if tmp_path.exists() {
            fs::remove_file(&tmp_path)?;
        }

        let mut offsets: Vec<(Bytes, u64)> = Vec::with_capacity(src.len());
        let mut pos = 0;
        for (key, value) in src.iter() {
            offsets.push((key.clone(), pos));
            pos += kvfile::encoded_len(key, value);
        }

        let file = KvFile::open(&tmp_path)?;
        let header = encode_index(&offsets)?;
        file.append(INDEX_KEY, &header)?;
        let data_start = file.len();

        let mut index = HashMap::with_capacity(offsets.len());
        for ((key, value), (_, expected)) in src.iter().zip(offsets.iter()) {
            let offset = file.append(key, value)? - data_start;
            if offset != *expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "key written at offset {} while index points to {}",
                        offset, expected
                    ),
                ));
            }
            index.insert(key.clone(), offset);
        }

        file.sync()?;
        drop(file);
        fs::rename(&tmp_path, path)?;
        sync_parent(path)?;

        debug!(seq, entries = index.len(), "table written");

        Ok(Self {
            seq,
            path: path.to_path_buf(),
            reader: Reader::open(path)?,
            index,
            data_start,
        })
    }

    /// Opens a table and reads its index into memory. An empty file is a valid
    /// table with no entries.
    pub fn load(path: &Path, seq: u64) -> io::Result<Self> {
        let mut reader = Reader::open(path)?;

        let (index, data_start) = match reader.next_record()? {
            None => (HashMap::new(), 0),
            Some(header) => {
                if header.key.as_ref() != INDEX_KEY {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("table {} does not start with the index", path.display()),
                    ));
                }
                (decode_index(header.value)?, reader.position())
            }
        };

        Ok(Self {
            seq,
            path: path.to_path_buf(),
            reader,
            index,
            data_start,
        })
    }

    /// Looks the key up in the index and reads the record it points to.
    pub fn lookup(&mut self, key: &[u8]) -> io::Result<Option<Bytes>> {
        let offset = match self.index.get(key) {
            Some(offset) => *offset,
            None => return Ok(None),
        };

        self.reader.seek(self.data_start + offset)?;
        let record = self.reader.next_record()?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("no record at indexed offset {}", offset),
            )
        })?;

        if record.key.as_ref() != key {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("index of {} points to a wrong record", self.path.display()),
            ));
        }

        Ok(Some(record.value))
    }

    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Path of the table with the given sequence number.
pub fn table_path(data_path: &Path, seq: u64) -> PathBuf {
    data_path.join(format!("{}{}", seq, TABLE_SUFFIX))
}

/// Extracts the sequence number out of a table file name. Only the names
/// `table_path` produces are accepted, so `+1` or `007` are not table names.
pub fn parse_seq(filename: &str) -> Option<u64> {
    let digits = filename.strip_suffix(TABLE_SUFFIX)?;
    let seq = digits.parse::<u64>().ok()?;
    if seq.to_string() != digits {
        return None;
    }

    Some(seq)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::File::open(dir)?.sync_all(),
        _ => Ok(()),
    }
}

fn encode_index(offsets: &[(Bytes, u64)]) -> io::Result<Bytes> {
    let count = u32::try_from(offsets.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "too many table entries"))?;

    let size: usize = offsets.iter().map(|(key, _)| 4 + key.len() + 8).sum();
    let mut buf = BytesMut::with_capacity(4 + size);
    buf.put_u32_le(count);
    for (key, offset) in offsets {
        buf.put_u32_le(key.len() as u32);
        buf.put_slice(key);
        buf.put_u64_le(*offset);
    }

    Ok(buf.freeze())
}

fn decode_index(mut buf: Bytes) -> io::Result<HashMap<Bytes, u64>> {
    let malformed = || io::Error::new(io::ErrorKind::InvalidData, "malformed table index");

    if buf.remaining() < 4 {
        return Err(malformed());
    }
    let count = buf.get_u32_le() as usize;

    let mut index = HashMap::new();
    for _ in 0..count {
        if buf.remaining() < 4 {
            return Err(malformed());
        }
        let key_len = buf.get_u32_le() as usize;
        if buf.remaining() < key_len + 8 {
            return Err(malformed());
        }
        let key = buf.split_to(key_len);
        let offset = buf.get_u64_le();
        index.insert(key, offset);
    }

    if buf.has_remaining() || index.len() != count {
        return Err(malformed());
    }

    Ok(index)
}
