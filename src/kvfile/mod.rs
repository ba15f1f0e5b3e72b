mod reader;

pub use reader::Reader;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/*
Record layout schema. Records are written back to back, there is no header,
no padding and no checksum in the file.
-------------------------------------------------------------
| Key Length | Key Data | Value Length | Value Data | ...   |
-------------------------------------------------------------
|  4B (LE)   |   ...    |   4B (LE)    |    ...     | ...   |
-------------------------------------------------------------
*/

/// Size of a single length prefix.
pub const LEN_PREFIX_SIZE: u64 = std::mem::size_of::<u32>() as u64; // 4.

/// A single key/value pair read back from the log together with the offset
/// the record starts at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
    pub offset: u64,
}

/// Append-only file of length prefixed key/value records. The file has exactly
/// one append cursor guarded by its own lock, reads go through independent
/// [`Reader`]s that open their own file handles.
#[derive(Debug)]
pub struct KvFile {
    path: PathBuf,
    writer: Mutex<Writer>,
}

#[derive(Debug)]
struct Writer {
    file: File,
    position: u64,
}

impl KvFile {
    /// Opens the file at the given path for appending, creating it if needed.
    /// Appends continue from the current end of the file.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let position = file.metadata()?.len();

        Ok(Self {
            path,
            writer: Mutex::new(Writer { file, position }),
        })
    }

    /// Writes key and value at the end of the file and returns the offset the
    /// record starts at.
    pub fn append(&self, key: &[u8], value: &[u8]) -> io::Result<u64> {
        let encoded = encode(key, value)?;

        let mut writer = self.writer.lock();
        let offset = writer.position;

        if let Err(e) = writer.file.write_all(&encoded) {
            // A part of the record may have landed, the file end is the truth.
            if let Ok(meta) = writer.file.metadata() {
                writer.position = meta.len();
            }
            return Err(e);
        }
        writer.position += encoded.len() as u64;

        Ok(offset)
    }

    /// Drops all the records.
    pub fn truncate(&self) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.file.set_len(0)?;
        writer.position = 0;

        Ok(())
    }

    /// Forces everything appended so far to stable storage.
    pub fn sync(&self) -> io::Result<()> {
        self.writer.lock().file.sync_all()
    }

    /// Returns a new reader with its own file handle, positioned at the start.
    pub fn reader(&self) -> io::Result<Reader> {
        Reader::open(&self.path)
    }

    /// Offset the next record will be written at.
    pub fn len(&self) -> u64 {
        self.writer.lock().position
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Encodes a single record. Fails if key or value does not fit the 4 bytes
/// length prefix.
pub fn encode(key: &[u8], value: &[u8]) -> io::Result<Bytes> {
    let key_len = prefix(key, "key")?;
    let value_len = prefix(value, "value")?;

    let mut buf = BytesMut::with_capacity(encoded_len(key, value) as usize);
    buf.put_u32_le(key_len);
    buf.put_slice(key);
    buf.put_u32_le(value_len);
    buf.put_slice(value);

    Ok(buf.freeze())
}

/// Number of bytes the record takes on disk.
pub fn encoded_len(key: &[u8], value: &[u8]) -> u64 {
    LEN_PREFIX_SIZE + key.len() as u64 + LEN_PREFIX_SIZE + value.len() as u64
}

fn prefix(data: &[u8], what: &str) -> io::Result<u32> {
    u32::try_from(data.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} of {} bytes does not fit a record", what, data.len()),
        )
    })
}
