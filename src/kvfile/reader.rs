use super::{Record, LEN_PREFIX_SIZE};
use bytes::Bytes;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Read cursor over a record file. Every reader owns its file handle and
/// position, so readers never affect each other or the append cursor.
#[derive(Debug)]
pub struct Reader {
    file: BufReader<File>,
    position: u64,
    failed: bool,
}

impl Reader {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;

        Ok(Self {
            file: BufReader::new(file),
            position: 0,
            failed: false,
        })
    }

    pub fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.position = offset;
        self.failed = false;

        Ok(())
    }

    /// Offset of the next record to be read.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads the record under the cursor. `Ok(None)` means the cursor is at the
    /// end of the file right on a record boundary. A record cut short by the
    /// end of the file is an `UnexpectedEof` error.
    pub fn next_record(&mut self) -> io::Result<Option<Record>> {
        let offset = self.position;

        let key_len = match self.read_len()? {
            Some(len) => len,
            None => return Ok(None),
        };
        let key = self.read_data(key_len, offset, "key")?;

        let value_len = match self.read_len()? {
            Some(len) => len,
            None => return Err(truncated(offset, "value length")),
        };
        let value = self.read_data(value_len, offset, "value")?;

        Ok(Some(Record { key, value, offset }))
    }

    /// Reads the 4 bytes length prefix. Returns `None` if not a single byte is
    /// left, errors if only a part of the prefix is there.
    fn read_len(&mut self) -> io::Result<Option<u32>> {
        let mut buf = [0u8; LEN_PREFIX_SIZE as usize];
        let mut filled = 0;

        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.position += filled as u64;

        match filled {
            0 => Ok(None),
            4 => Ok(Some(u32::from_le_bytes(buf))),
            _ => Err(truncated(self.position - filled as u64, "length prefix")),
        }
    }

    fn read_data(&mut self, len: u32, offset: u64, what: &str) -> io::Result<Bytes> {
        // Reading through take() does not trust the prefix with the allocation size.
        let mut data = Vec::new();
        let read = self.file.by_ref().take(len as u64).read_to_end(&mut data)?;
        self.position += read as u64;

        if read < len as usize {
            return Err(truncated(offset, what));
        }

        Ok(Bytes::from(data))
    }
}

impl Iterator for Reader {
    type Item = io::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        match self.next_record() {
            Ok(record) => record.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn truncated(offset: u64, what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("record at offset {} is cut short while reading {}", offset, what),
    )
}
