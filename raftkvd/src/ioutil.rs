//! Buffered length-prefixed record I/O over a single file.
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use raftkvd_api::LogRecord;
use tracing::error;

/// Abort on an unrecoverable persistence failure. Durability errors cannot be
/// handled from inside the node; recovery restarts from disk.
pub fn fatal(context: &str, err: impl std::fmt::Display) -> ! {
    error!(%err, "{context}: unrecoverable I/O failure, crashing immediately");
    std::process::abort();
}

pub const BUFFER_SIZE: usize = 128 << 10;

/// Length-prefixed record stream over one file with a fixed in-memory buffer.
///
/// An instance is used either for reading or for writing, never both; the
/// buffer is shared between the two directions.
pub struct BufferedFile {
    file: File,
    buf: Vec<u8>,
    /// Bytes of valid content in `buf`
    data: usize,
    /// Bytes already handed out to readers
    consumed: usize,
}

impl BufferedFile {
    pub fn from_file(file: File) -> Self {
        Self {
            file,
            buf: vec![0; BUFFER_SIZE],
            data: 0,
            consumed: 0,
        }
    }

    /// Open for writing, creating the file if needed. Write-side open
    /// failures are fatal: they only happen on the durability path.
    pub fn create(path: &Path) -> Self {
        match OpenOptions::new().create(true).write(true).open(path) {
            Ok(file) => Self::from_file(file),
            Err(err) => fatal("opening file for write", err),
        }
    }

    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self::from_file(File::open(path)?))
    }

    /// Hand out `n` writable bytes, flushing first if they would not fit.
    pub fn reserve(&mut self, n: usize) -> &mut [u8] {
        assert!(n <= BUFFER_SIZE);
        if self.data + n > BUFFER_SIZE {
            self.flush();
        }
        let start = self.data;
        self.data += n;
        &mut self.buf[start..start + n]
    }

    /// Return `n` contiguous readable bytes, or `None` at end of file.
    pub fn fetch(&mut self, n: usize) -> Option<&[u8]> {
        assert!(n <= BUFFER_SIZE);
        if self.consumed + n > self.data {
            self.buf.copy_within(self.consumed..self.data, 0);
            self.data -= self.consumed;
            self.consumed = 0;
            while self.data < BUFFER_SIZE {
                match self.file.read(&mut self.buf[self.data..]) {
                    Ok(0) => break,
                    Ok(read) => self.data += read,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => fatal("file read", err),
                }
                if self.data >= n {
                    break;
                }
            }
        }
        if self.consumed + n > self.data {
            None
        } else {
            let start = self.consumed;
            self.consumed += n;
            Some(&self.buf[start..start + n])
        }
    }

    pub fn flush(&mut self) {
        if let Err(err) = self.file.write_all(&self.buf[..self.data]) {
            fatal("file write", err);
        }
        self.data = 0;
        self.consumed = 0;
    }

    /// Flush and fdatasync. The durable point only advances past this call.
    pub fn sync(&mut self) {
        self.flush();
        if let Err(err) = self.file.sync_data() {
            fatal("file sync", err);
        }
    }

    pub fn write_i64(&mut self, value: i64) {
        self.reserve(8).copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_i64(&mut self) -> Option<i64> {
        let bytes = self.fetch(8)?;
        Some(i64::from_le_bytes(bytes.try_into().expect("can't fail")))
    }

    pub fn write_log_record(&mut self, record: &LogRecord) {
        let encoded = record.encode();
        self.write_i64(encoded.len() as i64);
        self.reserve(encoded.len()).copy_from_slice(&encoded);
    }

    /// Read the next record. `None` means honest end-of-log: end of file or
    /// a record that no longer parses (a mid-record crash); everything read
    /// so far stays authoritative.
    pub fn read_log_record(&mut self) -> Option<LogRecord> {
        let len = usize::try_from(self.read_i64()?).ok()?;
        if len > BUFFER_SIZE {
            return None;
        }
        let bytes = self.fetch(len)?;
        LogRecord::decode(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raftkvd_api::{LogIndex, Operation};

    fn record(ts: i64, key: &str, value: &str) -> LogRecord {
        LogRecord {
            ts: LogIndex(ts),
            operations: vec![Operation {
                key: key.into(),
                value: value.into(),
            }],
        }
    }

    #[test]
    fn record_stream_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream");

        let mut writer = BufferedFile::create(&path);
        writer.write_i64(-1);
        for i in 0..100 {
            writer.write_log_record(&record(i, &format!("key-{i}"), &format!("value-{i}")));
        }
        writer.sync();

        let mut reader = BufferedFile::open(&path).unwrap();
        assert_eq!(reader.read_i64(), Some(-1));
        for i in 0..100 {
            assert_eq!(
                reader.read_log_record(),
                Some(record(i, &format!("key-{i}"), &format!("value-{i}")))
            );
        }
        assert_eq!(reader.read_log_record(), None);
    }

    #[test]
    fn truncated_tail_is_honest_end_of_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream");

        let mut writer = BufferedFile::create(&path);
        writer.write_log_record(&record(0, "a", "1"));
        writer.write_log_record(&record(1, "b", "2"));
        writer.sync();

        // chop off the middle of the second record
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 3]).unwrap();

        let mut reader = BufferedFile::open(&path).unwrap();
        assert_eq!(reader.read_log_record(), Some(record(0, "a", "1")));
        assert_eq!(reader.read_log_record(), None);
    }

    #[test]
    fn large_batches_cross_buffer_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream");

        let big_value = "x".repeat(40 << 10);
        let mut writer = BufferedFile::create(&path);
        for i in 0..16 {
            writer.write_log_record(&record(i, "big", &big_value));
        }
        writer.sync();

        let mut reader = BufferedFile::open(&path).unwrap();
        for i in 0..16 {
            assert_eq!(reader.read_log_record(), Some(record(i, "big", &big_value)));
        }
        assert_eq!(reader.read_log_record(), None);
    }
}
