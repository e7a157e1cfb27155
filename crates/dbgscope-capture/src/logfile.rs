//! Saved-log binary format
//!
//! A file starts with the 8-byte magic `DBGSCOPE` and a little-endian `u32`
//! version, followed by records:
//! - length: u32 LE
//! - data: bincode encoded [`Message`]
//! - crc: u32 LE, CRC32 of length + data
//!
//! [`RecordDecoder`] is incremental so a file that is still being written can
//! be followed; a partially written trailing record is simply not yet
//! available.

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use dbgscope_types::Message;

use crate::error::{CaptureError, Result};

pub const LOG_FILE_MAGIC: &[u8; 8] = b"DBGSCOPE";
pub const LOG_FILE_VERSION: u32 = 1;

const HEADER_LEN: usize = LOG_FILE_MAGIC.len() + 4;
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;
/// Consumed bytes are compacted away once this many have accumulated
const COMPACT_THRESHOLD: usize = 64 * 1024;

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

fn record_crc(len: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len.to_le_bytes());
    hasher.update(data);
    hasher.finalize()
}

/// Whether `header` begins with the saved-log magic
pub fn has_magic(header: &[u8]) -> bool {
    header.starts_with(LOG_FILE_MAGIC)
}

/// Incremental decoder fed with arbitrary chunks of a saved log
#[derive(Debug, Default)]
pub struct RecordDecoder {
    pending: Vec<u8>,
    offset: usize,
    header_seen: bool,
    records: u64,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.offset >= COMPACT_THRESHOLD || self.offset == self.pending.len() {
            self.pending.drain(..self.offset);
            self.offset = 0;
        }
        self.pending.extend_from_slice(bytes);
    }

    /// Decode the next complete record; `Ok(None)` means more bytes are needed
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if !self.header_seen {
            let available = &self.pending[self.offset..];
            if available.len() < HEADER_LEN {
                if !LOG_FILE_MAGIC.starts_with(&available[..available.len().min(LOG_FILE_MAGIC.len())]) {
                    return Err(CaptureError::Format("missing DBGSCOPE header".to_string()));
                }
                return Ok(None);
            }
            if !has_magic(available) {
                return Err(CaptureError::Format("missing DBGSCOPE header".to_string()));
            }
            let version = read_u32(&available[LOG_FILE_MAGIC.len()..]);
            if version != LOG_FILE_VERSION {
                return Err(CaptureError::Format(format!("unsupported version {version}")));
            }
            self.offset += HEADER_LEN;
            self.header_seen = true;
        }

        let available = &self.pending[self.offset..];
        if available.len() < 4 {
            return Ok(None);
        }
        let len = read_u32(available);
        let data_len = len as usize;
        if data_len > MAX_RECORD_LEN {
            return Err(CaptureError::Format(format!(
                "record {} claims {data_len} bytes",
                self.records
            )));
        }
        let total = 4 + data_len + 4;
        if available.len() < total {
            return Ok(None);
        }

        let data = &available[4..4 + data_len];
        let crc = read_u32(&available[4 + data_len..]);
        if crc != record_crc(len, data) {
            return Err(CaptureError::Format(format!("checksum mismatch in record {}", self.records)));
        }
        let message = bincode::deserialize(data)?;

        self.offset += total;
        self.records += 1;
        Ok(Some(message))
    }

    /// Bytes received but not yet decoded (a partially written record)
    pub fn has_pending(&self) -> bool {
        self.offset < self.pending.len()
    }

    pub fn records(&self) -> u64 {
        self.records
    }
}

/// Streaming writer for the saved-log format
pub struct LogFileWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> LogFileWriter<W> {
    /// Wrap `inner` and write the file header
    pub fn new(mut inner: W) -> Result<Self> {
        inner
            .write_all(LOG_FILE_MAGIC)
            .and_then(|()| inner.write_all(&LOG_FILE_VERSION.to_le_bytes()))
            .map_err(|e| CaptureError::os("write log header", e))?;
        Ok(Self { inner, count: 0 })
    }

    pub fn write_message(&mut self, message: &Message) -> Result<()> {
        let data = bincode::serialize(message)?;
        let len = u32::try_from(data.len())
            .map_err(|_| CaptureError::Format(format!("record of {} bytes is too large", data.len())))?;
        let crc = record_crc(len, &data);

        self.inner
            .write_all(&len.to_le_bytes())
            .and_then(|()| self.inner.write_all(&data))
            .and_then(|()| self.inner.write_all(&crc.to_le_bytes()))
            .map_err(|e| CaptureError::os("write log record", e))?;
        self.count += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush().map_err(|e| CaptureError::os("flush log file", e))
    }

    /// Number of records written so far
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Iterator over the records of a complete saved log
///
/// A truncated final record is logged and treated as the end of the file.
pub struct LogFileReader<R: Read> {
    inner: R,
    decoder: RecordDecoder,
    chunk: Vec<u8>,
    done: bool,
}

impl<R: Read> LogFileReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: RecordDecoder::new(),
            chunk: vec![0u8; 8192],
            done: false,
        }
    }

    fn fill(&mut self) -> Result<bool> {
        loop {
            match self.inner.read(&mut self.chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.decoder.push(&self.chunk[..n]);
                    return Ok(true);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(CaptureError::os("read log file", e)),
            }
        }
    }
}

impl<R: Read> Iterator for LogFileReader<R> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.decoder.next_message() {
                Ok(Some(message)) => return Some(Ok(message)),
                Ok(None) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
            match self.fill() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    if !self.decoder.header_seen {
                        return Some(Err(CaptureError::Format("missing DBGSCOPE header".to_string())));
                    }
                    if self.decoder.has_pending() {
                        tracing::warn!(
                            records = self.decoder.records(),
                            "saved log ends with a truncated record"
                        );
                    }
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Write `messages` to a new saved-log file at `path`
pub fn write_log_file<'a>(path: &Path, messages: impl IntoIterator<Item = &'a Message>) -> Result<u64> {
    let file = File::create(path).map_err(|e| CaptureError::io(path, e))?;
    let mut writer = LogFileWriter::new(BufWriter::new(file))?;
    for message in messages {
        writer.write_message(message)?;
    }
    writer.flush()?;
    Ok(writer.count())
}

/// Read every record of the saved-log file at `path`
pub fn read_log_file(path: &Path) -> Result<Vec<Message>> {
    let file = File::open(path).map_err(|e| CaptureError::io(path, e))?;
    LogFileReader::new(BufReader::new(file)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample(n: u32) -> Vec<Message> {
        (0..n)
            .map(|i| {
                Message::new(
                    f64::from(i) * 0.25,
                    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, i).unwrap(),
                    1000 + i,
                    format!("proc{i}"),
                    format!("message number {i}"),
                )
            })
            .collect()
    }

    fn encode(messages: &[Message]) -> Vec<u8> {
        let mut writer = LogFileWriter::new(Vec::new()).unwrap();
        for message in messages {
            writer.write_message(message).unwrap();
        }
        writer.into_inner()
    }

    #[test]
    fn test_file_round_trip_preserves_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.dblog");
        let messages = sample(50);

        assert_eq!(write_log_file(&path, &messages).unwrap(), 50);
        assert_eq!(read_log_file(&path).unwrap(), messages);
    }

    #[test]
    fn test_decoder_waits_for_partial_record() {
        let bytes = encode(&sample(2));
        let mut decoder = RecordDecoder::new();

        // Header plus a few bytes of the first record
        decoder.push(&bytes[..HEADER_LEN + 3]);
        assert!(decoder.next_message().unwrap().is_none());
        assert!(decoder.has_pending());

        decoder.push(&bytes[HEADER_LEN + 3..]);
        let first = decoder.next_message().unwrap().unwrap();
        let second = decoder.next_message().unwrap().unwrap();
        assert_eq!(first.pid(), 1000);
        assert_eq!(second.pid(), 1001);
        assert!(decoder.next_message().unwrap().is_none());
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_byte_at_a_time_decoding() {
        let messages = sample(3);
        let bytes = encode(&messages);
        let mut decoder = RecordDecoder::new();
        let mut decoded = Vec::new();
        for byte in bytes {
            decoder.push(&[byte]);
            while let Some(message) = decoder.next_message().unwrap() {
                decoded.push(message);
            }
        }
        assert_eq!(decoded, messages);
    }

    #[test]
    fn test_bad_magic_is_format_error() {
        let mut decoder = RecordDecoder::new();
        decoder.push(b"NOTALOG!\x01\x00\x00\x00");
        assert!(matches!(decoder.next_message(), Err(CaptureError::Format(_))));
    }

    #[test]
    fn test_checksum_mismatch_is_format_error() {
        let mut bytes = encode(&sample(1));
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let results: Vec<_> = LogFileReader::new(bytes.as_slice()).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(CaptureError::Format(_))));
    }

    #[test]
    fn test_truncated_tail_is_tolerated() {
        let messages = sample(2);
        let bytes = encode(&messages);
        let cut = &bytes[..bytes.len() - 2];

        let decoded: Vec<_> = LogFileReader::new(cut).collect::<Result<_>>().unwrap();
        assert_eq!(decoded, messages[..1].to_vec());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = read_log_file(Path::new("/nonexistent/dir/capture.dblog")).unwrap_err();
        assert!(matches!(err, CaptureError::Io { .. }));
    }
}
