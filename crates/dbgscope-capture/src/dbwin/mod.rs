//! Shared-memory debug output capture.
//!
//! Producers and the reader rendezvous over one fixed-size record and two
//! named events:
//!
//! - the reader signals `BUFFER_READY` when the record may be written
//! - a producer waits for it, writes `{pid, text}` and signals `DATA_READY`
//! - the reader copies the record out, then signals `BUFFER_READY` again
//!
//! There is a single slot, so a producer that finds the buffer not ready
//! within its timeout drops its message. That loss is inherent to the
//! protocol and is not compensated for here.

#[cfg(target_os = "linux")]
mod posix;
#[cfg(target_os = "linux")]
use posix as platform;

#[cfg(not(target_os = "linux"))]
mod unsupported;
#[cfg(not(target_os = "linux"))]
use unsupported as platform;

use std::sync::Arc;
use std::time::Duration;

use dbgscope_types::{Clock, Line, SourceType};

use crate::error::{CaptureError, Result};
use crate::line_buffer::LineBuffer;
use crate::procinfo;
use crate::source::{DEFAULT_POLL_INTERVAL, LogSource};
use crate::thread::{ReaderThread, StopToken};
use platform::{NamedEvent, SharedBuffer};

/// Size of the shared record: pid followed by NUL-terminated text
pub const DBWIN_BUFFER_SIZE: usize = 4096;

const PID_SIZE: usize = std::mem::size_of::<u32>();

/// Bytes available for text, including the terminating NUL
pub const DBWIN_TEXT_CAPACITY: usize = DBWIN_BUFFER_SIZE - PID_SIZE;

/// Capture scope of the named objects
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DbWinScope {
    /// Objects visible to the current session
    Local,
    /// Cross-session objects; creating them requires elevated privileges
    Global,
}

/// Names of the three objects making up one capture channel
#[derive(Clone, Debug)]
pub struct DbWinNames {
    base: String,
}

impl DbWinNames {
    /// Names derived from `base`, e.g. `DBWIN` gives `DBWIN_BUFFER`
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    fn object(&self, scope: DbWinScope, suffix: &str) -> String {
        let name = format!("{}_{}", self.base, suffix);
        match scope {
            DbWinScope::Local => name,
            DbWinScope::Global => format!("Global\\{name}"),
        }
    }

    pub fn buffer(&self, scope: DbWinScope) -> String {
        self.object(scope, "BUFFER")
    }

    pub fn buffer_ready(&self, scope: DbWinScope) -> String {
        self.object(scope, "BUFFER_READY")
    }

    pub fn data_ready(&self, scope: DbWinScope) -> String {
        self.object(scope, "DATA_READY")
    }
}

impl Default for DbWinNames {
    fn default() -> Self {
        Self::new("DBWIN")
    }
}

/// Read the pid and text out of a record
pub fn decode_record(record: &[u8]) -> (u32, String) {
    let Some((pid, text)) = record.split_first_chunk::<PID_SIZE>() else {
        return (0, String::new());
    };
    let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
    (
        u32::from_ne_bytes(*pid),
        String::from_utf8_lossy(&text[..end]).into_owned(),
    )
}

/// Write a record, truncating `text` so the terminating NUL always fits
pub fn encode_record(record: &mut [u8], pid: u32, text: &str) {
    let Some((pid_bytes, body)) = record.split_first_chunk_mut::<PID_SIZE>() else {
        return;
    };
    *pid_bytes = pid.to_ne_bytes();
    if body.is_empty() {
        return;
    }
    let len = text.len().min(body.len() - 1);
    body[..len].copy_from_slice(&text.as_bytes()[..len]);
    body[len] = 0;
}

/// State of the single-slot handshake, seen from the reader
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rendezvous {
    /// `BUFFER_READY` signalled, waiting for a producer
    Armed,
    /// A producer signalled `DATA_READY`; the record must be copied out
    Filled,
}

/// Reader side of the shared-memory debug output channel
pub struct DbWinReader {
    scope: DbWinScope,
    buffer: Arc<LineBuffer>,
    thread: ReaderThread,
}

impl DbWinReader {
    /// Create the capture objects for `scope` and start reading
    ///
    /// Fails with [`CaptureError::DuplicateInstance`] while another reader of
    /// the same scope and names is alive, and with
    /// [`CaptureError::PermissionDenied`] for the global scope without
    /// sufficient privileges.
    pub fn new(
        clock: Clock,
        buffer: Arc<LineBuffer>,
        scope: DbWinScope,
        names: &DbWinNames,
    ) -> Result<Self> {
        if scope == DbWinScope::Global && !platform::has_global_rights() {
            return Err(CaptureError::PermissionDenied {
                name: names.buffer(scope),
            });
        }

        let shared = SharedBuffer::create(&names.buffer(scope))?;
        let buffer_ready = NamedEvent::create(&names.buffer_ready(scope))?;
        let data_ready = NamedEvent::create(&names.data_ready(scope))?;

        // Tell producers the slot is free
        buffer_ready.set()?;

        let thread = {
            let buffer = Arc::clone(&buffer);
            ReaderThread::spawn("dbwin-reader", move |stop| {
                capture_loop(&stop, &clock, &shared, &buffer_ready, &data_ready, &buffer);
            })?
        };

        tracing::debug!(?scope, "debug output reader started");
        Ok(Self {
            scope,
            buffer,
            thread,
        })
    }

    pub fn scope(&self) -> DbWinScope {
        self.scope
    }
}

fn capture_loop(
    stop: &StopToken,
    clock: &Clock,
    shared: &SharedBuffer,
    buffer_ready: &NamedEvent,
    data_ready: &NamedEvent,
    buffer: &LineBuffer,
) {
    let mut state = Rendezvous::Armed;
    while !stop.is_stopped() {
        state = match state {
            Rendezvous::Armed => match data_ready.wait(DEFAULT_POLL_INTERVAL) {
                Ok(true) => Rendezvous::Filled,
                Ok(false) => Rendezvous::Armed,
                Err(e) => {
                    tracing::warn!("debug output wait failed: {e}");
                    break;
                }
            },
            Rendezvous::Filled => {
                let (pid, text) = decode_record(shared.bytes());
                buffer.add(Line::new(clock, pid, procinfo::process_name(pid), text));

                // Re-arm only after the record has been copied out
                if let Err(e) = buffer_ready.set() {
                    tracing::warn!("debug output re-arm failed: {e}");
                    break;
                }
                Rendezvous::Armed
            }
        };
    }
}

impl LogSource for DbWinReader {
    fn source_type(&self) -> SourceType {
        SourceType::System
    }

    fn description(&self) -> String {
        match self.scope {
            DbWinScope::Local => "Debug output".to_string(),
            DbWinScope::Global => "Global debug output".to_string(),
        }
    }

    fn at_end(&self) -> bool {
        self.thread.at_end()
    }

    fn stop(&mut self) {
        self.thread.stop();
    }

    fn buffer(&self) -> &LineBuffer {
        &self.buffer
    }
}

/// Producer side: sends text to a running reader
pub struct DbWinWriter {
    pid: u32,
    shared: SharedBuffer,
    buffer_ready: NamedEvent,
    data_ready: NamedEvent,
}

impl DbWinWriter {
    /// Open the objects of a running reader
    pub fn open(scope: DbWinScope, names: &DbWinNames) -> Result<Self> {
        Ok(Self {
            pid: std::process::id(),
            shared: SharedBuffer::open(&names.buffer(scope))?,
            buffer_ready: NamedEvent::open(&names.buffer_ready(scope))?,
            data_ready: NamedEvent::open(&names.data_ready(scope))?,
        })
    }

    /// Report `pid` instead of the current process id
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Write one record; returns false if the reader did not free the slot in time
    pub fn output(&mut self, text: &str, timeout: Duration) -> Result<bool> {
        if !self.buffer_ready.wait(timeout)? {
            return Ok(false);
        }
        encode_record(self.shared.bytes_mut(), self.pid, text);
        self.data_ready.set()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let mut record = vec![0u8; DBWIN_BUFFER_SIZE];
        encode_record(&mut record, 4242, "hello\n");
        assert_eq!(decode_record(&record), (4242, "hello\n".to_string()));
    }

    #[test]
    fn test_record_truncates_long_text() {
        let mut record = vec![0xAAu8; DBWIN_BUFFER_SIZE];
        let text = "x".repeat(DBWIN_BUFFER_SIZE * 2);
        encode_record(&mut record, 1, &text);
        let (_, decoded) = decode_record(&record);
        assert_eq!(decoded.len(), DBWIN_TEXT_CAPACITY - 1);
        assert_eq!(record[DBWIN_BUFFER_SIZE - 1], 0);
    }

    #[test]
    fn test_record_without_nul_stops_at_end() {
        let mut record = vec![b'a'; DBWIN_BUFFER_SIZE];
        record[..PID_SIZE].copy_from_slice(&7u32.to_ne_bytes());
        let (pid, text) = decode_record(&record);
        assert_eq!(pid, 7);
        assert_eq!(text.len(), DBWIN_TEXT_CAPACITY);
    }

    #[test]
    fn test_global_names_are_prefixed() {
        let names = DbWinNames::default();
        assert_eq!(names.buffer(DbWinScope::Local), "DBWIN_BUFFER");
        assert_eq!(
            names.data_ready(DbWinScope::Global),
            "Global\\DBWIN_DATA_READY"
        );
    }

    #[cfg(target_os = "linux")]
    mod rendezvous {
        use super::*;
        use std::time::Instant;

        fn names(tag: &str) -> DbWinNames {
            DbWinNames::new(format!("dbgscope_{}_{}", std::process::id(), tag))
        }

        fn wait_for_lines(buffer: &LineBuffer, count: usize) -> Vec<Line> {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut lines = Vec::new();
            while lines.len() < count && Instant::now() < deadline {
                lines.extend(buffer.get_lines());
                std::thread::sleep(Duration::from_millis(5));
            }
            lines
        }

        #[test]
        fn test_second_reader_is_duplicate_until_first_dropped() {
            let names = names("dup");
            let clock = Clock::new();
            let first = DbWinReader::new(clock, Arc::new(LineBuffer::new()), DbWinScope::Local, &names)
                .unwrap();

            let second = DbWinReader::new(clock, Arc::new(LineBuffer::new()), DbWinScope::Local, &names);
            assert!(matches!(second, Err(CaptureError::DuplicateInstance { .. })));

            drop(first);
            let third = DbWinReader::new(clock, Arc::new(LineBuffer::new()), DbWinScope::Local, &names);
            assert!(third.is_ok());
        }

        #[test]
        fn test_writer_messages_reach_buffer_in_order() {
            let names = names("order");
            let buffer = Arc::new(LineBuffer::new());
            let mut reader =
                DbWinReader::new(Clock::new(), Arc::clone(&buffer), DbWinScope::Local, &names).unwrap();

            let mut writer = DbWinWriter::open(DbWinScope::Local, &names).unwrap();
            for i in 0..3 {
                assert!(writer.output(&format!("msg {i}\n"), Duration::from_secs(5)).unwrap());
            }

            let lines = wait_for_lines(&buffer, 3);
            let texts: Vec<_> = lines.iter().map(|l| l.text.as_str()).collect();
            assert_eq!(texts, vec!["msg 0\n", "msg 1\n", "msg 2\n"]);
            assert!(lines.iter().all(|l| l.pid == std::process::id()));

            reader.stop();
            assert!(reader.at_end());
        }

        #[test]
        fn test_writer_without_reader_has_no_listener() {
            let result = DbWinWriter::open(DbWinScope::Local, &names("nobody"));
            assert!(matches!(result, Err(CaptureError::NoListener { .. })));
        }

        #[test]
        fn test_unresolvable_pid_keeps_pid_only() {
            let names = names("pid");
            let buffer = Arc::new(LineBuffer::new());
            let _reader =
                DbWinReader::new(Clock::new(), Arc::clone(&buffer), DbWinScope::Local, &names).unwrap();

            let mut writer = DbWinWriter::open(DbWinScope::Local, &names).unwrap().with_pid(u32::MAX);
            assert!(writer.output("ghost", Duration::from_secs(5)).unwrap());

            let lines = wait_for_lines(&buffer, 1);
            assert_eq!(lines[0].pid, u32::MAX);
            assert_eq!(lines[0].process_name, "");
        }

        #[test]
        fn test_global_scope_requires_privileges() {
            if platform::has_global_rights() {
                return;
            }
            let result = DbWinReader::new(
                Clock::new(),
                Arc::new(LineBuffer::new()),
                DbWinScope::Global,
                &names("global"),
            );
            assert!(matches!(result, Err(CaptureError::PermissionDenied { .. })));
        }
    }
}
