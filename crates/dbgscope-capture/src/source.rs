use std::time::Duration;

use dbgscope_types::{Clock, Line, SourceType};

use crate::line_buffer::LineBuffer;

/// Default interval at which polling readers check for data and stop requests
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(40);

/// Capability set shared by every capture source
///
/// A source owns exactly one OS-level capture resource and a reader thread
/// that turns raw bytes into [`Line`]s in its [`LineBuffer`].
pub trait LogSource: Send {
    fn source_type(&self) -> SourceType;

    /// Human readable description for source listings
    fn description(&self) -> String;

    /// True once the underlying resource reported end-of-stream
    fn at_end(&self) -> bool;

    /// Stop capturing and join the reader thread; idempotent
    fn stop(&mut self);

    /// The buffer this source pushes its lines into
    fn buffer(&self) -> &LineBuffer;

    /// Drain everything captured since the last call
    fn take_lines(&self) -> Vec<Line> {
        self.buffer().get_lines()
    }
}

/// Splits a byte stream into newline-delimited lines
///
/// Bytes after the last newline are kept until more data arrives or the
/// stream ends.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Return the trailing partial line, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let line = decode_line(&self.pending);
            self.pending.clear();
            Some(line)
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Decode one line of captured bytes, dropping a trailing carriage return
pub(crate) fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Wrap split texts as lines with common provenance
pub(crate) fn make_lines(clock: &Clock, pid: u32, process_name: &str, texts: Vec<String>) -> Vec<Line> {
    texts
        .into_iter()
        .map(|text| Line::new(clock, pid, process_name, text))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_splitter_keeps_partial_fragment() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"first\nsec"), vec!["first"]);
        assert!(splitter.has_pending());
        assert_eq!(splitter.push(b"ond\r\nthird\n"), vec!["second", "third"]);
        assert!(!splitter.has_pending());
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_splitter_finish_flushes_tail() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"no newline").is_empty());
        assert_eq!(splitter.finish().as_deref(), Some("no newline"));
        assert_eq!(splitter.finish(), None);
    }

    #[test_case(b"\n\nx\n", &["", "", "x"] ; "empty lines")]
    #[test_case(b"crlf\r\n", &["crlf"] ; "carriage return stripped")]
    #[test_case(b"inner\rcr\n", &["inner\rcr"] ; "inner carriage return kept")]
    #[test_case(b"no newline", &[] ; "fragment only")]
    fn test_splitter_lines(input: &[u8], expected: &[&str]) {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(input), expected);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push(b"ok \xff\n");
        assert_eq!(lines, vec!["ok \u{fffd}"]);
    }
}
