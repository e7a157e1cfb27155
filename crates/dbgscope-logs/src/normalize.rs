//! End-of-line handling for sources that deliver raw writes.
//!
//! Shared-memory and UDP producers hand over whatever a single write call
//! contained: part of a line, exactly one line, or several. With auto-newline
//! on, every write ends a message. With it off, text is accumulated per
//! source and process until a newline arrives.

use std::collections::HashMap;

use dbgscope_types::Line;

use crate::sources::SourceHandle;

#[derive(Debug, Default)]
pub struct NewlineNormalizer {
    auto_newline: bool,
    pending: HashMap<(SourceHandle, u32), Line>,
}

impl NewlineNormalizer {
    pub fn new(auto_newline: bool) -> Self {
        Self {
            auto_newline,
            pending: HashMap::new(),
        }
    }

    pub fn auto_newline(&self) -> bool {
        self.auto_newline
    }

    pub fn set_auto_newline(&mut self, auto_newline: bool) {
        self.auto_newline = auto_newline;
    }

    /// Split one raw write into complete lines
    pub fn process(&mut self, source: SourceHandle, line: Line) -> Vec<Line> {
        let key = (source, line.pid);
        let mut prefix = self.pending.remove(&key);
        let mut out = Vec::new();

        let mut segments = line.text.split('\n').peekable();
        while let Some(segment) = segments.next() {
            let segment = segment.strip_suffix('\r').unwrap_or(segment);
            let is_last = segments.peek().is_none();

            let joined = match prefix.take() {
                Some(mut head) => {
                    head.text.push_str(segment);
                    head
                }
                None => line.with_text(segment),
            };

            if !is_last {
                out.push(joined);
            } else if self.auto_newline {
                // The write itself ends the line; a trailing newline adds nothing
                if !joined.text.is_empty() {
                    out.push(joined);
                }
            } else if !joined.text.is_empty() {
                self.pending.insert(key, joined);
            }
        }
        out
    }

    /// Emit the fragments still held for `source`
    pub fn flush(&mut self, source: SourceHandle) -> Vec<Line> {
        let keys: Vec<_> = self.pending.keys().filter(|(s, _)| *s == source).copied().collect();
        let mut lines: Vec<_> = keys.iter().filter_map(|key| self.pending.remove(key)).collect();
        lines.sort_by(|a, b| a.time.total_cmp(&b.time));
        lines
    }

    /// Drop every held fragment
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
