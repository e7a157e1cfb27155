use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use dbgscope_types::Message;

use crate::error::{LogError, Result};

struct Inner {
    messages: VecDeque<Arc<Message>>,
    begin: usize,
    history_size: usize,
    epoch: u64,
}

impl Inner {
    fn end(&self) -> usize {
        self.begin + self.messages.len()
    }

    fn evict(&mut self) {
        if self.history_size == 0 {
            return;
        }
        let excess = self.messages.len().saturating_sub(self.history_size);
        self.messages.drain(..excess);
        self.begin += excess;
    }
}

/// Ordered message history with stable indices
///
/// Indices start at 0 after construction or [`clear`](Self::clear) and are
/// never reused until the next clear. A non-zero history size bounds the
/// number of retained messages; eviction advances `begin_index`.
pub struct LogStore {
    inner: Mutex<Inner>,
}

impl LogStore {
    /// Create a store retaining at most `history_size` messages (0 = unbounded)
    pub fn new(history_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: VecDeque::new(),
                begin: 0,
                history_size,
                epoch: 0,
            }),
        }
    }

    /// Append a message and return its index
    pub fn add(&self, message: impl Into<Arc<Message>>) -> usize {
        let mut inner = self.inner.lock();
        let index = inner.end();
        inner.messages.push_back(message.into());
        inner.evict();
        index
    }

    /// Oldest retained index
    pub fn begin_index(&self) -> usize {
        self.inner.lock().begin
    }

    /// One past the newest index
    pub fn end_index(&self) -> usize {
        self.inner.lock().end()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().messages.is_empty()
    }

    /// Message at `index`
    pub fn get(&self, index: usize) -> Result<Arc<Message>> {
        let inner = self.inner.lock();
        index
            .checked_sub(inner.begin)
            .and_then(|offset| inner.messages.get(offset))
            .cloned()
            .ok_or(LogError::IndexOutOfRange {
                index,
                begin: inner.begin,
                end: inner.end(),
            })
    }

    /// Snapshot of `[begin, end)`; both bounds must lie in the retained range
    pub fn range(&self, begin: usize, end: usize) -> Result<Vec<Arc<Message>>> {
        let inner = self.inner.lock();
        let out_of_range = |index| LogError::IndexOutOfRange {
            index,
            begin: inner.begin,
            end: inner.end(),
        };
        if begin < inner.begin || begin > inner.end() {
            return Err(out_of_range(begin));
        }
        if end < begin || end > inner.end() {
            return Err(out_of_range(end));
        }
        let offset = begin - inner.begin;
        Ok(inner
            .messages
            .range(offset..offset + (end - begin))
            .cloned()
            .collect())
    }

    /// Snapshot of every retained message, oldest first
    pub fn messages(&self) -> Vec<Arc<Message>> {
        self.inner.lock().messages.iter().cloned().collect()
    }

    /// Drop every message and restart the index space at 0
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.messages.clear();
        inner.begin = 0;
        inner.epoch += 1;
    }

    /// Incremented by every [`clear`](Self::clear); indices are only
    /// comparable within one epoch
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn history_size(&self) -> usize {
        self.inner.lock().history_size
    }

    /// Change the retention bound, evicting immediately if it shrank
    pub fn set_history_size(&self, history_size: usize) {
        let mut inner = self.inner.lock();
        inner.history_size = history_size;
        inner.evict();
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(0)
    }
}
