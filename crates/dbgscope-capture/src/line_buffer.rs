use parking_lot::Mutex;
use tokio::sync::broadcast;

use dbgscope_types::Line;

/// Thread-safe queue between reader threads and the consuming thread
///
/// Readers call [`LineBuffer::add`] from their own threads; the consumer takes
/// everything queued so far with [`LineBuffer::get_lines`]. The lock is held
/// only while the queue itself is touched.
pub struct LineBuffer {
    /// Queued lines, oldest first
    lines: Mutex<Vec<Line>>,

    /// Optional "lines available" notification
    notify: Option<broadcast::Sender<()>>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            notify: None,
        }
    }

    /// Create a buffer that signals `notify` whenever a line is added
    pub fn with_notify(notify: broadcast::Sender<()>) -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            notify: Some(notify),
        }
    }

    /// Queue a line
    pub fn add(&self, line: Line) {
        self.lines.lock().push(line);
        if let Some(notify) = &self.notify {
            // No subscribers is fine
            let _ = notify.send(());
        }
    }

    /// Queue several lines under one lock acquisition
    pub fn add_all(&self, lines: impl IntoIterator<Item = Line>) {
        let added = {
            let mut queued = self.lines.lock();
            let before = queued.len();
            queued.extend(lines);
            queued.len() > before
        };
        if added {
            if let Some(notify) = &self.notify {
                let _ = notify.send(());
            }
        }
    }

    /// Take every queued line, leaving the buffer empty
    pub fn get_lines(&self) -> Vec<Line> {
        std::mem::take(&mut *self.lines.lock())
    }

    /// Drop everything queued
    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}
