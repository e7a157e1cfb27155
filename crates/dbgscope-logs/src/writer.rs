use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use dbgscope_capture::{BackgroundDispatcher, JobFailure, LogFileWriter};
use dbgscope_types::Message;

use crate::error::{LogError, Result};

type SharedWriter = Arc<Mutex<LogFileWriter<BufWriter<File>>>>;

/// Appends captured messages to a saved-log file off the consuming thread
///
/// Writes are queued on a background dispatcher so a slow disk never stalls
/// polling. Dropping the writer drains the queue.
pub struct TailWriter {
    path: PathBuf,
    writer: SharedWriter,
    dispatcher: BackgroundDispatcher,
}

impl TailWriter {
    /// Create `path` (truncating it) and write the file header
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| LogError::io(path, e))?;
        let writer = LogFileWriter::new(BufWriter::new(file))?;
        let dispatcher = BackgroundDispatcher::new("tail-writer")?;
        tracing::info!(path = %path.display(), "writing log to file");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Arc::new(Mutex::new(writer)),
            dispatcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue `messages` for writing
    pub fn write(&self, messages: Vec<Arc<Message>>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let writer = Arc::clone(&self.writer);
        self.dispatcher.queue(move || {
            let mut writer = writer.lock();
            for message in &messages {
                writer.write_message(message)?;
            }
            writer.flush()?;
            Ok(())
        })?;
        Ok(())
    }

    /// Wait until everything queued so far is on disk
    pub fn flush(&self) -> Result<()> {
        self.dispatcher.flush()?;
        Ok(())
    }

    /// Records written so far
    pub fn count(&self) -> u64 {
        self.writer.lock().count()
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<JobFailure> {
        self.dispatcher.subscribe_failures()
    }

    /// Drain pending writes and close the file
    pub fn close(self) -> Result<u64> {
        self.dispatcher.stop();
        let mut writer = self.writer.lock();
        writer.flush()?;
        tracing::info!(path = %self.path.display(), records = writer.count(), "closed log file");
        Ok(writer.count())
    }
}
