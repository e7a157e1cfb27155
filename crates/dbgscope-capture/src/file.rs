use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dbgscope_types::{Clock, Line, NO_PID, SourceType};

use crate::error::{CaptureError, Result};
use crate::line_buffer::LineBuffer;
use crate::logfile::{RecordDecoder, has_magic};
use crate::source::{LineSplitter, LogSource, make_lines};
use crate::thread::{ReaderThread, StopToken};

/// How a replayed file is interpreted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileFormat {
    /// Saved-log records; recorded time, pid and process name are kept
    Binary,
    /// One message per line, attributed to the file name
    Text,
}

impl FileFormat {
    /// Sniff the format from the file header
    pub fn detect(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| CaptureError::io(path, e))?;
        let mut header = [0u8; 8];
        let mut filled = 0;
        while filled < header.len() {
            match file.read(&mut header[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(CaptureError::io(path, e)),
            }
        }
        Ok(if has_magic(&header[..filled]) {
            Self::Binary
        } else {
            Self::Text
        })
    }
}

/// Replays a log file, optionally following it as it grows
pub struct FileReader {
    path: PathBuf,
    format: FileFormat,
    tail: bool,
    buffer: Arc<LineBuffer>,
    thread: ReaderThread,
}

impl FileReader {
    pub fn new(
        clock: Clock,
        buffer: Arc<LineBuffer>,
        path: impl Into<PathBuf>,
        format: FileFormat,
        tail: bool,
        poll_interval: Duration,
    ) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| CaptureError::io(&path, e))?;
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let thread = {
            let buffer = Arc::clone(&buffer);
            let path = path.clone();
            ReaderThread::spawn("file-reader", move |stop| {
                let mut replay = Replay {
                    file,
                    path: &path,
                    format,
                    tail,
                    poll_interval,
                };
                if let Err(e) = replay.run(&stop, &clock, &buffer, &name) {
                    tracing::warn!(path = %path.display(), "file replay stopped: {e}");
                }
            })?
        };

        tracing::info!(path = %path.display(), ?format, tail, "replaying log file");
        Ok(Self {
            path,
            format,
            tail,
            buffer,
            thread,
        })
    }

    /// Open `path`, detecting its format from the header
    pub fn open(
        clock: Clock,
        buffer: Arc<LineBuffer>,
        path: impl Into<PathBuf>,
        tail: bool,
        poll_interval: Duration,
    ) -> Result<Self> {
        let path = path.into();
        let format = FileFormat::detect(&path)?;
        Self::new(clock, buffer, path, format, tail, poll_interval)
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }
}

struct Replay<'a> {
    file: File,
    path: &'a Path,
    format: FileFormat,
    tail: bool,
    poll_interval: Duration,
}

impl Replay<'_> {
    fn run(&mut self, stop: &StopToken, clock: &Clock, buffer: &LineBuffer, name: &str) -> Result<()> {
        let mut splitter = LineSplitter::new();
        let mut decoder = RecordDecoder::new();
        let mut chunk = vec![0u8; 8192];

        let result = loop {
            if stop.is_stopped() {
                break Ok(());
            }
            let n = match self.file.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Err(CaptureError::io(self.path, e)),
            };

            if n == 0 {
                if !self.tail || stop.wait_timeout(self.poll_interval) {
                    break Ok(());
                }
                continue;
            }

            match self.format {
                FileFormat::Text => {
                    buffer.add_all(make_lines(clock, NO_PID, name, splitter.push(&chunk[..n])));
                }
                FileFormat::Binary => {
                    decoder.push(&chunk[..n]);
                    let mut lines = Vec::new();
                    let decoded = loop {
                        match decoder.next_message() {
                            Ok(Some(message)) => lines.push(Line::from(message)),
                            Ok(None) => break Ok(()),
                            Err(e) => break Err(e),
                        }
                    };
                    buffer.add_all(lines);
                    if let Err(e) = decoded {
                        break Err(e);
                    }
                }
            }
        };

        if let Some(tail) = splitter.finish() {
            buffer.add_all(make_lines(clock, NO_PID, name, vec![tail]));
        }
        if decoder.has_pending() {
            tracing::debug!(path = %self.path.display(), "ignoring partially written record");
        }
        result
    }
}

impl LogSource for FileReader {
    fn source_type(&self) -> SourceType {
        SourceType::File
    }

    fn description(&self) -> String {
        if self.tail {
            format!("Tail {}", self.path.display())
        } else {
            format!("File {}", self.path.display())
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
