use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use dbgscope_capture::{
    CaptureError, DEFAULT_POLL_INTERVAL, DbWinNames, DbWinReader, DbWinScope, FileReader, LineBuffer,
    LogSource, Pipe, PipeReader, ProcessReader, TcpReader, UdpReader,
};
use dbgscope_types::{Clock, Line, NO_PID, SourceDescriptor, SourceType};

use crate::error::{LogError, Result};
use crate::normalize::NewlineNormalizer;

/// Process name of messages generated by dbgscope itself
pub const INTERNAL_PROCESS_NAME: &str = "[internal]";

const NOTIFY_CAPACITY: usize = 16;

/// Opaque identifier of a registered source
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceHandle(u64);

impl SourceHandle {
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Listing entry for a registered source
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    pub handle: SourceHandle,
    pub source_type: SourceType,
    pub description: String,
    pub descriptor: SourceDescriptor,
}

struct Entry {
    handle: SourceHandle,
    descriptor: SourceDescriptor,
    reader: Box<dyn LogSource>,
}

/// Registry of running capture sources
///
/// Sources are drained in registration order by [`get_lines`](Self::get_lines),
/// which also removes sources that reached end-of-stream.
pub struct LogSources {
    clock: Clock,
    poll_interval: Duration,
    dbwin_names: DbWinNames,
    entries: Vec<Entry>,
    next_id: u64,
    internal: LineBuffer,
    normalizer: NewlineNormalizer,
    notify: broadcast::Sender<()>,
}

impl LogSources {
    pub fn new(clock: Clock, auto_newline: bool) -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            clock,
            poll_interval: DEFAULT_POLL_INTERVAL,
            dbwin_names: DbWinNames::default(),
            entries: Vec::new(),
            next_id: 1,
            internal: LineBuffer::with_notify(notify.clone()),
            normalizer: NewlineNormalizer::new(auto_newline),
            notify,
        }
    }

    /// Interval at which polling readers check for data
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Object names used by shared-memory readers
    pub fn with_dbwin_names(mut self, names: DbWinNames) -> Self {
        self.dbwin_names = names;
        self
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn auto_newline(&self) -> bool {
        self.normalizer.auto_newline()
    }

    pub fn set_auto_newline(&mut self, auto_newline: bool) {
        self.normalizer.set_auto_newline(auto_newline);
    }

    /// Notified whenever any source or internal message queues lines
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    fn new_buffer(&self) -> Arc<LineBuffer> {
        Arc::new(LineBuffer::with_notify(self.notify.clone()))
    }

    fn register(&mut self, descriptor: SourceDescriptor, reader: Box<dyn LogSource>) -> SourceHandle {
        let handle = SourceHandle(self.next_id);
        self.next_id += 1;
        tracing::info!(%handle, source = %reader.description(), "source added");
        self.entries.push(Entry {
            handle,
            descriptor,
            reader,
        });
        handle
    }

    /// Capture shared-memory debug output of `scope`
    pub fn add_dbwin_reader(&mut self, scope: DbWinScope) -> Result<SourceHandle> {
        let reader = DbWinReader::new(self.clock, self.new_buffer(), scope, &self.dbwin_names)?;
        let descriptor = SourceDescriptor::system(scope == DbWinScope::Global);
        Ok(self.register(descriptor, Box::new(reader)))
    }

    /// Capture lines written to `pipe` by process `pid`
    pub fn add_pipe_reader<P: Pipe>(&mut self, pipe: P, pid: u32, process_name: &str) -> Result<SourceHandle> {
        self.add_pipe(pipe, pid, process_name, process_name)
    }

    fn add_pipe<P: Pipe>(&mut self, pipe: P, pid: u32, process_name: &str, address: &str) -> Result<SourceHandle> {
        let reader = PipeReader::new(
            self.clock,
            self.new_buffer(),
            pipe,
            pid,
            process_name,
            self.poll_interval,
        )?;
        let mut descriptor = SourceDescriptor::new(SourceType::Pipe);
        descriptor.address = address.to_string();
        Ok(self.register(descriptor, Box::new(reader)))
    }

    /// Run `program` and capture its output
    pub fn add_process_reader(&mut self, program: &str, args: &[String]) -> Result<SourceHandle> {
        let reader = ProcessReader::new(self.clock, self.new_buffer(), program, args, self.poll_interval)?;
        Ok(self.register(
            SourceDescriptor::process(program, args.to_vec()),
            Box::new(reader),
        ))
    }

    pub fn add_udp_reader(&mut self, port: u16) -> Result<SourceHandle> {
        let reader = UdpReader::new(self.clock, self.new_buffer(), port, self.poll_interval)?;
        Ok(self.register(SourceDescriptor::udp(port), Box::new(reader)))
    }

    pub fn add_tcp_reader(&mut self, host: &str, port: u16) -> Result<SourceHandle> {
        let reader = TcpReader::new(self.clock, self.new_buffer(), host, port, self.poll_interval)?;
        Ok(self.register(SourceDescriptor::tcp(host, port), Box::new(reader)))
    }

    /// Replay a saved log or text file, following it when `tail` is set
    pub fn add_file_reader(&mut self, path: &str, tail: bool) -> Result<SourceHandle> {
        let reader = FileReader::open(self.clock, self.new_buffer(), path, tail, self.poll_interval)?;
        Ok(self.register(SourceDescriptor::file(path, tail), Box::new(reader)))
    }

    /// Start the source `descriptor` describes
    pub fn add(&mut self, descriptor: &SourceDescriptor) -> Result<SourceHandle> {
        match descriptor.source_type {
            SourceType::System => {
                let scope = if descriptor.global {
                    DbWinScope::Global
                } else {
                    DbWinScope::Local
                };
                self.add_dbwin_reader(scope)
            }
            SourceType::Pipe => self.add_named_pipe(&descriptor.address),
            SourceType::Process => self.add_process_reader(&descriptor.address, &descriptor.args),
            SourceType::Udp => self.add_udp_reader(descriptor.port),
            SourceType::Tcp => self.add_tcp_reader(&descriptor.address, descriptor.port),
            SourceType::File => self.add_file_reader(&descriptor.address, descriptor.tail),
            SourceType::Agent => Err(CaptureError::Unsupported(SourceType::Agent).into()),
        }
    }

    /// `-` is standard input, anything else a FIFO path
    fn add_named_pipe(&mut self, address: &str) -> Result<SourceHandle> {
        if address.is_empty() || address == "-" {
            let stdin = dbgscope_capture::stdin_pipe().map_err(|e| LogError::io("-", e))?;
            return self.add_pipe(stdin, NO_PID, "stdin", "-");
        }
        // Opening read-write keeps the open from blocking until a writer appears
        let fifo = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(address)
            .map_err(|e| LogError::io(address, e))?;
        self.add_pipe_reader(fifo, NO_PID, address)
    }

    /// Stop and drop a source; false if the handle is unknown
    ///
    /// Lines the source captured before it stopped, including held fragments,
    /// are still returned by the next [`get_lines`](Self::get_lines).
    pub fn remove(&mut self, handle: SourceHandle) -> bool {
        match self.detach(handle) {
            Some((_, remaining)) => {
                self.internal.add_all(remaining);
                true
            }
            None => false,
        }
    }

    /// Stop the source and take its remaining lines; returns its description
    fn detach(&mut self, handle: SourceHandle) -> Option<(String, Vec<Line>)> {
        let position = self.entries.iter().position(|e| e.handle == handle)?;
        let mut entry = self.entries.remove(position);
        entry.reader.stop();

        let taken = entry.reader.take_lines();
        let mut remaining: Vec<Line> = if entry.reader.source_type().carries_raw_writes() {
            taken
                .into_iter()
                .flat_map(|line| self.normalizer.process(handle, line))
                .collect()
        } else {
            taken
        };
        remaining.extend(self.normalizer.flush(handle));

        let description = entry.reader.description();
        tracing::info!(%handle, source = %description, "source removed");
        Some((description, remaining))
    }

    /// Remove every source and drop all queued lines and fragments
    pub fn reset(&mut self) {
        for mut entry in self.entries.drain(..) {
            entry.reader.stop();
        }
        self.normalizer.clear();
        self.internal.clear();
        tracing::debug!("source registry reset");
    }

    /// Drop queued lines and fragments but keep the sources running
    pub fn discard_pending(&mut self) {
        for entry in &self.entries {
            entry.reader.buffer().clear();
        }
        self.normalizer.clear();
        self.internal.clear();
    }

    pub fn contains(&self, handle: SourceHandle) -> bool {
        self.entries.iter().any(|e| e.handle == handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sources(&self) -> Vec<SourceInfo> {
        self.entries
            .iter()
            .map(|e| SourceInfo {
                handle: e.handle,
                source_type: e.reader.source_type(),
                description: e.reader.description(),
                descriptor: e.descriptor.clone(),
            })
            .collect()
    }

    /// Queue a message attributed to dbgscope itself
    pub fn add_message(&self, text: impl Into<String>) {
        self.internal
            .add(Line::new(&self.clock, NO_PID, INTERNAL_PROCESS_NAME, text));
    }

    /// Drain every buffer once
    pub fn get_lines(&mut self) -> Vec<Line> {
        let mut lines = self.internal.get_lines();
        let mut ended = Vec::new();

        for entry in &self.entries {
            // Checked before draining so the final lines are never left behind
            let at_end = entry.reader.at_end();
            let taken = entry.reader.take_lines();
            if entry.reader.source_type().carries_raw_writes() {
                for line in taken {
                    lines.extend(self.normalizer.process(entry.handle, line));
                }
            } else {
                lines.extend(taken);
            }
            if at_end {
                ended.push(entry.handle);
            }
        }

        for handle in ended {
            if let Some((description, remaining)) = self.detach(handle) {
                lines.extend(remaining);
                lines.push(Line::new(
                    &self.clock,
                    NO_PID,
                    INTERNAL_PROCESS_NAME,
                    format!("Source '{description}' was removed"),
                ));
            }
        }
        lines
    }
}

impl Drop for LogSources {
    fn drop(&mut self) {
        self.reset();
    }
}
