//! Shared types for dbgscope
//!
//! This crate contains data structures used across multiple dbgscope crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Process id reported for lines that do not originate from a local process
pub const NO_PID: u32 = 0;

// ============================================================================
// Time
// ============================================================================

/// Monotonic capture clock shared by every reader of one session
///
/// Timestamps are seconds since the clock was created, so lines captured on
/// different threads can be compared without consulting the wall clock.
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Seconds elapsed since the clock was created
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Source Types
// ============================================================================

/// Kind of ingestion channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    /// Shared-memory debug output (`OutputDebugString` protocol)
    System,
    /// Readable end of a pipe or FIFO
    Pipe,
    /// Child process whose stdout/stderr are captured
    Process,
    /// UDP datagrams, one or more lines each
    Udp,
    /// Line-oriented TCP stream
    Tcp,
    /// Replay of a saved log or text file
    File,
    /// DebugView agent connection
    Agent,
}

impl SourceType {
    /// Short display label
    pub fn label(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Pipe => "pipe",
            Self::Process => "process",
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::File => "file",
            Self::Agent => "agent",
        }
    }

    /// Whether lines from this source are raw writes that may need
    /// end-of-line coalescing before they become messages
    pub fn carries_raw_writes(&self) -> bool {
        matches!(self, Self::System | Self::Udp)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Describes a source to be added to a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Channel kind
    #[serde(rename = "type")]
    pub source_type: SourceType,

    /// Host name, file path, FIFO path or program, depending on the type
    #[serde(default)]
    pub address: String,

    /// UDP listen port or TCP remote port
    #[serde(default)]
    pub port: u16,

    /// Program arguments for process sources
    #[serde(default)]
    pub args: Vec<String>,

    /// Keep following a replayed file after reaching its end
    #[serde(default)]
    pub tail: bool,

    /// Capture from the global (cross-session) scope
    #[serde(default)]
    pub global: bool,

    /// Disabled descriptors are kept in configuration but not started
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SourceDescriptor {
    /// Create an enabled descriptor with empty parameters
    pub fn new(source_type: SourceType) -> Self {
        Self {
            source_type,
            address: String::new(),
            port: 0,
            args: Vec::new(),
            tail: false,
            global: false,
            enabled: true,
        }
    }

    pub fn system(global: bool) -> Self {
        Self {
            global,
            ..Self::new(SourceType::System)
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            port,
            ..Self::new(SourceType::Udp)
        }
    }

    pub fn tcp(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Self::new(SourceType::Tcp)
        }
    }

    pub fn file(path: impl Into<String>, tail: bool) -> Self {
        Self {
            address: path.into(),
            tail,
            ..Self::new(SourceType::File)
        }
    }

    pub fn process(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            address: program.into(),
            args,
            ..Self::new(SourceType::Process)
        }
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// Captured text with provenance, before it is accepted as a [`Message`]
#[derive(Clone, Debug, PartialEq)]
pub struct Line {
    /// Capture time, seconds on the session [`Clock`]
    pub time: f64,

    /// Wall-clock capture time
    pub system_time: DateTime<Utc>,

    /// Reporting process id ([`NO_PID`] if unknown)
    pub pid: u32,

    /// Reporting process name (empty if it could not be resolved)
    pub process_name: String,

    /// Captured text
    pub text: String,
}

impl Line {
    /// Create a line stamped with the current time
    pub fn new(clock: &Clock, pid: u32, process_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            time: clock.now(),
            system_time: Utc::now(),
            pid,
            process_name: process_name.into(),
            text: text.into(),
        }
    }

    /// Copy of this line's provenance carrying different text
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        Self {
            time: self.time,
            system_time: self.system_time,
            pid: self.pid,
            process_name: self.process_name.clone(),
            text: text.into(),
        }
    }
}

/// A fully provenanced, immutable unit of log content
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    time: f64,
    system_time: DateTime<Utc>,
    pid: u32,
    process_name: String,
    text: String,
}

impl Message {
    pub fn new(
        time: f64,
        system_time: DateTime<Utc>,
        pid: u32,
        process_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            time,
            system_time,
            pid,
            process_name: process_name.into(),
            text: text.into(),
        }
    }

    /// Capture time in seconds since the session clock started
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn system_time(&self) -> DateTime<Utc> {
        self.system_time
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Process label for display: the name when known, the pid otherwise
    pub fn process_label(&self) -> String {
        if self.process_name.is_empty() {
            format!("[{}]", self.pid)
        } else {
            self.process_name.clone()
        }
    }
}

impl From<Line> for Message {
    fn from(line: Line) -> Self {
        Self {
            time: line.time,
            system_time: line.system_time,
            pid: line.pid,
            process_name: line.process_name,
            text: line.text,
        }
    }
}

impl From<Message> for Line {
    fn from(message: Message) -> Self {
        Self {
            time: message.time,
            system_time: message.system_time,
            pid: message.pid,
            process_name: message.process_name,
            text: message.text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_message_from_line_keeps_provenance() {
        let clock = Clock::new();
        let line = Line::new(&clock, 42, "app", "hello");
        let message = Message::from(line.clone());
        assert_eq!(message.pid(), 42);
        assert_eq!(message.process_name(), "app");
        assert_eq!(message.text(), "hello");
        assert_eq!(message.time(), line.time);
        assert_eq!(message.system_time(), line.system_time);
    }

    #[test]
    fn test_process_label_falls_back_to_pid() {
        let message = Message::new(0.0, Utc::now(), 1234, "", "text");
        assert_eq!(message.process_label(), "[1234]");
    }

    #[test]
    fn test_raw_write_sources() {
        assert!(SourceType::System.carries_raw_writes());
        assert!(SourceType::Udp.carries_raw_writes());
        assert!(!SourceType::Pipe.carries_raw_writes());
        assert!(!SourceType::File.carries_raw_writes());
    }
}
