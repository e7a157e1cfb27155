//! Capture sources for dbgscope
//!
//! Every source owns one ingestion channel and a reader thread that turns raw
//! bytes into timestamped lines in a shared [`LineBuffer`]. This crate also
//! holds the saved-log codec and the job dispatchers used to move blocking
//! work off the consuming thread.

pub mod dbwin;
mod dispatch;
mod error;
mod file;
mod line_buffer;
pub mod logfile;
mod pipe;
mod procinfo;
mod process;
mod socket;
mod source;
mod thread;

pub use dbwin::{DbWinNames, DbWinReader, DbWinScope, DbWinWriter};
pub use dispatch::{BackgroundDispatcher, Job, JobFailure, OnDemandDispatcher};
pub use error::{CaptureError, Result};
pub use file::{FileFormat, FileReader};
pub use line_buffer::LineBuffer;
pub use logfile::{LogFileReader, LogFileWriter, RecordDecoder};
pub use pipe::{Pipe, PipeReader, stdin_pipe};
pub use procinfo::process_name;
pub use process::ProcessReader;
pub use socket::{TcpReader, UdpReader};
pub use source::{DEFAULT_POLL_INTERVAL, LineSplitter, LogSource};
pub use thread::{ReaderThread, StopToken};

// Re-export types used in our public API
pub use dbgscope_types::{Clock, Line, Message, SourceType};
