//! Log store, filtering and views for dbgscope
//!
//! This crate ties the capture sources together: a registry that drains them,
//! the bounded message store, per-view filters and the session that drives
//! it all, plus configuration and saved-log output.

mod config;
mod error;
mod filter;
mod normalize;
mod session;
mod sources;
mod store;
mod view;
mod writer;

pub use config::{Config, ViewConfig};
pub use error::{LogError, Result};
pub use filter::{
    FilterAction, FilterField, FilterOutcome, FilterRule, FilterSpec, LogFilter, MatchKind, RuleSet,
};
pub use normalize::NewlineNormalizer;
pub use session::{CaptureStatus, PolledMessage, Session, SessionOptions};
pub use sources::{INTERNAL_PROCESS_NAME, LogSources, SourceHandle, SourceInfo};
pub use store::LogStore;
pub use view::{LogView, ViewLine, ViewSet, ViewSettings, format_text_line};
pub use writer::TailWriter;

// Re-export types used in our public API
pub use dbgscope_capture::{CaptureError, DbWinNames, DbWinScope, DbWinWriter};
pub use dbgscope_types::{Clock, Line, Message, SourceDescriptor, SourceType};
