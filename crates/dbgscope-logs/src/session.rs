use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use dbgscope_capture::logfile::{read_log_file, write_log_file};
use dbgscope_capture::{CaptureError, DEFAULT_POLL_INTERVAL, DbWinNames, DbWinScope, FileFormat};
use dbgscope_types::{Clock, Message, NO_PID, SourceDescriptor, SourceType};

use crate::config::{Config, ViewConfig};
use crate::error::{LogError, Result};
use crate::filter::{FilterOutcome, FilterSpec, LogFilter};
use crate::sources::{LogSources, SourceHandle, SourceInfo};
use crate::store::LogStore;
use crate::view::ViewSet;
use crate::writer::TailWriter;

/// Construction parameters of a [`Session`]
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Maximum retained messages, 0 for unbounded
    pub history_size: usize,
    pub auto_newline: bool,
    pub poll_interval: Duration,
    /// Also capture the global scope on resume
    pub try_global: bool,
    pub dbwin_names: DbWinNames,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            history_size: 0,
            auto_newline: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            try_global: true,
            dbwin_names: DbWinNames::default(),
        }
    }
}

/// Which shared-memory captures are running
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureStatus {
    pub paused: bool,
    pub local: bool,
    pub global: bool,
    /// Global capture was refused and will not be retried
    pub global_downgraded: bool,
}

/// A message stored by [`Session::poll`]
#[derive(Clone, Debug)]
pub struct PolledMessage {
    pub index: usize,
    pub message: Arc<Message>,
    /// Filter outcome for each view, in view order
    pub outcomes: Vec<FilterOutcome>,
}

impl PolledMessage {
    /// Outcome for the view at `position`; rejected if there is no such view
    pub fn outcome(&self, position: usize) -> FilterOutcome {
        self.outcomes.get(position).copied().unwrap_or_default()
    }
}

/// Ingestion core: source registry, message store, views and file output
pub struct Session {
    sources: LogSources,
    store: LogStore,
    views: ViewSet,
    tail: Option<TailWriter>,
    local_reader: Option<SourceHandle>,
    global_reader: Option<SourceHandle>,
    try_global: bool,
    global_downgraded: bool,
    paused: bool,
}

impl Session {
    pub fn new(options: SessionOptions) -> Self {
        let sources = LogSources::new(Clock::new(), options.auto_newline)
            .with_poll_interval(options.poll_interval)
            .with_dbwin_names(options.dbwin_names);
        Self {
            sources,
            store: LogStore::new(options.history_size),
            views: ViewSet::new(),
            tail: None,
            local_reader: None,
            global_reader: None,
            try_global: options.try_global,
            global_downgraded: false,
            paused: true,
        }
    }

    // ========================================================================
    // Sources
    // ========================================================================

    /// Start a source; disabled descriptors are skipped and return `None`
    pub fn add_source(&mut self, descriptor: &SourceDescriptor) -> Result<Option<SourceHandle>> {
        if !descriptor.enabled {
            tracing::debug!(source_type = %descriptor.source_type, "skipping disabled source");
            return Ok(None);
        }
        let handle = self.sources.add(descriptor)?;
        if descriptor.source_type == SourceType::System {
            let slot = if descriptor.global {
                &mut self.global_reader
            } else {
                &mut self.local_reader
            };
            if let Some(previous) = slot.replace(handle) {
                self.sources.remove(previous);
            }
            self.paused = false;
        }
        Ok(Some(handle))
    }

    pub fn remove_source(&mut self, handle: SourceHandle) -> bool {
        if self.local_reader == Some(handle) {
            self.local_reader = None;
        }
        if self.global_reader == Some(handle) {
            self.global_reader = None;
        }
        self.sources.remove(handle)
    }

    pub fn sources(&self) -> Vec<SourceInfo> {
        self.sources.sources()
    }

    /// Direct access to the registry, e.g. to attach an arbitrary pipe
    pub fn registry(&mut self) -> &mut LogSources {
        &mut self.sources
    }

    /// Queue a message attributed to dbgscope itself
    pub fn add_message(&self, text: impl Into<String>) {
        self.sources.add_message(text);
    }

    pub fn auto_newline(&self) -> bool {
        self.sources.auto_newline()
    }

    pub fn set_auto_newline(&mut self, auto_newline: bool) {
        self.sources.set_auto_newline(auto_newline);
    }

    // ========================================================================
    // Store
    // ========================================================================

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    pub fn history_size(&self) -> usize {
        self.store.history_size()
    }

    pub fn set_history_size(&mut self, history_size: usize) {
        self.store.set_history_size(history_size);
        tracing::debug!(history_size, "history size changed");
    }

    /// Notified when sources queue new lines
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sources.subscribe()
    }

    fn add_to_store(&mut self, message: Arc<Message>) -> PolledMessage {
        let index = self.store.add(Arc::clone(&message));
        let outcomes = self.views.add(self.store.begin_index(), index, &message);
        PolledMessage {
            index,
            message,
            outcomes,
        }
    }

    /// Drain every source once, store the lines and project them into views
    pub fn poll(&mut self) -> Vec<PolledMessage> {
        self.views.sync_epoch(&self.store);
        let lines = self.sources.get_lines();
        let polled: Vec<_> = lines
            .into_iter()
            .map(|line| self.add_to_store(Arc::new(Message::from(line))))
            .collect();

        if let Some(tail) = &self.tail {
            let batch = polled.iter().map(|p| Arc::clone(&p.message)).collect();
            if let Err(e) = tail.write(batch) {
                tracing::warn!(path = %tail.path().display(), "tail write failed: {e}");
            }
        }
        polled
    }

    /// Drop all messages and queued lines; sources keep running
    pub fn clear(&mut self) {
        self.store.clear();
        self.views.sync_epoch(&self.store);
        self.sources.discard_pending();
        tracing::debug!("log cleared");
    }

    /// Clear and remove every source
    pub fn reset(&mut self) {
        self.clear();
        self.sources.reset();
        self.local_reader = None;
        self.global_reader = None;
        self.paused = true;
    }

    // ========================================================================
    // Views
    // ========================================================================

    pub fn views(&self) -> &ViewSet {
        &self.views
    }

    pub fn add_view(&mut self, name: impl Into<String>, filters: FilterSpec) -> Result<usize> {
        let filter = LogFilter::new(filters)?;
        Ok(self.views.add_view(name, filter, &self.store))
    }

    pub fn close_view(&mut self, position: usize) -> Result<()> {
        self.views.close(position).map(|_| ())
    }

    pub fn filter(&self, position: usize) -> Result<&FilterSpec> {
        Ok(self.views.get(position)?.filter().spec())
    }

    /// Replace a view's filter; the view is re-projected from the store
    pub fn set_filter(&mut self, position: usize, filters: FilterSpec) -> Result<()> {
        let filter = LogFilter::new(filters)?;
        self.views.get_mut(position)?.set_filter(filter, &self.store);
        Ok(())
    }

    pub fn link_views(&self) -> bool {
        self.views.link_views()
    }

    pub fn set_link_views(&mut self, link_views: bool) {
        self.views.set_link_views(link_views);
    }

    /// Write a view as text; returns the number of lines written
    pub fn save_view(&self, position: usize, path: &Path) -> Result<usize> {
        self.views.get(position)?.save(path, &self.store)
    }

    // ========================================================================
    // Capture control
    // ========================================================================

    pub fn status(&self) -> CaptureStatus {
        CaptureStatus {
            paused: self.paused,
            local: self.local_reader.is_some(),
            global: self.global_reader.is_some(),
            global_downgraded: self.global_downgraded,
        }
    }

    /// Stop shared-memory capture
    pub fn pause(&mut self) {
        for handle in [self.local_reader.take(), self.global_reader.take()].into_iter().flatten() {
            self.sources.remove(handle);
        }
        self.sources.add_message("<paused>");
        self.paused = true;
    }

    /// Start shared-memory capture
    ///
    /// Failing to open the local scope is an error. A global scope the
    /// process may not open is given up on: capture continues locally and
    /// the downgrade is reported in the returned status.
    pub fn resume(&mut self) -> Result<CaptureStatus> {
        if self.local_reader.is_none() {
            self.local_reader = Some(self.sources.add_dbwin_reader(DbWinScope::Local)?);
        }

        if self.try_global && self.global_reader.is_none() {
            match self.sources.add_dbwin_reader(DbWinScope::Global) {
                Ok(handle) => self.global_reader = Some(handle),
                Err(LogError::Capture(CaptureError::PermissionDenied { name })) => {
                    tracing::warn!(%name, "global capture not permitted, capturing locally only");
                    self.sources
                        .add_message("Unable to capture global debug output; insufficient privileges");
                    self.try_global = false;
                    self.global_downgraded = true;
                }
                Err(e) => return Err(e),
            }
        }

        self.paused = false;
        Ok(self.status())
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Write every retained message to a saved-log file
    pub fn save_log(&self, path: &Path) -> Result<u64> {
        let messages = self.store.messages();
        let count = write_log_file(path, messages.iter().map(|m| m.as_ref()))?;
        tracing::info!(path = %path.display(), count, "saved log");
        Ok(count)
    }

    /// Replace the history with the contents of a saved log or text file
    pub fn load_log(&mut self, path: &Path) -> Result<usize> {
        let messages = match FileFormat::detect(path)? {
            FileFormat::Binary => read_log_file(path)?,
            FileFormat::Text => read_text_log(path)?,
        };

        self.pause();
        self.clear();
        let count = messages.len();
        for message in messages {
            self.add_to_store(Arc::new(message));
        }
        tracing::info!(path = %path.display(), count, "loaded log");
        Ok(count)
    }

    /// Replace the history with a file that keeps being followed
    pub fn tail_log(&mut self, path: &Path) -> Result<SourceHandle> {
        self.pause();
        self.clear();
        self.sources.add_file_reader(&path.to_string_lossy(), true)
    }

    /// Append every polled message to `path` from now on
    pub fn start_tail(&mut self, path: &Path) -> Result<()> {
        self.stop_tail()?;
        self.tail = Some(TailWriter::create(path)?);
        Ok(())
    }

    /// Stop writing to the tail file; returns the number of records written
    pub fn stop_tail(&mut self) -> Result<Option<u64>> {
        match self.tail.take() {
            Some(tail) => Ok(Some(tail.close()?)),
            None => Ok(None),
        }
    }

    pub fn tail_path(&self) -> Option<&Path> {
        self.tail.as_ref().map(TailWriter::path)
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Apply a configuration document
    ///
    /// Views are reconciled position by position; a document without views
    /// leaves them alone. Sources in the document that are not already
    /// running are started; failures are logged and skipped.
    pub fn apply_config(&mut self, config: &Config) -> Result<()> {
        if !config.views.is_empty() {
            self.views.reconcile(&config.view_settings(), &self.store)?;
        }
        self.sources.set_auto_newline(config.auto_newline);
        self.views.set_link_views(config.link_views);
        self.store.set_history_size(config.history_size);

        let running: Vec<_> = self.sources.sources().into_iter().map(|s| s.descriptor).collect();
        for descriptor in config.sources.iter().filter(|d| !running.contains(d)) {
            if let Err(e) = self.add_source(descriptor) {
                tracing::warn!(source_type = %descriptor.source_type, "failed to start configured source: {e}");
                self.sources.add_message(format!("Unable to start {} source: {e}", descriptor.source_type));
            }
        }
        Ok(())
    }

    pub fn load_config(&mut self, path: &Path) -> Result<()> {
        let config = Config::load(path)?;
        self.apply_config(&config)?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(())
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> Config {
        Config {
            auto_newline: self.sources.auto_newline(),
            link_views: self.views.link_views(),
            history_size: self.store.history_size(),
            sources: self.sources.sources().into_iter().map(|s| s.descriptor).collect(),
            views: self
                .views
                .settings()
                .iter()
                .enumerate()
                .map(|(index, settings)| ViewConfig::from_settings(index, settings))
                .collect(),
        }
    }

    pub fn save_config(&self, path: &Path) -> Result<()> {
        self.config().save(path)
    }
}

/// Plain text log: one message per line, attributed to the file name
fn read_text_log(path: &Path) -> Result<Vec<Message>> {
    let text = std::fs::read(path).map_err(|e| LogError::io(path, e))?;
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(chrono::DateTime::<chrono::Utc>::from)
        .unwrap_or_else(|_| chrono::Utc::now());

    Ok(String::from_utf8_lossy(&text)
        .lines()
        .map(|line| Message::new(0.0, modified, NO_PID, name.as_str(), line))
        .collect())
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.stop_tail() {
            tracing::warn!("failed to close tail file: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterAction, FilterRule};
    #[cfg(target_os = "linux")]
    use std::time::Instant;

    fn session(tag: &str) -> Session {
        Session::new(SessionOptions {
            poll_interval: Duration::from_millis(5),
            dbwin_names: DbWinNames::new(format!("dbgscope_session_{}_{tag}", std::process::id())),
            ..SessionOptions::default()
        })
    }

    #[cfg(target_os = "linux")]
    fn poll_until(session: &mut Session, mut done: impl FnMut(&[PolledMessage]) -> bool) -> Vec<PolledMessage> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut polled = Vec::new();
        while !done(&polled) && Instant::now() < deadline {
            polled.extend(session.poll());
            std::thread::sleep(Duration::from_millis(5));
        }
        polled
    }

    #[test]
    fn test_poll_stores_and_filters() {
        let mut session = session("poll");
        session
            .add_view(
                "no noise",
                FilterSpec {
                    message_filters: vec![FilterRule::new("noise", FilterAction::Exclude)],
                    ..FilterSpec::default()
                },
            )
            .unwrap();

        session.add_message("noise");
        session.add_message("signal");
        let polled = session.poll();

        assert_eq!(polled.len(), 2);
        assert_eq!(polled[0].index, 0);
        assert!(polled[0].outcome(0).accepted);
        assert!(!polled[0].outcome(1).accepted);
        assert!(polled[1].outcome(1).accepted);
        assert!(!polled[1].outcome(7).accepted);
        assert_eq!(session.views().get(1).unwrap().len(), 1);
        assert_eq!(session.store().len(), 2);
    }

    #[test]
    fn test_clear_resets_store_and_views() {
        let mut session = session("clear");
        session.add_message("old");
        session.poll();
        session.clear();
        assert!(session.store().is_empty());
        assert!(session.views().get(0).unwrap().is_empty());

        session.add_message("new");
        let polled = session.poll();
        assert_eq!(polled[0].index, 0);
    }

    #[test]
    fn test_set_filter_and_history() {
        let mut session = session("filter");
        for text in ["a1", "b1", "a2"] {
            session.add_message(text);
        }
        session.poll();

        let spec = FilterSpec {
            message_filters: vec![FilterRule::new("a", FilterAction::Include)],
            default_action: FilterAction::Exclude,
            ..FilterSpec::default()
        };
        session.set_filter(0, spec.clone()).unwrap();
        assert_eq!(session.filter(0).unwrap(), &spec);
        assert_eq!(session.views().get(0).unwrap().len(), 2);
        assert!(matches!(session.set_filter(4, spec), Err(LogError::UnknownView(4))));

        session.set_history_size(1);
        assert_eq!(session.store().len(), 1);
        assert_eq!(session.history_size(), 1);
    }

    #[test]
    fn test_save_and_load_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.dblog");

        let mut first = session("save");
        for n in 0..5 {
            first.add_message(format!("line {n}"));
        }
        first.poll();
        assert_eq!(first.save_log(&path).unwrap(), 5);

        let mut second = session("load");
        second.add_message("to be replaced");
        second.poll();
        assert_eq!(second.load_log(&path).unwrap(), 5);
        let texts: Vec<_> = second.store().messages().iter().map(|m| m.text().to_string()).collect();
        assert_eq!(texts, (0..5).map(|n| format!("line {n}")).collect::<Vec<_>>());
        assert_eq!(second.views().get(0).unwrap().len(), 5);
    }

    #[test]
    fn test_load_text_log_uses_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        std::fs::write(&path, "first\nsecond\n").unwrap();

        let mut session = session("text");
        assert_eq!(session.load_log(&path).unwrap(), 2);
        let messages = session.store().messages();
        assert_eq!(messages[1].text(), "second");
        assert_eq!(messages[1].process_name(), "plain.txt");
    }

    #[test]
    fn test_tail_to_file_receives_polled_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tail.dblog");

        let mut session = session("tail");
        session.start_tail(&path).unwrap();
        assert_eq!(session.tail_path(), Some(path.as_path()));
        session.add_message("tailed");
        session.poll();
        assert_eq!(session.stop_tail().unwrap(), Some(1));
        assert_eq!(session.stop_tail().unwrap(), None);

        let replayed = read_log_file(&path).unwrap();
        assert_eq!(replayed[0].text(), "tailed");
    }

    #[test]
    fn test_config_round_trip_reconciles_views() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbgscope.toml");

        let mut original = session("config-save");
        original.set_auto_newline(false);
        original.set_link_views(true);
        original.set_history_size(100);
        original
            .add_view(
                "errors",
                FilterSpec {
                    message_filters: vec![FilterRule::new("error", FilterAction::Highlight)],
                    ..FilterSpec::default()
                },
            )
            .unwrap();
        original.save_config(&path).unwrap();

        let mut restored = session("config-load");
        restored.add_view("extra 1", FilterSpec::default()).unwrap();
        restored.add_view("extra 2", FilterSpec::default()).unwrap();
        restored.load_config(&path).unwrap();

        assert!(!restored.auto_newline());
        assert!(restored.link_views());
        assert_eq!(restored.history_size(), 100);
        assert_eq!(restored.views().len(), 2);
        assert_eq!(restored.views().get(1).unwrap().name(), "errors");
        assert_eq!(restored.config(), original.config());
    }

    #[test]
    fn test_config_without_views_keeps_views() {
        let mut session = session("config-empty");
        session.apply_config(&Config::default()).unwrap();
        assert_eq!(session.views().len(), 1);
        assert!(session.auto_newline());
    }

    #[test]
    fn test_disabled_and_unsupported_sources() {
        let mut session = session("sources");
        let mut disabled = SourceDescriptor::udp(0);
        disabled.enabled = false;
        assert!(session.add_source(&disabled).unwrap().is_none());

        let agent = SourceDescriptor::new(SourceType::Agent);
        assert!(matches!(
            session.add_source(&agent),
            Err(LogError::Capture(CaptureError::Unsupported(SourceType::Agent)))
        ));
        assert!(session.sources().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pause_resume_with_global_downgrade() {
        let mut session = session("resume");
        assert!(session.status().paused);

        let status = session.resume().unwrap();
        assert!(!status.paused);
        assert!(status.local);
        // Without privileges global capture is given up on, not an error
        assert_eq!(status.global, !status.global_downgraded);

        // Resume twice keeps the same readers
        let again = session.resume().unwrap();
        assert_eq!(again.local, status.local);
        assert_eq!(session.sources().len(), if status.global { 2 } else { 1 });

        session.pause();
        let paused = session.status();
        assert!(paused.paused && !paused.local && !paused.global);
        assert!(session.sources().is_empty());

        let polled = poll_until(&mut session, |p| p.iter().any(|m| m.message.text() == "<paused>"));
        assert!(polled.iter().any(|m| m.message.text() == "<paused>"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pause_keeps_output_captured_before_it() {
        use dbgscope_capture::DbWinWriter;

        let names = DbWinNames::new(format!("dbgscope_session_{}_pause-keep", std::process::id()));
        let mut session = Session::new(SessionOptions {
            poll_interval: Duration::from_millis(5),
            try_global: false,
            dbwin_names: names.clone(),
            ..SessionOptions::default()
        });
        session.resume().unwrap();

        let mut writer = DbWinWriter::open(DbWinScope::Local, &names).unwrap();
        assert!(writer.output("captured before pause", Duration::from_secs(5)).unwrap());
        // The slot is handed back only after the first record was copied out
        assert!(writer.output("second", Duration::from_secs(5)).unwrap());

        session.pause();
        let texts: Vec<_> = session.poll().iter().map(|p| p.message.text().to_string()).collect();
        let captured = texts.iter().position(|t| t == "captured before pause");
        let paused = texts.iter().position(|t| t == "<paused>");
        assert!(captured.is_some());
        assert!(captured < paused);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_second_session_cannot_capture_same_names() {
        let mut first = session("duplicate");
        first.resume().unwrap();

        let mut second = session("duplicate");
        assert!(matches!(
            second.resume(),
            Err(LogError::Capture(CaptureError::DuplicateInstance { .. }))
        ));
    }
}
