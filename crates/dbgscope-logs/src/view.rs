use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::SecondsFormat;

use dbgscope_types::Message;

use crate::error::{LogError, Result};
use crate::filter::{FilterOutcome, FilterSpec, LogFilter};
use crate::store::LogStore;

/// A store index accepted by a view
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewLine {
    pub index: usize,
    pub highlighted: bool,
    pub stop: bool,
}

/// Format a message as one line of a text export
///
/// Columns are tab separated: capture time, wall-clock time (RFC 3339), pid,
/// process name and text.
pub fn format_text_line(message: &Message) -> String {
    format!(
        "{:.6}\t{}\t{}\t{}\t{}",
        message.time(),
        message.system_time().to_rfc3339_opts(SecondsFormat::Millis, true),
        message.pid(),
        message.process_name(),
        message.text()
    )
}

/// Filtered projection of the log store
#[derive(Debug)]
pub struct LogView {
    name: String,
    filter: LogFilter,
    clock_time: bool,
    process_colors: bool,
    lines: VecDeque<ViewLine>,
    modified: bool,
}

impl LogView {
    pub fn new(name: impl Into<String>, filter: LogFilter) -> Self {
        Self {
            name: name.into(),
            filter,
            clock_time: false,
            process_colors: false,
            lines: VecDeque::new(),
            modified: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn filter(&self) -> &LogFilter {
        &self.filter
    }

    /// Replace the filter and re-project every retained message
    pub fn set_filter(&mut self, filter: LogFilter, store: &LogStore) {
        self.filter = filter;
        self.lines.clear();
        let begin = store.begin_index();
        for (offset, message) in store.messages().iter().enumerate() {
            self.accept(begin + offset, message);
        }
        self.modified = true;
    }

    /// Show wall-clock instead of relative time
    pub fn clock_time(&self) -> bool {
        self.clock_time
    }

    pub fn set_clock_time(&mut self, clock_time: bool) {
        self.clock_time = clock_time;
    }

    pub fn process_colors(&self) -> bool {
        self.process_colors
    }

    pub fn set_process_colors(&mut self, process_colors: bool) {
        self.process_colors = process_colors;
    }

    fn accept(&mut self, index: usize, message: &Message) -> FilterOutcome {
        let outcome = self.filter.evaluate(message);
        if outcome.accepted {
            self.lines.push_back(ViewLine {
                index,
                highlighted: outcome.highlighted,
                stop: outcome.stop,
            });
        }
        outcome
    }

    /// Offer the message stored at `index`; `begin_index` is the store's
    /// oldest retained index at that time
    pub fn add(&mut self, begin_index: usize, index: usize, message: &Message) -> FilterOutcome {
        while self.lines.front().is_some_and(|line| line.index < begin_index) {
            self.lines.pop_front();
        }
        let outcome = self.accept(index, message);
        self.modified |= outcome.accepted;
        outcome
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.modified = false;
    }

    pub fn lines(&self) -> impl Iterator<Item = &ViewLine> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Whether lines were accepted since the last call
    pub fn take_modified(&mut self) -> bool {
        std::mem::take(&mut self.modified)
    }

    /// Resolve the view's lines; evicted indices are skipped
    pub fn messages(&self, store: &LogStore) -> Vec<(ViewLine, Arc<Message>)> {
        let begin = store.begin_index();
        self.lines
            .iter()
            .filter(|line| line.index >= begin)
            .filter_map(|line| store.get(line.index).ok().map(|m| (*line, m)))
            .collect()
    }

    /// Write the view as text, one message per line; returns the line count
    pub fn save(&self, path: &Path, store: &LogStore) -> Result<usize> {
        let file = File::create(path).map_err(|e| LogError::io(path, e))?;
        let mut out = BufWriter::new(file);
        let messages = self.messages(store);
        for (_, message) in &messages {
            writeln!(out, "{}", format_text_line(message)).map_err(|e| LogError::io(path, e))?;
        }
        out.flush().map_err(|e| LogError::io(path, e))?;
        tracing::debug!(view = %self.name, path = %path.display(), lines = messages.len(), "saved view");
        Ok(messages.len())
    }
}

/// Settings a view is created or updated from
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViewSettings {
    pub name: String,
    pub clock_time: bool,
    pub process_colors: bool,
    pub filters: FilterSpec,
}

/// Ordered set of views fed from one store
#[derive(Debug)]
pub struct ViewSet {
    views: Vec<LogView>,
    link_views: bool,
    epoch: u64,
}

impl ViewSet {
    /// One unfiltered view named `View`
    pub fn new() -> Self {
        Self {
            views: vec![LogView::new("View", LogFilter::include_all())],
            link_views: false,
            epoch: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn get(&self, position: usize) -> Result<&LogView> {
        self.views.get(position).ok_or(LogError::UnknownView(position))
    }

    pub fn get_mut(&mut self, position: usize) -> Result<&mut LogView> {
        self.views.get_mut(position).ok_or(LogError::UnknownView(position))
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogView> {
        self.views.iter()
    }

    /// Append a view projecting the messages already in `store`
    pub fn add_view(&mut self, name: impl Into<String>, filter: LogFilter, store: &LogStore) -> usize {
        let mut view = LogView::new(name, LogFilter::include_all());
        view.set_filter(filter, store);
        self.views.push(view);
        self.views.len() - 1
    }

    pub fn close(&mut self, position: usize) -> Result<LogView> {
        if position >= self.views.len() {
            return Err(LogError::UnknownView(position));
        }
        Ok(self.views.remove(position))
    }

    /// Keep the focused line in sync when switching views
    pub fn link_views(&self) -> bool {
        self.link_views
    }

    pub fn set_link_views(&mut self, link_views: bool) {
        self.link_views = link_views;
    }

    /// Clear every view if the store was cleared since the last call
    pub fn sync_epoch(&mut self, store: &LogStore) {
        let epoch = store.epoch();
        if epoch != self.epoch {
            self.clear();
            self.epoch = epoch;
        }
    }

    /// Offer a newly stored message to every view; one outcome per view
    pub fn add(&mut self, begin_index: usize, index: usize, message: &Message) -> Vec<FilterOutcome> {
        self.views
            .iter_mut()
            .map(|view| view.add(begin_index, index, message))
            .collect()
    }

    pub fn clear(&mut self) {
        for view in &mut self.views {
            view.clear();
        }
    }

    /// Apply `settings` position by position
    ///
    /// Existing views are updated in place, missing ones are created and views
    /// beyond the end of `settings` are closed. Filters are compiled before
    /// anything changes, so an invalid rule leaves the set untouched.
    pub fn reconcile(&mut self, settings: &[ViewSettings], store: &LogStore) -> Result<()> {
        let filters = settings
            .iter()
            .map(|s| LogFilter::new(s.filters.clone()))
            .collect::<Result<Vec<_>>>()?;

        for (position, (settings, filter)) in settings.iter().zip(filters).enumerate() {
            if position < self.views.len() {
                let view = &mut self.views[position];
                view.set_name(settings.name.clone());
                view.set_filter(filter, store);
            } else {
                self.add_view(settings.name.clone(), filter, store);
            }
            let view = &mut self.views[position];
            view.set_clock_time(settings.clock_time);
            view.set_process_colors(settings.process_colors);
        }

        if self.views.len() > settings.len() {
            tracing::debug!(closed = self.views.len() - settings.len(), "closing extra views");
            self.views.truncate(settings.len());
        }
        Ok(())
    }

    /// Current settings of every view, in position order
    pub fn settings(&self) -> Vec<ViewSettings> {
        self.views
            .iter()
            .map(|view| ViewSettings {
                name: view.name.clone(),
                clock_time: view.clock_time,
                process_colors: view.process_colors,
                filters: view.filter.spec().clone(),
            })
            .collect()
    }
}

impl Default for ViewSet {
    fn default() -> Self {
        Self::new()
    }
}
