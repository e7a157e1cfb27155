//! Configuration document
//!
//! ```toml
//! auto_newline = true
//! link_views = false
//! history_size = 0
//!
//! [[sources]]
//! type = "udp"
//! port = 2020
//!
//! [[views]]
//! index = 0
//! name = "Errors"
//! clock_time = true
//!
//! [[views.message_filters]]
//! pattern = "error"
//! action = "highlight"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use dbgscope_types::SourceDescriptor;

use crate::error::{LogError, Result};
use crate::filter::{FilterAction, FilterRule, FilterSpec};
use crate::view::ViewSettings;

fn default_auto_newline() -> bool {
    true
}

/// One view entry of the document
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewConfig {
    /// Position of the view; entries are applied in index order
    pub index: usize,

    pub name: String,

    #[serde(default)]
    pub clock_time: bool,

    #[serde(default)]
    pub process_colors: bool,

    #[serde(default)]
    pub default_action: FilterAction,

    #[serde(default)]
    pub message_filters: Vec<FilterRule>,

    #[serde(default)]
    pub process_filters: Vec<FilterRule>,
}

impl ViewConfig {
    pub fn from_settings(index: usize, settings: &ViewSettings) -> Self {
        Self {
            index,
            name: settings.name.clone(),
            clock_time: settings.clock_time,
            process_colors: settings.process_colors,
            default_action: settings.filters.default_action,
            message_filters: settings.filters.message_filters.clone(),
            process_filters: settings.filters.process_filters.clone(),
        }
    }

    pub fn settings(&self) -> ViewSettings {
        ViewSettings {
            name: self.name.clone(),
            clock_time: self.clock_time,
            process_colors: self.process_colors,
            filters: FilterSpec {
                process_filters: self.process_filters.clone(),
                message_filters: self.message_filters.clone(),
                default_action: self.default_action,
            },
        }
    }
}

/// Persisted session configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Every raw write ends a message
    #[serde(default = "default_auto_newline")]
    pub auto_newline: bool,

    #[serde(default)]
    pub link_views: bool,

    /// Maximum retained messages, 0 for unbounded
    #[serde(default)]
    pub history_size: usize,

    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,

    #[serde(default)]
    pub views: Vec<ViewConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_newline: default_auto_newline(),
            link_views: false,
            history_size: 0,
            sources: Vec::new(),
            views: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| LogError::io(path, e))?;
        toml::from_str(&text).map_err(|source| LogError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|e| LogError::io(path, e))
    }

    /// View settings in index order
    pub fn view_settings(&self) -> Vec<ViewSettings> {
        let mut views: Vec<_> = self.views.iter().collect();
        views.sort_by_key(|view| view.index);
        views.into_iter().map(ViewConfig::settings).collect()
    }
}
