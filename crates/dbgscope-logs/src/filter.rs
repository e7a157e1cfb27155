use regex::Regex;
use serde::{Deserialize, Serialize};

use dbgscope_types::Message;

use crate::error::{LogError, Result};

/// How a rule pattern is interpreted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchKind {
    /// Pattern occurs anywhere in the field
    #[default]
    Substring,
    /// Pattern is a regular expression
    Regex,
    /// Field equals the pattern
    Exact,
    /// `*` and `?` wildcards over the whole field
    Wildcard,
}

/// Message field a rule is matched against
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterField {
    #[default]
    Text,
    ProcessName,
    Pid,
}

/// Outcome of a matching rule
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterAction {
    #[default]
    Include,
    Exclude,
    /// Accept and mark the message highlighted
    Highlight,
    /// Accept and request that auto-scrolling stops at the message
    Stop,
}

fn enabled_by_default() -> bool {
    true
}

/// One filter rule as stored in a configuration document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub pattern: String,

    #[serde(default)]
    pub kind: MatchKind,

    #[serde(default)]
    pub field: FilterField,

    #[serde(default)]
    pub action: FilterAction,

    #[serde(default = "enabled_by_default")]
    pub enabled: bool,

    #[serde(default)]
    pub case_insensitive: bool,
}

impl FilterRule {
    /// Substring rule on the message text
    pub fn new(pattern: impl Into<String>, action: FilterAction) -> Self {
        Self {
            pattern: pattern.into(),
            kind: MatchKind::Substring,
            field: FilterField::Text,
            action,
            enabled: true,
            case_insensitive: false,
        }
    }

    /// Substring rule on the process name
    pub fn process(pattern: impl Into<String>, action: FilterAction) -> Self {
        Self::new(pattern, action).on(FilterField::ProcessName)
    }

    pub fn kind(mut self, kind: MatchKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn on(mut self, field: FilterField) -> Self {
        self.field = field;
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn compile(&self) -> Result<Regex> {
        let body = match self.kind {
            MatchKind::Substring => regex::escape(&self.pattern),
            MatchKind::Regex => self.pattern.clone(),
            MatchKind::Exact => format!("^{}$", regex::escape(&self.pattern)),
            MatchKind::Wildcard => wildcard_to_regex(&self.pattern),
        };
        let source = if self.case_insensitive {
            format!("(?i){body}")
        } else {
            body
        };
        Regex::new(&source).map_err(|source| LogError::InvalidFilter {
            pattern: self.pattern.clone(),
            source,
        })
    }
}

fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("^(?s:");
    let mut literal = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(c.encode_utf8(&mut literal))),
        }
    }
    out.push_str(")$");
    out
}

/// Rule lists of one view filter, as stored in a configuration document
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub process_filters: Vec<FilterRule>,

    #[serde(default)]
    pub message_filters: Vec<FilterRule>,

    /// Action for messages no enabled rule matches
    #[serde(default)]
    pub default_action: FilterAction,
}

impl FilterSpec {
    pub fn is_empty(&self) -> bool {
        self.process_filters.is_empty() && self.message_filters.is_empty()
    }
}

struct CompiledRule {
    field: FilterField,
    action: FilterAction,
    regex: Regex,
}

impl CompiledRule {
    fn matches(&self, message: &Message) -> bool {
        match self.field {
            FilterField::Text => self.regex.is_match(message.text()),
            FilterField::ProcessName => self.regex.is_match(message.process_name()),
            FilterField::Pid => self.regex.is_match(&message.pid().to_string()),
        }
    }
}

/// Compiled, ordered rule list; first matching enabled rule wins
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    default_action: FilterAction,
}

impl RuleSet {
    /// Compile the enabled rules of `rules`
    ///
    /// A list without enabled rules includes everything; `default_action`
    /// only applies to lists that have something to match.
    pub fn compile(rules: &[FilterRule], default_action: FilterAction) -> Result<Self> {
        let rules: Vec<_> = rules
            .iter()
            .filter(|rule| rule.enabled)
            .map(|rule| {
                Ok(CompiledRule {
                    field: rule.field,
                    action: rule.action,
                    regex: rule.compile()?,
                })
            })
            .collect::<Result<_>>()?;
        let default_action = if rules.is_empty() {
            FilterAction::Include
        } else {
            default_action
        };
        Ok(Self { rules, default_action })
    }

    pub fn evaluate(&self, message: &Message) -> FilterAction {
        self.rules
            .iter()
            .find(|rule| rule.matches(message))
            .map_or(self.default_action, |rule| rule.action)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Result of running a message through a [`LogFilter`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterOutcome {
    pub accepted: bool,
    pub highlighted: bool,
    pub stop: bool,
}

/// Compiled per-view filter
pub struct LogFilter {
    spec: FilterSpec,
    process: RuleSet,
    message: RuleSet,
}

impl LogFilter {
    pub fn new(spec: FilterSpec) -> Result<Self> {
        let process = RuleSet::compile(&spec.process_filters, spec.default_action)?;
        let message = RuleSet::compile(&spec.message_filters, spec.default_action)?;
        Ok(Self { spec, process, message })
    }

    /// Filter that accepts everything
    pub fn include_all() -> Self {
        Self {
            spec: FilterSpec::default(),
            process: RuleSet {
                rules: Vec::new(),
                default_action: FilterAction::Include,
            },
            message: RuleSet {
                rules: Vec::new(),
                default_action: FilterAction::Include,
            },
        }
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    /// Process list first; an exclude there short-circuits the message list
    pub fn evaluate(&self, message: &Message) -> FilterOutcome {
        let by_process = self.process.evaluate(message);
        if by_process == FilterAction::Exclude {
            return FilterOutcome::default();
        }
        let by_message = self.message.evaluate(message);
        if by_message == FilterAction::Exclude {
            return FilterOutcome::default();
        }

        let any = |action| by_process == action || by_message == action;
        FilterOutcome {
            accepted: true,
            highlighted: any(FilterAction::Highlight),
            stop: any(FilterAction::Stop),
        }
    }

    pub fn accepts(&self, message: &Message) -> bool {
        self.evaluate(message).accepted
    }

    /// Byte ranges in `text` matched by enabled text highlight rules
    pub fn find_matches(&self, text: &str) -> Vec<(usize, usize)> {
        let mut matches: Vec<_> = self
            .process
            .rules
            .iter()
            .chain(&self.message.rules)
            .filter(|rule| rule.action == FilterAction::Highlight && rule.field == FilterField::Text)
            .flat_map(|rule| rule.regex.find_iter(text).map(|m| (m.start(), m.end())))
            .filter(|(start, end)| start < end)
            .collect();
        matches.sort_unstable();
        matches.dedup();
        matches
    }
}

impl Default for LogFilter {
    fn default() -> Self {
        Self::include_all()
    }
}

impl std::fmt::Debug for LogFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFilter")
            .field("process_rules", &self.process.len())
            .field("message_rules", &self.message.len())
            .field("default_action", &self.spec.default_action)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use test_case::test_case;

    fn message(pid: u32, process: &str, text: &str) -> Message {
        Message::new(0.0, Utc::now(), pid, process, text)
    }

    fn filter(message_filters: Vec<FilterRule>) -> LogFilter {
        LogFilter::new(FilterSpec {
            message_filters,
            ..FilterSpec::default()
        })
        .unwrap()
    }

    #[test_case(MatchKind::Substring, "err", "an error", true ; "substring hit")]
    #[test_case(MatchKind::Substring, "a.b", "axb", false ; "substring is literal")]
    #[test_case(MatchKind::Regex, "^conn(ect)?ed", "connected to db", true ; "regex hit")]
    #[test_case(MatchKind::Exact, "ready", "ready", true ; "exact hit")]
    #[test_case(MatchKind::Exact, "ready", "already", false ; "exact rejects substring")]
    #[test_case(MatchKind::Wildcard, "load*ms", "loaded in 12ms", true ; "wildcard star")]
    #[test_case(MatchKind::Wildcard, "v?.0", "v2.0", true ; "wildcard question")]
    #[test_case(MatchKind::Wildcard, "v?.0", "v2x0", false ; "wildcard dot is literal")]
    fn test_match_kinds(kind: MatchKind, pattern: &str, text: &str, expected: bool) {
        let f = filter(vec![FilterRule::new(pattern, FilterAction::Exclude).kind(kind)]);
        assert_eq!(!f.accepts(&message(1, "app", text)), expected);
    }

    #[test_case(vec![
        FilterRule::new("foo", FilterAction::Exclude),
        FilterRule::new("*", FilterAction::Include).kind(MatchKind::Wildcard),
    ], false ; "exclude first wins")]
    #[test_case(vec![
        FilterRule::new("*", FilterAction::Include).kind(MatchKind::Wildcard),
        FilterRule::new("foo", FilterAction::Exclude),
    ], true ; "include first wins")]
    fn test_rules_are_order_sensitive(rules: Vec<FilterRule>, accepted: bool) {
        let f = filter(rules);
        assert_eq!(f.accepts(&message(1, "app", "foo bar")), accepted);
    }

    #[test]
    fn test_process_exclude_short_circuits() {
        let f = LogFilter::new(FilterSpec {
            process_filters: vec![FilterRule::process("noisy", FilterAction::Exclude)],
            message_filters: vec![FilterRule::new("important", FilterAction::Highlight)],
            ..FilterSpec::default()
        })
        .unwrap();

        assert!(!f.accepts(&message(1, "noisy", "important")));
        let outcome = f.evaluate(&message(1, "quiet", "important"));
        assert!(outcome.accepted && outcome.highlighted && !outcome.stop);
    }

    #[test]
    fn test_default_action_applies_to_unmatched() {
        let f = LogFilter::new(FilterSpec {
            message_filters: vec![FilterRule::new("keep", FilterAction::Include)],
            default_action: FilterAction::Exclude,
            ..FilterSpec::default()
        })
        .unwrap();
        assert!(f.accepts(&message(1, "app", "keep me")));
        assert!(!f.accepts(&message(1, "app", "drop me")));
    }

    #[test]
    fn test_default_action_ignores_empty_lists() {
        let f = LogFilter::new(FilterSpec {
            process_filters: vec![FilterRule::process("app", FilterAction::Include).disabled()],
            message_filters: vec![FilterRule::new("keep", FilterAction::Include)],
            default_action: FilterAction::Exclude,
        })
        .unwrap();
        assert!(f.accepts(&message(1, "other", "keep me")));
        assert!(!f.accepts(&message(1, "app", "drop me")));

        let only_process = LogFilter::new(FilterSpec {
            process_filters: vec![FilterRule::process("app", FilterAction::Include)],
            default_action: FilterAction::Exclude,
            ..FilterSpec::default()
        })
        .unwrap();
        assert!(only_process.accepts(&message(1, "app", "anything")));
        assert!(!only_process.accepts(&message(1, "other", "anything")));
    }

    #[test]
    fn test_disabled_rules_are_skipped() {
        let f = filter(vec![FilterRule::new("foo", FilterAction::Exclude).disabled()]);
        assert!(f.accepts(&message(1, "app", "foo")));
    }

    #[test]
    fn test_pid_and_case_insensitive_rules() {
        let f = filter(vec![
            FilterRule::new("42", FilterAction::Exclude)
                .kind(MatchKind::Exact)
                .on(FilterField::Pid),
            FilterRule::new("WARNING", FilterAction::Stop).case_insensitive(),
        ]);
        assert!(!f.accepts(&message(42, "app", "anything")));
        assert!(f.accepts(&message(420, "app", "anything")));
        assert!(f.evaluate(&message(7, "app", "warning: disk")).stop);
    }

    #[test]
    fn test_invalid_regex_is_reported() {
        let result = LogFilter::new(FilterSpec {
            message_filters: vec![FilterRule::new("(", FilterAction::Include).kind(MatchKind::Regex)],
            ..FilterSpec::default()
        });
        assert!(matches!(result, Err(LogError::InvalidFilter { .. })));
    }

    #[test]
    fn test_find_matches_for_highlight_rules() {
        let f = filter(vec![
            FilterRule::new("error", FilterAction::Highlight),
            FilterRule::new("another", FilterAction::Include),
        ]);
        let matches = f.find_matches("an error occurred, another error here");
        assert_eq!(matches, vec![(3, 8), (27, 32)]);
    }
}
