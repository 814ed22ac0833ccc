use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod error;
pub mod parse;
pub mod protocol;

/// Operating mode of the supervised loop. Each mode maps to a fixed argument
/// template on the configured loop command; see the supervisor for the
/// templates themselves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    Standard,
    Scoped,
    Review,
}

impl Default for LoopMode {
    fn default() -> Self {
        Self::Standard
    }
}

impl LoopMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopMode::Standard => "standard",
            LoopMode::Scoped => "scoped",
            LoopMode::Review => "review",
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoopMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "standard" => Ok(LoopMode::Standard),
            "scoped" => Ok(LoopMode::Scoped),
            "review" => Ok(LoopMode::Review),
            other => Err(format!("Unknown mode: {other}")),
        }
    }
}

/// Lifecycle snapshot of the supervised loop process. Exactly one instance
/// exists; the supervisor is the only writer, and exits reset it rather than
/// destroy it (the last mode and counters stay visible on the dashboard).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessRunState {
    pub is_running: bool,
    pub mode: LoopMode,
    pub iteration_count: u64,
    /// 0 means unbounded.
    pub iteration_limit: u64,
    #[serde(default)]
    pub scope_label: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub os_process_id: Option<u32>,
}

impl Default for ProcessRunState {
    fn default() -> Self {
        Self {
            is_running: false,
            mode: LoopMode::Standard,
            iteration_count: 0,
            iteration_limit: 0,
            scope_label: None,
            started_at: None,
            os_process_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogSeverity {
    Info,
    Warning,
    Error,
    Success,
}

impl LogSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSeverity::Info => "info",
            LogSeverity::Warning => "warning",
            LogSeverity::Error => "error",
            LogSeverity::Success => "success",
        }
    }
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of loop or tailer output. Immutable once created and never
/// persisted; ordering is only meaningful within a single producer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub severity: LogSeverity,
}

impl LogEvent {
    pub fn new(severity: LogSeverity, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            text: text.into(),
            severity,
        }
    }
}

/// A single checkbox line. The id is the source line index, stable only
/// within one parse pass; inserting a line above shifts downstream ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecklistItem {
    pub id: String,
    pub text: String,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChecklistSnapshot {
    pub items: Vec<ChecklistItem>,
    pub done_count: u32,
    pub total_count: u32,
    pub last_parsed_at: DateTime<Utc>,
}

impl Default for ChecklistSnapshot {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            done_count: 0,
            total_count: 0,
            last_parsed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitInfo {
    pub short_hash: String,
    pub message: String,
    pub author: String,
    /// ISO-8601 committer date as printed by git.
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RepositoryStatus {
    pub branch: String,
    pub uncommitted_count: u32,
    /// Newest first, bounded length.
    pub commits: Vec<CommitInfo>,
    #[serde(default)]
    pub remote: Option<String>,
}
