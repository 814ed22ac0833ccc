//! Pure text-to-structure functions shared by the supervisor, tailer, and
//! differ. Keeping these free of I/O lets the control paths stay blind to
//! raw text.

use chrono::Utc;
use regex::Regex;

use crate::{ChecklistItem, ChecklistSnapshot, LogSeverity};

const ERROR_MARKERS: [&str; 3] = ["error", "fail", "exception"];
const WARNING_MARKERS: [&str; 2] = ["warning", "warn"];
const SUCCESS_MARKERS: [&str; 3] = ["success", "complete", "pass"];

/// Classify one log line by case-insensitive substring match, first match
/// wins: error markers, then warning, then success, else info.
pub fn classify_line(line: &str) -> LogSeverity {
    let lower = line.to_lowercase();
    if ERROR_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return LogSeverity::Error;
    }
    if WARNING_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return LogSeverity::Warning;
    }
    if SUCCESS_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return LogSeverity::Success;
    }
    LogSeverity::Info
}

/// Extract the iteration counter from a loop stdout line, if present.
/// Matches an "iteration" token followed by an integer, tolerating a short
/// run of separator characters between them ("iteration 3", "Iteration #7",
/// "=== ITERATION 12/50 ===").
pub fn parse_iteration_marker(line: &str) -> Option<u64> {
    let pattern = Regex::new(r"(?i)\biteration\b[^0-9]{0,16}([0-9]+)").expect("valid regex");
    pattern
        .captures(line)
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
}

/// Parse the whole checklist file. Lines that do not look like checkbox
/// items are ignored, not errors. Item ids are source line indices.
pub fn parse_checklist(content: &str) -> ChecklistSnapshot {
    let item = Regex::new(r"^\s*[-*]\s*\[(.)\]\s*(.*)$").expect("valid regex");
    let mut items = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if let Some(captures) = item.captures(line) {
            let mark = captures.get(1).map(|m| m.as_str()).unwrap_or(" ");
            let text = captures.get(2).map(|m| m.as_str().trim()).unwrap_or("");
            items.push(ChecklistItem {
                id: index.to_string(),
                text: text.to_string(),
                done: matches!(mark, "x" | "X"),
            });
        }
    }
    let done_count = items.iter().filter(|item| item.done).count() as u32;
    ChecklistSnapshot {
        done_count,
        total_count: items.len() as u32,
        items,
        last_parsed_at: Utc::now(),
    }
}

/// Parse an `owner/repo` identifier out of a git remote URL. Supports the
/// SSH form (`git@host:owner/repo.git`), the ssh:// form, and HTTP(S).
pub fn parse_remote_identifier(url: &str) -> Option<String> {
    let trimmed = url.trim();
    let path = if let Some(rest) = trimmed.strip_prefix("git@") {
        rest.split_once(':').map(|(_, path)| path)?
    } else if let Some(rest) = trimmed.strip_prefix("ssh://git@") {
        rest.split_once('/').map(|(_, path)| path)?
    } else if let Some(rest) = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
    {
        rest.split_once('/').map(|(_, path)| path)?
    } else {
        return None;
    };
    let path = path.trim_end_matches('/').trim_end_matches(".git");
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return None;
    }
    let repo = segments.pop()?;
    let owner = segments.pop()?;
    Some(format!("{owner}/{repo}"))
}

/// A document name is safe when it cannot escape the documents directory:
/// plain file names only, no separators, no parent references, no absolute
/// paths.
pub fn is_safe_document_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
        && !name.starts_with('.')
}
