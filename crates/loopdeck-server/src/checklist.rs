//! Checklist differ. The file is cheap to parse, so every change
//! notification re-reads the whole thing and re-emits the full snapshot;
//! consumers must tolerate redundant snapshots. Item toggling is a
//! structured rewrite of the matched line, never a blind text substitution.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use loopdeck_core::error::ChecklistError;
use loopdeck_core::parse::parse_checklist;
use loopdeck_core::ChecklistSnapshot;
use regex::Regex;
use tokio::fs;
use tracing::warn;

use crate::hub::{HubEvent, HubHandle};
use crate::watch::file_watcher;

pub struct ChecklistFile {
    path: PathBuf,
}

impl ChecklistFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty checklist, not an error.
    pub async fn load(&self) -> ChecklistSnapshot {
        match fs::read_to_string(&self.path).await {
            Ok(content) => parse_checklist(&content),
            Err(_) => parse_checklist(""),
        }
    }

    /// Flip the checkbox on the given source line and write the file back.
    /// The change re-enters through the watcher like any external edit.
    pub async fn toggle(&self, line: usize) -> Result<(), ChecklistError> {
        let content = fs::read_to_string(&self.path).await?;
        let had_trailing_newline = content.ends_with('\n');
        let mut lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();
        let Some(target) = lines.get_mut(line) else {
            return Err(ChecklistError::NoSuchItem(line));
        };
        let item = Regex::new(r"^(\s*[-*]\s*\[)(.)(\].*)$").expect("valid regex");
        let rebuilt = {
            let Some(captures) = item.captures(target) else {
                return Err(ChecklistError::NoSuchItem(line));
            };
            let mark = match captures.get(2).map(|m| m.as_str()) {
                Some("x") | Some("X") => " ",
                _ => "x",
            };
            format!(
                "{}{}{}",
                captures.get(1).map(|m| m.as_str()).unwrap_or_default(),
                mark,
                captures.get(3).map(|m| m.as_str()).unwrap_or_default()
            )
        };
        *target = rebuilt;
        let mut joined = lines.join("\n");
        if had_trailing_newline {
            joined.push('\n');
        }
        fs::write(&self.path, joined).await?;
        Ok(())
    }
}

pub async fn run(file: Arc<ChecklistFile>, events: HubHandle, debounce: Duration) {
    let (_watcher, mut ticks) = match file_watcher(file.path()) {
        Ok(pair) => pair,
        Err(err) => {
            warn!("checklist_watch_failed: {err}");
            return;
        }
    };
    events.event(HubEvent::Checklist(file.load().await));
    let mut pending = false;
    loop {
        tokio::select! {
            tick = ticks.recv() => {
                match tick {
                    Some(()) => pending = true,
                    None => break,
                }
            }
            _ = tokio::time::sleep(debounce), if pending => {
                pending = false;
                events.event(HubEvent::Checklist(file.load().await));
            }
        }
    }
}
