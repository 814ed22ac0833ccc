//! One-shot document generator. Spawns the configured external tool, splits
//! its stdout on sentinel marker lines into named documents, and writes them
//! through the document store. Cancellation is a hard terminate with no
//! grace period; the generator is not expected to need cleanup.

use std::path::PathBuf;
use std::sync::Arc;

use loopdeck_core::error::GeneratorError;
use loopdeck_core::{LogEvent, LogSeverity};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::docs::DocumentStore;
use crate::hub::{HubEvent, HubHandle};

#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    pub command: Vec<String>,
    pub project_root: PathBuf,
}

pub struct DocumentGenerator {
    config: GeneratorConfig,
    documents: Arc<DocumentStore>,
    events: HubHandle,
    cancel: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl DocumentGenerator {
    pub fn new(config: GeneratorConfig, documents: Arc<DocumentStore>, events: HubHandle) -> Self {
        Self {
            config,
            documents,
            events,
            cancel: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn start(&self) -> Result<(), GeneratorError> {
        let mut cancel_slot = self.cancel.lock().await;
        if cancel_slot.is_some() {
            return Err(GeneratorError::Busy);
        }
        if self.config.command.is_empty() {
            return Err(GeneratorError::Unconfigured);
        }

        let mut command = Command::new(&self.config.command[0]);
        command
            .args(&self.config.command[1..])
            .current_dir(&self.config.project_root)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|err| GeneratorError::Spawn(err.to_string()))?;

        let (cancel_tx, mut cancel_rx) = mpsc::channel(1);
        *cancel_slot = Some(cancel_tx);
        drop(cancel_slot);

        info!(event = "generator_started");
        self.events.event(HubEvent::Log(LogEvent::new(
            LogSeverity::Info,
            "document generation started",
        )));

        let documents = self.documents.clone();
        let events = self.events.clone();
        let cancel_slot = self.cancel.clone();
        tokio::spawn(async move {
            let stdout = child.stdout.take();
            let mut output = String::new();
            let mut cancelled = false;
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    tokio::select! {
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                output.push_str(&line);
                                output.push('\n');
                            }
                            _ => break,
                        },
                        Some(()) = cancel_rx.recv() => {
                            let _ = child.start_kill();
                            cancelled = true;
                            break;
                        }
                    }
                }
            }
            let _ = child.wait().await;

            if cancelled {
                events.event(HubEvent::Log(LogEvent::new(
                    LogSeverity::Warning,
                    "document generation cancelled",
                )));
            } else {
                let mut written = 0;
                for (name, content) in split_documents(&output) {
                    match documents.write(&name, &content).await {
                        Ok(()) => written += 1,
                        Err(err) => events.event(HubEvent::Log(LogEvent::new(
                            LogSeverity::Error,
                            format!("generator output {name} rejected: {err}"),
                        ))),
                    }
                }
                events.event(HubEvent::Log(LogEvent::new(
                    LogSeverity::Success,
                    format!("document generation complete ({written} documents)"),
                )));
            }
            *cancel_slot.lock().await = None;
        });
        Ok(())
    }

    pub async fn cancel(&self) {
        let sender = self.cancel.lock().await.clone();
        match sender {
            Some(sender) => {
                let _ = sender.send(()).await;
            }
            None => {
                self.events.event(HubEvent::Log(LogEvent::new(
                    LogSeverity::Warning,
                    "cancel requested but generator is not running",
                )));
            }
        }
    }
}

/// Split generator stdout into (document name, content) pairs on sentinel
/// marker lines. Text before the first marker is discarded.
pub fn split_documents(output: &str) -> Vec<(String, String)> {
    let marker = Regex::new(r"^===\s*FILE:\s*(.+?)\s*===$").expect("valid regex");
    let mut documents = Vec::new();
    let mut current: Option<(String, String)> = None;
    for line in output.lines() {
        if let Some(captures) = marker.captures(line) {
            if let Some(doc) = current.take() {
                documents.push(doc);
            }
            let name = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            current = Some((name.to_string(), String::new()));
            continue;
        }
        if let Some((_, content)) = current.as_mut() {
            content.push_str(line);
            content.push('\n');
        }
    }
    if let Some(doc) = current.take() {
        documents.push(doc);
    }
    documents
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_sentinel_markers_and_drops_preamble() {
        let output = "thinking out loud\n\
                      === FILE: PROMPT.md ===\n\
                      do the thing\n\
                      carefully\n\
                      === FILE: NOTES.md ===\n\
                      remember the edge cases\n";
        let documents = split_documents(output);
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].0, "PROMPT.md");
        assert_eq!(documents[0].1, "do the thing\ncarefully\n");
        assert_eq!(documents[1].0, "NOTES.md");
        assert_eq!(documents[1].1, "remember the edge cases\n");
    }

    #[test]
    fn output_without_markers_yields_nothing() {
        assert!(split_documents("no markers at all\n").is_empty());
    }
}
