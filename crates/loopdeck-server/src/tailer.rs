//! Incremental tailer for the loop's append-only output file. One task owns
//! the byte offset, so reads are serialized per file; change notifications
//! only schedule the next delta read.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use loopdeck_core::parse::classify_line;
use loopdeck_core::LogEvent;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;

use crate::hub::{HubEvent, HubHandle};
use crate::watch::file_watcher;

pub struct LogTailer {
    path: PathBuf,
    offset: u64,
    events: HubHandle,
}

impl LogTailer {
    /// The offset starts at 0, so a pre-existing file is replayed in full as
    /// backlog on first attach.
    pub fn new(path: PathBuf, events: HubHandle) -> Self {
        Self {
            path,
            offset: 0,
            events,
        }
    }

    /// Read exactly the bytes appended since the last poll and emit one
    /// classified event per non-empty line. A shrunken or replaced file
    /// resets the offset and replays the new content; a missing file resets
    /// the offset and emits nothing.
    pub async fn poll(&mut self) {
        let size = match fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                self.offset = 0;
                return;
            }
        };
        if size < self.offset {
            self.offset = 0;
        }
        if size == self.offset {
            return;
        }
        let chunk = match self.read_range(self.offset, size).await {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!("tail_read_failed: {err}");
                return;
            }
        };
        self.offset = size;
        let text = String::from_utf8_lossy(&chunk);
        for line in text.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let severity = classify_line(line);
            self.events
                .event(HubEvent::Log(LogEvent::new(severity, line)));
        }
    }

    async fn read_range(&self, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
        let mut file = fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;
        let mut buffer = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buffer).await?;
        Ok(buffer)
    }
}

pub async fn run(mut tailer: LogTailer, debounce: Duration) {
    let (_watcher, mut ticks) = match file_watcher(&tailer.path) {
        Ok(pair) => pair,
        Err(err) => {
            warn!("tail_watch_failed: {err}");
            return;
        }
    };
    // Catch up from scratch before waiting on notifications.
    tailer.poll().await;
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
                tailer.poll().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubMessage;
    use loopdeck_core::LogSeverity;
    use std::io::Write;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn test_tailer(path: PathBuf) -> (LogTailer, mpsc::UnboundedReceiver<HubMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LogTailer::new(path, HubHandle::new(tx)), rx)
    }

    fn drain_logs(rx: &mut mpsc::UnboundedReceiver<HubMessage>) -> Vec<LogEvent> {
        let mut logs = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let HubMessage::Event(HubEvent::Log(entry)) = message {
                logs.push(entry);
            }
        }
        logs
    }

    fn append(path: &std::path::Path, data: &str) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .expect("open for append");
        file.write_all(data.as_bytes()).expect("append");
    }

    #[tokio::test]
    async fn emits_exactly_the_appended_delta_per_poll() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("loop.log");
        append(&path, "alpha\nbeta\n");
        let (mut tailer, mut rx) = test_tailer(path.clone());

        tailer.poll().await;
        let first: Vec<String> = drain_logs(&mut rx).into_iter().map(|e| e.text).collect();
        assert_eq!(first, vec!["alpha", "beta"]);

        append(&path, "gamma\ndelta\n");
        tailer.poll().await;
        let second: Vec<String> = drain_logs(&mut rx).into_iter().map(|e| e.text).collect();
        assert_eq!(second, vec!["gamma", "delta"]);

        // Nothing new, nothing emitted.
        tailer.poll().await;
        assert!(drain_logs(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn truncated_file_replays_from_the_start() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("loop.log");
        append(&path, "one\ntwo\nthree\n");
        let (mut tailer, mut rx) = test_tailer(path.clone());
        tailer.poll().await;
        drain_logs(&mut rx);

        std::fs::write(&path, "fresh\n").expect("rewrite");
        tailer.poll().await;
        let logs: Vec<String> = drain_logs(&mut rx).into_iter().map(|e| e.text).collect();
        assert_eq!(logs, vec!["fresh"]);
    }

    #[tokio::test]
    async fn missing_file_is_empty_state_not_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("absent.log");
        let (mut tailer, mut rx) = test_tailer(path.clone());
        tailer.poll().await;
        assert!(drain_logs(&mut rx).is_empty());

        // File shows up later; the whole content is backlog.
        append(&path, "late arrival\n");
        tailer.poll().await;
        let logs = drain_logs(&mut rx);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].text, "late arrival");
    }

    #[tokio::test]
    async fn lines_are_classified_on_the_way_through() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("loop.log");
        append(&path, "Error: connection failed\nBuild succeeded\n");
        let (mut tailer, mut rx) = test_tailer(path);
        tailer.poll().await;
        let logs = drain_logs(&mut rx);
        assert_eq!(logs[0].severity, LogSeverity::Error);
        assert_eq!(logs[1].severity, LogSeverity::Success);
    }
}
