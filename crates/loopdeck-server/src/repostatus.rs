//! Repository status poller. A failed git query is swallowed and observers
//! keep the previous snapshot; transient tool errors never reach them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use loopdeck_core::parse::parse_remote_identifier;
use loopdeck_core::{CommitInfo, RepositoryStatus};
use tokio::process::Command;
use tracing::debug;

use crate::hub::{HubEvent, HubHandle};

const COMMIT_LIMIT: usize = 10;
const FIELD_SEP: char = '\u{1f}';

pub struct RepoStatusPoller {
    root: PathBuf,
    interval: Duration,
    events: HubHandle,
}

impl RepoStatusPoller {
    pub fn new(root: PathBuf, interval: Duration, events: HubHandle) -> Self {
        Self {
            root,
            interval,
            events,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            // The first tick fires immediately, giving the eager startup poll.
            ticker.tick().await;
            match query_status(&self.root).await {
                Ok(status) => self.events.event(HubEvent::Repository(status)),
                Err(err) => debug!("repo_status_skipped: {err}"),
            }
        }
    }
}

async fn query_status(root: &Path) -> Result<RepositoryStatus, String> {
    let branch = run_git(root, &["rev-parse", "--abbrev-ref", "HEAD"])
        .await?
        .trim()
        .to_string();
    let status_raw = run_git(root, &["status", "--porcelain"]).await?;
    let uncommitted_count = status_raw.lines().filter(|l| !l.trim().is_empty()).count() as u32;
    let log_raw = run_git(
        root,
        &[
            "log",
            "-n",
            "10",
            "--pretty=format:%h%x1f%s%x1f%an%x1f%cI",
        ],
    )
    .await?;
    let commits = parse_commit_log(&log_raw);
    // A repository without a remote is still a valid snapshot.
    let remote = match run_git(root, &["remote", "get-url", "origin"]).await {
        Ok(url) => parse_remote_identifier(&url),
        Err(_) => None,
    };
    Ok(RepositoryStatus {
        branch,
        uncommitted_count,
        commits,
        remote,
    })
}

fn parse_commit_log(raw: &str) -> Vec<CommitInfo> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.split(FIELD_SEP);
            let short_hash = parts.next()?.trim().to_string();
            let message = parts.next()?.to_string();
            let author = parts.next()?.to_string();
            let timestamp = parts.next()?.to_string();
            if short_hash.is_empty() {
                return None;
            }
            Some(CommitInfo {
                short_hash,
                message,
                author,
                timestamp,
            })
        })
        .take(COMMIT_LIMIT)
        .collect()
}

async fn run_git(cwd: &Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|err| err.to_string())?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(stderr);
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
