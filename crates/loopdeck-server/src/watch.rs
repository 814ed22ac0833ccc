//! Shared notify plumbing for the tailer and the checklist differ: watch a
//! file and its parent directory, reporting every filesystem event as a unit
//! tick on an unbounded channel.

use std::path::Path;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

/// The returned watcher must be kept alive for ticks to keep flowing.
pub(crate) fn file_watcher(
    path: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<()>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            let _ = tx.send(());
        }
    })?;
    watch_path(&mut watcher, path);
    Ok((watcher, rx))
}

fn watch_path(watcher: &mut RecommendedWatcher, path: &Path) {
    if let Some(parent) = path.parent() {
        if parent.exists() {
            if let Err(err) = watcher.watch(parent, RecursiveMode::NonRecursive) {
                warn!("watch_failed: {err}");
            }
        }
    }
    if path.exists() {
        if let Err(err) = watcher.watch(path, RecursiveMode::NonRecursive) {
            warn!("watch_failed: {err}");
        }
    }
}
