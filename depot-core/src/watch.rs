//! Debounced recursive filesystem watching for published roots.
//!
//! Raw notify events are coalesced into [`ChangeBatch`]es of root-relative
//! paths and fanned out on a broadcast channel. The channel is bounded:
//! consumers that fall behind lose the oldest batches instead of blocking
//! the watcher thread.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::error::{DepotError, Result};
use crate::models::ChangeBatch;

/// Default debounce window for coalescing change events.
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// Batches buffered per consumer before the oldest are shed.
const CHANGE_BUFFER: usize = 64;

/// Watches one directory tree and broadcasts coalesced change batches.
pub struct ChangeWatcher {
    tx: broadcast::Sender<ChangeBatch>,
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

impl ChangeWatcher {
    /// Start watching `root` recursively with the given debounce window.
    pub fn start(root: &Path, debounce_ms: u64) -> Result<ChangeWatcher> {
        let (tx, _) = broadcast::channel(CHANGE_BUFFER);
        let event_tx = tx.clone();
        let root_owned: PathBuf = root.to_path_buf();

        let mut debouncer = new_debouncer(
            Duration::from_millis(debounce_ms),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let mut paths: Vec<String> = events
                        .iter()
                        .flat_map(|event| event.paths.iter())
                        .filter_map(|abspath| relative_posix(&root_owned, abspath))
                        .collect();
                    paths.sort();
                    paths.dedup();
                    if paths.is_empty() {
                        return;
                    }
                    debug!(count = paths.len(), "filesystem change batch");
                    // Send fails only when nobody is subscribed.
                    let _ = event_tx.send(ChangeBatch { paths });
                }
                Err(errors) => {
                    for err in errors {
                        error!("watcher error: {err}");
                    }
                }
            },
        )
        .map_err(|err| DepotError::Internal(format!("failed to create watcher: {err}")))?;

        debouncer
            .watch(root, RecursiveMode::Recursive)
            .map_err(|err| {
                DepotError::Internal(format!("failed to watch {}: {err}", root.display()))
            })?;

        Ok(ChangeWatcher {
            tx,
            _debouncer: debouncer,
        })
    }

    /// Subscribe to change batches from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.tx.subscribe()
    }
}

fn relative_posix(root: &Path, abspath: &Path) -> Option<String> {
    let rel = abspath.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_posix() {
        let root = Path::new("/srv/root");
        assert_eq!(
            relative_posix(root, Path::new("/srv/root/dir1/ds.b2nd")).unwrap(),
            "dir1/ds.b2nd"
        );
        assert_eq!(relative_posix(root, Path::new("/elsewhere/x")), None);
        assert_eq!(relative_posix(root, Path::new("/srv/root")), None);
    }

    #[tokio::test]
    async fn emits_batches_for_writes() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = ChangeWatcher::start(dir.path(), 50).unwrap();
        let mut rx = watcher.subscribe();

        std::fs::write(dir.path().join("fresh.b2nd"), b"x").unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("change batch before timeout")
            .unwrap();
        assert!(batch.paths.contains(&"fresh.b2nd".to_string()));
    }
}
