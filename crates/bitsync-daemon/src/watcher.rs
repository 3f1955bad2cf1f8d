//! File watcher with debouncing for the share directory.
//!
//! Uses notify-debouncer-mini and reports batches of share-relative paths.
//! What changed at each path is decided later by `NativeFs::refresh`.

use anyhow::Result;
use bitsync_core::fs::RESERVED_DIR;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

const DEBOUNCE: Duration = Duration::from_millis(200);

/// File watcher that monitors the share directory.
pub struct FileWatcher {
    /// Share root
    root: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    /// Receiver for batches of changed paths
    event_rx: mpsc::UnboundedReceiver<Vec<String>>,
}

impl FileWatcher {
    /// Create a new recursive watcher for `root`.
    pub fn new(root: PathBuf) -> Result<Self> {
        // FSEvents needs the real path (/var -> /private/var on macOS)
        let root = root.canonicalize().unwrap_or(root);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root_clone = root.clone();

        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    let paths: Vec<String> = events
                        .iter()
                        .filter_map(|event| relative_path(&event.path, &root_clone))
                        .collect();
                    if !paths.is_empty() {
                        debug!("Changed: {:?}", paths);
                        // Receiver dropped means the daemon is shutting down
                        let _ = event_tx.send(paths);
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            root,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Get the receiver for changed path batches.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<Vec<String>> {
        &mut self.event_rx
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Share-relative `/`-separated form of `path`, or `None` for the root
/// itself, paths outside it and anything under the reserved directory.
fn relative_path(path: &Path, root: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let components: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    match components.first() {
        None => None,
        Some(first) if *first == RESERVED_DIR => None,
        Some(_) => Some(components.join("/")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_relative_path_filters() {
        let root = Path::new("/share");
        assert_eq!(
            relative_path(Path::new("/share/docs/a.txt"), root),
            Some("docs/a.txt".to_string())
        );
        assert_eq!(relative_path(Path::new("/share"), root), None);
        assert_eq!(relative_path(Path::new("/elsewhere/a.txt"), root), None);
        assert_eq!(
            relative_path(Path::new("/share/.bitsync/partial/abc"), root),
            None
        );
        // Only the top-level reserved directory is skipped
        assert_eq!(
            relative_path(Path::new("/share/docs/.bitsync"), root),
            Some("docs/.bitsync".to_string())
        );
    }

    #[tokio::test]
    async fn test_watcher_reports_new_file() {
        let dir = TempDir::new().unwrap();
        let mut watcher = FileWatcher::new(dir.path().to_path_buf()).unwrap();

        // Let the backend settle before touching the tree
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(dir.path().join("hello.txt"), b"hi").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut seen = false;
        while !seen {
            let batch = tokio::time::timeout_at(deadline, watcher.event_rx().recv())
                .await
                .expect("watcher event")
                .expect("watcher channel open");
            seen = batch.iter().any(|p| p == "hello.txt");
        }
    }
}
