//
// watcher.rs
//
// Recursive filesystem watcher feeding the workspace worker
//

use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use notify::event::{EventKind, ModifyKind};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Modified,
    Removed,
    Renamed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: WatchEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

fn classify(kind: &EventKind) -> Option<WatchEventKind> {
    match kind {
        EventKind::Create(_) => Some(WatchEventKind::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Some(WatchEventKind::Renamed),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(WatchEventKind::Modified),
        EventKind::Remove(_) => Some(WatchEventKind::Removed),
        EventKind::Access(_) => None,
        EventKind::Any | EventKind::Other => Some(WatchEventKind::Modified),
    }
}

/// True if any component of `path` below `root` is an excluded directory.
fn is_excluded(root: &Path, path: &Path, excluded: &[String]) -> bool {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components().any(|c| {
        let name = c.as_os_str().to_string_lossy();
        excluded.iter().any(|e| *e == name)
    })
}

/// Translate one notify event into zero or more watch events.
pub fn translate_event(event: &Event, root: &Path, excluded: &[String]) -> Vec<WatchEvent> {
    let Some(kind) = classify(&event.kind) else {
        return Vec::new();
    };
    event
        .paths
        .iter()
        .filter(|p| !is_excluded(root, p, excluded))
        .map(|p| WatchEvent::new(p.clone(), kind))
        .collect()
}

/// Owns the platform watcher thread. Dropping the cancellation token's
/// owner (or cancelling it) ends the thread within one poll interval.
pub struct FsWatcher {
    handle: Option<JoinHandle<()>>,
    token: CancellationToken,
}

impl FsWatcher {
    const POLL_INTERVAL: Duration = Duration::from_millis(250);

    /// Watch `root` recursively, forwarding events on `tx` until `token`
    /// is cancelled or the receiver goes away.
    pub fn spawn(
        root: PathBuf,
        excluded: Vec<String>,
        tx: mpsc::UnboundedSender<WatchEvent>,
        token: CancellationToken,
    ) -> Result<Self> {
        let (watch_tx, watch_rx) = std_mpsc::channel();
        let mut watcher = RecommendedWatcher::new(watch_tx, NotifyConfig::default())
            .map_err(|e| anyhow!("Failed to create watcher: {e}"))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| anyhow!("Failed to watch {}: {e}", root.display()))?;
        log::info!("Watching {} for changes", root.display());

        let thread_token = token.clone();
        let handle = std::thread::Builder::new()
            .name("pkgindex-watcher".to_string())
            .spawn(move || {
                // Keep the watcher alive for the lifetime of the loop
                let _watcher = watcher;
                loop {
                    if thread_token.is_cancelled() {
                        break;
                    }
                    match watch_rx.recv_timeout(Self::POLL_INTERVAL) {
                        Ok(Ok(event)) => {
                            for ev in translate_event(&event, &root, &excluded) {
                                if tx.send(ev).is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(Err(err)) => log::warn!("Watcher error: {err:?}"),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::trace!("Watcher for {} stopped", root.display());
            })
            .map_err(|e| anyhow!("Failed to spawn watcher thread: {e}"))?;

        Ok(Self {
            handle: Some(handle),
            token,
        })
    }

    /// Cancel and wait for the watcher thread to exit.
    pub fn close(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};

    fn excluded() -> Vec<String> {
        vec![".git".to_string(), "vendor".to_string()]
    }

    #[test]
    fn test_translate_kinds() {
        let root = Path::new("/w");
        let cases = [
            (EventKind::Create(CreateKind::File), Some(WatchEventKind::Created)),
            (
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                Some(WatchEventKind::Modified),
            ),
            (
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                Some(WatchEventKind::Renamed),
            ),
            (EventKind::Remove(RemoveKind::Folder), Some(WatchEventKind::Removed)),
            (EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)), None),
        ];
        for (kind, expected) in cases {
            let event = Event::new(kind).add_path(PathBuf::from("/w/a/a.toy"));
            let got = translate_event(&event, root, &excluded());
            assert_eq!(got.first().map(|e| e.kind), expected);
        }
    }

    #[test]
    fn test_translate_filters_excluded_dirs() {
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/w/.git/index"))
            .add_path(PathBuf::from("/w/vendor/x/x.toy"))
            .add_path(PathBuf::from("/w/a/a.toy"));
        let got = translate_event(&event, Path::new("/w"), &excluded());
        assert_eq!(
            got,
            vec![WatchEvent::new("/w/a/a.toy", WatchEventKind::Created)]
        );
    }

    #[tokio::test]
    async fn test_watcher_reports_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let watcher = FsWatcher::spawn(root.clone(), excluded(), tx, token.clone()).unwrap();

        std::fs::write(root.join("go.mod"), "module example.com/m\n").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .ok()
            .flatten();
        if let Some(event) = event {
            assert!(event.path.starts_with(&root));
        }

        watcher.close();
        assert!(token.is_cancelled());
    }
}
