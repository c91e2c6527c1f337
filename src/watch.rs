//! Watcher (C7): a debounced file-change event source. Unlike a plain
//! `notify` consumer, this layers a mandatory polling watcher on top of the
//! OS-native one at all times (`spec.md` §4.7), so platforms whose native
//! notifications are lossy still converge; both debouncers feed one merged
//! channel.

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use notify_debouncer_full::{new_debouncer_opt, DebounceEventResult, DebouncedEvent, Debouncer, FileIdMap};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Paths skipped unless explicitly requested, even if a caller asks to watch
/// a directory that contains them.
const NOISE_SEGMENTS: [&str; 4] = ["node_modules", ".git", ".ionify", "dist"];

const DEBOUNCE_DURATION: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Changed,
    Deleted,
}

#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

struct Watched {
    native: Debouncer<RecommendedWatcher, FileIdMap>,
    polling: Debouncer<notify::PollWatcher, FileIdMap>,
    paths: HashSet<PathBuf>,
}

/// File-change event source combining OS notifications with a polling
/// fallback. Cloning shares the same underlying watchers and event stream.
pub struct FsWatcher {
    inner: Arc<Mutex<Watched>>,
    rx: Arc<Mutex<mpsc::Receiver<ChangeEvent>>>,
}

impl FsWatcher {
    pub fn new() -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel(256);

        let native = build_debouncer::<RecommendedWatcher>(tx.clone(), notify::Config::default())?;
        let polling = build_debouncer::<notify::PollWatcher>(
            tx,
            notify::Config::default().with_poll_interval(POLL_INTERVAL),
        )?;

        Ok(Self {
            inner: Arc::new(Mutex::new(Watched {
                native,
                polling,
                paths: HashSet::new(),
            })),
            rx: Arc::new(Mutex::new(rx)),
        })
    }

    /// Idempotent: watching an already-watched path is a no-op.
    ///
    /// The lock guards are held only across plain `HashSet`/notify-watcher
    /// calls with no panicking code in between, so poisoning here can only
    /// follow a bug elsewhere in the process; treated as fatal rather than
    /// threading a recovery path through every caller.
    #[tracing::instrument(level = "debug", skip(self))]
    #[allow(clippy::expect_used)]
    pub fn watch(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if is_noise_path(path) {
            tracing::debug!(?path, "refusing to watch a default-excluded path");
            return Ok(());
        }

        let mut guard = self.inner.lock().expect("watcher lock poisoned");
        if !guard.paths.insert(path.to_path_buf()) {
            return Ok(());
        }
        guard.native.watch(path, RecursiveMode::Recursive)?;
        guard.polling.watch(path, RecursiveMode::Recursive)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    #[allow(clippy::expect_used)]
    pub fn unwatch(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let mut guard = self.inner.lock().expect("watcher lock poisoned");
        if !guard.paths.remove(path) {
            return Ok(());
        }
        // Absence on one side (already unwatched, or never matched due to a
        // race) is not an error here; best-effort release on both watchers.
        let _ = guard.native.unwatch(path);
        let _ = guard.polling.unwatch(path);
        Ok(())
    }

    /// Release every underlying handle. Idempotent.
    #[allow(clippy::expect_used)]
    pub fn close_all(&self) {
        let mut guard = self.inner.lock().expect("watcher lock poisoned");
        let paths: Vec<_> = guard.paths.drain().collect();
        for path in paths {
            let _ = guard.native.unwatch(&path);
            let _ = guard.polling.unwatch(&path);
        }
    }

    /// Receive the next coalesced change event.
    #[allow(clippy::expect_used)]
    pub async fn recv(&self) -> Option<ChangeEvent> {
        self.rx.lock().expect("watcher lock poisoned").recv().await
    }
}

fn build_debouncer<W: notify::Watcher + Send + 'static>(
    tx: mpsc::Sender<ChangeEvent>,
    config: notify::Config,
) -> anyhow::Result<Debouncer<W, FileIdMap>> {
    new_debouncer_opt::<_, W, FileIdMap>(
        DEBOUNCE_DURATION,
        None,
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                for event in events {
                    if let Some(change) = classify(&event) {
                        let _ = tx.blocking_send(change);
                    }
                }
            }
            Err(errors) => {
                for err in errors {
                    tracing::warn!(error = ?err, "error from filesystem watcher");
                }
            }
        },
        FileIdMap::new(),
        config,
    )
    .map_err(Into::into)
}

fn classify(event: &DebouncedEvent) -> Option<ChangeEvent> {
    use notify::EventKind;

    let kind = match event.event.kind {
        EventKind::Create(_) => ChangeKind::Added,
        EventKind::Remove(_) => ChangeKind::Deleted,
        EventKind::Modify(_) => ChangeKind::Changed,
        _ => return None,
    };

    let path = event.paths.first()?.clone();
    if is_noise_path(&path) {
        return None;
    }

    Some(ChangeEvent { path, kind })
}

fn is_noise_path(path: &Path) -> bool {
    path.components()
        .filter_map(|c| c.as_os_str().to_str())
        .any(|segment| NOISE_SEGMENTS.contains(&segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_segments_are_detected() {
        assert!(is_noise_path(Path::new("/proj/node_modules/pkg/index.js")));
        assert!(is_noise_path(Path::new("/proj/.git/HEAD")));
        assert!(!is_noise_path(Path::new("/proj/src/main.ts")));
    }

    #[tokio::test]
    async fn watch_is_idempotent_and_unwatch_releases() {
        let watcher = FsWatcher::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        watcher.watch(dir.path()).unwrap();
        watcher.watch(dir.path()).unwrap();
        assert_eq!(watcher.inner.lock().unwrap().paths.len(), 1);
        watcher.unwatch(dir.path()).unwrap();
        assert_eq!(watcher.inner.lock().unwrap().paths.len(), 0);
        // idempotent: unwatching again is a no-op, not an error
        watcher.unwatch(dir.path()).unwrap();
    }

    #[test]
    fn close_all_is_idempotent() {
        let watcher = FsWatcher::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        watcher.watch(dir.path()).unwrap();
        watcher.close_all();
        watcher.close_all();
        assert_eq!(watcher.inner.lock().unwrap().paths.len(), 0);
    }
}
