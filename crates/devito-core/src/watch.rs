//! Filesystem watching scoped to the dependency graph.
//!
//! A [`FileWatcher`] turns one directory into a stream of [`FileChange`]s.
//! The [`WatchRegistry`] holds one subscription per directory of the current
//! [`WatchSet`], forwards changes to tracked files, and is replaced wholesale
//! after every successful build: old subscriptions are torn down before new
//! ones are installed, never diffed.

use futures::stream::{select_all, Stream, StreamExt};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{BuildError, Result};

/// File change event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    /// File was modified
    Modified(PathBuf),
    /// File was created
    Created(PathBuf),
    /// File was removed
    Removed(PathBuf),
}

impl FileChange {
    /// Get the path affected by this change.
    pub fn path(&self) -> &Path {
        match self {
            FileChange::Modified(p) | FileChange::Created(p) | FileChange::Removed(p) => p,
        }
    }

    pub fn into_path(self) -> PathBuf {
        match self {
            FileChange::Modified(p) | FileChange::Created(p) | FileChange::Removed(p) => p,
        }
    }
}

/// Stream of changes for one watched directory.
///
/// Dropping the subscription stops the underlying watch.
pub struct WatchSubscription {
    rx: mpsc::UnboundedReceiver<FileChange>,
    _handle: Option<Box<dyn Any + Send>>,
}

impl WatchSubscription {
    /// Wrap a receiver, keeping `handle` alive for as long as the
    /// subscription lives.
    pub fn new(rx: mpsc::UnboundedReceiver<FileChange>, handle: impl Any + Send) -> Self {
        Self {
            rx,
            _handle: Some(Box::new(handle)),
        }
    }

    pub fn from_receiver(rx: mpsc::UnboundedReceiver<FileChange>) -> Self {
        Self { rx, _handle: None }
    }
}

impl std::fmt::Debug for WatchSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSubscription").finish_non_exhaustive()
    }
}

impl Stream for WatchSubscription {
    type Item = FileChange;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<FileChange>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Source of per-directory change streams.
pub trait FileWatcher: Send + Sync {
    /// Watch `dir` (not recursively).
    fn watch(&self, dir: &Path) -> Result<WatchSubscription>;
}

/// [`FileWatcher`] backed by the platform watcher from `notify`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyWatcher;

impl NotifyWatcher {
    pub fn new() -> Self {
        Self
    }
}

impl FileWatcher for NotifyWatcher {
    fn watch(&self, dir: &Path) -> Result<WatchSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for path in &event.paths {
                    let change = match event.kind {
                        EventKind::Create(_) => FileChange::Created(path.clone()),
                        EventKind::Modify(_) => FileChange::Modified(path.clone()),
                        EventKind::Remove(_) => FileChange::Removed(path.clone()),
                        _ => continue,
                    };
                    let _ = tx.send(change);
                }
            }
            Err(e) => tracing::warn!("watch error: {}", e),
        })?;

        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        tracing::trace!("watching {}", dir.display());
        Ok(WatchSubscription::new(rx, watcher))
    }
}

/// Files to track and the directories that contain them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSet {
    files: BTreeSet<PathBuf>,
    dirs: BTreeSet<PathBuf>,
}

impl WatchSet {
    /// Derive the set from a build's (or analysis') input paths.
    pub fn from_inputs<I, P>(inputs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut set = Self::default();
        for input in inputs {
            let input = input.as_ref();
            if let Some(dir) = input.parent().filter(|d| !d.as_os_str().is_empty()) {
                set.dirs.insert(dir.to_path_buf());
                set.files.insert(input.to_path_buf());
            }
        }
        set
    }

    pub fn dirs(&self) -> impl Iterator<Item = &Path> {
        self.dirs.iter().map(PathBuf::as_path)
    }

    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(PathBuf::as_path)
    }

    /// Whether a change to `path` should be reported.
    pub fn tracks(&self, path: &Path) -> bool {
        path.extension().is_none_or(|ext| ext != "map") && self.files.contains(path)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Receives every tracked change.
pub type ChangeSink = Arc<dyn Fn(FileChange) + Send + Sync>;

struct ActiveWatch {
    set: WatchSet,
    task: JoinHandle<()>,
}

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The live set of directory subscriptions.
pub struct WatchRegistry {
    watcher: Arc<dyn FileWatcher>,
    sink: ChangeSink,
    active: Mutex<Option<ActiveWatch>>,
}

impl std::fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("watched", &self.watched())
            .finish()
    }
}

impl WatchRegistry {
    pub fn new(watcher: Arc<dyn FileWatcher>, sink: ChangeSink) -> Self {
        Self {
            watcher,
            sink,
            active: Mutex::new(None),
        }
    }

    /// Tear down every subscription, then watch the directories of `set`.
    ///
    /// Directories that cannot be watched are logged and skipped. Returns
    /// the number of directories now watched.
    pub fn replace(&self, set: WatchSet) -> Result<usize> {
        // drop the previous watch before installing new handles
        self.active.lock().take();

        let mut subscriptions = Vec::new();
        for dir in set.dirs() {
            match self.watcher.watch(dir) {
                Ok(sub) => subscriptions.push(sub),
                Err(e) => tracing::warn!("cannot watch {}: {}", dir.display(), e),
            }
        }
        if subscriptions.is_empty() && !set.is_empty() {
            return Err(BuildError::Watch("no input directory could be watched".into()));
        }

        let watched = subscriptions.len();
        let tracked = set.clone();
        let sink = Arc::clone(&self.sink);
        let task = tokio::spawn(async move {
            let mut merged = select_all(subscriptions);
            while let Some(change) = merged.next().await {
                if tracked.tracks(change.path()) {
                    tracing::debug!("changed: {}", change.path().display());
                    sink(change);
                }
            }
        });

        *self.active.lock() = Some(ActiveWatch { set, task });
        tracing::debug!("watching {} directories", watched);
        Ok(watched)
    }

    /// Stop watching everything.
    pub fn clear(&self) {
        self.active.lock().take();
    }

    /// The set currently watched.
    pub fn watched(&self) -> WatchSet {
        self.active
            .lock()
            .as_ref()
            .map(|a| a.set.clone())
            .unwrap_or_default()
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    //! A watcher driven by the test.

    use super::*;
    use rustc_hash::FxHashMap;

    /// Watcher whose events are emitted by hand.
    #[derive(Debug, Default)]
    pub struct ManualWatcher {
        subscribers: Mutex<FxHashMap<PathBuf, Vec<mpsc::UnboundedSender<FileChange>>>>,
    }

    impl ManualWatcher {
        pub fn new() -> Self {
            Self::default()
        }

        /// Deliver `change` to subscribers of its parent directory. Returns
        /// how many live subscriptions received it.
        pub fn emit(&self, change: FileChange) -> usize {
            let Some(dir) = change.path().parent() else {
                return 0;
            };
            let mut subscribers = self.subscribers.lock();
            let Some(senders) = subscribers.get_mut(dir) else {
                return 0;
            };
            senders.retain(|tx| !tx.is_closed());
            senders.iter().filter(|tx| tx.send(change.clone()).is_ok()).count()
        }

        /// Directories with at least one live subscription.
        pub fn watched_dirs(&self) -> Vec<PathBuf> {
            let mut dirs: Vec<_> = self
                .subscribers
                .lock()
                .iter()
                .filter(|(_, senders)| senders.iter().any(|tx| !tx.is_closed()))
                .map(|(dir, _)| dir.clone())
                .collect();
            dirs.sort();
            dirs
        }
    }

    impl FileWatcher for ManualWatcher {
        fn watch(&self, dir: &Path) -> Result<WatchSubscription> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.subscribers
                .lock()
                .entry(dir.to_path_buf())
                .or_default()
                .push(tx);
            Ok(WatchSubscription::from_receiver(rx))
        }
    }
}
