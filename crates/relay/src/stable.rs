//! Stable-file detection.
//!
//! A file is only reported once it has stopped changing for a configured
//! quiet period, so callers never act on a file that is still being copied
//! into the watch directory.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::error::{RelayError, Result};

/// Default quiet period before a file is considered completely written
pub const DEFAULT_STABLE_THRESHOLD: Duration = Duration::from_secs(5);

const EVENT_BUFFER: usize = 64;

/// Signals that a file in the watch directory is ready to be processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    Unstable,
    Stable,
    Removed,
}

/// What the detector last observed about a tracked path
#[derive(Debug, Clone)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub last_change: Instant,
    pub state: Stability,
}

impl WatchedFile {
    fn observe(path: PathBuf) -> Self {
        let mut file = Self {
            path,
            size: 0,
            modified: None,
            last_change: Instant::now(),
            state: Stability::Unstable,
        };
        if let Ok(meta) = std::fs::metadata(&file.path) {
            file.size = meta.len();
            file.modified = meta.modified().ok();
        }
        file
    }

    fn touch(&mut self) {
        if let Ok(meta) = std::fs::metadata(&self.path) {
            self.size = meta.len();
            self.modified = meta.modified().ok();
        }
        self.last_change = Instant::now();
        self.state = Stability::Unstable;
    }

    /// Re-stat the file and compare against the previous snapshot.
    ///
    /// Catches writes whose notifications were lost, which happens on
    /// network mounts.
    fn refresh(&mut self) -> Stability {
        self.state = match std::fs::metadata(&self.path) {
            Ok(meta) => {
                let modified = meta.modified().ok();
                if meta.len() != self.size || modified != self.modified {
                    self.size = meta.len();
                    self.modified = modified;
                    self.last_change = Instant::now();
                    Stability::Unstable
                } else {
                    Stability::Stable
                }
            }
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!("unable to stat {}, skipping: {}", self.path.display(), e);
                }
                Stability::Removed
            }
        };
        self.state
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathSignal {
    Changed,
    Removed,
}

type InFlight = Arc<Mutex<HashMap<PathBuf, mpsc::UnboundedSender<PathSignal>>>>;

/// Shared state between the dispatcher and the per-path waits
#[derive(Clone)]
struct Tracker {
    threshold: Duration,
    inflight: InFlight,
    events: mpsc::Sender<FileEvent>,
    cancel: CancellationToken,
}

impl Tracker {
    fn inflight(&self) -> MutexGuard<'_, HashMap<PathBuf, mpsc::UnboundedSender<PathSignal>>> {
        self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a stability wait for `path`, or reset the one already running.
    fn track(&self, path: PathBuf) {
        let mut inflight = self.inflight();
        if let Some(signals) = inflight.get(&path) {
            if signals.send(PathSignal::Changed).is_ok() {
                return;
            }
        }
        self.spawn_wait(&mut inflight, path);
    }

    /// Start a stability wait unless one is already running for `path`.
    fn discover(&self, path: PathBuf) {
        let mut inflight = self.inflight();
        if inflight.contains_key(&path) {
            return;
        }
        self.spawn_wait(&mut inflight, path);
    }

    fn spawn_wait(
        &self,
        inflight: &mut HashMap<PathBuf, mpsc::UnboundedSender<PathSignal>>,
        path: PathBuf,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        inflight.insert(path.clone(), tx);
        debug!("waiting for {} to stabilize", path.display());
        tokio::spawn(self.clone().wait_until_stable(path, rx));
    }

    /// Cancel the wait for `path` and for anything beneath it.
    fn remove(&self, path: &Path) {
        let mut inflight = self.inflight();
        let doomed: Vec<PathBuf> = inflight
            .keys()
            .filter(|tracked| tracked.starts_with(path))
            .cloned()
            .collect();
        for tracked in doomed {
            if let Some(signals) = inflight.remove(&tracked) {
                let _ = signals.send(PathSignal::Removed);
            }
        }
    }

    fn changed(&self, path: PathBuf) {
        if path.is_dir() {
            return;
        }
        self.track(path);
    }

    fn appeared(&self, path: PathBuf) {
        if path.is_dir() {
            // A directory created or moved in may already hold files
            for file in existing_files(&path) {
                self.discover(file);
            }
        } else {
            self.track(path);
        }
    }

    fn handle(&self, event: Event) {
        match event.kind {
            EventKind::Create(_) => {
                for path in event.paths {
                    self.appeared(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                for path in event.paths {
                    if path.exists() {
                        self.appeared(path);
                    } else {
                        self.remove(&path);
                    }
                }
            }
            EventKind::Modify(_) => {
                for path in event.paths {
                    self.changed(path);
                }
            }
            EventKind::Remove(_) => {
                for path in event.paths {
                    self.remove(&path);
                }
            }
            _ => {}
        }
    }

    /// Drop `path` from the in-flight set unless a signal raced in.
    ///
    /// Signals are only ever sent while the in-flight lock is held, so an
    /// empty queue under the lock means nobody else knows about this wait.
    fn try_retire(&self, path: &Path, signals: &mut mpsc::UnboundedReceiver<PathSignal>) -> Option<PathSignal> {
        let mut inflight = self.inflight();
        match signals.try_recv() {
            Ok(signal) => Some(signal),
            Err(TryRecvError::Empty) => {
                inflight.remove(path);
                None
            }
            Err(TryRecvError::Disconnected) => Some(PathSignal::Removed),
        }
    }

    async fn wait_until_stable(self, path: PathBuf, mut signals: mpsc::UnboundedReceiver<PathSignal>) {
        let mut file = WatchedFile::observe(path);
        let timer = tokio::time::sleep(self.threshold);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                signal = signals.recv() => match signal {
                    Some(PathSignal::Changed) => {
                        file.touch();
                        timer.as_mut().reset(Instant::now() + self.threshold);
                    }
                    Some(PathSignal::Removed) | None => {
                        debug!("{} was removed before it stabilized", file.path.display());
                        return;
                    }
                },
                _ = &mut timer => {
                    let state = file.refresh();
                    if state == Stability::Unstable {
                        debug!("{} changed without a notification, waiting again", file.path.display());
                        timer.as_mut().reset(Instant::now() + self.threshold);
                        continue;
                    }
                    match self.try_retire(&file.path, &mut signals) {
                        Some(PathSignal::Changed) => {
                            file.touch();
                            timer.as_mut().reset(Instant::now() + self.threshold);
                            continue;
                        }
                        Some(PathSignal::Removed) => return,
                        None => {}
                    }
                    if state == Stability::Removed {
                        debug!("{} disappeared before it stabilized", file.path.display());
                        return;
                    }
                    info!(
                        "{} is stable ({} bytes, unchanged for {:?})",
                        file.path.display(),
                        file.size,
                        file.last_change.elapsed()
                    );
                    let event = FileEvent { path: file.path };
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = self.events.send(event) => {}
                    }
                    return;
                }
            }
        }
    }
}

/// Watches a directory tree and signals files once they stop changing
pub struct StableFileWatcher {
    cancel: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
}

impl StableFileWatcher {
    /// Begin watching `root` recursively. Must be called inside a tokio runtime.
    pub fn watch(
        root: impl Into<PathBuf>,
        stable_threshold: Duration,
    ) -> Result<(Self, mpsc::Receiver<FileEvent>)> {
        Self::watch_until(root, stable_threshold, &CancellationToken::new())
    }

    /// Like [`watch`](Self::watch), stopping when `shutdown` is cancelled.
    pub fn watch_until(
        root: impl Into<PathBuf>,
        stable_threshold: Duration,
        shutdown: &CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<FileEvent>)> {
        let root = root.into();
        if !root.is_dir() {
            return Err(RelayError::invalid_argument(format!(
                "watch directory {} does not exist",
                root.display()
            )));
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut native = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = raw_tx.send(res);
        })?;
        native.watch(&root, RecursiveMode::Recursive)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = shutdown.child_token();
        let tracker = Tracker {
            threshold: stable_threshold,
            inflight: InFlight::default(),
            events: events_tx,
            cancel: cancel.clone(),
        };

        // Enumerate after the native watch is registered so nothing slips between
        let existing = existing_files(&root);
        debug!("found {} existing files under {}", existing.len(), root.display());
        for path in existing {
            tracker.discover(path);
        }

        info!("watching {} (stable threshold {:?})", root.display(), stable_threshold);
        let dispatcher = tokio::spawn(dispatch(root.clone(), native, raw_rx, tracker));

        Ok((
            Self {
                cancel,
                dispatcher: Some(dispatcher),
            },
            events_rx,
        ))
    }

    /// Stop watching. Every pending stability wait ends and the event channel closes.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Close and wait for the dispatcher to finish.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.await;
        }
    }
}

impl Drop for StableFileWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn dispatch(
    root: PathBuf,
    native: RecommendedWatcher,
    mut raw: mpsc::UnboundedReceiver<notify::Result<Event>>,
    tracker: Tracker,
) {
    // Dropped when the loop ends, which stops native notifications
    let _native = native;
    loop {
        tokio::select! {
            _ = tracker.cancel.cancelled() => break,
            msg = raw.recv() => match msg {
                None => break,
                Some(Ok(event)) => tracker.handle(event),
                Some(Err(e)) => warn!("file system watch error under {}: {}", root.display(), e),
            }
        }
    }
    debug!("stopped watching {}", root.display());
}

fn existing_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                warn!("error reading directory entry: {}", e);
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}
