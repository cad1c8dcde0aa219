// Filesystem change detection for served directories.
//
// Raw notifications from `notify` land in a single-slot cell (a `watch` channel
// holding the most recent event). A debounce task drains that cell: the first
// event moves it from idle to pending, every further event pushes the deadline
// back, and once the quiet period passes without events one ChangeSignal is sent
// to the owner. Intermediate events are overwritten and only the last one is
// kept around for logging.

use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::errors::Result;

/// One raw notification, kept for diagnostics only.
#[derive(Debug, Clone)]
pub struct RawChange {
    pub kind: String,
    pub paths: Vec<PathBuf>,
    pub received_at: DateTime<Utc>,
}

impl From<Event> for RawChange {
    fn from(event: Event) -> Self {
        RawChange {
            kind: format!("{:?}", event.kind),
            paths: event.paths,
            received_at: Utc::now(),
        }
    }
}

/// Emitted once per burst of raw changes under `root`.
#[derive(Debug, Clone)]
pub struct ChangeSignal {
    pub root: PathBuf,
    pub last_change: Option<RawChange>,
}

/// Turns bursts of raw changes into single signals.
#[derive(Clone)]
pub struct Debouncer {
    pending: Arc<watch::Sender<Option<RawChange>>>,
}

impl Debouncer {
    /// Start the debounce task. It stops once every clone of the debouncer is gone
    /// or the signal receiver is dropped.
    pub fn spawn(root: PathBuf, quiet: Duration, signals: mpsc::Sender<ChangeSignal>) -> Debouncer {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(debounce(root, quiet, rx, signals));
        Debouncer {
            pending: Arc::new(tx),
        }
    }

    pub fn push(&self, change: RawChange) {
        self.pending.send_replace(Some(change));
    }
}

async fn debounce(
    root: PathBuf,
    quiet: Duration,
    mut pending: watch::Receiver<Option<RawChange>>,
    signals: mpsc::Sender<ChangeSignal>,
) {
    // idle: wait for the first event of a burst
    while pending.changed().await.is_ok() {
        // pending: restart the quiet period on every new event
        loop {
            let deadline = Instant::now() + quiet;
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                changed = pending.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        let last_change = pending.borrow_and_update().clone();
        if let Some(change) = &last_change {
            tracing::debug!(
                "Changes under {} settled, last was {} on {:?}",
                root.display(),
                change.kind,
                change.paths
            );
        }
        let signal = ChangeSignal {
            root: root.clone(),
            last_change,
        };
        if signals.send(signal).await.is_err() {
            return;
        }
    }
}

/// Shared on/off switch for notification delivery. Turning it off drops raw
/// events on the floor without tearing the watchers down.
#[derive(Debug, Clone)]
pub struct WatchSwitch(Arc<AtomicBool>);

impl WatchSwitch {
    pub fn new(enabled: bool) -> WatchSwitch {
        WatchSwitch(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for WatchSwitch {
    fn default() -> Self {
        WatchSwitch::new(true)
    }
}

/// A native watcher on one directory feeding a Debouncer.
///
/// Errors reported by the native watcher are logged; the watcher is not
/// recreated. Dropping the ChangeWatcher stops both the native watcher and the
/// debounce task.
pub struct ChangeWatcher {
    switch: WatchSwitch,
    _watcher: RecommendedWatcher,
}

impl ChangeWatcher {
    pub fn new(
        path: &Path,
        mode: RecursiveMode,
        quiet: Duration,
        switch: WatchSwitch,
        signals: mpsc::Sender<ChangeSignal>,
    ) -> Result<ChangeWatcher> {
        let debouncer = Debouncer::spawn(path.to_path_buf(), quiet, signals);
        let event_switch = switch.clone();
        let root = path.to_path_buf();

        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    if !event_switch.is_enabled() {
                        return;
                    }
                    // Reads of served files must not look like changes.
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    debouncer.push(RawChange::from(event));
                }
                Err(e) => {
                    tracing::error!("Change watcher for {} reported an error: {}", root.display(), e);
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(path, mode)?;
        tracing::info!("Watching {} for changes", path.display());

        Ok(ChangeWatcher {
            switch,
            _watcher: watcher,
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.switch.set_enabled(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.switch.is_enabled()
    }
}
