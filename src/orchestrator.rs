// Decides when the snapshot gets rebuilt.
//
// Each trigger runs as its own task: relevant settings changes, debounced
// filesystem signals, the periodic timer and the forced timer. Timers sleep,
// await their refresh, and only then sleep again, so one timer never stacks
// rebuilds on top of itself. Triggers that race each other are folded together
// by SnapshotProvider::refresh.

use notify::RecursiveMode;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::provider::{RefreshOutcome, RefreshReason, SnapshotProvider};
use crate::settings::{Settings, SettingsHandle};
use crate::watcher::{ChangeSignal, ChangeWatcher, WatchSwitch};

const SIGNAL_QUEUE: usize = 16;

pub struct RefreshOrchestrator {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RefreshOrchestrator {
    /// Spawn the refresh tasks. When `settings_file` is given it is watched as
    /// well and reloaded into `settings` whenever it changes.
    pub fn start(
        provider: Arc<SnapshotProvider>,
        settings: SettingsHandle,
        settings_file: Option<PathBuf>,
    ) -> RefreshOrchestrator {
        let shutdown = CancellationToken::new();
        let switch = WatchSwitch::default();
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE);

        let mut tasks = vec![
            tokio::spawn(follow_settings(
                provider.clone(),
                settings.subscribe(),
                switch,
                signal_tx,
                shutdown.clone(),
            )),
            tokio::spawn(follow_changes(
                provider.clone(),
                settings.clone(),
                signal_rx,
                shutdown.clone(),
            )),
            tokio::spawn(run_timer(
                provider.clone(),
                settings.subscribe(),
                RefreshReason::Periodic,
                shutdown.clone(),
            )),
            tokio::spawn(run_timer(
                provider,
                settings.subscribe(),
                RefreshReason::Forced,
                shutdown.clone(),
            )),
        ];
        if let Some(path) = settings_file {
            tasks.push(tokio::spawn(follow_settings_file(
                path,
                settings,
                shutdown.clone(),
            )));
        }

        RefreshOrchestrator { shutdown, tasks }
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Refresh task ended abnormally: {}", e);
            }
        }
        tracing::info!("Refresh orchestrator stopped");
    }
}

async fn refresh(provider: &SnapshotProvider, reason: RefreshReason) {
    match provider.refresh(reason).await {
        Ok(RefreshOutcome::Published(generation)) => {
            tracing::info!("Refresh ({}) published snapshot {}", reason, generation)
        }
        Ok(RefreshOutcome::Coalesced) => {
            tracing::debug!("Refresh ({}) folded into a running rebuild", reason)
        }
        Err(e) => tracing::error!("Refresh ({}) failed: {}", reason, e),
    }
}

fn create_watchers(
    settings: &Settings,
    switch: &WatchSwitch,
    signals: &mpsc::Sender<ChangeSignal>,
) -> Vec<ChangeWatcher> {
    if !settings.auto_detect_changes {
        return Vec::new();
    }
    let mut watchers = Vec::new();
    for dir in &settings.served_directories {
        match ChangeWatcher::new(
            dir,
            RecursiveMode::Recursive,
            settings.watch_debounce(),
            switch.clone(),
            signals.clone(),
        ) {
            Ok(watcher) => watchers.push(watcher),
            Err(e) => tracing::error!("Cannot watch {}: {}", dir.display(), e),
        }
    }
    watchers
}

async fn follow_settings(
    provider: Arc<SnapshotProvider>,
    mut settings: watch::Receiver<Settings>,
    switch: WatchSwitch,
    signals: mpsc::Sender<ChangeSignal>,
    shutdown: CancellationToken,
) {
    let initial = settings.borrow_and_update().clone();
    let mut snapshot_key = initial.snapshot_key();
    let mut watch_key = initial.watch_key();
    let mut watchers = create_watchers(&initial, &switch, &signals);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = settings.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let current = settings.borrow_and_update().clone();

        if current.watch_key() != watch_key {
            watch_key = current.watch_key();
            // Old watchers go first so their debounce tasks stop with them.
            watchers.clear();
            watchers.extend(create_watchers(&current, &switch, &signals));
            tracing::info!("Now watching {} served directories", watchers.len());
        }
        if current.snapshot_key() != snapshot_key {
            snapshot_key = current.snapshot_key();
            refresh(&provider, RefreshReason::SettingsChanged).await;
        }
    }
}

async fn follow_changes(
    provider: Arc<SnapshotProvider>,
    settings: SettingsHandle,
    mut signals: mpsc::Receiver<ChangeSignal>,
    shutdown: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            _ = shutdown.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        if !settings.current().auto_detect_changes {
            continue;
        }
        tracing::info!("Detected changes under {}", signal.root.display());
        refresh(&provider, RefreshReason::FileSystemChanged).await;
    }
}

fn timer_interval(settings: &Settings, reason: RefreshReason) -> Option<Duration> {
    match reason {
        RefreshReason::Forced => settings.forced_refresh_interval(),
        _ => settings.refresh_interval(),
    }
}

async fn run_timer(
    provider: Arc<SnapshotProvider>,
    mut settings: watch::Receiver<Settings>,
    reason: RefreshReason,
    shutdown: CancellationToken,
) {
    let mut interval = timer_interval(&settings.borrow_and_update(), reason);
    let mut deadline = interval.map(|interval| Instant::now() + interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = settings.changed() => {
                if changed.is_err() {
                    break;
                }
                // Only a new interval re-arms the timer.
                let next = timer_interval(&settings.borrow_and_update(), reason);
                if next != interval {
                    interval = next;
                    deadline = interval.map(|interval| Instant::now() + interval);
                }
            }
            _ = wait_until(deadline) => {
                refresh(&provider, reason).await;
                deadline = interval.map(|interval| Instant::now() + interval);
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn follow_settings_file(path: PathBuf, settings: SettingsHandle, shutdown: CancellationToken) {
    let Some(dir) = path.parent().filter(|d| d.is_dir()).map(Path::to_path_buf) else {
        tracing::warn!(
            "Settings directory for {} does not exist, not watching it",
            path.display()
        );
        return;
    };
    let (tx, mut rx) = mpsc::channel(SIGNAL_QUEUE);
    let _watcher = match ChangeWatcher::new(
        &dir,
        RecursiveMode::NonRecursive,
        settings.current().watch_debounce(),
        WatchSwitch::default(),
        tx,
    ) {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::error!("Cannot watch settings file {}: {}", path.display(), e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            signal = rx.recv() => {
                if signal.is_none() {
                    break;
                }
            }
        }
        match Settings::load(&path) {
            Ok(reloaded) => {
                if settings.update(reloaded) {
                    tracing::info!("Reloaded settings from {}", path.display());
                }
            }
            Err(e) => tracing::warn!(
                "Ignoring unreadable settings file {}: {}",
                path.display(),
                e
            ),
        }
    }
}
