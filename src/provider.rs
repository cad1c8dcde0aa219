use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::instrument;
use uuid::Uuid;

use crate::errors::Result;
use crate::settings::{Settings, SettingsHandle};
use crate::vfs::{BuildOptions, SnapshotBuilder, VirtualFileSystemRoot};

/// Where snapshots come from. The service always reads the disk; tests swap in
/// their own sources.
pub trait SnapshotSource: Send + Sync + 'static {
    fn build(&self, settings: &Settings) -> VirtualFileSystemRoot;
}

pub struct DiskSource;

impl SnapshotSource for DiskSource {
    fn build(&self, settings: &Settings) -> VirtualFileSystemRoot {
        SnapshotBuilder::new(BuildOptions::from_settings(settings)).build(&settings.served_directories)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    Initial,
    SettingsChanged,
    FileSystemChanged,
    Periodic,
    Forced,
}

impl fmt::Display for RefreshReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            RefreshReason::Initial => "initial",
            RefreshReason::SettingsChanged => "settings changed",
            RefreshReason::FileSystemChanged => "file system changed",
            RefreshReason::Periodic => "periodic",
            RefreshReason::Forced => "forced",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Published(Uuid),
    /// Another rebuild was already running; this request was folded into it.
    Coalesced,
}

/// Clears the in-flight flag however the rebuild ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the published snapshot.
///
/// Readers take a cheap `Arc` clone of the current tree and keep using it for as
/// long as they like. A refresh builds a new tree on a blocking worker and then
/// replaces the reference in one step, so nobody ever sees a half-built tree.
pub struct SnapshotProvider {
    current: RwLock<Arc<VirtualFileSystemRoot>>,
    settings: SettingsHandle,
    source: Arc<dyn SnapshotSource>,
    refreshing: AtomicBool,
    /// Set by every refresh request, cleared by the rebuild that serves it.
    pending: AtomicBool,
}

impl SnapshotProvider {
    /// Build the first snapshot from disk. The provider only exists once a tree
    /// is ready to be served.
    pub async fn initialize(settings: SettingsHandle) -> Result<Arc<SnapshotProvider>> {
        SnapshotProvider::with_source(settings, Arc::new(DiskSource)).await
    }

    pub async fn with_source(
        settings: SettingsHandle,
        source: Arc<dyn SnapshotSource>,
    ) -> Result<Arc<SnapshotProvider>> {
        let tree = build_off_thread(source.clone(), settings.current()).await?;
        tracing::info!(
            "Snapshot {} ready ({})",
            tree.generation(),
            RefreshReason::Initial
        );
        Ok(Arc::new(SnapshotProvider {
            current: RwLock::new(Arc::new(tree)),
            settings,
            source,
            refreshing: AtomicBool::new(false),
            pending: AtomicBool::new(false),
        }))
    }

    pub fn current(&self) -> Arc<VirtualFileSystemRoot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// Rebuild and publish a new snapshot.
    ///
    /// If a rebuild is already running the call returns straight away with
    /// `Coalesced`, and the running rebuild goes around once more so the request
    /// is served with the settings and disk state that followed it. On failure
    /// the previous snapshot stays published.
    #[instrument(name = "provider.refresh", level = "info", skip(self, reason), fields(reason = %reason))]
    pub async fn refresh(&self, reason: RefreshReason) -> Result<RefreshOutcome> {
        // Record the request before trying to become the rebuilder. The rebuilder
        // checks for requests again after stepping down.
        self.pending.store(true, Ordering::SeqCst);
        let mut outcome = None;
        while self.pending.load(Ordering::SeqCst)
            && self
                .refreshing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let _in_flight = InFlight(&self.refreshing);
            while self.pending.swap(false, Ordering::SeqCst) {
                if outcome.is_some() {
                    tracing::info!("Refresh requested during rebuild, rebuilding again");
                }
                outcome = Some(self.rebuild(reason).await);
            }
        }
        match outcome {
            Some(outcome) => outcome,
            None => {
                tracing::debug!("Rebuild already in flight, folding {} refresh into it", reason);
                Ok(RefreshOutcome::Coalesced)
            }
        }
    }

    async fn rebuild(&self, reason: RefreshReason) -> Result<RefreshOutcome> {
        let tree = match build_off_thread(self.source.clone(), self.settings.current()).await {
            Ok(tree) => tree,
            Err(e) => {
                tracing::error!(
                    "Rebuild ({}) failed, keeping snapshot {}: {}",
                    reason,
                    self.current().generation(),
                    e
                );
                return Err(e);
            }
        };
        let generation = tree.generation();
        self.publish(tree);
        Ok(RefreshOutcome::Published(generation))
    }

    fn publish(&self, tree: VirtualFileSystemRoot) {
        let tree = Arc::new(tree);
        let previous = {
            let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *guard, tree.clone())
        };
        tracing::info!(
            "Published snapshot {} ({} items), replacing {}",
            tree.generation(),
            tree.len(),
            previous.generation()
        );
    }
}

async fn build_off_thread(
    source: Arc<dyn SnapshotSource>,
    settings: Settings,
) -> Result<VirtualFileSystemRoot> {
    let tree = tokio::task::spawn_blocking(move || source.build(&settings)).await?;
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MirrorErrorType;
    use crate::vfs::resolve;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn settings_for(dir: &std::path::Path) -> SettingsHandle {
        SettingsHandle::new(Settings {
            served_directories: vec![dir.to_path_buf()],
            exclude_empty_directories: false,
            ..Settings::default()
        })
    }

    #[tokio::test]
    async fn old_readers_keep_their_tree_after_refresh() {
        let tmp = TempDir::new().unwrap();
        let served = tmp.path().join("games");
        std::fs::create_dir_all(&served).unwrap();
        std::fs::write(served.join("old.nsp"), b"old").unwrap();

        let provider = SnapshotProvider::initialize(settings_for(&served)).await.unwrap();
        let held = provider.current();
        let held_generation = held.generation();

        std::fs::remove_file(served.join("old.nsp")).unwrap();
        std::fs::write(served.join("new.nsp"), b"new").unwrap();
        let outcome = provider.refresh(RefreshReason::FileSystemChanged).await.unwrap();

        assert_eq!(held.generation(), held_generation);
        assert!(resolve(&held, "/games/old.nsp").is_some());
        assert!(resolve(&held, "/games/new.nsp").is_none());

        let fresh = provider.current();
        assert_eq!(outcome, RefreshOutcome::Published(fresh.generation()));
        assert_ne!(fresh.generation(), held_generation);
        assert!(resolve(&fresh, "/games/new.nsp").is_some());
        assert!(resolve(&fresh, "/games/old.nsp").is_none());
    }

    #[tokio::test]
    async fn settings_are_read_at_refresh_time() {
        let tmp = TempDir::new().unwrap();
        let served = tmp.path().join("games");
        std::fs::create_dir_all(served.join("sub")).unwrap();
        std::fs::write(served.join("sub/a.nsp"), b"a").unwrap();

        let settings = settings_for(&served);
        let provider = SnapshotProvider::initialize(settings.clone()).await.unwrap();
        assert!(resolve(&provider.current(), "/games/sub/a.nsp").is_some());

        settings.update(Settings {
            flatten: true,
            ..settings.current()
        });
        provider.refresh(RefreshReason::SettingsChanged).await.unwrap();
        assert!(resolve(&provider.current(), "/a.nsp").is_some());
    }

    struct FailingSource {
        calls: AtomicUsize,
    }

    impl SnapshotSource for FailingSource {
        fn build(&self, _settings: &Settings) -> VirtualFileSystemRoot {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                panic!("disk went away");
            }
            VirtualFileSystemRoot::empty()
        }
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_previous_tree() {
        let source = Arc::new(FailingSource {
            calls: AtomicUsize::new(0),
        });
        let provider =
            SnapshotProvider::with_source(SettingsHandle::new(Settings::default()), source)
                .await
                .unwrap();
        let before = provider.current().generation();

        let err = provider.refresh(RefreshReason::Periodic).await.unwrap_err();
        assert_eq!(err.error_type, MirrorErrorType::InternalError);
        assert_eq!(provider.current().generation(), before);
        assert!(!provider.is_refreshing());
    }

    /// Records the `flatten` setting each build saw and holds the second build
    /// (the first refresh after startup) until released.
    struct GatedSource {
        release: Mutex<std::sync::mpsc::Receiver<()>>,
        seen_flatten: Mutex<Vec<bool>>,
    }

    impl GatedSource {
        fn new(release: std::sync::mpsc::Receiver<()>) -> Arc<GatedSource> {
            Arc::new(GatedSource {
                release: Mutex::new(release),
                seen_flatten: Mutex::new(Vec::new()),
            })
        }

        fn seen_flatten(&self) -> Vec<bool> {
            self.seen_flatten.lock().unwrap().clone()
        }
    }

    impl SnapshotSource for GatedSource {
        fn build(&self, settings: &Settings) -> VirtualFileSystemRoot {
            let build = {
                let mut seen = self.seen_flatten.lock().unwrap();
                seen.push(settings.flatten);
                seen.len()
            };
            if build == 2 {
                let release = self.release.lock().unwrap();
                let _ = release.recv_timeout(Duration::from_secs(5));
            }
            VirtualFileSystemRoot::empty()
        }
    }

    async fn start_blocked_refresh(
        provider: &Arc<SnapshotProvider>,
    ) -> tokio::task::JoinHandle<Result<RefreshOutcome>> {
        let first = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.refresh(RefreshReason::Periodic).await })
        };
        while !provider.is_refreshing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        first
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_refreshes_are_coalesced() {
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let source = GatedSource::new(release_rx);
        let provider = SnapshotProvider::with_source(
            SettingsHandle::new(Settings::default()),
            source.clone(),
        )
        .await
        .unwrap();

        let first = start_blocked_refresh(&provider).await;
        let second = provider.refresh(RefreshReason::Forced).await.unwrap();
        let third = provider.refresh(RefreshReason::Forced).await.unwrap();
        assert_eq!(second, RefreshOutcome::Coalesced);
        assert_eq!(third, RefreshOutcome::Coalesced);

        release_tx.send(()).unwrap();
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, RefreshOutcome::Published(_)));
        // startup, the blocked rebuild, and one more for both folded requests
        assert_eq!(source.seen_flatten().len(), 3);
        assert!(!provider.is_refreshing());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn settings_changed_during_rebuild_are_published() {
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let source = GatedSource::new(release_rx);
        let settings = SettingsHandle::new(Settings::default());
        let provider = SnapshotProvider::with_source(settings.clone(), source.clone())
            .await
            .unwrap();

        let first = start_blocked_refresh(&provider).await;
        settings.update(Settings {
            flatten: true,
            ..settings.current()
        });
        let second = provider.refresh(RefreshReason::SettingsChanged).await.unwrap();
        assert_eq!(second, RefreshOutcome::Coalesced);

        release_tx.send(()).unwrap();
        let first = first.await.unwrap().unwrap();
        assert_eq!(source.seen_flatten(), vec![false, false, true]);
        assert_eq!(
            first,
            RefreshOutcome::Published(provider.current().generation())
        );
    }
}
