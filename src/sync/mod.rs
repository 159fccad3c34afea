//! Virtual file synchronization between the flat files map and the sandbox.
//!
//! Every write the runtime performs makes the sandbox watch report the same
//! path back. To keep those echoes from looping into the editor, the
//! synchronizer arms one ignore credit per path *before* each operation and
//! spends it on the next change notification for that path. Notifications
//! that find no credit are genuine external changes (a build tool rewriting a
//! file, a process generating one) and are forwarded to subscribers.

pub mod tree;

pub use tree::{normalize_path, to_tree, FileNode, FileTree, FilesMap};

use crate::error::{PlaygroundError, Result};
use crate::events::{Observers, Subscription};
use crate::sandbox::{Connection, FsEvent, SandboxManager, DEPENDENCY_DIR};
use dashmap::DashMap;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOptions {
    /// Remove existing top-level entries (except the dependency directory)
    /// before mounting.
    pub clean: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self { clean: true }
    }
}

pub struct FileSynchronizer {
    manager: Arc<SandboxManager>,
    credits: DashMap<String, u32>,
    external: Observers<FsEvent>,
    resync: Observers<u64>,
}

impl FileSynchronizer {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        Self {
            manager,
            credits: DashMap::new(),
            external: Observers::new(),
            resync: Observers::new(),
        }
    }

    /// Route the manager's change notifications through [`Self::handle_change`]
    /// and its lag notices through [`Self::handle_lag`].
    ///
    /// The subscription holds a weak reference, so the synchronizer can be
    /// dropped while attached.
    pub fn attach(self: &Arc<Self>) -> Subscription {
        let weak: Weak<Self> = Arc::downgrade(self);
        let changes = self.manager.on_file_change(move |event| {
            if let Some(sync) = weak.upgrade() {
                sync.handle_change(event);
            }
        });
        let weak: Weak<Self> = Arc::downgrade(self);
        let lags = self.manager.on_resync(move |skipped| {
            if let Some(sync) = weak.upgrade() {
                sync.handle_lag(*skipped);
            }
        });
        Subscription::from_fn(move || {
            changes.unsubscribe();
            lags.unsubscribe();
        })
    }

    /// Subscribe to resyncs: the watch dropped events, so subscribers should
    /// re-read whatever they track instead of waiting for notifications.
    pub fn on_resync<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&u64) + Send + Sync + 'static,
    {
        self.resync.subscribe(callback)
    }

    /// The watch dropped `skipped` notifications. Echoes that never arrive
    /// would keep their credits armed and swallow the next genuine change,
    /// so every credit is dropped.
    pub fn handle_lag(&self, skipped: u64) {
        let armed = self.credits.len();
        self.clear_credits();
        tracing::warn!(skipped, armed, "Watch lagged; ignore credits cleared");
        self.resync.emit(&skipped);
    }

    /// Subscribe to changes that did not originate from this synchronizer.
    pub fn on_external_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&FsEvent) + Send + Sync + 'static,
    {
        self.external.subscribe(callback)
    }

    /// Filter one notification. Returns `true` when it was forwarded.
    pub fn handle_change(&self, event: &FsEvent) -> bool {
        let path = normalize_path(&event.path);

        let swallowed = match self.credits.get_mut(&path) {
            Some(mut credit) if *credit > 0 => {
                *credit -= 1;
                true
            }
            _ => false,
        };
        self.credits.remove_if(&path, |_, credit| *credit == 0);

        if swallowed {
            tracing::trace!(path = %path, kind = ?event.kind, "Swallowed self-inflicted change");
            false
        } else {
            tracing::debug!(path = %path, kind = ?event.kind, "External file change");
            self.external.emit(event);
            true
        }
    }

    /// Ignore credits currently armed for `path`.
    pub fn pending_credits(&self, path: &str) -> u32 {
        self.credits
            .get(&normalize_path(path))
            .map_or(0, |credit| *credit)
    }

    pub fn clear_credits(&self) {
        self.credits.clear();
    }

    /// Mount a files map into the sandbox working directory.
    pub async fn mount(&self, files: &FilesMap, options: MountOptions) -> Result<()> {
        let connection = self.manager.get()?;

        if options.clean {
            self.clean(connection.as_ref()).await?;
        }

        let tree = to_tree(files);
        for path in files.keys() {
            self.arm(path);
        }

        if let Err(e) = connection.mount(&tree).await {
            for path in files.keys() {
                self.disarm(path);
            }
            return Err(PlaygroundError::MountFailure(format!("{e:#}")));
        }

        tracing::info!(files = tree.file_count(), clean = options.clean, "Mounted files");
        Ok(())
    }

    /// Write one file, creating missing parent directories.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let connection = self.manager.get()?;
        let path = normalize_path(path);

        self.arm(&path);
        if let Err(e) = connection.write_file(&path, content).await {
            self.disarm(&path);
            return Err(PlaygroundError::sandbox(&e.context(format!("write {path}"))));
        }
        tracing::debug!(path = %path, bytes = content.len(), "Wrote file to sandbox");
        Ok(())
    }

    /// Delete a file or directory. A missing path is a soft failure:
    /// logged and reported as `Ok(false)`.
    pub async fn delete_file(&self, path: &str) -> Result<bool> {
        let connection = self.manager.get()?;
        let path = normalize_path(path);

        self.arm(&path);
        match connection.rm(&path, true).await {
            Ok(()) => {
                tracing::debug!(path = %path, "Deleted file from sandbox");
                Ok(true)
            }
            Err(e) => {
                self.disarm(&path);
                tracing::debug!(path = %path, error = %e, "Delete skipped");
                Ok(false)
            }
        }
    }

    /// Delete several paths; soft failures never abort the batch. Returns how
    /// many were removed.
    pub async fn delete_files<I, S>(&self, paths: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut removed = 0;
        for path in paths {
            if self.delete_file(path.as_ref()).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        let connection = self.manager.get()?;
        let path = normalize_path(path);
        connection
            .read_file(&path)
            .await
            .map_err(|_| PlaygroundError::FileNotFound(path))
    }

    async fn clean(&self, connection: &dyn Connection) -> Result<()> {
        let entries = connection
            .read_dir("/")
            .await
            .map_err(|e| PlaygroundError::MountFailure(format!("list workdir: {e:#}")))?;

        for name in entries {
            if name == DEPENDENCY_DIR {
                continue;
            }
            let path = format!("/{name}");
            self.arm(&path);
            if let Err(e) = connection.rm(&path, true).await {
                self.disarm(&path);
                return Err(PlaygroundError::MountFailure(format!(
                    "remove {path}: {e:#}"
                )));
            }
        }
        Ok(())
    }

    fn arm(&self, path: &str) {
        *self.credits.entry(normalize_path(path)).or_insert(0) += 1;
    }

    fn disarm(&self, path: &str) {
        let path = normalize_path(path);
        if let Some(mut credit) = self.credits.get_mut(&path) {
            *credit = credit.saturating_sub(1);
        }
        self.credits.remove_if(&path, |_, credit| *credit == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::memory::MemorySandbox;
    use crate::sandbox::{BootOptions, FsEventKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn setup() -> (MemorySandbox, Arc<SandboxManager>, Arc<FileSynchronizer>) {
        let sandbox = MemorySandbox::new();
        let manager = Arc::new(SandboxManager::new(Arc::new(sandbox.clone())));
        manager.connect(&BootOptions::default()).await.unwrap();
        let sync = Arc::new(FileSynchronizer::new(Arc::clone(&manager)));
        (sandbox, manager, sync)
    }

    fn counter(sync: &FileSynchronizer) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let sub = sync.on_external_change(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, sub)
    }

    #[tokio::test]
    async fn echo_of_own_write_is_swallowed() {
        let (_sandbox, _manager, sync) = setup().await;
        let (count, _sub) = counter(&sync);

        sync.write_file("/a.txt", "v").await.unwrap();
        assert_eq!(sync.pending_credits("/a.txt"), 1);

        let forwarded = sync.handle_change(&FsEvent::new("/a.txt", FsEventKind::Modified));
        assert!(!forwarded);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(sync.pending_credits("/a.txt"), 0);
    }

    #[tokio::test]
    async fn change_without_credit_is_forwarded() {
        let (_sandbox, _manager, sync) = setup().await;
        let (count, _sub) = counter(&sync);

        assert!(sync.handle_change(&FsEvent::new("/a.txt", FsEventKind::Modified)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attached_sync_filters_real_watch_events() {
        let (sandbox, _manager, sync) = setup().await;
        let _attached = sync.attach();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = sync.on_external_change(move |event| {
            let _ = tx.send(event.path.clone());
        });

        sync.write_file("/own.txt", "mine").await.unwrap();
        sandbox
            .connection()
            .unwrap()
            .external_write("/generated.txt", "theirs");

        let path = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path, "/generated.txt");
        assert_eq!(sync.pending_credits("/own.txt"), 0);
    }

    #[tokio::test]
    async fn lagged_watch_drops_stale_credits() {
        let (sandbox, _manager, sync) = setup().await;
        let _attached = sync.attach();
        let (count, _sub) = counter(&sync);
        let resyncs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&resyncs);
        let _resync = sync.on_resync(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let files: FilesMap = (0..1100)
            .map(|i| (format!("/f{i:04}.js"), i.to_string()))
            .collect();
        sync.mount(&files, MountOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(resyncs.load(Ordering::SeqCst), 1);
        assert_eq!(sync.pending_credits("/f0000.js"), 0);

        let before = count.load(Ordering::SeqCst);
        sandbox
            .connection()
            .unwrap()
            .external_write("/f0000.js", "rewritten by a tool");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), before + 1);
    }

    #[tokio::test]
    async fn clean_mount_keeps_dependency_dir() {
        let (sandbox, manager, sync) = setup().await;
        let connection = manager.get().unwrap();
        connection
            .write_file("/node_modules/react/index.js", "lib")
            .await
            .unwrap();
        connection.write_file("/stale.js", "old").await.unwrap();

        let files = FilesMap::from([
            ("/index.js".to_string(), "new".to_string()),
            ("/src/app.js".to_string(), "app".to_string()),
        ]);
        sync.mount(&files, MountOptions::default()).await.unwrap();

        let mounted = sandbox.connection().unwrap().files();
        assert!(mounted.contains_key("/node_modules/react/index.js"));
        assert!(!mounted.contains_key("/stale.js"));
        assert_eq!(mounted.get("/src/app.js").map(String::as_str), Some("app"));
        assert_eq!(sync.pending_credits("/index.js"), 1);
        assert_eq!(sync.pending_credits("/stale.js"), 1);
    }

    #[tokio::test]
    async fn mount_without_clean_merges() {
        let (sandbox, manager, sync) = setup().await;
        manager
            .get()
            .unwrap()
            .write_file("/keep.js", "k")
            .await
            .unwrap();

        let files = FilesMap::from([("/index.js".to_string(), "i".to_string())]);
        sync.mount(&files, MountOptions { clean: false }).await.unwrap();

        let mounted = sandbox.connection().unwrap().files();
        assert!(mounted.contains_key("/keep.js"));
        assert!(mounted.contains_key("/index.js"));
    }

    #[tokio::test]
    async fn deleting_missing_file_is_soft() {
        let (_sandbox, _manager, sync) = setup().await;
        sync.write_file("/a.txt", "1").await.unwrap();

        let removed = sync.delete_files(["/missing.txt", "/a.txt"]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(sync.pending_credits("/missing.txt"), 0);
    }

    #[tokio::test]
    async fn write_creates_parent_directories() {
        let (sandbox, _manager, sync) = setup().await;
        sync.write_file("/deep/nested/file.txt", "x").await.unwrap();
        assert_eq!(sync.read_file("/deep/nested/file.txt").await.unwrap(), "x");
        assert!(sandbox
            .connection()
            .unwrap()
            .files()
            .contains_key("/deep/nested/file.txt"));
    }

    #[tokio::test]
    async fn operations_before_boot_fail_with_not_booted() {
        let manager = Arc::new(SandboxManager::new(Arc::new(MemorySandbox::new())));
        let sync = FileSynchronizer::new(manager);
        assert!(matches!(
            sync.write_file("/a.txt", "x").await,
            Err(PlaygroundError::NotBooted)
        ));
    }
}
