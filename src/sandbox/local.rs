//! Local sandbox provider: a working directory on the host.
//!
//! Each boot creates a fresh directory under the configured root and runs
//! processes there through `tokio::process`. Filesystem operations issued
//! through the connection emit one watch event each; a polling watcher picks
//! up everything else (files written by spawned processes). Preview URLs are
//! `http://localhost:{port}`, detected by probing the preview ports after a
//! spawn.

use super::{
    BootOptions, Connection, FsEvent, FsEventKind, OutputChunk, ProcessHandle, SandboxProcess,
    SandboxProvider, ServerReady, StreamKind, EVENT_CAPACITY, OUTPUT_CAPACITY,
};
use crate::sync::tree::{normalize_path, split_path};
use crate::sync::FileTree;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use walkdir::WalkDir;

/// Directories the poller never descends into.
const SKIP_DIRS: &[&str] = &["node_modules", ".next", ".git", "dist", "build", ".cache"];

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const PROBE_INTERVAL: Duration = Duration::from_millis(250);
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const READ_CHUNK: usize = 4096;

pub struct LocalSandbox {
    root: PathBuf,
    poll_interval: Duration,
}

impl LocalSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(10));
        self
    }
}

#[async_trait]
impl SandboxProvider for LocalSandbox {
    async fn boot(&self, options: &BootOptions) -> anyhow::Result<Arc<dyn Connection>> {
        let dir = self
            .root
            .join(format!("{}-{}", options.workdir, uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create sandbox dir {}", dir.display()))?;
        let dir = dir.canonicalize().unwrap_or(dir);

        tracing::info!(dir = %dir.display(), ports = ?options.preview_ports, "Local sandbox created");
        Ok(Arc::new(LocalConnection::new(
            options,
            dir,
            self.poll_interval,
        )))
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// Last known modification times, keyed by sandbox path.
#[derive(Default)]
struct Snapshot {
    /// Bumped by every connection-issued operation; a poll that raced one is
    /// discarded.
    version: u64,
    files: HashMap<String, SystemTime>,
}

pub struct LocalConnection {
    workdir: String,
    dir: PathBuf,
    preview_ports: Mutex<Vec<u16>>,
    fs_events: broadcast::Sender<FsEvent>,
    ready_events: broadcast::Sender<ServerReady>,
    snapshot: Arc<Mutex<Snapshot>>,
    poller: JoinHandle<()>,
}

impl LocalConnection {
    fn new(options: &BootOptions, dir: PathBuf, poll_interval: Duration) -> Self {
        let (fs_events, _) = broadcast::channel(EVENT_CAPACITY);
        let (ready_events, _) = broadcast::channel(EVENT_CAPACITY);
        let snapshot = Arc::new(Mutex::new(Snapshot::default()));
        let poller = tokio::spawn(poll(
            dir.clone(),
            poll_interval,
            Arc::clone(&snapshot),
            fs_events.clone(),
        ));
        Self {
            workdir: options.workdir.clone(),
            dir,
            preview_ports: Mutex::new(options.preview_ports.clone()),
            fs_events,
            ready_events,
            snapshot,
            poller,
        }
    }

    /// Host directory backing this connection.
    pub fn host_dir(&self) -> &Path {
        &self.dir
    }

    fn host_path(&self, path: &str) -> anyhow::Result<PathBuf> {
        let mut host = self.dir.clone();
        for segment in split_path(path) {
            anyhow::ensure!(segment != "..", "path escapes the sandbox: {path}");
            host.push(segment);
        }
        Ok(host)
    }

    /// Record a connection-issued change and emit its event.
    fn record(&self, path: &str, kind: FsEventKind, mtime: Option<SystemTime>) {
        {
            let mut snapshot = self.snapshot.lock();
            snapshot.version += 1;
            match (kind, mtime) {
                (FsEventKind::Removed, _) => {
                    let prefix = format!("{path}/");
                    snapshot
                        .files
                        .retain(|p, _| p != path && !p.starts_with(&prefix));
                }
                (_, Some(mtime)) => {
                    snapshot.files.insert(path.to_string(), mtime);
                }
                (_, None) => {}
            }
        }
        let _ = self.fs_events.send(FsEvent::new(path, kind));
    }

    async fn write(&self, path: &str, content: &str) -> anyhow::Result<()> {
        let path = normalize_path(path);
        let host = self.host_path(&path)?;
        if let Some(parent) = host.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create parent of {path}"))?;
        }
        let existed = tokio::fs::try_exists(&host).await.unwrap_or(false);
        tokio::fs::write(&host, content)
            .await
            .with_context(|| format!("write {path}"))?;
        let mtime = tokio::fs::metadata(&host)
            .await
            .and_then(|meta| meta.modified())
            .ok();

        let kind = if existed {
            FsEventKind::Modified
        } else {
            FsEventKind::Created
        };
        self.record(&path, kind, mtime);
        Ok(())
    }

    fn spawn_probe(&self, shared: Arc<ProcessShared>) {
        let ports = self.preview_ports.lock().clone();
        if ports.is_empty() {
            return;
        }
        let ready_events = self.ready_events.clone();
        tokio::spawn(async move {
            while !shared.finished() {
                for &port in &ports {
                    let connect = TcpStream::connect(("127.0.0.1", port));
                    if let Ok(Ok(_)) = tokio::time::timeout(PROBE_CONNECT_TIMEOUT, connect).await {
                        tracing::debug!(port, "Preview port accepting connections");
                        let _ = ready_events.send(ServerReady {
                            port,
                            url: format!("http://localhost:{port}"),
                        });
                        return;
                    }
                }
                tokio::time::sleep(PROBE_INTERVAL).await;
            }
        });
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.poller.abort();
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            tracing::debug!(dir = %self.dir.display(), error = %e, "Sandbox dir not removed");
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn workdir(&self) -> &str {
        &self.workdir
    }

    async fn mount(&self, tree: &FileTree) -> anyhow::Result<()> {
        for (path, content) in tree.flatten() {
            self.write(&path, &content).await?;
        }
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        self.write(path, content).await
    }

    async fn read_file(&self, path: &str) -> anyhow::Result<String> {
        let host = self.host_path(path)?;
        tokio::fs::read_to_string(&host)
            .await
            .with_context(|| format!("read {}", normalize_path(path)))
    }

    async fn read_dir(&self, path: &str) -> anyhow::Result<Vec<String>> {
        let host = self.host_path(path)?;
        let mut entries = tokio::fs::read_dir(&host)
            .await
            .with_context(|| format!("read dir {}", normalize_path(path)))?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn rm(&self, path: &str, recursive: bool) -> anyhow::Result<()> {
        let path = normalize_path(path);
        anyhow::ensure!(path != "/", "refusing to remove the working directory");
        let host = self.host_path(&path)?;
        let meta = tokio::fs::symlink_metadata(&host)
            .await
            .with_context(|| format!("no such file or directory {path}"))?;

        let removed = if meta.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&host).await
            } else {
                tokio::fs::remove_dir(&host).await
            }
        } else {
            tokio::fs::remove_file(&host).await
        };
        removed.with_context(|| format!("remove {path}"))?;

        self.record(&path, FsEventKind::Removed, None);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> anyhow::Result<()> {
        let host = self.host_path(path)?;
        tokio::fs::create_dir_all(&host)
            .await
            .with_context(|| format!("mkdir {}", normalize_path(path)))
    }

    fn watch(&self) -> broadcast::Receiver<FsEvent> {
        self.fs_events.subscribe()
    }

    fn watch_ports(&self, ports: &[u16]) {
        let mut watched = self.preview_ports.lock();
        for &port in ports {
            if !watched.contains(&port) {
                watched.push(port);
            }
        }
    }

    async fn spawn(&self, command: &str, args: &[String]) -> anyhow::Result<SandboxProcess> {
        let mut child = tokio::process::Command::new(command)
            .args(args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {command}"))?;
        tracing::debug!(command, ?args, pid = child.id(), "Spawned process");

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        let shared = Arc::new(ProcessShared::default());

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward(stdout, StreamKind::Stdout, out_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward(stderr, StreamKind::Stderr, out_tx.clone())));
        }
        drop(out_tx);

        self.spawn_probe(Arc::clone(&shared));

        let waiter = Arc::clone(&shared);
        let command = command.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => Some(status),
                () = waiter.notify.notified() => None,
            };
            match status {
                Some(status) => {
                    for reader in readers {
                        let _ = reader.await;
                    }
                    waiter.exited.store(true, Ordering::SeqCst);
                    let code = match status {
                        Ok(status) => status.code().unwrap_or(-1),
                        Err(e) => {
                            tracing::warn!(command = %command, error = %e, "Failed to wait for process");
                            -1
                        }
                    };
                    tracing::debug!(command = %command, code, "Process exited");
                    let _ = exit_tx.send(code);
                }
                None => {
                    if let Err(e) = child.kill().await {
                        tracing::debug!(command = %command, error = %e, "Kill failed");
                    }
                    for reader in readers {
                        reader.abort();
                    }
                    waiter.exited.store(true, Ordering::SeqCst);
                    tracing::debug!(command = %command, "Process killed");
                }
            }
        });

        Ok(SandboxProcess {
            output: out_rx,
            exit: exit_rx,
            handle: Arc::new(LocalProcessHandle { shared }),
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_events.subscribe()
    }
}

#[derive(Default)]
struct ProcessShared {
    killed: AtomicBool,
    exited: AtomicBool,
    notify: Notify,
}

impl ProcessShared {
    fn finished(&self) -> bool {
        self.killed.load(Ordering::SeqCst) || self.exited.load(Ordering::SeqCst)
    }
}

struct LocalProcessHandle {
    shared: Arc<ProcessShared>,
}

impl ProcessHandle for LocalProcessHandle {
    fn kill(&self) {
        if !self.shared.killed.swap(true, Ordering::SeqCst) {
            self.shared.notify.notify_one();
        }
    }
}

async fn forward<R>(mut reader: R, stream: StreamKind, tx: mpsc::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut pending = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);
        // Hold back an incomplete UTF-8 sequence for the next read.
        let valid = match std::str::from_utf8(&pending) {
            Ok(_) => pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => pending.len(),
        };
        let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
        pending.drain(..valid);
        if text.is_empty() {
            continue;
        }
        if tx.send(OutputChunk { stream, text }).await.is_err() {
            return;
        }
    }
    if !pending.is_empty() {
        let text = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(OutputChunk { stream, text }).await;
    }
}

/// Walk the directory on each tick and report differences from the last
/// snapshot.
async fn poll(
    dir: PathBuf,
    interval: Duration,
    snapshot: Arc<Mutex<Snapshot>>,
    events: broadcast::Sender<FsEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let version = snapshot.lock().version;
        let root = dir.clone();
        let scanned = match tokio::task::spawn_blocking(move || scan(&root)).await {
            Ok(scanned) => scanned,
            Err(e) => {
                tracing::debug!(error = %e, "Sandbox poll aborted");
                continue;
            }
        };

        let changes = {
            let mut snapshot = snapshot.lock();
            if snapshot.version != version {
                continue;
            }
            let changes = diff(&snapshot.files, &scanned);
            snapshot.files = scanned;
            changes
        };

        for event in changes {
            tracing::trace!(path = %event.path, kind = ?event.kind, "Polled change");
            let _ = events.send(event);
        }
    }
}

fn scan(dir: &Path) -> HashMap<String, SystemTime> {
    WalkDir::new(dir)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| SKIP_DIRS.contains(&name))
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(dir).ok()?;
            let path = normalize_path(relative.to_str()?);
            let mtime = entry.metadata().ok()?.modified().ok()?;
            Some((path, mtime))
        })
        .collect()
}

fn diff(before: &HashMap<String, SystemTime>, after: &HashMap<String, SystemTime>) -> Vec<FsEvent> {
    let mut events: Vec<FsEvent> = after
        .iter()
        .filter_map(|(path, mtime)| match before.get(path) {
            None => Some(FsEvent::new(path.clone(), FsEventKind::Created)),
            Some(old) if old != mtime => Some(FsEvent::new(path.clone(), FsEventKind::Modified)),
            Some(_) => None,
        })
        .collect();
    events.extend(
        before
            .keys()
            .filter(|path| !after.contains_key(*path))
            .map(|path| FsEvent::new(path.clone(), FsEventKind::Removed)),
    );
    events.sort_by(|a, b| a.path.cmp(&b.path));
    events
}
