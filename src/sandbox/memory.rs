//! In-memory sandbox provider with scripted processes.
//!
//! Nothing is executed: `spawn` looks up a [`ScriptedProcess`] registered for
//! the command line and replays its output, optional server-ready event and
//! exit code. Every filesystem operation emits exactly one watch event for its
//! path. The provider records boots, spawns and kills so callers can assert on
//! them.

use super::{
    BootOptions, Connection, FsEvent, FsEventKind, OutputChunk, ProcessHandle, SandboxProcess,
    SandboxProvider, ServerReady, EVENT_CAPACITY, OUTPUT_CAPACITY,
};
use crate::sync::tree::{normalize_path, split_path};
use crate::sync::{FileTree, FilesMap};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};

/// Behaviour of one scripted command.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProcess {
    pub output: Vec<OutputChunk>,
    pub exit_code: i32,
    /// Emit a server-ready event for this port after the output.
    pub serve_port: Option<u16>,
    /// Keep running after the output until killed.
    pub run_until_killed: bool,
    /// Pause before each output chunk.
    pub chunk_delay: Option<Duration>,
}

impl ScriptedProcess {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    /// A dev server: prints its output, reports `port` ready, then runs until
    /// killed.
    pub fn serving(port: u16) -> Self {
        Self {
            serve_port: Some(port),
            run_until_killed: true,
            ..Self::default()
        }
    }

    /// Runs until killed without ever reporting ready.
    pub fn hanging() -> Self {
        Self {
            run_until_killed: true,
            ..Self::default()
        }
    }

    pub fn stdout(mut self, text: impl Into<String>) -> Self {
        self.output.push(OutputChunk::stdout(text));
        self
    }

    pub fn stderr(mut self, text: impl Into<String>) -> Self {
        self.output.push(OutputChunk::stderr(text));
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct Recorder {
    boot_count: AtomicUsize,
    failing_boots: AtomicUsize,
    boot_delay: Mutex<Option<Duration>>,
    scripts: Mutex<HashMap<String, ScriptedProcess>>,
    spawned: Mutex<Vec<String>>,
    kills: Mutex<HashMap<String, usize>>,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
}

/// Scriptable in-memory provider. Clones share recorded state.
#[derive(Clone, Default)]
pub struct MemorySandbox {
    recorder: Arc<Recorder>,
}

impl MemorySandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_boot_delay(self, delay: Duration) -> Self {
        *self.recorder.boot_delay.lock() = Some(delay);
        self
    }

    /// Make the next `count` boots fail.
    pub fn fail_next_boots(&self, count: usize) {
        self.recorder.failing_boots.store(count, Ordering::SeqCst);
    }

    /// Register the behaviour for a command line such as `"npm install"`.
    /// Unregistered commands exit 0 without output.
    pub fn script(&self, command_line: &str, process: ScriptedProcess) {
        self.recorder
            .scripts
            .lock()
            .insert(command_line.to_string(), process);
    }

    pub fn boot_count(&self) -> usize {
        self.recorder.boot_count.load(Ordering::SeqCst)
    }

    /// Command lines spawned so far, in order.
    pub fn spawned(&self) -> Vec<String> {
        self.recorder.spawned.lock().clone()
    }

    /// How many times `kill()` was called on processes of this command line.
    pub fn kill_count(&self, command_line: &str) -> usize {
        self.recorder
            .kills
            .lock()
            .get(command_line)
            .copied()
            .unwrap_or(0)
    }

    /// Most recently booted connection.
    pub fn connection(&self) -> Option<Arc<MemoryConnection>> {
        self.recorder.connections.lock().last().cloned()
    }
}

#[async_trait]
impl SandboxProvider for MemorySandbox {
    async fn boot(&self, options: &BootOptions) -> anyhow::Result<Arc<dyn Connection>> {
        self.recorder.boot_count.fetch_add(1, Ordering::SeqCst);

        let delay = *self.recorder.boot_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self.recorder.failing_boots.load(Ordering::SeqCst);
        if failing > 0 {
            self.recorder
                .failing_boots
                .store(failing - 1, Ordering::SeqCst);
            anyhow::bail!("simulated boot failure");
        }

        let connection = Arc::new(MemoryConnection::new(
            options.workdir.clone(),
            Arc::clone(&self.recorder),
        ));
        self.recorder
            .connections
            .lock()
            .push(Arc::clone(&connection));
        Ok(connection)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Connection to a [`MemorySandbox`].
pub struct MemoryConnection {
    workdir: String,
    files: Mutex<FilesMap>,
    dirs: Mutex<BTreeSet<String>>,
    watched_ports: Mutex<Vec<u16>>,
    fs_events: broadcast::Sender<FsEvent>,
    ready_events: broadcast::Sender<ServerReady>,
    recorder: Arc<Recorder>,
}

impl MemoryConnection {
    fn new(workdir: String, recorder: Arc<Recorder>) -> Self {
        let (fs_events, _) = broadcast::channel(EVENT_CAPACITY);
        let (ready_events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            workdir,
            files: Mutex::new(FilesMap::new()),
            dirs: Mutex::new(BTreeSet::new()),
            watched_ports: Mutex::new(Vec::new()),
            fs_events,
            ready_events,
            recorder,
        }
    }

    /// Snapshot of every file in the sandbox.
    pub fn files(&self) -> FilesMap {
        self.files.lock().clone()
    }

    /// Ports registered through `watch_ports`, in order.
    pub fn watched_ports(&self) -> Vec<u16> {
        self.watched_ports.lock().clone()
    }

    /// Simulate a process inside the sandbox writing a file.
    pub fn external_write(&self, path: &str, content: &str) {
        let path = normalize_path(path);
        let kind = self.put(&path, content);
        self.emit(&path, kind);
    }

    /// Inject a raw watch event.
    pub fn emit_fs_event(&self, event: FsEvent) {
        let _ = self.fs_events.send(event);
    }

    fn put(&self, path: &str, content: &str) -> FsEventKind {
        self.add_parent_dirs(path);
        match self
            .files
            .lock()
            .insert(path.to_string(), content.to_string())
        {
            Some(_) => FsEventKind::Modified,
            None => FsEventKind::Created,
        }
    }

    fn add_parent_dirs(&self, path: &str) {
        let segments: Vec<&str> = split_path(path).collect();
        let mut dirs = self.dirs.lock();
        for depth in 1..segments.len() {
            dirs.insert(format!("/{}", segments[..depth].join("/")));
        }
    }

    fn emit(&self, path: &str, kind: FsEventKind) {
        let _ = self.fs_events.send(FsEvent::new(path, kind));
    }

    fn is_dir(&self, path: &str) -> bool {
        path == "/" || self.dirs.lock().contains(path)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn workdir(&self) -> &str {
        &self.workdir
    }

    async fn mount(&self, tree: &FileTree) -> anyhow::Result<()> {
        for (path, content) in tree.flatten() {
            let kind = self.put(&path, &content);
            self.emit(&path, kind);
        }
        Ok(())
    }

    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        let path = normalize_path(path);
        anyhow::ensure!(!self.is_dir(&path), "EISDIR: {path} is a directory");
        let kind = self.put(&path, content);
        self.emit(&path, kind);
        Ok(())
    }

    async fn read_file(&self, path: &str) -> anyhow::Result<String> {
        let path = normalize_path(path);
        self.files
            .lock()
            .get(&path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("ENOENT: no such file {path}"))
    }

    async fn read_dir(&self, path: &str) -> anyhow::Result<Vec<String>> {
        let path = normalize_path(path);
        anyhow::ensure!(self.is_dir(&path), "ENOENT: no such directory {path}");

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let child = |entry: &String| -> Option<String> {
            entry
                .strip_prefix(&prefix)
                .and_then(|rest| rest.split('/').next())
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        };

        let mut names: BTreeSet<String> = self.files.lock().keys().filter_map(child).collect();
        names.extend(self.dirs.lock().iter().filter_map(child));
        Ok(names.into_iter().collect())
    }

    async fn rm(&self, path: &str, recursive: bool) -> anyhow::Result<()> {
        let path = normalize_path(path);

        if self.files.lock().remove(&path).is_some() {
            self.emit(&path, FsEventKind::Removed);
            return Ok(());
        }

        anyhow::ensure!(
            path != "/" && self.is_dir(&path),
            "ENOENT: no such file or directory {path}"
        );

        let prefix = format!("{path}/");
        {
            let mut files = self.files.lock();
            let nested = files.keys().any(|p| p.starts_with(&prefix));
            anyhow::ensure!(recursive || !nested, "ENOTEMPTY: {path}");
            files.retain(|p, _| !p.starts_with(&prefix));
        }
        self.dirs
            .lock()
            .retain(|d| d != &path && !d.starts_with(&prefix));
        self.emit(&path, FsEventKind::Removed);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> anyhow::Result<()> {
        let path = normalize_path(path);
        self.add_parent_dirs(&path);
        self.dirs.lock().insert(path);
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<FsEvent> {
        self.fs_events.subscribe()
    }

    fn watch_ports(&self, ports: &[u16]) {
        let mut watched = self.watched_ports.lock();
        for &port in ports {
            if !watched.contains(&port) {
                watched.push(port);
            }
        }
    }

    async fn spawn(&self, command: &str, args: &[String]) -> anyhow::Result<SandboxProcess> {
        let command_line = std::iter::once(command)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        self.recorder.spawned.lock().push(command_line.clone());
        let script = self
            .recorder
            .scripts
            .lock()
            .get(&command_line)
            .cloned()
            .unwrap_or_default();

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        let handle = Arc::new(MemoryProcessHandle {
            command_line: command_line.clone(),
            killed: AtomicBool::new(false),
            notify: Notify::new(),
            recorder: Arc::clone(&self.recorder),
        });

        let ready_events = self.ready_events.clone();
        let task_handle = Arc::clone(&handle);
        tokio::spawn(async move {
            let run = async {
                for chunk in script.output {
                    if let Some(delay) = script.chunk_delay {
                        tokio::time::sleep(delay).await;
                    }
                    if out_tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                if let Some(port) = script.serve_port {
                    let _ = ready_events.send(ServerReady {
                        port,
                        url: format!("http://localhost:{port}"),
                    });
                }
                if script.run_until_killed {
                    std::future::pending::<()>().await;
                }
                script.exit_code
            };

            let exit_code = tokio::select! {
                code = run => Some(code),
                () = task_handle.notify.notified() => None,
            };
            drop(out_tx);

            match exit_code {
                Some(code) => {
                    tracing::debug!(command = %task_handle.command_line, code, "Scripted process exited");
                    let _ = exit_tx.send(code);
                }
                None => {
                    tracing::debug!(command = %task_handle.command_line, "Scripted process killed");
                }
            }
        });

        Ok(SandboxProcess {
            output: out_rx,
            exit: exit_rx,
            handle,
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_events.subscribe()
    }
}

struct MemoryProcessHandle {
    command_line: String,
    killed: AtomicBool,
    notify: Notify,
    recorder: Arc<Recorder>,
}

impl ProcessHandle for MemoryProcessHandle {
    fn kill(&self) {
        *self
            .recorder
            .kills
            .lock()
            .entry(self.command_line.clone())
            .or_insert(0) += 1;
        if !self.killed.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }
}
