//! Session orchestration.
//!
//! A [`Session`] drives one exercise through boot, mount, install and dev
//! server start. All state lives in the [`WorkspaceStore`]; the session only
//! performs sandbox I/O and applies [`state`] transitions around it.
//!
//! Runs are tagged with an epoch. `start()` and `reset()` both bump it, and
//! every transition a run applies is gated on its epoch still being current,
//! so a run interrupted by `reset()` goes quiet instead of overwriting the
//! fresh state.

pub mod state;

use crate::error::{PlaygroundError, Result};
use crate::events::Subscription;
use crate::exercise::{scaffold, Command, ExerciseConfig};
use crate::output::OutputBuffer;
use crate::sandbox::{
    BootOptions, Connection, FsEvent, FsEventKind, OutputChunk, ProcessHandle, SandboxManager,
    SandboxProvider, ServerReady, StreamKind, DEPENDENCY_DIR,
};
use crate::sync::{FileSynchronizer, FilesMap, MountOptions};
use crate::workspace::WorkspaceStore;
use parking_lot::Mutex;
use regex::Regex;
use state::{BootEvent, BootState, ServerEvent, ServerState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(60);

const MANIFEST_PATH: &str = "/package.json";

static URL_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):\d{2,5}\S*")
        .expect("valid URL hint pattern")
});

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub boot: BootOptions,
    pub install_command: Command,
    /// How long `start_server` waits for the server-ready event.
    pub server_timeout: Duration,
    /// Start the dev server as soon as the boot reaches `Ready`.
    pub auto_start_server: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            boot: BootOptions::default(),
            install_command: Command::new("npm", ["install"]),
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            auto_start_server: true,
        }
    }
}

#[derive(Default)]
struct Tracked {
    install: Option<Arc<dyn ProcessHandle>>,
    dev: Option<Arc<dyn ProcessHandle>>,
    /// Waits for the server-ready event, then watches the dev process.
    server_watch: Option<JoinHandle<()>>,
}

enum WriteRequest {
    Write { path: String, content: String },
    Delete { path: String },
    Flush(oneshot::Sender<()>),
}

struct Inner {
    manager: Arc<SandboxManager>,
    sync: Arc<FileSynchronizer>,
    store: Arc<WorkspaceStore>,
    options: SessionOptions,
    epoch: AtomicU64,
    server_epoch: AtomicU64,
    tracked: Mutex<Tracked>,
    writer: Mutex<Option<mpsc::UnboundedSender<WriteRequest>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Cheaply cloneable handle to one playground session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create a session over `provider`. Must be called inside a tokio
    /// runtime; the ordered file writer is spawned here.
    pub fn new(provider: Arc<dyn SandboxProvider>, options: SessionOptions) -> Self {
        Self::with_store(provider, options, Arc::new(WorkspaceStore::default()))
    }

    pub fn with_store(
        provider: Arc<dyn SandboxProvider>,
        options: SessionOptions,
        store: Arc<WorkspaceStore>,
    ) -> Self {
        let manager = Arc::new(SandboxManager::new(provider));
        let sync = Arc::new(FileSynchronizer::new(Arc::clone(&manager)));

        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(run_writer(rx, Arc::clone(&sync), Arc::clone(&store)));

        let inner = Arc::new(Inner {
            manager,
            sync,
            store,
            options,
            epoch: AtomicU64::new(0),
            server_epoch: AtomicU64::new(0),
            tracked: Mutex::new(Tracked::default()),
            writer: Mutex::new(Some(tx)),
            writer_task: Mutex::new(Some(writer_task)),
            subscriptions: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let external = inner
            .sync
            .on_external_change(move |event| on_external_change(&weak, event));
        let weak = Arc::downgrade(&inner);
        let resync = inner.sync.on_resync(move |_| resync_tracked(&weak));
        let attached = inner.sync.attach();
        inner.subscriptions.lock().extend([attached, external, resync]);

        Self { inner }
    }

    pub fn store(&self) -> &Arc<WorkspaceStore> {
        &self.inner.store
    }

    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.inner.manager
    }

    pub fn synchronizer(&self) -> &Arc<FileSynchronizer> {
        &self.inner.sync
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn boot_state(&self) -> BootState {
        self.inner.store.boot_state()
    }

    pub fn server_state(&self) -> ServerState {
        self.inner.store.server_state()
    }

    /// Reset, then install `config` and reseed the files from it. The sandbox
    /// connection is kept.
    pub fn load_exercise(&self, config: ExerciseConfig) -> Result<()> {
        config.validate()?;
        self.reset();
        let id = config.id.clone();
        self.inner.store.load_config(config)?;
        tracing::info!(exercise = %id, "Exercise loaded");
        Ok(())
    }

    /// Boot, mount and install. No-op unless the boot state is idle or
    /// error. Never fails: failures end in `BootState::Error`. Returns the
    /// boot state the run ended in.
    pub async fn start(&self) -> BootState {
        let inner = &self.inner;
        let Some(config) = inner.store.config() else {
            tracing::warn!("start() without a loaded exercise");
            return self.boot_state();
        };

        let mut epoch = 0;
        let started = inner.store.apply_boot_if(BootEvent::Start, || {
            epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            true
        });
        if started.is_none() {
            tracing::debug!(state = %self.boot_state(), "start() ignored");
            return self.boot_state();
        }
        tracing::info!(exercise = %config.id, epoch, "Starting session");

        let boot = self.boot_options(&config);
        let connection = match inner.manager.connect(&boot).await {
            Ok(connection) => connection,
            Err(e) => return self.fail(epoch, &e),
        };
        if !self.advance(epoch, BootEvent::Connected) {
            return self.boot_state();
        }

        let install = config.has_dependencies();
        let mut files = inner.store.files();
        scaffold::fill_missing(&mut files, &config);
        if install {
            self.merge_manifest(&mut files, &config);
        }
        if let Err(e) = inner.sync.mount(&files, MountOptions::default()).await {
            return self.fail(epoch, &e);
        }
        for (path, content) in &files {
            inner.store.mark_synced(path, content);
        }

        if !self.advance(epoch, BootEvent::Mounted { install }) {
            return self.boot_state();
        }

        if install {
            match self.install(epoch, connection.as_ref()).await {
                Ok(true) => {}
                Ok(false) => return self.boot_state(),
                Err(e) => return self.fail(epoch, &e),
            }
            if !self.advance(epoch, BootEvent::Installed) {
                return self.boot_state();
            }
        }

        tracing::info!(exercise = %config.id, "Sandbox ready");
        self.push_dirty();
        if inner.options.auto_start_server && self.is_current(epoch) {
            self.start_server().await;
        }
        self.boot_state()
    }

    /// Spawn the dev command and wait for the sandbox to report the server
    /// ready. Legal only while the boot state is `Ready` and no server runs.
    /// Returns the server state the wait ended in.
    pub async fn start_server(&self) -> ServerState {
        let inner = &self.inner;
        let Some(config) = inner.store.config() else {
            return self.server_state();
        };

        let mut server_epoch = 0;
        let started = inner.store.apply_server_if(ServerEvent::Start, || {
            server_epoch = inner.server_epoch.fetch_add(1, Ordering::SeqCst) + 1;
            true
        });
        if started.is_none() {
            tracing::debug!(boot = %self.boot_state(), server = %self.server_state(), "start_server() ignored");
            return self.server_state();
        }
        let epoch = inner.epoch.load(Ordering::SeqCst);

        let connection = match inner.manager.get() {
            Ok(connection) => connection,
            Err(e) => return self.fail_server(server_epoch, e.to_string()),
        };

        // The connection may predate this exercise; register its port anew.
        if let Some(port) = config.preview_port {
            connection.watch_ports(&[port]);
        }
        // Subscribe before spawning so an early ready event is not missed.
        let ready = connection.server_ready();
        let command = &config.dev_command;
        let process = match connection.spawn(&command.program, &command.args).await {
            Ok(process) => process,
            Err(e) => {
                let err = PlaygroundError::ServerProcessError(format!("{e:#}"));
                return self.fail_server(server_epoch, err.to_string());
            }
        };
        tracing::info!(command = %command, "Dev server spawned");

        {
            let mut tracked = inner.tracked.lock();
            if inner.server_epoch.load(Ordering::SeqCst) != server_epoch {
                drop(tracked);
                process.handle.kill();
                return self.server_state();
            }
            tracked.dev = Some(Arc::clone(&process.handle));
        }
        inner.store.set_running(true);
        let streaming = self.stream_output(epoch, process.output);

        let (first_tx, first_rx) = oneshot::channel();
        let watch = tokio::spawn(watch_server(
            Arc::downgrade(inner),
            server_epoch,
            ready,
            process.exit,
            streaming,
            first_tx,
        ));
        {
            let mut tracked = inner.tracked.lock();
            if let Some(previous) = tracked.server_watch.replace(watch) {
                previous.abort();
            }
        }

        match first_rx.await {
            Ok(state) => state,
            Err(_) => self.server_state(),
        }
    }

    /// Kill the dev server and return the server state to idle.
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.server_epoch.fetch_add(1, Ordering::SeqCst);
        let (dev, watch) = {
            let mut tracked = inner.tracked.lock();
            (tracked.dev.take(), tracked.server_watch.take())
        };
        if let Some(watch) = watch {
            watch.abort();
        }
        if let Some(dev) = dev {
            dev.kill();
            tracing::info!("Dev server stopped");
        }
        inner.store.apply_server(ServerEvent::Stop);
        if inner.tracked.lock().install.is_none() {
            inner.store.set_running(false);
        }
    }

    /// Kill tracked processes, clear the terminal and return both states to
    /// idle. The sandbox connection is kept.
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        inner.server_epoch.fetch_add(1, Ordering::SeqCst);

        let tracked = std::mem::take(&mut *inner.tracked.lock());
        if let Some(watch) = tracked.server_watch {
            watch.abort();
        }
        for handle in [tracked.install, tracked.dev].into_iter().flatten() {
            handle.kill();
        }

        inner.store.reset();
        tracing::info!("Session reset");
    }

    /// Edit a file. The files map changes now; the sandbox write is queued
    /// when the boot is ready and otherwise deferred to the next mount.
    pub fn edit_file(&self, path: &str, content: &str) -> Result<()> {
        let inner = &self.inner;
        inner.store.update_file(path, content)?;
        if inner.store.boot_state().is_ready() {
            self.enqueue(WriteRequest::Write {
                path: path.to_string(),
                content: content.to_string(),
            });
        }
        Ok(())
    }

    /// Swap the working copy with the solution. Returns `false` when the
    /// exercise has no solution.
    pub fn toggle_solution(&self) -> Result<bool> {
        let inner = &self.inner;
        let Some(diff) = inner.store.toggle_solution()? else {
            return Ok(false);
        };
        if inner.store.boot_state().is_ready() {
            let files = inner.store.files();
            for path in diff.written {
                if let Some(content) = files.get(&path) {
                    let content = content.clone();
                    self.enqueue(WriteRequest::Write { path, content });
                }
            }
            for path in diff.removed {
                self.enqueue(WriteRequest::Delete { path });
            }
        }
        Ok(true)
    }

    /// Reset, stop the writer and dispose the sandbox connection.
    pub fn dispose(&self) {
        let inner = &self.inner;
        self.reset();
        inner.writer.lock().take();
        inner.subscriptions.lock().clear();
        inner.manager.dispose();
        tracing::info!("Session disposed");
    }

    /// Wait until every write queued so far has been applied.
    pub async fn flush_writes(&self) {
        let (tx, rx) = oneshot::channel();
        self.enqueue(WriteRequest::Flush(tx));
        let _ = rx.await;
    }

    fn boot_options(&self, config: &ExerciseConfig) -> BootOptions {
        let mut boot = self.inner.options.boot.clone();
        if let Some(port) = config.preview_port {
            if !boot.preview_ports.contains(&port) {
                boot.preview_ports.push(port);
            }
        }
        boot
    }

    /// Make the mounted manifest declare the exercise's dependencies and
    /// scripts. The store copy follows so the editor shows what is mounted.
    fn merge_manifest(&self, files: &mut FilesMap, config: &ExerciseConfig) {
        let manifest = match files.get(MANIFEST_PATH) {
            Some(existing) => config.merge_manifest(existing),
            None => config.manifest(),
        };
        let store = &self.inner.store;
        if store.file(MANIFEST_PATH).is_some() {
            store.apply_external(MANIFEST_PATH, Some(manifest.clone()));
        }
        files.insert(MANIFEST_PATH.to_string(), manifest);
    }

    /// Queue writes for files edited while the sandbox was not ready.
    fn push_dirty(&self) {
        let store = &self.inner.store;
        let files = store.files();
        let dirty: Vec<String> = store.editor().dirty_files().map(str::to_string).collect();
        for path in dirty {
            if let Some(content) = files.get(&path) {
                tracing::debug!(path = %path, "Writing edit made during boot");
                self.enqueue(WriteRequest::Write {
                    path,
                    content: content.clone(),
                });
            }
        }
    }

    /// Run the install command and stream its output. `Ok(false)` means the
    /// run went stale.
    async fn install(&self, epoch: u64, connection: &dyn Connection) -> Result<bool> {
        let inner = &self.inner;
        let command = &inner.options.install_command;
        let process = connection
            .spawn(&command.program, &command.args)
            .await
            .map_err(|e| PlaygroundError::sandbox(&e.context(format!("spawn {command}"))))?;
        tracing::info!(command = %command, "Installing dependencies");

        {
            let mut tracked = inner.tracked.lock();
            if !self.is_current(epoch) {
                drop(tracked);
                process.handle.kill();
                return Ok(false);
            }
            tracked.install = Some(Arc::clone(&process.handle));
        }
        inner.store.set_running(true);

        let streaming = self.stream_output(epoch, process.output);
        let exit = process.exit.await;
        let _ = streaming.await;

        if !self.is_current(epoch) {
            return Ok(false);
        }
        inner.tracked.lock().install = None;
        inner.store.set_running(false);

        match exit {
            Ok(0) => {
                tracing::info!("Dependencies installed");
                Ok(true)
            }
            Ok(code) => Err(PlaygroundError::InstallFailure { code }),
            Err(_) => Err(PlaygroundError::ServerProcessError(
                "install process ended without an exit code".to_string(),
            )),
        }
    }

    /// Stream a process's output into the terminal, one buffer per stream.
    fn stream_output(&self, epoch: u64, mut output: mpsc::Receiver<OutputChunk>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut stdout = OutputBuffer::new();
            let mut stderr = OutputBuffer::new();

            while let Some(chunk) = output.recv().await {
                let buffer = match chunk.stream {
                    StreamKind::Stdout => &mut stdout,
                    StreamKind::Stderr => &mut stderr,
                };
                let lines = buffer.append(&chunk.text);
                if !emit_lines(&weak, epoch, chunk.stream, lines) {
                    return;
                }
            }
            emit_lines(&weak, epoch, StreamKind::Stdout, stdout.flush());
            emit_lines(&weak, epoch, StreamKind::Stderr, stderr.flush());
        })
    }

    fn enqueue(&self, request: WriteRequest) {
        let sent = match self.inner.writer.lock().as_ref() {
            Some(writer) => writer.send(request).is_ok(),
            None => false,
        };
        if !sent {
            tracing::debug!("File writer stopped; write deferred to next mount");
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.inner.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Apply a boot event if the run is still current.
    fn advance(&self, epoch: u64, event: BootEvent) -> bool {
        let inner = &self.inner;
        let applied = inner
            .store
            .apply_boot_if(event, || inner.epoch.load(Ordering::SeqCst) == epoch);
        if applied.is_none() {
            tracing::debug!(epoch, "Stale run; stopping");
        }
        applied.is_some()
    }

    fn fail(&self, epoch: u64, err: &PlaygroundError) -> BootState {
        tracing::warn!(error = %err, "Session start failed");
        self.advance(epoch, BootEvent::Failed(err.to_string()));
        self.boot_state()
    }

    fn fail_server(&self, server_epoch: u64, cause: String) -> ServerState {
        tracing::warn!(cause = %cause, "Dev server failed to start");
        apply_server_event(&self.inner, server_epoch, ServerEvent::Failed(cause));
        self.server_state()
    }
}

fn emit_lines(inner: &Weak<Inner>, epoch: u64, stream: StreamKind, lines: Vec<String>) -> bool {
    let Some(inner) = inner.upgrade() else {
        return false;
    };
    if inner.epoch.load(Ordering::SeqCst) != epoch {
        return false;
    }
    for line in lines {
        if let Some(url) = URL_HINT.find(&line) {
            tracing::debug!(url = url.as_str(), "Output mentions a URL");
        }
        inner.store.append_terminal(stream, line);
    }
    true
}

fn apply_server_event(inner: &Inner, server_epoch: u64, event: ServerEvent) -> Option<ServerState> {
    inner.store.apply_server_if(event, || {
        inner.server_epoch.load(Ordering::SeqCst) == server_epoch
    })
}

/// Wait for the first of server-ready, process exit or timeout and report
/// the resulting state through `first`; then keep watching for an exit.
async fn watch_server(
    inner: Weak<Inner>,
    server_epoch: u64,
    mut ready: broadcast::Receiver<ServerReady>,
    mut exit: oneshot::Receiver<i32>,
    streaming: JoinHandle<()>,
    first: oneshot::Sender<ServerState>,
) {
    let Some(timeout) = inner.upgrade().map(|inner| inner.options.server_timeout) else {
        return;
    };

    let waited = tokio::time::timeout(timeout, async {
        loop {
            tokio::select! {
                event = ready.recv() => match event {
                    Ok(ready) => return Ok(ready),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Server-ready events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err("sandbox connection closed".to_string());
                    }
                },
                code = &mut exit => {
                    return Err(match code {
                        Ok(code) => format!("dev server exited with code {code}"),
                        Err(_) => "dev server was killed".to_string(),
                    });
                }
            }
        }
    })
    .await;

    let exited = matches!(waited, Ok(Err(_)));
    let event = match waited {
        Ok(Ok(ready)) => {
            tracing::info!(url = %ready.url, port = ready.port, "Dev server ready");
            ServerEvent::Ready {
                url: ready.url,
                port: ready.port,
            }
        }
        Ok(Err(cause)) => ServerEvent::Failed(cause),
        Err(_) => {
            tracing::warn!(timeout_secs = timeout.as_secs(), "Dev server did not report ready");
            ServerEvent::Failed(PlaygroundError::ServerStartTimeout.to_string())
        }
    };
    let is_ready = matches!(event, ServerEvent::Ready { .. });

    let Some(session) = inner.upgrade() else {
        return;
    };
    if apply_server_event(&session, server_epoch, event).is_none() {
        let _ = first.send(session.store.server_state());
        return;
    }

    if !is_ready {
        let dev = session.tracked.lock().dev.take();
        if let Some(dev) = dev {
            if !exited {
                dev.kill();
            }
        }
        session.store.set_running(false);
        let _ = first.send(session.store.server_state());
        return;
    }
    let _ = first.send(session.store.server_state());
    drop(session);

    // Server is up; report a later crash.
    let code = exit.await;
    let _ = streaming.await;
    let Some(session) = inner.upgrade() else {
        return;
    };
    if let Ok(code) = code {
        tracing::warn!(code, "Dev server exited");
        let cause = format!("dev server exited with code {code}");
        if apply_server_event(&session, server_epoch, ServerEvent::Failed(cause)).is_some() {
            session.tracked.lock().dev = None;
            session.store.set_running(false);
        }
    }
}

/// Reflect changes the sandbox made on its own into the files map.
fn on_external_change(inner: &Weak<Inner>, event: &FsEvent) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let path = event.path.clone();
    if in_dependency_dir(&path) {
        return;
    }
    if inner.store.file(&path).is_none() {
        tracing::trace!(path = %path, "Ignoring change to untracked path");
        return;
    }
    if inner.store.editor().is_dirty(&path) {
        tracing::debug!(path = %path, "Ignoring external change to a file with unsaved edits");
        return;
    }

    match event.kind {
        FsEventKind::Removed => inner.store.apply_external(&path, None),
        FsEventKind::Created | FsEventKind::Modified => {
            let sync = Arc::clone(&inner.sync);
            let store = Arc::clone(&inner.store);
            tokio::spawn(async move {
                match sync.read_file(&path).await {
                    Ok(content) => store.apply_external(&path, Some(content)),
                    Err(e) => tracing::debug!(path = %path, error = %e, "External change unreadable"),
                }
            });
        }
    }
}

/// Re-read every tracked file without unsaved edits after the watch lost
/// notifications.
fn resync_tracked(inner: &Weak<Inner>) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let sync = Arc::clone(&inner.sync);
    let store = Arc::clone(&inner.store);
    tokio::spawn(async move {
        let paths: Vec<String> = store.files().into_keys().collect();
        let mut refreshed = 0;
        for path in paths {
            if in_dependency_dir(&path) || store.editor().is_dirty(&path) {
                continue;
            }
            if let Ok(content) = sync.read_file(&path).await {
                store.apply_external(&path, Some(content));
                refreshed += 1;
            }
        }
        tracing::info!(refreshed, "Re-read tracked files after watch lag");
    });
}

fn in_dependency_dir(path: &str) -> bool {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .is_some_and(|top| top == DEPENDENCY_DIR)
}

/// Apply queued edits to the sandbox in order.
async fn run_writer(
    mut requests: mpsc::UnboundedReceiver<WriteRequest>,
    sync: Arc<FileSynchronizer>,
    store: Arc<WorkspaceStore>,
) {
    while let Some(request) = requests.recv().await {
        if let WriteRequest::Flush(done) = request {
            let _ = done.send(());
            continue;
        }
        if !store.boot_state().is_ready() {
            tracing::debug!("Sandbox not ready; write deferred to next mount");
            continue;
        }
        match request {
            WriteRequest::Write { path, content } => match sync.write_file(&path, &content).await {
                Ok(()) => {
                    store.mark_synced(&path, &content);
                }
                Err(e) => tracing::warn!(path = %path, error = %e, "Failed to sync edit"),
            },
            WriteRequest::Delete { path } => {
                if let Err(e) = sync.delete_file(&path).await {
                    tracing::warn!(path = %path, error = %e, "Failed to sync delete");
                }
            }
            WriteRequest::Flush(_) => {}
        }
    }
    tracing::debug!("File writer stopped");
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.writer_task.get_mut().take() {
            task.abort();
        }
        if let Some(watch) = self.tracked.get_mut().server_watch.take() {
            watch.abort();
        }
    }
}
