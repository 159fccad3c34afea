//! Sandbox abstraction layer for the playground.
//!
//! Defines the [`SandboxProvider`] and [`Connection`] traits that every
//! execution environment must implement, plus the process and event types
//! they exchange with the runtime. Two providers exist:
//!
//! - [`local::LocalSandbox`]: a working directory on the host with processes
//!   spawned through `tokio::process`
//! - [`memory::MemorySandbox`]: an in-memory filesystem with scripted
//!   processes, used as a stub in tests and embeddings
//!
//! All paths passed to a [`Connection`] are absolute and rooted at the
//! connection's working directory (`/` is the workdir itself).
//!
//! [`manager::SandboxManager`] owns the one live connection of a session.

pub mod local;
pub mod manager;
pub mod memory;

use crate::sync::FileTree;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

pub use manager::SandboxManager;

/// Directory that survives a clean mount (an install is expensive to redo).
pub const DEPENDENCY_DIR: &str = "node_modules";

/// Options for booting a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootOptions {
    /// Working directory name inside the sandbox. Fixed for the session once
    /// the first boot succeeds.
    pub workdir: String,
    /// Ports a dev server is expected to bind; providers that cannot observe
    /// binds directly probe these.
    #[serde(default)]
    pub preview_ports: Vec<u16>,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            workdir: "playground".to_string(),
            preview_ports: Vec::new(),
        }
    }
}

/// Kind of filesystem change reported by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsEventKind {
    Created,
    Modified,
    Removed,
}

/// One change notification from the sandbox filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsEvent {
    pub path: String,
    pub kind: FsEventKind,
}

impl FsEvent {
    pub fn new(path: impl Into<String>, kind: FsEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Fired when a spawned server binds a port and becomes reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A chunk of process output. Chunk boundaries are arbitrary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub text: String,
}

impl OutputChunk {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Stderr,
            text: text.into(),
        }
    }
}

/// Control side of a spawned process.
pub trait ProcessHandle: Send + Sync {
    /// Terminate the process. Its output channel closes and its exit
    /// receiver resolves (or is dropped) afterwards.
    fn kill(&self);
}

/// A process running inside the sandbox.
pub struct SandboxProcess {
    /// Output chunks; the channel closes when the process ends.
    pub output: mpsc::Receiver<OutputChunk>,
    /// Exit code. Dropped without a value if the process was killed.
    pub exit: oneshot::Receiver<i32>,
    pub handle: Arc<dyn ProcessHandle>,
}

/// Provider-agnostic boot entry point.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Boot a fresh sandbox. Expensive; the manager calls it at most once
    /// per session unless a boot fails or the connection is disposed.
    async fn boot(&self, options: &BootOptions) -> anyhow::Result<Arc<dyn Connection>>;

    /// Short provider name for logs.
    fn name(&self) -> &str;
}

/// Live connection to a booted sandbox.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Working directory name the sandbox was booted with.
    fn workdir(&self) -> &str;

    /// Write a whole tree into the working directory, merging with what is
    /// already there.
    async fn mount(&self, tree: &FileTree) -> anyhow::Result<()>;

    /// Write a file, creating missing parent directories.
    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()>;

    async fn read_file(&self, path: &str) -> anyhow::Result<String>;

    /// Names of the entries directly under `path`.
    async fn read_dir(&self, path: &str) -> anyhow::Result<Vec<String>>;

    /// Remove a file or directory. Fails if the path does not exist.
    async fn rm(&self, path: &str, recursive: bool) -> anyhow::Result<()>;

    async fn mkdir(&self, path: &str) -> anyhow::Result<()>;

    /// Recursive watch over the working directory.
    fn watch(&self) -> broadcast::Receiver<FsEvent>;

    /// Add ports that later spawns may serve on. Providers that detect
    /// readiness by probing include them from the next spawn on; others
    /// ignore them.
    fn watch_ports(&self, _ports: &[u16]) {}

    async fn spawn(&self, command: &str, args: &[String]) -> anyhow::Result<SandboxProcess>;

    /// Server-ready notifications for processes spawned on this connection.
    fn server_ready(&self) -> broadcast::Receiver<ServerReady>;
}

/// Event channel capacity shared by providers.
pub(crate) const EVENT_CAPACITY: usize = 1024;

/// Output channel capacity per spawned process.
pub(crate) const OUTPUT_CAPACITY: usize = 256;
