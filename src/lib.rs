//! Interactive coding playground runtime.
//!
//! Boots a sandbox, mounts an exercise's files into it, installs the declared
//! dependencies and runs a live dev server, keeping an in-memory workspace
//! (files, editor, terminal, panels) in sync with the sandbox.

pub mod config;
pub mod error;
pub mod events;
pub mod exercise;
pub mod lifecycle;
pub mod output;
pub mod sandbox;
pub mod sync;
pub mod workspace;

pub use config::PlaygroundConfig;
pub use error::{PlaygroundError, Result};
pub use exercise::{ExerciseConfig, ExerciseFile, ExerciseLoader, TemplateKind};
pub use lifecycle::state::{BootState, ServerState};
pub use lifecycle::{Session, SessionOptions};
pub use sandbox::SandboxManager;
pub use sync::{FileSynchronizer, FilesMap};
pub use workspace::WorkspaceStore;
