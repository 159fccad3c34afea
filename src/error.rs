//! Error taxonomy for the playground runtime.
//!
//! Sandbox providers report failures as `anyhow::Error`; the manager, the
//! synchronizer and the session map them into [`PlaygroundError`] at their
//! boundaries. Every variant carries owned strings so the error can be cloned
//! into shared boot futures and stored in state enums.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlaygroundError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaygroundError {
    /// The sandbox failed to initialize.
    #[error("sandbox failed to boot: {0}")]
    ConnectionBootFailure(String),

    /// The file tree could not be written into the sandbox.
    #[error("failed to mount files: {0}")]
    MountFailure(String),

    #[error("install failed with code {code}")]
    InstallFailure { code: i32 },

    #[error("startup timed out")]
    ServerStartTimeout,

    #[error("dev server error: {0}")]
    ServerProcessError(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("exercise not found: {0}")]
    ExerciseNotFound(String),

    /// A caller asked for the connection before any boot completed.
    #[error("sandbox is not booted")]
    NotBooted,

    #[error("invalid exercise: {0}")]
    InvalidExercise(String),

    #[error("file is read-only: {0}")]
    ReadOnlyFile(String),

    #[error("sandbox operation failed: {0}")]
    Sandbox(String),

    #[error("config error: {0}")]
    Config(String),
}

impl PlaygroundError {
    /// Wrap a provider-level failure.
    pub fn sandbox(err: &anyhow::Error) -> Self {
        Self::Sandbox(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_failure_message_carries_code() {
        let err = PlaygroundError::InstallFailure { code: 1 };
        assert_eq!(err.to_string(), "install failed with code 1");
    }

    #[test]
    fn timeout_message() {
        assert_eq!(
            PlaygroundError::ServerStartTimeout.to_string(),
            "startup timed out"
        );
    }

    #[test]
    fn sandbox_error_keeps_context_chain() {
        let err = anyhow::anyhow!("disk full").context("write /a.txt");
        let mapped = PlaygroundError::sandbox(&err);
        assert_eq!(
            mapped,
            PlaygroundError::Sandbox("write /a.txt: disk full".to_string())
        );
    }
}
