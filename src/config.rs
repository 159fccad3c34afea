//! Runtime configuration loaded from TOML.
//!
//! Lookup order: an explicit `--config` path, then `config.toml` in the
//! platform config directory, then built-in defaults. Environment variables
//! override file values. Unknown keys are logged and otherwise ignored.

use crate::error::{PlaygroundError, Result};
use crate::exercise::Command;
use crate::lifecycle::SessionOptions;
use crate::sandbox::BootOptions;
use directories::ProjectDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_EXERCISES_DIR: &str = "PLAYGROUND_EXERCISES_DIR";
pub const ENV_SANDBOX_ROOT: &str = "PLAYGROUND_SANDBOX_ROOT";
pub const ENV_SERVER_TIMEOUT: &str = "PLAYGROUND_SERVER_TIMEOUT_SECS";

const CONFIG_FILE: &str = "config.toml";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "playground")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PlaygroundConfig {
    /// Directory holding one subdirectory per exercise.
    pub exercises_dir: PathBuf,
    /// Where local sandboxes create their working directories.
    pub sandbox_root: PathBuf,
    /// Working directory name inside the sandbox.
    pub workdir: String,
    /// Command that installs declared dependencies.
    pub install_command: String,
    /// Seconds to wait for the dev server to report ready.
    pub server_ready_timeout_secs: u64,
    /// Poll interval of the local sandbox file watcher, in milliseconds.
    pub watch_poll_ms: u64,
    /// Terminal lines kept before the oldest are dropped.
    pub terminal_scrollback: usize,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for PlaygroundConfig {
    fn default() -> Self {
        let sandbox_root = project_dirs()
            .map(|dirs| dirs.cache_dir().join("sandboxes"))
            .unwrap_or_else(|| std::env::temp_dir().join("playground"));
        Self {
            exercises_dir: PathBuf::from("exercises"),
            sandbox_root,
            workdir: BootOptions::default().workdir,
            install_command: "npm install".to_string(),
            server_ready_timeout_secs: 60,
            watch_poll_ms: 500,
            terminal_scrollback: crate::workspace::DEFAULT_SCROLLBACK,
            log_level: "info".to_string(),
        }
    }
}

impl PlaygroundConfig {
    /// `config.toml` in the platform config directory.
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load from `path`, or from the default location when it exists, then
    /// apply environment overrides and expand paths.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    tracing::debug!("No config file; using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.expand_paths()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PlaygroundError::Config(format!("read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&raw)
            .map_err(|e| PlaygroundError::Config(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Parse TOML, warning about keys that do not map to a field.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let table: toml::Table = raw
            .parse()
            .map_err(|e: toml::de::Error| PlaygroundError::Config(e.to_string()))?;
        let value = toml::Value::Table(table);
        let mut ignored = Vec::new();
        let config: Self = serde_ignored::deserialize(value, |path| ignored.push(path.to_string()))
            .map_err(|e| PlaygroundError::Config(e.to_string()))?;
        for key in ignored {
            tracing::warn!(key = %key, "Unknown config key ignored");
        }
        Ok(config)
    }

    /// Apply `PLAYGROUND_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_EXERCISES_DIR).filter(|v| !v.is_empty()) {
            self.exercises_dir = PathBuf::from(dir);
        }
        if let Some(root) = lookup(ENV_SANDBOX_ROOT).filter(|v| !v.is_empty()) {
            self.sandbox_root = PathBuf::from(root);
        }
        if let Some(secs) = lookup(ENV_SERVER_TIMEOUT) {
            self.server_ready_timeout_secs = secs.trim().parse().map_err(|_| {
                PlaygroundError::Config(format!("{ENV_SERVER_TIMEOUT} must be a number, got {secs:?}"))
            })?;
        }
        Ok(())
    }

    /// Expand `~` and `$VAR` in path fields.
    pub fn expand_paths(&mut self) -> Result<()> {
        self.exercises_dir = expand(&self.exercises_dir)?;
        self.sandbox_root = expand(&self.sandbox_root)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_ready_timeout_secs == 0 {
            return Err(PlaygroundError::Config(
                "server_ready_timeout_secs must be positive".to_string(),
            ));
        }
        if self.workdir.trim().is_empty() || self.workdir.contains('/') {
            return Err(PlaygroundError::Config(format!(
                "workdir must be a single directory name, got {:?}",
                self.workdir
            )));
        }
        if Command::parse(&self.install_command).is_none() {
            return Err(PlaygroundError::Config("install_command is blank".to_string()));
        }
        Ok(())
    }

    pub fn session_options(&self) -> Result<SessionOptions> {
        let install_command = Command::parse(&self.install_command)
            .ok_or_else(|| PlaygroundError::Config("install_command is blank".to_string()))?;
        Ok(SessionOptions {
            boot: BootOptions {
                workdir: self.workdir.clone(),
                preview_ports: Vec::new(),
            },
            install_command,
            server_timeout: Duration::from_secs(self.server_ready_timeout_secs),
            ..SessionOptions::default()
        })
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch_poll_ms)
    }

    /// JSON schema of the configuration file.
    pub fn schema_json() -> String {
        let schema = schemars::schema_for!(PlaygroundConfig);
        serde_json::to_string_pretty(&schema).unwrap_or_default()
    }
}

fn expand(path: &Path) -> Result<PathBuf> {
    let Some(raw) = path.to_str() else {
        return Ok(path.to_path_buf());
    };
    shellexpand::full(raw)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|e| PlaygroundError::Config(format!("expand {raw}: {e}")))
}
