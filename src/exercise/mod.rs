//! Exercise configuration.
//!
//! An [`ExerciseConfig`] is the immutable description of one exercise: its
//! files, optional solution, declared dependencies and scripts, and how the
//! dev server is started. It is built once (by [`loader::ExerciseLoader`] or
//! programmatically) and read-only for the rest of the session.

pub mod loader;
pub mod scaffold;

pub use loader::ExerciseLoader;
pub use scaffold::TemplateKind;

use crate::error::{PlaygroundError, Result};
use crate::sync::FilesMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;

/// File content: inline text or a reference read on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum FileContent {
    Inline(String),
    External(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseFile {
    /// Absolute path inside the sandbox working directory.
    pub path: String,
    pub content: FileContent,
    /// Mounted but not listed in the file tree.
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub read_only: bool,
}

impl ExerciseFile {
    pub fn inline(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: FileContent::Inline(content.into()),
            hidden: false,
            read_only: false,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Text of the file; external references are read now.
    pub fn resolve(&self) -> Result<String> {
        match &self.content {
            FileContent::Inline(text) => Ok(text.clone()),
            FileContent::External(source) => std::fs::read_to_string(source).map_err(|e| {
                tracing::warn!(path = %self.path, source = %source.display(), error = %e, "External file unreadable");
                PlaygroundError::FileNotFound(source.display().to_string())
            }),
        }
    }
}

/// A program with arguments, e.g. `npm run dev`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Command {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a command line on whitespace. Returns `None` for a blank line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseConfig {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub template: TemplateKind,
    pub files: Vec<ExerciseFile>,
    #[serde(default)]
    pub solution: Option<Vec<ExerciseFile>>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
    pub dev_command: Command,
    #[serde(default)]
    pub preview_port: Option<u16>,
    #[serde(default)]
    pub focus: Option<String>,
}

impl ExerciseConfig {
    /// A config with the template's default dependencies, scripts, dev
    /// command and port, and no files.
    pub fn new(id: impl Into<String>, template: TemplateKind) -> Self {
        let id = id.into();
        let defaults = scaffold::defaults(template);
        Self {
            title: id.clone(),
            id,
            description: String::new(),
            template,
            files: Vec::new(),
            solution: None,
            dependencies: defaults.dependencies,
            dev_dependencies: defaults.dev_dependencies,
            scripts: defaults.scripts,
            dev_command: defaults.dev_command,
            preview_port: defaults.port,
            focus: None,
        }
    }

    pub fn with_file(mut self, file: ExerciseFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_solution(mut self, files: Vec<ExerciseFile>) -> Self {
        self.solution = Some(files);
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.dependencies.insert(name.into(), version.into());
        self
    }

    /// Any runtime or dev dependency declared.
    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty() || !self.dev_dependencies.is_empty()
    }

    pub fn file(&self, path: &str) -> Option<&ExerciseFile> {
        self.files.iter().find(|file| file.path == path)
    }

    pub fn is_read_only(&self, path: &str) -> bool {
        self.file(path).is_some_and(|file| file.read_only)
    }

    /// Paths shown in the file tree, in declaration order.
    pub fn visible_paths(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|file| !file.hidden)
            .map(|file| file.path.clone())
            .collect()
    }

    /// The file opened first: the declared focus, else the first visible file.
    pub fn initial_focus(&self) -> Option<String> {
        self.focus
            .clone()
            .or_else(|| self.visible_paths().into_iter().next())
    }

    /// Check the path invariants: absolute and unique, in both file sets.
    pub fn validate(&self) -> Result<()> {
        check_paths(&self.id, &self.files)?;
        if let Some(solution) = &self.solution {
            check_paths(&self.id, solution)?;
        }
        if let Some(focus) = &self.focus {
            if self.file(focus).is_none() {
                return Err(PlaygroundError::InvalidExercise(format!(
                    "{}: focus file {focus} is not part of the exercise",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Resolve every exercise file into a files map.
    pub fn files_map(&self) -> Result<FilesMap> {
        resolve_all(&self.files)
    }

    /// The exercise files overlaid with the solution, if there is one.
    pub fn solution_map(&self) -> Result<Option<FilesMap>> {
        let Some(solution) = &self.solution else {
            return Ok(None);
        };
        let mut files = self.files_map()?;
        files.extend(resolve_all(solution)?);
        Ok(Some(files))
    }

    /// `package.json` describing the declared dependencies and scripts.
    pub fn manifest(&self) -> String {
        let manifest = serde_json::json!({
            "name": manifest_name(&self.id),
            "private": true,
            "type": "module",
            "scripts": self.scripts,
            "dependencies": self.dependencies,
            "devDependencies": self.dev_dependencies,
        });
        let mut text = serde_json::to_string_pretty(&manifest).unwrap_or_else(|_| "{}".to_string());
        text.push('\n');
        text
    }

    /// Overlay the declared scripts and dependencies onto an existing
    /// `package.json`. Declared entries replace entries of the same name;
    /// every other key is kept. A manifest that is not a JSON object is
    /// replaced by [`Self::manifest`].
    pub fn merge_manifest(&self, existing: &str) -> String {
        let Ok(Value::Object(mut manifest)) = serde_json::from_str::<Value>(existing) else {
            tracing::warn!(exercise = %self.id, "package.json is not a JSON object; regenerating it");
            return self.manifest();
        };

        let sections = [
            ("scripts", &self.scripts),
            ("dependencies", &self.dependencies),
            ("devDependencies", &self.dev_dependencies),
        ];
        for (key, declared) in sections {
            if declared.is_empty() {
                continue;
            }
            let section = manifest
                .entry(key)
                .or_insert_with(|| Value::Object(Map::new()));
            if !section.is_object() {
                *section = Value::Object(Map::new());
            }
            if let Value::Object(section) = section {
                for (name, version) in declared {
                    section.insert(name.clone(), Value::String(version.clone()));
                }
            }
        }

        match serde_json::to_string_pretty(&Value::Object(manifest)) {
            Ok(mut text) => {
                text.push('\n');
                text
            }
            Err(_) => self.manifest(),
        }
    }
}

fn check_paths(id: &str, files: &[ExerciseFile]) -> Result<()> {
    let mut seen = HashSet::new();
    for file in files {
        if !file.path.starts_with('/') {
            return Err(PlaygroundError::InvalidExercise(format!(
                "{id}: path {} is not absolute",
                file.path
            )));
        }
        if !seen.insert(file.path.as_str()) {
            return Err(PlaygroundError::InvalidExercise(format!(
                "{id}: duplicate path {}",
                file.path
            )));
        }
    }
    Ok(())
}

fn resolve_all(files: &[ExerciseFile]) -> Result<FilesMap> {
    files
        .iter()
        .map(|file| Ok((file.path.clone(), file.resolve()?)))
        .collect()
}

/// npm package names are lowercase and URL-safe.
fn manifest_name(id: &str) -> String {
    let name: String = id
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    if name.is_empty() {
        "playground".to_string()
    } else {
        name
    }
}
