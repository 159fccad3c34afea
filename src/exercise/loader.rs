//! Filesystem-backed exercise loader.
//!
//! Layout of one exercise under the exercises root:
//!
//! ```text
//! <root>/<id>/exercise.json   descriptor
//! <root>/<id>/**              exercise files, mounted at /<relative path>
//! <root>/<id>/solution/**     optional solution, same relative layout
//! ```
//!
//! Hidden entries (dot-files) are skipped everywhere.

use super::scaffold;
use super::{Command, ExerciseConfig, ExerciseFile, FileContent, TemplateKind};
use crate::error::{PlaygroundError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

pub const DESCRIPTOR_FILE: &str = "exercise.json";
pub const SOLUTION_DIR: &str = "solution";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    template: TemplateKind,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
    #[serde(default)]
    dev_command: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    focus: Option<String>,
    /// Per-file overrides keyed by absolute path.
    #[serde(default)]
    files: BTreeMap<String, FileOverride>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileOverride {
    #[serde(default)]
    hidden: bool,
    #[serde(default)]
    read_only: bool,
    /// Content source relative to the exercise directory.
    #[serde(default)]
    from: Option<String>,
}

pub struct ExerciseLoader {
    root: PathBuf,
}

impl ExerciseLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ids of every directory under the root that holds a descriptor.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| {
            PlaygroundError::Config(format!(
                "cannot read exercises dir {}: {e}",
                self.root.display()
            ))
        })?;

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(DESCRIPTOR_FILE).is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|id| !id.starts_with('.'))
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn load(&self, id: &str) -> Result<ExerciseConfig> {
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            return Err(PlaygroundError::ExerciseNotFound(id.to_string()));
        }

        let dir = self.root.join(id);
        let descriptor_path = dir.join(DESCRIPTOR_FILE);
        if !dir.is_dir() || !descriptor_path.is_file() {
            tracing::debug!(id, dir = %dir.display(), "Exercise directory or descriptor missing");
            return Err(PlaygroundError::ExerciseNotFound(id.to_string()));
        }

        let raw = std::fs::read_to_string(&descriptor_path)
            .map_err(|_| PlaygroundError::ExerciseNotFound(id.to_string()))?;
        let descriptor: Descriptor = serde_json::from_str(&raw).map_err(|e| {
            PlaygroundError::InvalidExercise(format!("{id}: {DESCRIPTOR_FILE}: {e}"))
        })?;

        let mut config = ExerciseConfig::new(id, descriptor.template);
        if let Some(title) = descriptor.title {
            config.title = title;
        }
        config.description = descriptor.description;
        config.dependencies.extend(descriptor.dependencies);
        config.dev_dependencies.extend(descriptor.dev_dependencies);
        config.scripts.extend(descriptor.scripts);
        if let Some(line) = &descriptor.dev_command {
            config.dev_command = Command::parse(line).ok_or_else(|| {
                PlaygroundError::InvalidExercise(format!("{id}: devCommand is blank"))
            })?;
        }
        if descriptor.port.is_some() {
            config.preview_port = descriptor.port;
        }
        config.focus = descriptor.focus;

        config.files = collect(&dir, true)?;
        let solution_dir = dir.join(SOLUTION_DIR);
        if solution_dir.is_dir() {
            config.solution = Some(collect(&solution_dir, false)?);
        }

        apply_overrides(&mut config, &dir, descriptor.files)?;
        let added = scaffold::merge_into_config(&mut config);
        config.validate()?;

        tracing::info!(
            id,
            template = %config.template,
            files = config.files.len(),
            scaffolded = added,
            solution = config.solution.is_some(),
            "Loaded exercise"
        );
        Ok(config)
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// Read every file under `base` as an inline exercise file. The exercise
/// root also skips its descriptor and solution directory.
fn collect(base: &Path, exercise_root: bool) -> Result<Vec<ExerciseFile>> {
    let walker = WalkDir::new(base)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if is_hidden(entry) {
                return false;
            }
            if exercise_root && entry.depth() == 1 {
                let name = entry.file_name();
                return name != DESCRIPTOR_FILE && name != SOLUTION_DIR;
            }
            true
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| PlaygroundError::InvalidExercise(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(path) = sandbox_path(base, entry.path()) else {
            continue;
        };
        match std::fs::read_to_string(entry.path()) {
            Ok(text) => files.push(ExerciseFile::inline(path, text)),
            Err(e) => {
                tracing::warn!(file = %entry.path().display(), error = %e, "Skipping unreadable exercise file");
            }
        }
    }
    Ok(files)
}

/// `/`-joined absolute path of `file` relative to `base`.
fn sandbox_path(base: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(base).ok()?;
    let segments: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(format!("/{}", segments.join("/")))
}

fn apply_overrides(
    config: &mut ExerciseConfig,
    dir: &Path,
    overrides: BTreeMap<String, FileOverride>,
) -> Result<()> {
    for (path, over) in overrides {
        let content = match &over.from {
            Some(from) => Some(FileContent::External(external_source(&config.id, dir, from)?)),
            None => None,
        };

        match config.files.iter_mut().find(|file| file.path == path) {
            Some(file) => {
                file.hidden = over.hidden;
                file.read_only = over.read_only;
                if let Some(content) = content {
                    file.content = content;
                }
            }
            None => {
                let Some(content) = content else {
                    return Err(PlaygroundError::InvalidExercise(format!(
                        "{}: override for {path} names no file and has no source",
                        config.id
                    )));
                };
                config.files.push(ExerciseFile {
                    path,
                    content,
                    hidden: over.hidden,
                    read_only: over.read_only,
                });
            }
        }
    }
    Ok(())
}

/// Resolve a `from` reference; it must exist and stay inside the exercise
/// directory.
fn external_source(id: &str, dir: &Path, from: &str) -> Result<PathBuf> {
    let invalid = |why: &str| PlaygroundError::InvalidExercise(format!("{id}: source {from} {why}"));

    let base = dir.canonicalize().map_err(|_| invalid("has no exercise directory"))?;
    let source = dir
        .join(from)
        .canonicalize()
        .map_err(|_| PlaygroundError::FileNotFound(from.to_string()))?;
    if !source.starts_with(&base) {
        return Err(invalid("escapes the exercise directory"));
    }
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn fixture() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(
            root,
            "counter/exercise.json",
            r#"{
                "title": "Counter",
                "description": "Build a counter",
                "dependencies": { "clsx": "^2.1.0" },
                "focus": "/src/App.jsx",
                "files": {
                    "/src/styles.css": { "readOnly": true },
                    "/notes.md": { "hidden": true, "from": "docs/notes.md" }
                }
            }"#,
        );
        write(root, "counter/src/App.jsx", "export default () => null;\n");
        write(root, "counter/src/styles.css", "body {}\n");
        write(root, "counter/docs/notes.md", "# notes\n");
        write(root, "counter/.DS_Store", "junk");
        write(root, "counter/solution/src/App.jsx", "export default () => 1;\n");

        write(
            root,
            "hello/exercise.json",
            r#"{ "template": "node", "devCommand": "node index.js" }"#,
        );
        write(root, "hello/index.js", "console.log(1);\n");
        fs::create_dir_all(root.join("not-an-exercise")).unwrap();
        tmp
    }

    #[test]
    fn list_returns_sorted_exercise_ids() {
        let tmp = fixture();
        let loader = ExerciseLoader::new(tmp.path());
        assert_eq!(loader.list().unwrap(), vec!["counter", "hello"]);
    }

    #[test]
    fn load_collects_files_and_solution() {
        let tmp = fixture();
        let config = ExerciseLoader::new(tmp.path()).load("counter").unwrap();

        assert_eq!(config.title, "Counter");
        assert_eq!(config.template, TemplateKind::React);
        assert!(config.dependencies.contains_key("clsx"));
        assert!(config.dependencies.contains_key("react"));
        assert_eq!(config.initial_focus().as_deref(), Some("/src/App.jsx"));

        assert!(config.file("/exercise.json").is_none());
        assert!(config.file("/.DS_Store").is_none());
        assert!(config.file("/solution/src/App.jsx").is_none());
        assert!(config.is_read_only("/src/styles.css"));

        let solution = config.solution.as_ref().unwrap();
        assert_eq!(solution.len(), 1);
        assert_eq!(solution[0].path, "/src/App.jsx");
    }

    #[test]
    fn author_files_are_kept_and_scaffold_fills_the_rest() {
        let tmp = fixture();
        let config = ExerciseLoader::new(tmp.path()).load("counter").unwrap();

        let app = config.file("/src/App.jsx").unwrap();
        assert_eq!(
            app.content,
            FileContent::Inline("export default () => null;\n".to_string())
        );
        for scaffolded in ["/package.json", "/vite.config.js", "/index.html", "/src/main.jsx"] {
            assert!(config.file(scaffolded).is_some(), "missing {scaffolded}");
        }
    }

    #[test]
    fn from_override_becomes_external_content() {
        let tmp = fixture();
        let config = ExerciseLoader::new(tmp.path()).load("counter").unwrap();
        let notes = config.file("/notes.md").unwrap();
        assert!(notes.hidden);
        assert!(matches!(notes.content, FileContent::External(_)));
        assert_eq!(notes.resolve().unwrap(), "# notes\n");
    }

    #[test]
    fn node_template_uses_descriptor_dev_command() {
        let tmp = fixture();
        let config = ExerciseLoader::new(tmp.path()).load("hello").unwrap();
        assert_eq!(config.template, TemplateKind::Node);
        assert_eq!(config.dev_command.to_string(), "node index.js");
        assert_eq!(config.preview_port, None);
        assert!(!config.has_dependencies());
        assert!(config.solution.is_none());
    }

    #[test]
    fn missing_exercise_or_descriptor_is_not_found() {
        let tmp = fixture();
        let loader = ExerciseLoader::new(tmp.path());
        for id in ["nope", "not-an-exercise", "../counter"] {
            assert!(
                matches!(loader.load(id), Err(PlaygroundError::ExerciseNotFound(_))),
                "{id}"
            );
        }
    }

    #[test]
    fn source_outside_exercise_is_rejected() {
        let tmp = fixture();
        write(tmp.path(), "secret.txt", "s");
        write(
            tmp.path(),
            "escape/exercise.json",
            r#"{ "template": "node", "files": { "/leak.txt": { "from": "../secret.txt" } } }"#,
        );
        let err = ExerciseLoader::new(tmp.path()).load("escape").unwrap_err();
        assert!(matches!(err, PlaygroundError::InvalidExercise(_)));
    }

    #[test]
    fn malformed_descriptor_is_invalid() {
        let tmp = fixture();
        write(tmp.path(), "broken/exercise.json", "{ not json");
        let err = ExerciseLoader::new(tmp.path()).load("broken").unwrap_err();
        assert!(matches!(err, PlaygroundError::InvalidExercise(_)));
    }
}
