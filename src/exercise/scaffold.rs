//! Template scaffolds.
//!
//! Each exercise runs on one of three templates. A template contributes
//! default dependencies, scripts, a dev command and preview port, plus the
//! boilerplate files (manifest, build config, HTML entry, framework
//! bootstrap) an exercise needs but its author rarely writes. Scaffold files
//! only fill paths the exercise does not already provide.

use super::{Command, ExerciseConfig, ExerciseFile};
use crate::sync::FilesMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    /// Plain Node.js script.
    Node,
    /// React on Vite.
    #[default]
    React,
    /// Static HTML served as files.
    Static,
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TemplateKind::Node => "node",
            TemplateKind::React => "react",
            TemplateKind::Static => "static",
        })
    }
}

pub struct TemplateDefaults {
    pub dependencies: BTreeMap<String, String>,
    pub dev_dependencies: BTreeMap<String, String>,
    pub scripts: BTreeMap<String, String>,
    pub dev_command: Command,
    pub port: Option<u16>,
}

const REACT_PORT: u16 = 5173;
const STATIC_PORT: u16 = 3000;

fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

pub fn defaults(kind: TemplateKind) -> TemplateDefaults {
    let dev_command = Command::new("npm", ["run", "dev"]);
    match kind {
        TemplateKind::Node => TemplateDefaults {
            dependencies: BTreeMap::new(),
            dev_dependencies: BTreeMap::new(),
            scripts: map(&[("dev", "node index.js")]),
            dev_command,
            port: None,
        },
        TemplateKind::React => TemplateDefaults {
            dependencies: map(&[("react", "^18.3.1"), ("react-dom", "^18.3.1")]),
            dev_dependencies: map(&[("@vitejs/plugin-react", "^4.3.1"), ("vite", "^5.4.0")]),
            scripts: map(&[("dev", "vite --port 5173 --strictPort")]),
            dev_command,
            port: Some(REACT_PORT),
        },
        TemplateKind::Static => TemplateDefaults {
            dependencies: BTreeMap::new(),
            dev_dependencies: map(&[("serve", "^14.2.3")]),
            scripts: map(&[("dev", "serve -l 3000 .")]),
            dev_command,
            port: Some(STATIC_PORT),
        },
    }
}

const NODE_INDEX: &str = "console.log('Hello from the playground!');\n";

const REACT_VITE_CONFIG: &str = "import { defineConfig } from 'vite';
import react from '@vitejs/plugin-react';

export default defineConfig({
  plugins: [react()],
});
";

const REACT_INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <title>Playground</title>
  </head>
  <body>
    <div id="root"></div>
    <script type="module" src="/src/main.jsx"></script>
  </body>
</html>
"#;

const REACT_MAIN: &str = "import React from 'react';
import ReactDOM from 'react-dom/client';
import App from './App.jsx';

ReactDOM.createRoot(document.getElementById('root')).render(
  <React.StrictMode>
    <App />
  </React.StrictMode>,
);
";

const REACT_APP: &str = "export default function App() {
  return <h1>Hello from the playground!</h1>;
}
";

const STATIC_INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <title>Playground</title>
  </head>
  <body>
    <h1>Hello from the playground!</h1>
  </body>
</html>
"#;

/// Scaffold files for a config's template. Boilerplate is hidden; entry
/// points the learner edits stay visible.
pub fn scaffold_files(config: &ExerciseConfig) -> Vec<ExerciseFile> {
    let manifest = ExerciseFile::inline("/package.json", config.manifest()).hidden();
    match config.template {
        TemplateKind::Node => vec![manifest, ExerciseFile::inline("/index.js", NODE_INDEX)],
        TemplateKind::React => vec![
            manifest,
            ExerciseFile::inline("/vite.config.js", REACT_VITE_CONFIG).hidden(),
            ExerciseFile::inline("/index.html", REACT_INDEX_HTML).hidden(),
            ExerciseFile::inline("/src/main.jsx", REACT_MAIN).hidden(),
            ExerciseFile::inline("/src/App.jsx", REACT_APP),
        ],
        TemplateKind::Static => vec![manifest, ExerciseFile::inline("/index.html", STATIC_INDEX_HTML)],
    }
}

/// Append scaffold files whose paths the config does not provide. Returns
/// how many were added.
pub fn merge_into_config(config: &mut ExerciseConfig) -> usize {
    let missing: Vec<ExerciseFile> = scaffold_files(config)
        .into_iter()
        .filter(|file| config.file(&file.path).is_none())
        .collect();
    let added = missing.len();
    config.files.extend(missing);
    added
}

/// Fill a files map with scaffold content for absent paths. Returns how many
/// were added.
pub fn fill_missing(files: &mut FilesMap, config: &ExerciseConfig) -> usize {
    let mut added = 0;
    for file in scaffold_files(config) {
        if files.contains_key(&file.path) {
            continue;
        }
        if let super::FileContent::Inline(text) = file.content {
            files.insert(file.path, text);
            added += 1;
        }
    }
    added
}
