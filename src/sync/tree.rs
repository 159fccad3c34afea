//! Hierarchical file tree built from a flat `path → content` map.
//!
//! The serialized form matches the mount format sandboxes expect:
//!
//! ```json
//! { "a.txt": { "file": { "contents": "1" } },
//!   "x": { "directory": { "b.txt": { "file": { "contents": "2" } } } } }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flat mapping from absolute path to file content.
pub type FilesMap = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileNode {
    File { contents: String },
    Directory(FileTree),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTree {
    entries: BTreeMap<String, FileNode>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Direct children, sorted by name.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &FileNode)> {
        self.entries.iter().map(|(name, node)| (name.as_str(), node))
    }

    /// Look up a node by absolute path.
    pub fn get(&self, path: &str) -> Option<&FileNode> {
        let mut segments = split_path(path).peekable();
        let mut current = self;
        while let Some(segment) = segments.next() {
            let node = current.entries.get(segment)?;
            if segments.peek().is_none() {
                return Some(node);
            }
            match node {
                FileNode::Directory(tree) => current = tree,
                FileNode::File { .. } => return None,
            }
        }
        None
    }

    /// Place `contents` at `path`, creating intermediate directories.
    ///
    /// A file standing where a directory is needed is replaced by the
    /// directory.
    pub fn insert(&mut self, path: &str, contents: impl Into<String>) {
        let segments: Vec<&str> = split_path(path).collect();
        let Some((leaf, parents)) = segments.split_last() else {
            tracing::warn!(path, "Skipping file with empty path");
            return;
        };

        let mut current = self;
        for segment in parents {
            let node = current
                .entries
                .entry((*segment).to_string())
                .or_insert_with(|| FileNode::Directory(FileTree::new()));
            if let FileNode::File { .. } = node {
                tracing::warn!(path, segment, "File replaced by directory in tree");
                *node = FileNode::Directory(FileTree::new());
            }
            current = match node {
                FileNode::Directory(tree) => tree,
                FileNode::File { .. } => unreachable!("replaced above"),
            };
        }

        current.entries.insert(
            (*leaf).to_string(),
            FileNode::File {
                contents: contents.into(),
            },
        );
    }

    /// Flatten back into absolute paths.
    pub fn flatten(&self) -> FilesMap {
        let mut files = FilesMap::new();
        self.flatten_into("", &mut files);
        files
    }

    fn flatten_into(&self, prefix: &str, files: &mut FilesMap) {
        for (name, node) in &self.entries {
            let path = format!("{prefix}/{name}");
            match node {
                FileNode::File { contents } => {
                    files.insert(path, contents.clone());
                }
                FileNode::Directory(tree) => tree.flatten_into(&path, files),
            }
        }
    }

    pub fn file_count(&self) -> usize {
        self.entries
            .values()
            .map(|node| match node {
                FileNode::File { .. } => 1,
                FileNode::Directory(tree) => tree.file_count(),
            })
            .sum()
    }
}

/// Build the tree for a files map. Identical input yields identical trees.
pub fn to_tree(files: &FilesMap) -> FileTree {
    let mut tree = FileTree::new();
    for (path, contents) in files {
        tree.insert(path, contents.as_str());
    }
    tree
}

pub(crate) fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

/// Normalize to a single leading `/` without trailing separators.
pub fn normalize_path(path: &str) -> String {
    let joined = split_path(path).collect::<Vec<_>>().join("/");
    format!("/{joined}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FilesMap {
        FilesMap::from([
            ("/a.txt".to_string(), "1".to_string()),
            ("/x/b.txt".to_string(), "2".to_string()),
            ("/x/y/c.txt".to_string(), "3".to_string()),
        ])
    }

    #[test]
    fn flatten_recovers_original_map() {
        let files = sample();
        assert_eq!(to_tree(&files).flatten(), files);
    }

    #[test]
    fn shared_prefix_shares_directory_node() {
        let tree = to_tree(&sample());
        let names: Vec<&str> = tree.entries().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["a.txt", "x"]);

        let Some(FileNode::Directory(x)) = tree.get("/x") else {
            panic!("expected directory at /x");
        };
        let names: Vec<&str> = x.entries().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["b.txt", "y"]);
    }

    #[test]
    fn deterministic() {
        assert_eq!(to_tree(&sample()), to_tree(&sample()));
        assert_eq!(to_tree(&sample()).file_count(), 3);
    }

    #[test]
    fn serializes_in_mount_format() {
        let files = FilesMap::from([("/x/b.txt".to_string(), "2".to_string())]);
        let json = serde_json::to_value(to_tree(&files)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "x": { "directory": { "b.txt": { "file": { "contents": "2" } } } } })
        );
    }

    #[test]
    fn get_resolves_nested_files() {
        let tree = to_tree(&sample());
        assert_eq!(
            tree.get("/x/y/c.txt"),
            Some(&FileNode::File {
                contents: "3".to_string()
            })
        );
        assert!(tree.get("/a.txt/nope").is_none());
        assert!(tree.get("/missing").is_none());
    }

    #[test]
    fn normalize_collapses_separators() {
        assert_eq!(normalize_path("src//main.js/"), "/src/main.js");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("./a"), "/a");
    }
}
