use std::fmt;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One entry of a [`FileTree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileNode {
    File { contents: String },
    Directory(FileTree),
}

impl FileNode {
    pub fn file(contents: impl Into<String>) -> Self {
        Self::File {
            contents: contents.into(),
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::File { .. })
    }
}

/// The virtual file tree exchanged between the assistant, the UI and the sandbox.
///
/// Serialized as `{ [name]: { "file": { "contents": .. } } | <nested tree> }`.
/// Entries keep insertion order so explorers list files the way the
/// assistant produced them; mounting does not depend on it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    entries: Vec<(String, FileNode)>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("invalid path in file tree: {0:?}")]
    InvalidPath(String),
    #[error("path conflicts with an existing entry: {0:?}")]
    Conflict(String),
}

/// Splits a `/`-separated key into plain segments.
///
/// Empty and `.` segments are dropped; absolute paths, `..`, backslashes and
/// NUL bytes are rejected.
pub fn split_path(path: &str) -> Result<Vec<String>, TreeError> {
    if path.starts_with('/') || path.contains('\\') || path.contains('\0') {
        return Err(TreeError::InvalidPath(path.to_string()));
    }

    let mut out = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => return Err(TreeError::InvalidPath(path.to_string())),
            s => out.push(s.to_string()),
        }
    }

    if out.is_empty() {
        return Err(TreeError::InvalidPath(path.to_string()));
    }
    Ok(out)
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileNode)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, name: &str) -> Option<&FileNode> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut FileNode> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Inserts or replaces `name`. A replaced entry keeps its position.
    pub fn insert(&mut self, name: impl Into<String>, node: FileNode) -> Option<FileNode> {
        let name = name.into();
        if let Some(slot) = self.get_mut(&name) {
            return Some(std::mem::replace(slot, node));
        }
        self.entries.push((name, node));
        None
    }

    /// Contents of the file at a `/`-separated path.
    pub fn file(&self, path: &str) -> Option<&str> {
        let segments = split_path(path).ok()?;
        let (last, dirs) = segments.split_last()?;
        let mut cur = self;
        for seg in dirs {
            match cur.get(seg)? {
                FileNode::Directory(t) => cur = t,
                FileNode::File { .. } => return None,
            }
        }
        match cur.get(last)? {
            FileNode::File { contents } => Some(contents.as_str()),
            FileNode::Directory(_) => None,
        }
    }

    pub fn contains_file(&self, path: &str) -> bool {
        self.file(path).is_some()
    }

    /// Writes a file at a `/`-separated path, creating intermediate directories.
    pub fn set_file(&mut self, path: &str, contents: impl Into<String>) -> Result<(), TreeError> {
        let segments = split_path(path)?;
        self.merge_at(&segments, FileNode::file(contents), path)
    }

    /// All file paths, depth first, in insertion order.
    pub fn file_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, node) in &self.entries {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            match node {
                FileNode::File { .. } => out.push(path),
                FileNode::Directory(t) => t.collect_paths(&path, out),
            }
        }
    }

    /// Rewrites flat keys such as `src/index.js` into nested directories.
    ///
    /// The runtime cannot create directories from flat keys, so every tree is
    /// normalized before it is stored or mounted.
    pub fn normalized(&self) -> Result<FileTree, TreeError> {
        let mut out = FileTree::new();
        for (key, node) in &self.entries {
            let segments = split_path(key)?;
            let node = match node {
                FileNode::File { .. } => node.clone(),
                FileNode::Directory(t) => FileNode::Directory(t.normalized()?),
            };
            out.merge_at(&segments, node, key)?;
        }
        Ok(out)
    }

    fn merge_at(
        &mut self,
        segments: &[String],
        node: FileNode,
        full_path: &str,
    ) -> Result<(), TreeError> {
        let Some((first, rest)) = segments.split_first() else {
            return Err(TreeError::InvalidPath(full_path.to_string()));
        };

        if rest.is_empty() {
            let Some(slot) = self.get_mut(first) else {
                self.entries.push((first.clone(), node));
                return Ok(());
            };
            match (slot, node) {
                (FileNode::Directory(existing), FileNode::Directory(incoming)) => {
                    for (name, child) in incoming.entries {
                        existing.merge_at(std::slice::from_ref(&name), child, full_path)?;
                    }
                }
                (slot, node @ FileNode::File { .. }) if slot.is_file() => {
                    *slot = node;
                }
                _ => return Err(TreeError::Conflict(full_path.to_string())),
            }
            return Ok(());
        }

        if self.get(first).is_none() {
            self.entries
                .push((first.clone(), FileNode::Directory(FileTree::new())));
        }
        match self.get_mut(first) {
            Some(FileNode::Directory(dir)) => dir.merge_at(rest, node, full_path),
            _ => Err(TreeError::Conflict(full_path.to_string())),
        }
    }
}

struct FileBody<'a> {
    contents: &'a str,
}

impl Serialize for FileBody<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("contents", self.contents)?;
        map.end()
    }
}

impl Serialize for FileNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FileNode::File { contents } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("file", &FileBody { contents })?;
                map.end()
            }
            FileNode::Directory(tree) => tree.serialize(serializer),
        }
    }
}

impl Serialize for FileTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, node) in &self.entries {
            map.serialize_entry(name, node)?;
        }
        map.end()
    }
}

// Order-preserving intermediate form; serde_json's own map sorts keys.
enum Raw {
    Str(String),
    Map(Vec<(String, Raw)>),
    Other,
}

impl<'de> Deserialize<'de> for Raw {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RawVisitor;

        impl<'de> Visitor<'de> for RawVisitor {
            type Value = Raw;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a file tree value")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Raw, E> {
                Ok(Raw::Str(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Raw, E> {
                Ok(Raw::Str(v))
            }

            fn visit_bool<E: de::Error>(self, _: bool) -> Result<Raw, E> {
                Ok(Raw::Other)
            }

            fn visit_i64<E: de::Error>(self, _: i64) -> Result<Raw, E> {
                Ok(Raw::Other)
            }

            fn visit_u64<E: de::Error>(self, _: u64) -> Result<Raw, E> {
                Ok(Raw::Other)
            }

            fn visit_f64<E: de::Error>(self, _: f64) -> Result<Raw, E> {
                Ok(Raw::Other)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Raw, E> {
                Ok(Raw::Other)
            }

            fn visit_none<E: de::Error>(self) -> Result<Raw, E> {
                Ok(Raw::Other)
            }

            fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Raw, D::Error> {
                Raw::deserialize(d)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Raw, A::Error> {
                while seq.next_element::<Raw>()?.is_some() {}
                Ok(Raw::Other)
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Raw, A::Error> {
                let mut entries = Vec::new();
                while let Some((k, v)) = map.next_entry::<String, Raw>()? {
                    entries.push((k, v));
                }
                Ok(Raw::Map(entries))
            }
        }

        deserializer.deserialize_any(RawVisitor)
    }
}

fn file_contents(entries: &[(String, Raw)]) -> Option<String> {
    let [(key, Raw::Map(body))] = entries else {
        return None;
    };
    if key != "file" {
        return None;
    }
    body.iter().find_map(|(k, v)| match (k.as_str(), v) {
        ("contents", Raw::Str(s)) => Some(s.clone()),
        _ => None,
    })
}

fn tree_from_entries(entries: Vec<(String, Raw)>) -> Result<FileTree, String> {
    let mut tree = FileTree::new();
    for (name, raw) in entries {
        let Raw::Map(children) = raw else {
            return Err(format!("entry {name:?} must be an object"));
        };
        let node = if let Some(contents) = file_contents(&children) {
            FileNode::File { contents }
        } else if let [(key, Raw::Map(_))] = children.as_slice()
            && key == "directory"
        {
            let Some((_, Raw::Map(inner))) = children.into_iter().next() else {
                return Err(format!("entry {name:?} has an invalid directory"));
            };
            FileNode::Directory(tree_from_entries(inner)?)
        } else {
            FileNode::Directory(tree_from_entries(children)?)
        };
        tree.insert(name, node);
    }
    Ok(tree)
}

impl<'de> Deserialize<'de> for FileTree {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Map(entries) => tree_from_entries(entries).map_err(de::Error::custom),
            _ => Err(de::Error::custom("file tree must be an object")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_files_and_nested_trees_in_order() {
        let json = r#"{
            "server.js": { "file": { "contents": "require('express')" } },
            "public": { "index.html": { "file": { "contents": "<h1/>" } } },
            "assets": { "directory": { "a.css": { "file": { "contents": "" } } } }
        }"#;
        let tree: FileTree = serde_json::from_str(json).unwrap();

        assert_eq!(
            tree.file_paths(),
            vec!["server.js", "public/index.html", "assets/a.css"]
        );
        assert_eq!(tree.file("server.js"), Some("require('express')"));
        assert_eq!(tree.file("public/index.html"), Some("<h1/>"));
    }

    #[test]
    fn serializes_directories_as_bare_trees() {
        let mut tree = FileTree::new();
        tree.set_file("src/app.js", "x").unwrap();
        let out = serde_json::to_string(&tree).unwrap();
        assert_eq!(out, r#"{"src":{"app.js":{"file":{"contents":"x"}}}}"#);
    }

    #[test]
    fn rejects_non_object_entries() {
        let err = serde_json::from_str::<FileTree>(r#"{"a.js": "oops"}"#).unwrap_err();
        assert!(err.to_string().contains("must be an object"));
    }

    #[test]
    fn normalizes_flat_keys_into_directories() {
        let json = r#"{
            "src/index.js": { "file": { "contents": "1" } },
            "src/lib/util.js": { "file": { "contents": "2" } },
            "README.md": { "file": { "contents": "3" } }
        }"#;
        let tree: FileTree = serde_json::from_str(json).unwrap();
        let norm = tree.normalized().unwrap();

        assert_eq!(norm.len(), 2);
        assert!(matches!(norm.get("src"), Some(FileNode::Directory(_))));
        assert_eq!(
            norm.file_paths(),
            vec!["src/index.js", "src/lib/util.js", "README.md"]
        );
    }

    #[test]
    fn normalize_rejects_traversal_and_conflicts() {
        let mut tree = FileTree::new();
        tree.insert("../etc/passwd", FileNode::file("x"));
        assert!(matches!(tree.normalized(), Err(TreeError::InvalidPath(_))));

        let mut tree = FileTree::new();
        tree.insert("src", FileNode::file("x"));
        tree.insert("src/a.js", FileNode::file("y"));
        assert!(matches!(tree.normalized(), Err(TreeError::Conflict(_))));
    }

    #[test]
    fn set_file_replaces_in_place() {
        let mut tree = FileTree::new();
        tree.set_file("a.js", "1").unwrap();
        tree.set_file("b.js", "2").unwrap();
        tree.set_file("a.js", "3").unwrap();
        assert_eq!(tree.file_paths(), vec!["a.js", "b.js"]);
        assert_eq!(tree.file("a.js"), Some("3"));
    }

    #[test]
    fn split_path_drops_dot_segments() {
        assert_eq!(split_path("./src//a.js").unwrap(), vec!["src", "a.js"]);
        assert!(split_path("/abs").is_err());
        assert!(split_path("").is_err());
    }
}
