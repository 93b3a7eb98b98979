use livepane_process::{FileNode, FileTree};
use serde_json::json;

pub const MANIFEST_FILE: &str = "package.json";
const DEFAULT_ENTRY: &str = "server.js";
const FALLBACK_ENTRIES: [&str; 3] = ["index.js", "app.js", "main.js"];

/// Top-level file the synthesized manifest starts.
pub fn pick_entry(tree: &FileTree) -> &'static str {
    if tree.contains_file(DEFAULT_ENTRY) {
        return DEFAULT_ENTRY;
    }
    FALLBACK_ENTRIES
        .into_iter()
        .find(|name| tree.contains_file(name))
        .unwrap_or(DEFAULT_ENTRY)
}

pub fn default_manifest(entry: &str) -> String {
    let manifest = json!({
        "name": "generated-project",
        "version": "1.0.0",
        "main": entry,
        "scripts": { "start": format!("node {entry}") },
        "dependencies": { "express": "^4.18.2" },
    });
    serde_json::to_string_pretty(&manifest).unwrap_or_else(|_| "{}".to_string())
}

/// Adds a default `package.json` when the tree has none.
///
/// Returns the entry file the manifest points at when one was added.
pub fn ensure_manifest(tree: &mut FileTree) -> Option<&'static str> {
    if matches!(tree.get(MANIFEST_FILE), Some(FileNode::File { .. })) {
        return None;
    }
    let entry = pick_entry(tree);
    tree.insert(MANIFEST_FILE, FileNode::file(default_manifest(entry)));
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(json: &str) -> FileTree {
        serde_json::from_str(json).unwrap()
    }

    fn manifest(t: &FileTree) -> serde_json::Value {
        serde_json::from_str(t.file(MANIFEST_FILE).unwrap()).unwrap()
    }

    #[test]
    fn synthesizes_for_server_js() {
        let mut t = tree(r#"{"server.js":{"file":{"contents":"require('express')"}}}"#);
        assert_eq!(ensure_manifest(&mut t), Some("server.js"));

        let m = manifest(&t);
        assert_eq!(m["name"], "generated-project");
        assert_eq!(m["version"], "1.0.0");
        assert_eq!(m["main"], "server.js");
        assert_eq!(m["scripts"]["start"], "node server.js");
        assert_eq!(m["dependencies"]["express"], "^4.18.2");
        assert_eq!(t.file_paths(), vec!["server.js", "package.json"]);
    }

    #[test]
    fn falls_back_to_other_entry_files() {
        let mut t =
            tree(r#"{"README.md":{"file":{"contents":""}},"app.js":{"file":{"contents":""}}}"#);
        assert_eq!(ensure_manifest(&mut t), Some("app.js"));
        assert_eq!(manifest(&t)["scripts"]["start"], "node app.js");
    }

    #[test]
    fn defaults_to_server_js_without_candidates() {
        let mut t = tree(r#"{"src":{"index.js":{"file":{"contents":""}}}}"#);
        assert_eq!(ensure_manifest(&mut t), Some("server.js"));
    }

    #[test]
    fn leaves_existing_manifest_alone() {
        let mut t = tree(r#"{"package.json":{"file":{"contents":"{\"name\":\"mine\"}"}}}"#);
        assert_eq!(ensure_manifest(&mut t), None);
        assert_eq!(t.file(MANIFEST_FILE), Some("{\"name\":\"mine\"}"));
    }
}
