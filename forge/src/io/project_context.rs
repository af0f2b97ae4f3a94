//! Bounded project summary fed into intake and the spec.

use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};
use walkdir::{DirEntry, WalkDir};

use crate::core::text::head;

const LISTING_DEPTH: usize = 2;
const README_BYTES: usize = 1_500;
const MANIFEST_BYTES: usize = 1_000;

const README_NAMES: &[&str] = &["README.md", "README", "readme.md", "README.txt"];
const MANIFEST_NAMES: &[&str] = &[
    "Cargo.toml",
    "package.json",
    "pyproject.toml",
    "go.mod",
    "Makefile",
    "justfile",
];
const SKIPPED_DIRS: &[&str] = &[".git", ".forge", "target", "node_modules", ".venv"];

/// Assemble a text summary of `root`, cut to `budget_bytes`.
///
/// Sections: shallow sorted file listing, README excerpt, known manifests.
#[instrument(skip_all, fields(root = %root.display(), budget_bytes))]
pub fn assemble_project_context(root: &Path, budget_bytes: usize) -> Result<String> {
    if !root.is_dir() {
        return Err(anyhow!("project path {} is not a directory", root.display()));
    }

    let mut out = String::from("Files:\n");
    for rel in list_files(root) {
        out.push_str("- ");
        out.push_str(&rel);
        out.push('\n');
    }

    if let Some((name, text)) = read_first(root, README_NAMES, README_BYTES) {
        out.push_str(&format!("\n{name}:\n{text}\n"));
    }
    for name in MANIFEST_NAMES {
        if let Some((name, text)) = read_first(root, &[*name], MANIFEST_BYTES) {
            out.push_str(&format!("\n{name}:\n{text}\n"));
        }
    }

    let summary = head(&out, budget_bytes).to_string();
    debug!(bytes = summary.len(), "project context assembled");
    Ok(summary)
}

fn list_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .max_depth(LISTING_DEPTH)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_skipped_dir(entry))
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .ok()
                .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    files
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

fn read_first(root: &Path, names: &[&str], max_bytes: usize) -> Option<(String, String)> {
    names.iter().find_map(|name| {
        let path = root.join(name);
        let text = fs::read_to_string(&path).ok()?;
        Some((name.to_string(), head(text.trim(), max_bytes).to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_files_readme_and_manifests() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("src/deep/er")).expect("mkdir");
        fs::create_dir_all(root.join("target")).expect("mkdir");
        fs::write(root.join("README.md"), "# Demo\nA demo app.").expect("write");
        fs::write(root.join("Cargo.toml"), "[package]\nname = \"demo\"").expect("write");
        fs::write(root.join("src/main.rs"), "fn main() {}").expect("write");
        fs::write(root.join("src/deep/er/hidden.rs"), "").expect("write");
        fs::write(root.join("target/junk"), "").expect("write");

        let summary = assemble_project_context(root, 10_000).expect("context");
        assert!(summary.starts_with("Files:\n- Cargo.toml\n- README.md\n- src/main.rs\n"));
        assert!(!summary.contains("hidden.rs"));
        assert!(!summary.contains("junk"));
        assert!(summary.contains("README.md:\n# Demo"));
        assert!(summary.contains("Cargo.toml:\n[package]"));
    }

    #[test]
    fn respects_budget() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("README.md"), "x".repeat(5_000)).expect("write");
        let summary = assemble_project_context(temp.path(), 100).expect("context");
        assert_eq!(summary.len(), 100);
    }

    #[test]
    fn missing_dir_is_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(assemble_project_context(&temp.path().join("nope"), 100).is_err());
    }
}
