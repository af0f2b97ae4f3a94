//! Task-scoped spec artifacts under `.forge/specs/<task_id>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::TaskSpec;
use crate::io::config::write_atomic;
use crate::io::prompt::PromptEngine;

/// Artifact paths for one task.
#[derive(Debug, Clone)]
pub struct SpecPaths {
    pub dir: PathBuf,
    pub json_path: PathBuf,
    pub markdown_path: PathBuf,
}

impl SpecPaths {
    pub fn new(specs_dir: &Path, task_id: &str) -> Self {
        let dir = specs_dir.join(task_id);
        Self {
            json_path: dir.join("spec.json"),
            markdown_path: dir.join("spec.md"),
            dir,
        }
    }
}

/// Write (or overwrite) the JSON and Markdown artifacts for `spec`.
pub fn write_spec(specs_dir: &Path, spec: &TaskSpec, prompts: &PromptEngine) -> Result<SpecPaths> {
    let paths = SpecPaths::new(specs_dir, &spec.task_id);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create spec dir {}", paths.dir.display()))?;

    let mut json = serde_json::to_string_pretty(spec).context("serialize spec")?;
    json.push('\n');
    write_atomic(&paths.json_path, &json)?;
    write_atomic(&paths.markdown_path, &prompts.render_spec_markdown(spec)?)?;

    debug!(
        task_id = %spec.task_id,
        version = spec.version,
        path = %paths.json_path.display(),
        "spec artifact written"
    );
    Ok(paths)
}

/// Load a previously written spec artifact.
pub fn read_spec(path: &Path) -> Result<TaskSpec> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read spec {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse spec {}", path.display()))
}
