//! Canonical `.forge/` layout and `forge init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{ForgeConfig, write_config};

const FORGE_GITIGNORE: &str = "interactions.db*\nspecs/\nevents.jsonl\n";

/// All canonical paths within `.forge/` for a project root.
#[derive(Debug, Clone)]
pub struct ForgePaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub specs_dir: PathBuf,
    pub config_path: PathBuf,
    pub events_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl ForgePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".forge");
        Self {
            root: root.clone(),
            specs_dir: state_dir.join("specs"),
            config_path: state_dir.join("config.toml"),
            events_path: state_dir.join("events.jsonl"),
            gitignore_path: state_dir.join(".gitignore"),
            state_dir,
        }
    }

    /// Store location from config, resolved against the project root.
    pub fn store_path(&self, cfg: &ForgeConfig) -> PathBuf {
        if cfg.store_path.is_absolute() {
            cfg.store_path.clone()
        } else {
            self.root.join(&cfg.store_path)
        }
    }
}

/// Options for `init_forge`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config.
    pub force: bool,
}

/// Create `.forge/` scaffolding in `root` with a default config.
///
/// Fails if a config already exists unless `options.force` is set.
pub fn init_forge(root: &Path, options: &InitOptions) -> Result<ForgePaths> {
    let paths = ForgePaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!("forge init: .forge exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "forge init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    fs::create_dir_all(&paths.specs_dir)
        .with_context(|| format!("create {}", paths.specs_dir.display()))?;
    write_config(&paths.config_path, &ForgeConfig::default())?;
    if options.force || !paths.gitignore_path.exists() {
        fs::write(&paths.gitignore_path, FORGE_GITIGNORE)
            .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    }

    Ok(paths)
}
