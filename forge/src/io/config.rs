//! Forge configuration stored under `.forge/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::controller::DEFAULT_MAX_ITERATIONS;
use crate::core::playbook::default_topics;
use crate::io::process::ProcessLimits;

/// Forge configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForgeConfig {
    /// Iterations per task before escalating to a human.
    pub max_iterations: u32,

    /// Maximum number of topic-specific playbooks embedded in a spec.
    pub playbook_limit: usize,

    /// Interaction store location, relative to the project root.
    pub store_path: PathBuf,

    /// Byte budget for the assembled project context.
    pub project_context_bytes: usize,

    pub executor: ExecutorConfig,
    pub tests: TestsConfig,
    pub oracle: OracleConfig,
    pub mining: MiningConfig,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            playbook_limit: 3,
            store_path: PathBuf::from(".forge/interactions.db"),
            project_context_bytes: 6_000,
            executor: ExecutorConfig::default(),
            tests: TestsConfig::default(),
            oracle: OracleConfig::default(),
            mining: MiningConfig::default(),
        }
    }
}

/// Which agent backend runs each iteration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Batch,
    Interactive,
    Stub,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub backend: Backend,
    /// Hard wall-clock limit per agent invocation.
    pub timeout_secs: u64,
    /// Bytes of agent stdout/stderr retained (tail).
    pub output_limit_bytes: usize,
    pub batch: BatchConfig,
    pub interactive: InteractiveConfig,
    pub stub: StubConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Batch,
            timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
            batch: BatchConfig::default(),
            interactive: InteractiveConfig::default(),
            stub: StubConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn limits(&self) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_secs(self.timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
        }
    }
}

/// Non-interactive CLI agent invoked with the spec artifact path.
///
/// `args` may contain `{spec_path}`, `{model}` and `{workdir}` placeholders.
/// Target directories are appended after the arguments, each preceded by
/// `target_flag` when one is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatchConfig {
    pub program: String,
    pub args: Vec<String>,
    pub model: String,
    pub target_dirs: Vec<String>,
    /// Flag placed before each target directory (e.g. `--target`).
    pub target_flag: Option<String>,
    /// Extra environment for the agent (credentials and the like).
    pub env: BTreeMap<String, String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            program: "aider".to_string(),
            args: vec![
                "--yes-always".to_string(),
                "--message-file".to_string(),
                "{spec_path}".to_string(),
                "--model".to_string(),
                "{model}".to_string(),
            ],
            model: "sonnet".to_string(),
            target_dirs: vec![".".to_string()],
            target_flag: None,
            env: BTreeMap::new(),
        }
    }
}

/// Single-shot agent-mode CLI fed the instruction prompt and spec on stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InteractiveConfig {
    pub program: String,
    /// Same placeholders as [`BatchConfig::args`], plus `{prompt}` for the
    /// rendered instruction. The instruction and spec JSON are always sent on stdin.
    pub args: Vec<String>,
    pub model: String,
    /// Optional live-preview side process started for the duration of a run.
    pub preview_command: Vec<String>,
    /// URL reported as `serve_web_url` when the preview started.
    pub preview_url: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for InteractiveConfig {
    fn default() -> Self {
        Self {
            program: "codex".to_string(),
            args: vec![
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
                "--model".to_string(),
                "{model}".to_string(),
                "-".to_string(),
            ],
            model: "gpt-5-codex".to_string(),
            preview_command: Vec::new(),
            preview_url: None,
            env: BTreeMap::new(),
        }
    }
}

/// Canned result returned by the stub backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StubConfig {
    pub pass: bool,
    pub output: String,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            pass: true,
            output: "stub executor: all tests passed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestsConfig {
    /// Shell command run through `sh -c` in the project directory.
    pub command: String,
    pub timeout_secs: u64,
    /// Bytes of test output retained per stream (tail).
    pub output_limit_bytes: usize,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            command: "make test".to_string(),
            timeout_secs: 120,
            output_limit_bytes: 8_000,
        }
    }
}

impl TestsConfig {
    pub fn limits(&self) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_secs(self.timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
        }
    }
}

/// Reasoning oracle command. The prompt is written to its stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    pub command: Vec<String>,
    /// Flag used to pass `max_tokens` (e.g. `--max-tokens`); omitted when unset.
    pub max_tokens_flag: Option<String>,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
                "-".to_string(),
            ],
            max_tokens_flag: None,
            max_tokens: 1_024,
            timeout_secs: 120,
            output_limit_bytes: 64_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MiningConfig {
    /// Topic keywords used to cluster tasks into playbooks.
    pub topics: Vec<String>,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            topics: default_topics(),
        }
    }
}

impl ForgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.executor.timeout_secs == 0 {
            return Err(anyhow!("executor.timeout_secs must be > 0"));
        }
        if self.executor.output_limit_bytes == 0 {
            return Err(anyhow!("executor.output_limit_bytes must be > 0"));
        }
        if self.tests.timeout_secs == 0 {
            return Err(anyhow!("tests.timeout_secs must be > 0"));
        }
        if self.tests.output_limit_bytes == 0 {
            return Err(anyhow!("tests.output_limit_bytes must be > 0"));
        }
        if self.tests.command.trim().is_empty() {
            return Err(anyhow!("tests.command must be non-empty"));
        }
        match self.executor.backend {
            Backend::Batch if self.executor.batch.program.trim().is_empty() => {
                return Err(anyhow!("executor.batch.program must be non-empty"));
            }
            Backend::Interactive if self.executor.interactive.program.trim().is_empty() => {
                return Err(anyhow!("executor.interactive.program must be non-empty"));
            }
            _ => {}
        }
        if self.oracle.command.is_empty() || self.oracle.command[0].trim().is_empty() {
            return Err(anyhow!("oracle.command must be a non-empty array"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForgeConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForgeConfig> {
    if !path.exists() {
        let cfg = ForgeConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForgeConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ForgeConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` to a sibling temp file, then rename over `path`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
