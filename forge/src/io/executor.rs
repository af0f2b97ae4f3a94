//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples the orchestration loop from the actual
//! agent backend. Backends never return errors: spawn failures, non-zero
//! exits, timeouts and cancellation all become failed [`ExecutionResult`]s.
//! Tests use scripted executors that return predetermined results without
//! spawning processes.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::classifier::{AGENT_TAIL_BYTES, classify_output};
use crate::core::text::tail;
use crate::core::types::{ExecStatus, ExecutionResult, TaskSpec, TestResults};
use crate::io::config::{
    Backend, BatchConfig, ExecutorConfig, InteractiveConfig, StubConfig,
};
use crate::io::process::{
    BackgroundProcess, CommandOutput, ProcessLimits, run_command_with_timeout,
};
use crate::io::prompt::PromptEngine;

/// Parameters for one executor invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub spec: TaskSpec,
    /// Spec artifact written before the call.
    pub spec_path: PathBuf,
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub cancel: Option<CancelToken>,
}

impl ExecRequest {
    fn limits(&self) -> ProcessLimits {
        ProcessLimits {
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        }
    }
}

/// Abstraction over agent execution backends.
pub trait Executor {
    /// Short backend name for logs and events.
    fn name(&self) -> &'static str;

    /// Run the agent once against `request.spec`.
    fn execute(&self, request: &ExecRequest) -> ExecutionResult;
}

/// Construct the backend selected in config.
pub fn build_executor(config: &ExecutorConfig) -> Result<Box<dyn Executor>> {
    let executor: Box<dyn Executor> = match config.backend {
        Backend::Batch => Box::new(BatchCliExecutor::new(config.batch.clone())),
        Backend::Interactive => Box::new(InteractiveExecutor::new(config.interactive.clone())?),
        Backend::Stub => Box::new(StubExecutor::new(config.stub.clone())),
    };
    debug!(backend = executor.name(), "executor ready");
    Ok(executor)
}

/// Substitute `{spec_path}`, `{model}`, `{workdir}` and `{prompt}` in `args`.
fn expand_args(args: &[String], request: &ExecRequest, model: &str, prompt: &str) -> Vec<String> {
    args.iter()
        .map(|arg| {
            arg.replace("{spec_path}", &request.spec_path.display().to_string())
                .replace("{model}", model)
                .replace("{workdir}", &request.workdir.display().to_string())
                .replace("{prompt}", prompt)
        })
        .collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Turn a finished agent process into a result.
///
/// A clean exit is `completed` with the classified output tail; everything
/// else is `failed` with an explicit error.
fn result_from_output(
    backend: &str,
    request: &ExecRequest,
    output: &CommandOutput,
    duration_ms: u64,
) -> ExecutionResult {
    let combined = output.combined_lossy();
    let excerpt = tail(&combined, AGENT_TAIL_BYTES).to_string();
    let task_id = request.spec.task_id.as_str();

    let failure = if output.timed_out {
        Some(format!(
            "{backend} agent timed out after {:?}",
            request.timeout
        ))
    } else if output.cancelled {
        Some(format!("{backend} agent cancelled"))
    } else if !output.status.success() {
        Some(format!(
            "{backend} agent exited with status {:?}",
            output.status.code()
        ))
    } else {
        None
    };

    let (status, test_results) = match failure {
        Some(error) => {
            warn!(task_id, error = %error, "agent run failed");
            let detail = if excerpt.trim().is_empty() {
                error
            } else {
                format!("{error}\n{}", excerpt.trim_end())
            };
            (ExecStatus::Failed, TestResults::failed(detail, excerpt))
        }
        None => {
            let passed = classify_output(&excerpt);
            debug!(task_id, passed, "agent output classified");
            (
                ExecStatus::Completed,
                TestResults {
                    passed,
                    error: None,
                    output: excerpt,
                },
            )
        }
    };

    ExecutionResult {
        task_id: task_id.to_string(),
        status,
        test_results,
        duration_ms,
        stdout: Some(output.stdout_lossy()),
        stderr: Some(output.stderr_lossy()),
        serve_web_url: None,
        stub: false,
    }
}

/// Non-interactive CLI agent handed the spec artifact path.
#[derive(Debug, Clone)]
pub struct BatchCliExecutor {
    config: BatchConfig,
}

impl BatchCliExecutor {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &ExecRequest) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(expand_args(&self.config.args, request, &self.config.model, ""));
        for dir in &self.config.target_dirs {
            if let Some(flag) = &self.config.target_flag {
                cmd.arg(flag);
            }
            cmd.arg(dir);
        }
        cmd.envs(&self.config.env).current_dir(&request.workdir);
        cmd
    }
}

impl Executor for BatchCliExecutor {
    fn name(&self) -> &'static str {
        "batch"
    }

    #[instrument(skip_all, fields(task_id = %request.spec.task_id, program = %self.config.program))]
    fn execute(&self, request: &ExecRequest) -> ExecutionResult {
        info!(workdir = %request.workdir.display(), "starting batch agent");
        let started = Instant::now();
        let output = run_command_with_timeout(
            self.command(request),
            None,
            request.limits(),
            request.cancel.as_ref(),
        );
        let duration_ms = elapsed_ms(started);
        match output {
            Ok(output) => result_from_output(self.name(), request, &output, duration_ms),
            Err(err) => ExecutionResult::failed(
                &request.spec.task_id,
                format!("batch agent could not start: {err:#}"),
                duration_ms,
            ),
        }
    }
}

/// Single-shot agent-mode CLI fed an instruction and the spec on stdin.
///
/// Optionally keeps a preview process alive while the agent runs.
pub struct InteractiveExecutor {
    config: InteractiveConfig,
    prompts: PromptEngine,
}

impl InteractiveExecutor {
    pub fn new(config: InteractiveConfig) -> Result<Self> {
        Ok(Self {
            config,
            prompts: PromptEngine::new()?,
        })
    }

    fn start_preview(&self, workdir: &Path) -> Option<BackgroundProcess> {
        let (program, args) = self.config.preview_command.split_first()?;
        let mut cmd = Command::new(program);
        cmd.args(args).envs(&self.config.env).current_dir(workdir);
        match BackgroundProcess::spawn(cmd) {
            Ok(process) => {
                info!(pid = process.id(), "preview started");
                Some(process)
            }
            Err(err) => {
                warn!(err = %err, "preview failed to start, continuing without it");
                None
            }
        }
    }

    fn stdin_payload(&self, request: &ExecRequest, instruction: &str) -> Result<String> {
        let spec_json =
            serde_json::to_string_pretty(&request.spec).context("serialize spec for agent")?;
        Ok(format!("{instruction}\n\n```json\n{spec_json}\n```\n"))
    }
}

impl Executor for InteractiveExecutor {
    fn name(&self) -> &'static str {
        "interactive"
    }

    #[instrument(skip_all, fields(task_id = %request.spec.task_id, program = %self.config.program))]
    fn execute(&self, request: &ExecRequest) -> ExecutionResult {
        info!(workdir = %request.workdir.display(), "starting interactive agent");
        let started = Instant::now();

        let prepared = self
            .prompts
            .render_agent_instruction(&request.spec, &request.spec_path, &request.workdir)
            .and_then(|instruction| {
                let stdin = self.stdin_payload(request, &instruction)?;
                Ok((instruction, stdin))
            });
        let (instruction, stdin) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                return ExecutionResult::failed(
                    &request.spec.task_id,
                    format!("interactive agent prompt failed: {err:#}"),
                    elapsed_ms(started),
                );
            }
        };

        let preview = self.start_preview(&request.workdir);

        let mut cmd = Command::new(&self.config.program);
        cmd.args(expand_args(
            &self.config.args,
            request,
            &self.config.model,
            &instruction,
        ))
        .envs(&self.config.env)
        .current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(stdin.as_bytes()),
            request.limits(),
            request.cancel.as_ref(),
        );
        let duration_ms = elapsed_ms(started);
        let mut result = match output {
            Ok(output) => result_from_output(self.name(), request, &output, duration_ms),
            Err(err) => ExecutionResult::failed(
                &request.spec.task_id,
                format!("interactive agent could not start: {err:#}"),
                duration_ms,
            ),
        };
        if preview.is_some() {
            result.serve_web_url = self.config.preview_url.clone();
        }
        drop(preview);
        result
    }
}

/// Backend returning a canned result without spawning anything.
#[derive(Debug, Clone)]
pub struct StubExecutor {
    config: StubConfig,
}

impl StubExecutor {
    pub fn new(config: StubConfig) -> Self {
        Self { config }
    }

    pub fn passing() -> Self {
        Self::new(StubConfig::default())
    }

    pub fn failing(output: impl Into<String>) -> Self {
        Self::new(StubConfig {
            pass: false,
            output: output.into(),
        })
    }
}

impl Executor for StubExecutor {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn execute(&self, request: &ExecRequest) -> ExecutionResult {
        debug!(task_id = %request.spec.task_id, pass = self.config.pass, "stub executor");
        let output = self.config.output.clone();
        let test_results = if self.config.pass {
            TestResults::passed(output.clone())
        } else {
            TestResults::failed(output.clone(), output.clone())
        };
        ExecutionResult {
            task_id: request.spec.task_id.clone(),
            status: ExecStatus::Completed,
            test_results,
            duration_ms: 0,
            stdout: Some(output),
            stderr: None,
            serve_web_url: None,
            stub: true,
        }
    }
}
