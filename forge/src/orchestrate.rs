//! Orchestration driver for `forge run`.
//!
//! Takes one PRD through intake, spec generation and the bounded
//! execute/validate/decide loop. The driver is the error boundary: every
//! fault ends in one of four result shapes (success, escalated, handoff,
//! needs clarification) and nothing is returned as an error.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::active::{ActiveTaskGuard, ActiveTasks};
use crate::agents::clarifier::{Clarifier, IntakeOutcome};
use crate::cancel::CancelToken;
use crate::core::classifier::AGENT_TAIL_BYTES;
use crate::core::controller::{Verdict, decide};
use crate::core::text::tail;
use crate::core::types::{
    ExecStatus, ExecutionResult, IterationRecord, Phase, PrdRequest, TaskSpec, TaskStatus,
    TestOutcome, TestResults,
};
use crate::io::config::ForgeConfig;
use crate::io::events::{EventPublisher, PhaseEvent, emit};
use crate::io::executor::{ExecRequest, Executor};
use crate::io::init::ForgePaths;
use crate::io::oracle::Oracle;
use crate::io::project_context::assemble_project_context;
use crate::io::prompt::PromptEngine;
use crate::io::spec_store::{SpecPaths, write_spec};
use crate::io::store::InteractionStore;
use crate::io::validator::{TestRequest, TestValidator};
use crate::spec_builder::{BuiltSpec, SpecBuilder};

/// Current time as RFC 3339 with millisecond precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// External collaborators injected into a run.
pub struct Collaborators<'a> {
    pub oracle: &'a dyn Oracle,
    pub executor: &'a dyn Executor,
    pub validator: &'a dyn TestValidator,
    pub store: &'a dyn InteractionStore,
    pub events: &'a dyn EventPublisher,
    pub active: &'a ActiveTasks,
    pub prompts: &'a PromptEngine,
}

/// Resolved knobs for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_iterations: u32,
    pub playbook_limit: usize,
    pub project_context_bytes: usize,
    pub specs_dir: PathBuf,
    /// Working directory when the PRD names no project path.
    pub default_workdir: PathBuf,
    pub test_command: String,
    pub test_timeout: Duration,
    pub test_output_limit_bytes: usize,
    pub exec_timeout: Duration,
    pub exec_output_limit_bytes: usize,
    pub oracle_max_tokens: u32,
}

impl RunSettings {
    pub fn from_config(cfg: &ForgeConfig, paths: &ForgePaths) -> Self {
        let exec = cfg.executor.limits();
        let tests = cfg.tests.limits();
        Self {
            max_iterations: cfg.max_iterations,
            playbook_limit: cfg.playbook_limit,
            project_context_bytes: cfg.project_context_bytes,
            specs_dir: paths.specs_dir.clone(),
            default_workdir: paths.root.clone(),
            test_command: cfg.tests.command.clone(),
            test_timeout: tests.timeout,
            test_output_limit_bytes: tests.output_limit_bytes,
            exec_timeout: exec.timeout,
            exec_output_limit_bytes: exec.output_limit_bytes,
            oracle_max_tokens: cfg.oracle.max_tokens,
        }
    }
}

/// Per-invocation switches.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop after the spec is written; an external agent takes over.
    pub handoff: bool,
    pub cancel: Option<CancelToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Escalated,
    Handoff,
}

/// Outcome of [`orchestrate`], printed as JSON by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    pub message: String,
    #[serde(
        rename = "needsClarification",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub needs_clarification: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serve_web_url: Option<String>,
    /// Persistence failures swallowed during the run.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub store_errors: u32,
}

/// Message carried by a panic payload, when it has one.
fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl OrchestrationResult {
    fn needs_clarification(questions: Vec<String>) -> Self {
        Self {
            success: false,
            task_id: None,
            status: None,
            message: format!(
                "PRD needs clarification before work can start ({} question(s)).",
                questions.len()
            ),
            needs_clarification: true,
            questions,
            iteration_count: None,
            spec_path: None,
            final_code: None,
            serve_web_url: None,
            store_errors: 0,
        }
    }

    fn terminal(status: RunStatus, task_id: Option<String>, message: String) -> Self {
        Self {
            success: status != RunStatus::Escalated,
            task_id,
            status: Some(status),
            message,
            needs_clarification: false,
            questions: Vec::new(),
            iteration_count: None,
            spec_path: None,
            final_code: None,
            serve_web_url: None,
            store_errors: 0,
        }
    }
}

/// Run one PRD to a terminal outcome.
#[instrument(skip_all, fields(title = %prd.title, handoff = options.handoff))]
pub fn orchestrate(
    prd: &PrdRequest,
    collaborators: &Collaborators<'_>,
    settings: &RunSettings,
    options: &RunOptions,
) -> OrchestrationResult {
    let mut run = Run {
        c: collaborators,
        settings,
        options,
        store_errors: 0,
    };
    let mut result = run.drive(prd);
    result.store_errors = run.store_errors;
    info!(
        success = result.success,
        status = ?result.status,
        iterations = ?result.iteration_count,
        store_errors = result.store_errors,
        "run finished"
    );
    result
}

struct Run<'r, 'a> {
    c: &'r Collaborators<'a>,
    settings: &'r RunSettings,
    options: &'r RunOptions,
    store_errors: u32,
}

impl Run<'_, '_> {
    fn drive(&mut self, prd: &PrdRequest) -> OrchestrationResult {
        let workdir = prd
            .project_path
            .clone()
            .unwrap_or_else(|| self.settings.default_workdir.clone());
        let project_context = self.project_context(prd.project_path.as_deref());

        self.emit(None, Phase::Clarification, None, "analyzing PRD");
        let intake = self.intake(prd, project_context.as_deref());
        if !intake.ready {
            self.emit(
                None,
                Phase::Clarification,
                None,
                &format!("{} clarifying question(s)", intake.questions.len()),
            );
            return OrchestrationResult::needs_clarification(intake.questions);
        }

        self.emit(None, Phase::SpecGeneration, None, "building spec");
        let playbooks = self
            .store_op("load playbooks", self.c.store.playbooks())
            .unwrap_or_default();
        let builder = SpecBuilder {
            specs_dir: &self.settings.specs_dir,
            prompts: self.c.prompts,
            test_command: &self.settings.test_command,
            playbook_limit: self.settings.playbook_limit,
        };
        let BuiltSpec { spec, paths } =
            match builder.build(prd, &playbooks, project_context.as_deref()) {
                Ok(built) => built,
                Err(err) => {
                    warn!(err = %err, "spec artifact could not be written");
                    return OrchestrationResult::terminal(
                        RunStatus::Escalated,
                        None,
                        format!("Spec generation failed: {err:#}"),
                    );
                }
            };
        let task_id = spec.task_id.clone();
        let guard = self.c.active.register(&task_id, Some(&prd.title));

        let created_at = now_rfc3339();
        self.store_op(
            "record task start",
            self.c.store.record_task_started(&task_id, prd, &created_at),
        );
        guard.set_phase(Phase::SpecReady, None);
        self.emit(
            Some(&task_id),
            Phase::SpecReady,
            None,
            &format!("spec written to {}", paths.json_path.display()),
        );

        if self.options.handoff {
            guard.set_phase(Phase::Handoff, None);
            self.emit(Some(&task_id), Phase::Handoff, None, "handing off spec");
            let mut result = OrchestrationResult::terminal(
                RunStatus::Handoff,
                Some(task_id),
                format!("Spec ready for handoff at {}.", paths.json_path.display()),
            );
            result.spec_path = Some(paths.json_path);
            return result;
        }

        let mut result = self.iterate(spec, &workdir, &guard);
        result.spec_path = Some(paths.json_path);
        result
    }

    /// The execute, validate, record, decide loop.
    fn iterate(
        &mut self,
        mut spec: TaskSpec,
        workdir: &Path,
        guard: &ActiveTaskGuard,
    ) -> OrchestrationResult {
        let task_id = spec.task_id.clone();
        let max_iterations = self.settings.max_iterations.max(1);
        let mut serve_web_url = None;

        for iteration in 1..=max_iterations {
            if self.cancelled() {
                return self.abort(&task_id, iteration - 1, serve_web_url);
            }

            guard.set_phase(Phase::AgentRun, Some(iteration));
            self.emit(
                Some(&task_id),
                Phase::AgentRun,
                Some(iteration),
                &format!("running {} agent", self.c.executor.name()),
            );
            let exec = self.execute(&spec, workdir);
            if exec.serve_web_url.is_some() {
                serve_web_url.clone_from(&exec.serve_web_url);
            }

            guard.set_phase(Phase::Validation, Some(iteration));
            let results = self.validate(&spec, &exec, workdir, iteration);

            self.store_op(
                "record iteration",
                self.c.store.record_iteration(&IterationRecord {
                    task_id: task_id.clone(),
                    iteration,
                    spec: spec.clone(),
                    agent_output: exec.agent_output(),
                    test_result: TestOutcome::from_passed(results.passed),
                    error: if results.passed {
                        None
                    } else {
                        results.error.clone()
                    },
                    duration_ms: exec.duration_ms,
                }),
            );

            if !results.passed && self.cancelled() {
                return self.abort(&task_id, iteration, serve_web_url);
            }

            match decide(&spec, &results, iteration, max_iterations) {
                Verdict::Success => {
                    let final_code = tail(&exec.agent_output(), AGENT_TAIL_BYTES).to_string();
                    self.finish(&task_id, TaskStatus::Success, Some(&final_code));
                    guard.set_phase(Phase::Complete, Some(iteration));
                    self.emit(Some(&task_id), Phase::Complete, Some(iteration), "tests passed");
                    let mut result = OrchestrationResult::terminal(
                        RunStatus::Success,
                        Some(task_id.clone()),
                        format!("Task {task_id} succeeded after {iteration} iteration(s)."),
                    );
                    result.iteration_count = Some(iteration);
                    result.final_code = Some(final_code);
                    result.serve_web_url = serve_web_url;
                    return result;
                }
                Verdict::Escalate { message } => {
                    return self.escalate(&task_id, iteration, message, serve_web_url);
                }
                Verdict::Retry { feedback } => {
                    info!(%task_id, iteration, "retrying with feedback");
                    spec = spec.with_gotcha(feedback);
                    if let Err(err) = write_spec(&self.settings.specs_dir, &spec, self.c.prompts) {
                        warn!(err = %err, %task_id, "spec artifact rewrite failed");
                    }
                }
            }
        }

        // `decide` escalates at the last iteration; kept for an exhausted range.
        let message = format!(
            "Escalated task {task_id} after {max_iterations} iteration(s) without passing tests."
        );
        self.escalate(&task_id, max_iterations, message, serve_web_url)
    }

    fn execute(&self, spec: &TaskSpec, workdir: &Path) -> ExecutionResult {
        let request = ExecRequest {
            spec: spec.clone(),
            spec_path: SpecPaths::new(&self.settings.specs_dir, &spec.task_id).json_path,
            workdir: workdir.to_path_buf(),
            timeout: self.settings.exec_timeout,
            output_limit_bytes: self.settings.exec_output_limit_bytes,
            cancel: self.options.cancel.clone(),
        };
        let started = Instant::now();
        let mut exec =
            match panic::catch_unwind(AssertUnwindSafe(|| self.c.executor.execute(&request))) {
                Ok(exec) => exec,
                Err(payload) => {
                    let reason = panic_reason(&*payload);
                    warn!(task_id = %spec.task_id, %reason, "executor panicked");
                    ExecutionResult::failed(
                        &spec.task_id,
                        format!("{} agent panicked: {reason}", self.c.executor.name()),
                        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    )
                }
            };
        let timeout_ms = u64::try_from(self.settings.exec_timeout.as_millis()).unwrap_or(u64::MAX);
        if exec.duration_ms > timeout_ms && !exec.has_explicit_error() {
            warn!(
                task_id = %spec.task_id,
                duration_ms = exec.duration_ms,
                timeout_ms,
                "agent overran its timeout"
            );
            exec.status = ExecStatus::Failed;
            exec.test_results = TestResults::failed(
                format!(
                    "agent timed out after {:?}",
                    self.settings.exec_timeout
                ),
                exec.test_results.output.clone(),
            );
        }
        exec
    }

    /// Stub results and explained failures are trusted; everything else is re-tested.
    fn validate(
        &self,
        spec: &TaskSpec,
        exec: &ExecutionResult,
        workdir: &Path,
        iteration: u32,
    ) -> TestResults {
        let task_id = spec.task_id.as_str();
        if exec.stub || exec.has_explicit_error() {
            self.emit(
                Some(task_id),
                Phase::Validation,
                Some(iteration),
                "using executor-reported results",
            );
            return exec.test_results.clone();
        }
        self.emit(
            Some(task_id),
            Phase::Validation,
            Some(iteration),
            &format!("running `{}`", spec.test_command),
        );
        let request = TestRequest {
            command: spec.test_command.clone(),
            workdir: workdir.to_path_buf(),
            timeout: self.settings.test_timeout,
            output_limit_bytes: self.settings.test_output_limit_bytes,
            cancel: self.options.cancel.clone(),
        };
        match panic::catch_unwind(AssertUnwindSafe(|| self.c.validator.validate(&request))) {
            Ok(results) => results,
            Err(payload) => {
                let reason = panic_reason(&*payload);
                warn!(%task_id, %reason, "test validator panicked");
                TestResults::failed(format!("test validator panicked: {reason}"), String::new())
            }
        }
    }

    fn escalate(
        &mut self,
        task_id: &str,
        iteration: u32,
        message: String,
        serve_web_url: Option<String>,
    ) -> OrchestrationResult {
        self.finish(task_id, TaskStatus::Escalated, None);
        self.emit(Some(task_id), Phase::Escalate, Some(iteration), &message);
        let mut result =
            OrchestrationResult::terminal(RunStatus::Escalated, Some(task_id.to_string()), message);
        result.iteration_count = Some(iteration);
        result.serve_web_url = serve_web_url;
        result
    }

    fn abort(
        &mut self,
        task_id: &str,
        completed: u32,
        serve_web_url: Option<String>,
    ) -> OrchestrationResult {
        warn!(%task_id, completed, "run cancelled");
        let message =
            format!("Task {task_id} aborted by operator after {completed} iteration(s).");
        self.escalate(task_id, completed, message, serve_web_url)
    }

    fn finish(&mut self, task_id: &str, status: TaskStatus, final_code: Option<&str>) {
        let completed_at = now_rfc3339();
        self.store_op(
            "record task finish",
            self.c
                .store
                .record_task_finished(task_id, status, &completed_at, final_code),
        );
    }

    fn intake(&self, prd: &PrdRequest, project_context: Option<&str>) -> IntakeOutcome {
        if prd.title.trim().is_empty() && prd.description.trim().is_empty() {
            return IntakeOutcome {
                ready: false,
                questions: vec![
                    "What should be built? The PRD has no title or description.".to_string(),
                ],
            };
        }
        match Clarifier::new(self.c.oracle, self.c.prompts, self.settings.oracle_max_tokens) {
            Ok(clarifier) => clarifier.analyze(prd, project_context),
            Err(err) => {
                warn!(err = %err, "clarifier unavailable, proceeding without clarification");
                IntakeOutcome::ready()
            }
        }
    }

    fn project_context(&self, project_path: Option<&Path>) -> Option<String> {
        let path = project_path?;
        match assemble_project_context(path, self.settings.project_context_bytes) {
            Ok(context) => Some(context),
            Err(err) => {
                warn!(err = %err, "project context unavailable");
                None
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.options
            .cancel
            .as_ref()
            .is_some_and(CancelToken::is_cancelled)
    }

    /// Log and count a persistence failure; the run continues without it.
    fn store_op<T>(&mut self, what: &str, result: anyhow::Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.store_errors += 1;
                warn!(err = %format!("{err:#}"), op = what, "store operation failed");
                None
            }
        }
    }

    fn emit(&self, task_id: Option<&str>, phase: Phase, iteration: Option<u32>, message: &str) {
        emit(
            self.c.events,
            PhaseEvent {
                at: now_rfc3339(),
                task_id: task_id.map(str::to_string),
                phase,
                iteration,
                message: message.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clarification_result_serializes_camel_case_flag() {
        let result = OrchestrationResult::needs_clarification(vec!["Which port?".to_string()]);
        let json = serde_json::to_value(&result).expect("serialize");
        assert_eq!(json["success"], false);
        assert_eq!(json["needsClarification"], true);
        assert_eq!(json["questions"][0], "Which port?");
        assert!(json.get("task_id").is_none());
        assert!(json.get("store_errors").is_none());
    }

    #[test]
    fn terminal_result_serializes_status() {
        let mut result = OrchestrationResult::terminal(
            RunStatus::Escalated,
            Some("task-1".to_string()),
            "gave up".to_string(),
        );
        result.iteration_count = Some(2);
        result.store_errors = 1;
        let json = serde_json::to_value(&result).expect("serialize");
        assert_eq!(json["success"], false);
        assert_eq!(json["status"], "escalated");
        assert_eq!(json["iteration_count"], 2);
        assert_eq!(json["store_errors"], 1);
        assert!(json.get("needsClarification").is_none());
    }

    #[test]
    fn timestamps_are_rfc3339_utc() {
        let now = now_rfc3339();
        assert!(now.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&now).is_ok());
    }
}
