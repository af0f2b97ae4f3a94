//! Shared types for the orchestration core.
//!
//! These types define stable contracts between the driver, the agent backends,
//! and the interaction store. Field names are part of the persisted JSON shape
//! (spec artifacts, store columns, CLI output) and must stay stable.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Pattern name of the catch-all playbook.
pub const GENERAL_PATTERN: &str = "general";

/// Natural-language requirements input for one orchestration run.
///
/// Never mutated after intake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrdRequest {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<PathBuf>,
}

impl PrdRequest {
    /// Text used for topic and playbook keyword matching.
    pub fn match_text(&self) -> String {
        format!("{} {}", self.title, self.description)
    }
}

/// Rough size estimate attached to a spec for backends that budget effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// Condensed playbook guidance embedded into a spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookHint {
    pub pattern: String,
    pub success_rate: f64,
    pub avg_iterations: f64,
    #[serde(default)]
    pub common_errors: Vec<String>,
    #[serde(default)]
    pub template_excerpt: String,
}

/// Context carried by a spec across iterations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecContext {
    /// Feedback accumulated from failed iterations. Append-only.
    #[serde(default)]
    pub gotchas: Vec<String>,
    /// Assembled project context (file listing, README excerpt, manifests).
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub playbooks: Vec<PlaybookHint>,
}

/// The unit of work handed to an agent backend for one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    /// 1 for the first iteration; incremented each time a gotcha is appended.
    pub version: u32,
    pub title: String,
    pub description: String,
    pub test_command: String,
    #[serde(default)]
    pub context: SpecContext,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_complexity: Option<Complexity>,
}

impl TaskSpec {
    /// Derive the next iteration's spec by appending one gotcha.
    ///
    /// `self` is left untouched so previously recorded snapshots stay valid.
    #[must_use]
    pub fn with_gotcha(&self, feedback: impl Into<String>) -> TaskSpec {
        let mut next = self.clone();
        next.version += 1;
        next.context.gotchas.push(feedback.into());
        next
    }
}

/// Whether the agent backend ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Completed,
    Failed,
}

/// Pass/fail verdict plus the output it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResults {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub output: String,
}

impl TestResults {
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            error: None,
            output: output.into(),
        }
    }

    pub fn failed(error: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            passed: false,
            error: Some(error.into()),
            output: output.into(),
        }
    }
}

/// Output of one agent backend invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub status: ExecStatus,
    pub test_results: TestResults,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serve_web_url: Option<String>,
    /// Produced by the stub backend; `test_results` are authoritative.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stub: bool,
}

impl ExecutionResult {
    /// A failed result carrying `error` as both the status reason and test error.
    pub fn failed(task_id: &str, error: impl Into<String>, duration_ms: u64) -> Self {
        let error = error.into();
        Self {
            task_id: task_id.to_string(),
            status: ExecStatus::Failed,
            test_results: TestResults::failed(error, String::new()),
            duration_ms,
            stdout: None,
            stderr: None,
            serve_web_url: None,
            stub: false,
        }
    }

    /// Combined stdout and stderr as recorded in the iteration history.
    pub fn agent_output(&self) -> String {
        let mut buf = String::new();
        if let Some(stdout) = self.stdout.as_deref().filter(|s| !s.is_empty()) {
            buf.push_str(stdout);
        }
        if let Some(stderr) = self.stderr.as_deref().filter(|s| !s.is_empty()) {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(stderr);
        }
        if buf.is_empty() {
            buf.push_str(&self.test_results.output);
        }
        buf
    }

    /// True when the backend failed and already explained why.
    pub fn has_explicit_error(&self) -> bool {
        self.status == ExecStatus::Failed && self.test_results.error.is_some()
    }
}

/// Persisted test verdict of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Pass,
    Fail,
}

impl TestOutcome {
    pub fn from_passed(passed: bool) -> Self {
        if passed { Self::Pass } else { Self::Fail }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

/// Write-once record of a single iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub task_id: String,
    /// 1-based, monotonic within a task.
    pub iteration: u32,
    pub spec: TaskSpec,
    pub agent_output: String,
    pub test_result: TestOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Lifecycle status of a task row. `Success` and `Escalated` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InProgress,
    Success,
    Escalated,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Escalated => "escalated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "in_progress" => Some(Self::InProgress),
            "success" => Some(Self::Success),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Aggregate row for one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRow {
    pub task_id: String,
    pub prd: PrdRequest,
    pub status: TaskStatus,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_code: Option<String>,
}

/// Task row joined with its iteration summary, as consumed by the miner.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskHistory {
    pub task_id: String,
    pub prd: PrdRequest,
    pub status: TaskStatus,
    pub created_at: String,
    pub iterations: u32,
    /// Spec snapshot of the last recorded iteration.
    pub final_spec: Option<TaskSpec>,
}

/// Mined summary of historical outcomes for one topic pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
    pub pattern: String,
    pub success_rate: f64,
    pub avg_iterations: f64,
    #[serde(default)]
    pub common_errors: Vec<String>,
    #[serde(default)]
    pub winning_spec_template: String,
    pub last_updated: String,
}

/// Orchestration phase reported to event subscribers and the active-task registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Clarification,
    SpecGeneration,
    SpecReady,
    Handoff,
    AgentRun,
    Validation,
    Complete,
    Escalate,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clarification => "clarification",
            Self::SpecGeneration => "spec_generation",
            Self::SpecReady => "spec_ready",
            Self::Handoff => "handoff",
            Self::AgentRun => "agent_run",
            Self::Validation => "validation",
            Self::Complete => "complete",
            Self::Escalate => "escalate",
        }
    }
}
