//! Scripted collaborators and fixtures for unit and integration tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::active::ActiveTasks;
use crate::core::types::{
    Complexity, ExecStatus, ExecutionResult, Phase, Playbook, PrdRequest, SpecContext, TaskSpec,
    TestResults,
};
use crate::io::events::{EventPublisher, PhaseEvent};
use crate::io::executor::{ExecRequest, Executor};
use crate::io::init::{ForgePaths, InitOptions, init_forge};
use crate::io::oracle::Oracle;
use crate::io::prompt::PromptEngine;
use crate::io::store::{InteractionStore, SqliteStore};
use crate::io::validator::{TestRequest, TestValidator};
use crate::orchestrate::{
    Collaborators, OrchestrationResult, RunOptions, RunSettings, orchestrate,
};

/// The canonical "add a health endpoint" PRD.
pub fn health_prd() -> PrdRequest {
    PrdRequest {
        title: "Add health endpoint".to_string(),
        description: "Add GET /health returning 200 with body ok".to_string(),
        acceptance_criteria: vec!["GET /health returns 200".to_string()],
        project_path: None,
    }
}

/// A deterministic version-1 spec for `task_id`.
pub fn spec_for(task_id: &str) -> TaskSpec {
    TaskSpec {
        task_id: task_id.to_string(),
        version: 1,
        title: "Add health endpoint".to_string(),
        description: "Add GET /health returning 200 with body ok".to_string(),
        test_command: "make test".to_string(),
        context: SpecContext::default(),
        requirements: vec!["GET /health returns 200".to_string()],
        estimated_complexity: Some(Complexity::Low),
    }
}

pub fn playbook(pattern: &str, success_rate: f64) -> Playbook {
    Playbook {
        pattern: pattern.to_string(),
        success_rate,
        avg_iterations: 1.0,
        common_errors: Vec::new(),
        winning_spec_template: format!("template for {pattern}"),
        last_updated: "2026-01-01T00:00:00.000Z".to_string(),
    }
}

/// Oracle returning one canned reply (or error) and recording prompts.
pub struct ScriptedOracle {
    reply: Result<String, String>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedOracle {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Ok(reply.to_string()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn ready() -> Self {
        Self::replying(r#"{"ready": true, "questions": []}"#)
    }

    pub fn asking(questions: &[&str]) -> Self {
        let reply = serde_json::json!({ "ready": false, "questions": questions });
        Self::replying(&reply.to_string())
    }

    pub fn failing(error: &str) -> Self {
        Self {
            reply: Err(error.to_string()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl Oracle for ScriptedOracle {
    fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String> {
        self.prompts.borrow_mut().push(prompt.to_string());
        self.reply.clone().map_err(|err| anyhow!(err))
    }
}

/// Executor replaying scripted results; the last one repeats.
pub struct ScriptedExecutor {
    results: RefCell<VecDeque<ExecutionResult>>,
    last: RefCell<Option<ExecutionResult>>,
    requests: RefCell<Vec<ExecRequest>>,
}

impl ScriptedExecutor {
    pub fn new(results: Vec<ExecutionResult>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            last: RefCell::new(None),
            requests: RefCell::new(Vec::new()),
        }
    }

    /// Non-stub runs that complete with the given outputs (validation decides).
    pub fn completing(outputs: &[&str]) -> Self {
        Self::new(outputs.iter().map(|o| completed(o)).collect())
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.borrow().len()
    }
}

/// A completed, non-stub execution result with `output` on stdout.
pub fn completed(output: &str) -> ExecutionResult {
    ExecutionResult {
        task_id: String::new(),
        status: ExecStatus::Completed,
        test_results: TestResults {
            passed: false,
            error: None,
            output: output.to_string(),
        },
        duration_ms: 5,
        stdout: Some(output.to_string()),
        stderr: None,
        serve_web_url: None,
        stub: false,
    }
}

impl Executor for ScriptedExecutor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn execute(&self, request: &ExecRequest) -> ExecutionResult {
        self.requests.borrow_mut().push(request.clone());
        let next = self.results.borrow_mut().pop_front();
        let mut result = match next {
            Some(result) => {
                *self.last.borrow_mut() = Some(result.clone());
                result
            }
            None => self
                .last
                .borrow()
                .clone()
                .unwrap_or_else(|| ExecutionResult::failed("", "no scripted result", 0)),
        };
        result.task_id.clone_from(&request.spec.task_id);
        result
    }
}

/// Validator replaying scripted results; the last one repeats.
pub struct ScriptedValidator {
    results: RefCell<VecDeque<TestResults>>,
    last: RefCell<Option<TestResults>>,
    calls: Cell<usize>,
}

impl ScriptedValidator {
    pub fn new(results: Vec<TestResults>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            last: RefCell::new(None),
            calls: Cell::new(0),
        }
    }

    pub fn passing() -> Self {
        Self::new(vec![TestResults::passed("all tests passed")])
    }

    pub fn failing(error: &str) -> Self {
        Self::new(vec![TestResults::failed(error, error)])
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl TestValidator for ScriptedValidator {
    fn validate(&self, _request: &TestRequest) -> TestResults {
        self.calls.set(self.calls.get() + 1);
        let next = self.results.borrow_mut().pop_front();
        match next {
            Some(results) => {
                *self.last.borrow_mut() = Some(results.clone());
                results
            }
            None => self
                .last
                .borrow()
                .clone()
                .unwrap_or_else(|| TestResults::failed("no scripted result", "")),
        }
    }
}

/// Publisher keeping every event in memory.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<PhaseEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<PhaseEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.events().into_iter().map(|e| e.phase).collect()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: &PhaseEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
        Ok(())
    }
}

/// Publisher whose every publish fails.
pub struct FailingPublisher;

impl EventPublisher for FailingPublisher {
    fn publish(&self, _event: &PhaseEvent) -> Result<()> {
        Err(anyhow!("subscriber unavailable"))
    }
}

/// Scratch project with an initialized `.forge/`, an in-memory store and a recording publisher.
pub struct TestRig {
    pub temp: TempDir,
    pub paths: ForgePaths,
    pub prompts: PromptEngine,
    pub active: ActiveTasks,
    pub events: RecordingPublisher,
    pub store: SqliteStore,
    pub settings: RunSettings,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_max_iterations(3)
    }

    pub fn with_max_iterations(max_iterations: u32) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_forge(temp.path(), &InitOptions { force: false }).expect("init forge");
        let mut cfg = crate::io::config::ForgeConfig {
            max_iterations,
            ..Default::default()
        };
        cfg.executor.timeout_secs = 30;
        let mut settings = RunSettings::from_config(&cfg, &paths);
        settings.test_timeout = Duration::from_secs(10);
        Self {
            paths,
            prompts: PromptEngine::new().expect("prompts"),
            active: ActiveTasks::new(),
            events: RecordingPublisher::default(),
            store: SqliteStore::open_in_memory().expect("store"),
            settings,
            temp,
        }
    }

    pub fn run(
        &self,
        prd: &PrdRequest,
        oracle: &dyn Oracle,
        executor: &dyn Executor,
        validator: &dyn TestValidator,
        options: &RunOptions,
    ) -> OrchestrationResult {
        self.run_with_store(prd, oracle, executor, validator, &self.store, options)
    }

    pub fn run_with_store(
        &self,
        prd: &PrdRequest,
        oracle: &dyn Oracle,
        executor: &dyn Executor,
        validator: &dyn TestValidator,
        store: &dyn InteractionStore,
        options: &RunOptions,
    ) -> OrchestrationResult {
        let collaborators = Collaborators {
            oracle,
            executor,
            validator,
            store,
            events: &self.events,
            active: &self.active,
            prompts: &self.prompts,
        };
        orchestrate(prd, &collaborators, &self.settings, options)
    }
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}
