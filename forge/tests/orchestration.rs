use std::fs;

use forge::cancel::CancelToken;
use forge::core::types::{ExecutionResult, Phase, PrdRequest, TaskStatus, TestOutcome, TestResults};
use forge::io::executor::{ExecRequest, Executor, StubExecutor};
use forge::io::spec_store::read_spec;
use forge::io::store::{InteractionStore, UnavailableStore};
use forge::io::validator::{TestRequest, TestValidator};
use forge::orchestrate::{RunOptions, RunStatus};
use forge::test_support::{
    FailingPublisher, ScriptedExecutor, ScriptedOracle, ScriptedValidator, TestRig, completed,
    health_prd,
};

#[test]
fn passing_stub_succeeds_in_one_iteration() {
    let rig = TestRig::new();
    let validator = ScriptedValidator::failing("should not run");

    let result = rig.run(
        &health_prd(),
        &ScriptedOracle::ready(),
        &StubExecutor::passing(),
        &validator,
        &RunOptions::default(),
    );

    assert!(result.success, "{result:?}");
    assert_eq!(result.status, Some(RunStatus::Success));
    assert_eq!(result.iteration_count, Some(1));
    assert_eq!(validator.calls(), 0);
    let task_id = result.task_id.clone().expect("task id");
    assert_eq!(
        result.message,
        format!("Task {task_id} succeeded after 1 iteration(s).")
    );
    assert!(
        result
            .final_code
            .as_deref()
            .is_some_and(|code| code.contains("all tests passed"))
    );

    let task = rig.store.task(&task_id).expect("task").expect("row");
    assert_eq!(task.status, TaskStatus::Success);
    assert!(task.completed_at.is_some());
    let iterations = rig.store.iterations(&task_id).expect("iterations");
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].test_result, TestOutcome::Pass);
    assert!(rig.active.snapshot().is_empty());
}

#[test]
fn failing_runs_escalate_after_max_iterations_with_growing_gotchas() {
    let rig = TestRig::with_max_iterations(2);
    let executor = StubExecutor::failing("FAILED test_health: expected 200, got 404");

    let result = rig.run(
        &health_prd(),
        &ScriptedOracle::ready(),
        &executor,
        &ScriptedValidator::passing(),
        &RunOptions::default(),
    );

    assert!(!result.success);
    assert_eq!(result.status, Some(RunStatus::Escalated));
    assert_eq!(result.iteration_count, Some(2));
    assert!(result.message.contains("after 2 iteration(s)"));
    assert!(result.message.contains("expected 200, got 404"));

    let task_id = result.task_id.clone().expect("task id");
    let task = rig.store.task(&task_id).expect("task").expect("row");
    assert_eq!(task.status, TaskStatus::Escalated);
    assert!(task.final_code.is_none());

    let iterations = rig.store.iterations(&task_id).expect("iterations");
    let numbers: Vec<u32> = iterations.iter().map(|i| i.iteration).collect();
    assert_eq!(numbers, vec![1, 2]);
    assert!(iterations.iter().all(|i| i.spec.task_id == task_id));
    assert!(iterations.iter().all(|i| i.test_result == TestOutcome::Fail));
    assert!(iterations[0].spec.context.gotchas.is_empty());
    assert_eq!(iterations[1].spec.context.gotchas.len(), 1);
    assert!(iterations[1].spec.context.gotchas[0].starts_with("Iteration 1 failed:"));
    assert_eq!(iterations[1].spec.version, 2);

    // The artifact on disk tracks the latest spec version.
    let spec_path = result.spec_path.expect("spec path");
    assert_eq!(read_spec(&spec_path).expect("read").version, 2);
}

#[test]
fn retries_stop_once_tests_pass() {
    let rig = TestRig::with_max_iterations(5);
    let executor = ScriptedExecutor::completing(&["attempt one", "attempt two"]);
    let validator = ScriptedValidator::new(vec![
        TestResults::failed("error: assertion failed", "error: assertion failed"),
        TestResults::passed("ok"),
    ]);

    let result = rig.run(
        &health_prd(),
        &ScriptedOracle::ready(),
        &executor,
        &validator,
        &RunOptions::default(),
    );

    assert_eq!(result.status, Some(RunStatus::Success));
    assert_eq!(result.iteration_count, Some(2));
    assert_eq!(executor.calls(), 2);
    assert_eq!(validator.calls(), 2);
    assert_eq!(result.final_code.as_deref(), Some("attempt two"));

    let requests = executor.requests();
    assert_eq!(requests[0].spec.version, 1);
    assert_eq!(requests[1].spec.version, 2);
    assert_eq!(requests[0].spec.task_id, requests[1].spec.task_id);
    assert_eq!(requests[0].workdir, rig.paths.root);
}

#[test]
fn clarification_stops_before_any_task_is_created() {
    let rig = TestRig::new();
    let executor = ScriptedExecutor::completing(&["never"]);
    let vague = PrdRequest {
        title: "Make it better".to_string(),
        description: "Improve the app".to_string(),
        acceptance_criteria: Vec::new(),
        project_path: None,
    };

    let result = rig.run(
        &vague,
        &ScriptedOracle::asking(&["Which screen?", "What does better mean?", "Any deadline?"]),
        &executor,
        &ScriptedValidator::passing(),
        &RunOptions::default(),
    );

    assert!(!result.success);
    assert!(result.needs_clarification);
    assert_eq!(result.questions.len(), 3);
    assert!(result.task_id.is_none());
    assert!(result.status.is_none());
    assert_eq!(executor.calls(), 0);
    assert!(rig.store.task_histories().expect("histories").is_empty());
    assert!(fs::read_dir(&rig.paths.specs_dir).expect("specs").next().is_none());
}

#[test]
fn blank_prd_asks_what_to_build_without_calling_the_oracle() {
    let rig = TestRig::new();
    let oracle = ScriptedOracle::ready();
    let blank = PrdRequest {
        title: "  ".to_string(),
        description: String::new(),
        acceptance_criteria: Vec::new(),
        project_path: None,
    };

    let result = rig.run(
        &blank,
        &oracle,
        &StubExecutor::passing(),
        &ScriptedValidator::passing(),
        &RunOptions::default(),
    );

    assert!(result.needs_clarification);
    assert_eq!(result.questions.len(), 1);
    assert!(oracle.prompts().is_empty());
}

#[test]
fn oracle_failure_fails_open() {
    let rig = TestRig::new();

    let result = rig.run(
        &health_prd(),
        &ScriptedOracle::failing("connection refused"),
        &StubExecutor::passing(),
        &ScriptedValidator::passing(),
        &RunOptions::default(),
    );

    assert_eq!(result.status, Some(RunStatus::Success));
}

#[test]
fn handoff_writes_spec_without_running_the_agent() {
    let rig = TestRig::new();
    let executor = ScriptedExecutor::completing(&["never"]);

    let result = rig.run(
        &health_prd(),
        &ScriptedOracle::ready(),
        &executor,
        &ScriptedValidator::passing(),
        &RunOptions {
            handoff: true,
            cancel: None,
        },
    );

    assert!(result.success);
    assert_eq!(result.status, Some(RunStatus::Handoff));
    assert_eq!(executor.calls(), 0);
    let spec_path = result.spec_path.clone().expect("spec path");
    assert!(spec_path.exists());
    assert!(spec_path.with_extension("md").exists());
    assert!(result.message.starts_with("Spec ready for handoff at "));

    let task_id = result.task_id.expect("task id");
    let task = rig.store.task(&task_id).expect("task").expect("row");
    assert_eq!(task.status, TaskStatus::InProgress);
    assert!(rig.store.iterations(&task_id).expect("iterations").is_empty());
}

#[test]
fn explicit_executor_errors_skip_validation() {
    let rig = TestRig::with_max_iterations(1);
    let executor = ScriptedExecutor::new(vec![ExecutionResult::failed(
        "",
        "batch agent exited with status 2",
        10,
    )]);
    let validator = ScriptedValidator::passing();

    let result = rig.run(
        &health_prd(),
        &ScriptedOracle::ready(),
        &executor,
        &validator,
        &RunOptions::default(),
    );

    assert_eq!(result.status, Some(RunStatus::Escalated));
    assert_eq!(validator.calls(), 0);
    let task_id = result.task_id.expect("task id");
    let iterations = rig.store.iterations(&task_id).expect("iterations");
    assert_eq!(
        iterations[0].error.as_deref(),
        Some("batch agent exited with status 2")
    );
}

#[test]
fn agent_overrunning_its_timeout_is_a_failure() {
    let rig = TestRig::with_max_iterations(1);
    let mut slow = completed("finished eventually");
    slow.duration_ms = 60_000;
    let executor = ScriptedExecutor::new(vec![slow]);
    let validator = ScriptedValidator::passing();

    let result = rig.run(
        &health_prd(),
        &ScriptedOracle::ready(),
        &executor,
        &validator,
        &RunOptions::default(),
    );

    assert_eq!(result.status, Some(RunStatus::Escalated));
    assert_eq!(validator.calls(), 0);
    assert!(result.message.contains("agent timed out after 30s"));
}

#[test]
fn store_outage_does_not_stop_the_run() {
    let rig = TestRig::new();
    let store = UnavailableStore::new("disk full");

    let result = rig.run_with_store(
        &health_prd(),
        &ScriptedOracle::ready(),
        &StubExecutor::passing(),
        &ScriptedValidator::passing(),
        &store,
        &RunOptions::default(),
    );

    assert_eq!(result.status, Some(RunStatus::Success));
    // playbooks, task start, iteration, task finish
    assert_eq!(result.store_errors, 4);
}

#[test]
fn cancelled_run_escalates_before_the_first_iteration() {
    let rig = TestRig::new();
    let executor = ScriptedExecutor::completing(&["never"]);
    let cancel = CancelToken::new();
    cancel.cancel();

    let result = rig.run(
        &health_prd(),
        &ScriptedOracle::ready(),
        &executor,
        &ScriptedValidator::passing(),
        &RunOptions {
            handoff: false,
            cancel: Some(cancel),
        },
    );

    assert_eq!(result.status, Some(RunStatus::Escalated));
    assert_eq!(result.iteration_count, Some(0));
    assert_eq!(executor.calls(), 0);
    assert!(result.message.contains("aborted by operator after 0 iteration(s)"));
    let task_id = result.task_id.expect("task id");
    let task = rig.store.task(&task_id).expect("task").expect("row");
    assert_eq!(task.status, TaskStatus::Escalated);
}

#[test]
fn failing_subscribers_are_isolated() {
    let rig = TestRig::new();
    let collaborators = forge::orchestrate::Collaborators {
        oracle: &ScriptedOracle::ready(),
        executor: &StubExecutor::passing(),
        validator: &ScriptedValidator::passing(),
        store: &rig.store,
        events: &FailingPublisher,
        active: &rig.active,
        prompts: &rig.prompts,
    };

    let result = forge::orchestrate::orchestrate(
        &health_prd(),
        &collaborators,
        &rig.settings,
        &RunOptions::default(),
    );

    assert_eq!(result.status, Some(RunStatus::Success));
}

#[test]
fn phases_are_published_in_order() {
    let rig = TestRig::new();

    let result = rig.run(
        &health_prd(),
        &ScriptedOracle::ready(),
        &StubExecutor::passing(),
        &ScriptedValidator::passing(),
        &RunOptions::default(),
    );

    assert_eq!(
        rig.events.phases(),
        vec![
            Phase::Clarification,
            Phase::SpecGeneration,
            Phase::SpecReady,
            Phase::AgentRun,
            Phase::Validation,
            Phase::Complete,
        ]
    );
    let events = rig.events.events();
    assert!(events[0].task_id.is_none());
    assert_eq!(events[2].task_id, result.task_id);
    assert_eq!(events[3].iteration, Some(1));
}

#[test]
fn runs_feed_later_specs_through_mined_playbooks() {
    let rig = TestRig::new();
    let first = rig.run(
        &health_prd(),
        &ScriptedOracle::ready(),
        &StubExecutor::passing(),
        &ScriptedValidator::passing(),
        &RunOptions::default(),
    );
    assert!(first.success);

    let topics = vec!["endpoint".to_string()];
    let mined = forge::mine::run_mining(&rig.store, &topics, "2026-01-01T00:00:00.000Z")
        .expect("mine");
    assert!(mined.iter().any(|p| p.pattern == "endpoint"));

    let executor = ScriptedExecutor::completing(&["done"]);
    let second = rig.run(
        &health_prd(),
        &ScriptedOracle::ready(),
        &executor,
        &ScriptedValidator::passing(),
        &RunOptions::default(),
    );
    assert!(second.success);
    let spec = &executor.requests()[0].spec;
    assert!(spec.context.playbooks.iter().any(|h| h.pattern == "endpoint"));
    assert_ne!(first.task_id, second.task_id);
}

struct PanickingExecutor;

impl Executor for PanickingExecutor {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn execute(&self, _request: &ExecRequest) -> ExecutionResult {
        panic!("backend crashed");
    }
}

struct PanickingValidator;

impl TestValidator for PanickingValidator {
    fn validate(&self, _request: &TestRequest) -> TestResults {
        panic!("runner crashed");
    }
}

#[test]
fn panicking_executor_escalates_and_closes_the_task() {
    let rig = TestRig::with_max_iterations(2);

    let result = rig.run(
        &health_prd(),
        &ScriptedOracle::ready(),
        &PanickingExecutor,
        &ScriptedValidator::passing(),
        &RunOptions::default(),
    );

    assert_eq!(result.status, Some(RunStatus::Escalated));
    assert_eq!(result.iteration_count, Some(2));
    let task_id = result.task_id.expect("task id");
    let task = rig.store.task(&task_id).expect("task").expect("row");
    assert_eq!(task.status, TaskStatus::Escalated);
    let iterations = rig.store.iterations(&task_id).expect("iterations");
    assert_eq!(iterations.len(), 2);
    assert!(
        iterations[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("panicking agent panicked: backend crashed"))
    );
    assert!(rig.active.snapshot().is_empty());
}

#[test]
fn panicking_validator_counts_as_a_failed_iteration() {
    let rig = TestRig::with_max_iterations(1);

    let result = rig.run(
        &health_prd(),
        &ScriptedOracle::ready(),
        &ScriptedExecutor::completing(&["done"]),
        &PanickingValidator,
        &RunOptions::default(),
    );

    assert_eq!(result.status, Some(RunStatus::Escalated));
    assert!(result.message.contains("test validator panicked: runner crashed"));
    let task_id = result.task_id.expect("task id");
    let task = rig.store.task(&task_id).expect("task").expect("row");
    assert_eq!(task.status, TaskStatus::Escalated);
}
