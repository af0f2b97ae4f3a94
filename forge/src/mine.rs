//! Playbook mining pass for `forge mine`.

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::playbook::mine_playbooks;
use crate::core::types::Playbook;
use crate::io::store::InteractionStore;

/// Recompute playbooks from the full task history and upsert each one.
///
/// Patterns with no terminal tasks keep their stored rows.
#[instrument(skip_all, fields(topics = topics.len()))]
pub fn run_mining(store: &dyn InteractionStore, topics: &[String], now: &str) -> Result<Vec<Playbook>> {
    let history = store.task_histories().context("load task history")?;
    let playbooks = mine_playbooks(&history, topics, now);
    for playbook in &playbooks {
        store.upsert_playbook(playbook)?;
    }
    info!(
        tasks = history.len(),
        playbooks = playbooks.len(),
        "mining pass complete"
    );
    Ok(playbooks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{GENERAL_PATTERN, IterationRecord, PrdRequest, TaskStatus, TestOutcome};
    use crate::io::store::SqliteStore;
    use crate::test_support::spec_for;

    fn seed(store: &SqliteStore, id: &str, description: &str, status: TaskStatus, iterations: u32) {
        let prd = PrdRequest {
            title: "Task".to_string(),
            description: description.to_string(),
            acceptance_criteria: Vec::new(),
            project_path: None,
        };
        store
            .record_task_started(id, &prd, &format!("2026-01-01T00:00:0{}Z", id.len()))
            .expect("start");
        for iteration in 1..=iterations {
            store
                .record_iteration(&IterationRecord {
                    task_id: id.to_string(),
                    iteration,
                    spec: spec_for(id),
                    agent_output: String::new(),
                    test_result: TestOutcome::from_passed(
                        status == TaskStatus::Success && iteration == iterations,
                    ),
                    error: None,
                    duration_ms: 1,
                })
                .expect("iteration");
        }
        if status.is_terminal() {
            store
                .record_task_finished(id, status, "2026-01-02T00:00:00Z", None)
                .expect("finish");
        }
    }

    #[test]
    fn mining_upserts_clusters_and_keeps_untouched_rows() {
        let store = SqliteStore::open_in_memory().expect("store");
        let stale = Playbook {
            pattern: "ui".to_string(),
            success_rate: 0.1,
            avg_iterations: 3.0,
            common_errors: Vec::new(),
            winning_spec_template: String::new(),
            last_updated: "2025-01-01T00:00:00Z".to_string(),
        };
        store.upsert_playbook(&stale).expect("stale");

        seed(&store, "t1", "add an api endpoint", TaskStatus::Success, 1);
        seed(&store, "t22", "api auth flow", TaskStatus::Escalated, 3);
        seed(&store, "t333", "api still running", TaskStatus::InProgress, 1);

        let mined = run_mining(&store, &["api".to_string(), "ui".to_string()], "now").expect("mine");
        let patterns: Vec<&str> = mined.iter().map(|p| p.pattern.as_str()).collect();
        assert_eq!(patterns, vec!["api", GENERAL_PATTERN]);

        let stored = store.playbooks().expect("playbooks");
        let api = stored.iter().find(|p| p.pattern == "api").expect("api");
        assert!((api.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((api.avg_iterations - 2.0).abs() < f64::EPSILON);
        assert_eq!(api.common_errors, vec!["api auth flow"]);
        assert!(api.winning_spec_template.contains("Test command:"));
        assert_eq!(api.last_updated, "now");

        let ui = stored.iter().find(|p| p.pattern == "ui").expect("ui");
        assert_eq!(ui, &stale);
    }
}
