//! Playbook selection and mining.
//!
//! Mining recomputes every touched pattern from the full task history on each
//! pass. That is fine for modest history sizes; large histories would want
//! incrementally maintained aggregates instead.

use std::collections::BTreeMap;

use crate::core::spec::render_spec_template;
use crate::core::text::truncate_with_ellipsis;
use crate::core::types::{GENERAL_PATTERN, Playbook, PrdRequest, TaskHistory, TaskStatus};

/// Maximum number of escalated-task descriptions kept per playbook.
pub const MAX_COMMON_ERRORS: usize = 5;
const COMMON_ERROR_BYTES: usize = 120;
const TEMPLATE_BYTES: usize = 1_500;

/// Default topic vocabulary used to cluster tasks.
pub fn default_topics() -> Vec<String> {
    [
        "api",
        "auth",
        "cache",
        "cli",
        "config",
        "database",
        "docs",
        "endpoint",
        "migration",
        "performance",
        "refactor",
        "test",
        "ui",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Select playbooks relevant to `prd`.
///
/// A playbook matches when its pattern occurs (case-insensitively) in the PRD
/// title or description. Specific matches are ordered by success rate, best
/// first, and capped at `limit`; the `general` playbook is always appended
/// last when present.
pub fn select_playbooks(prd: &PrdRequest, playbooks: &[Playbook], limit: usize) -> Vec<Playbook> {
    let haystack = prd.match_text().to_lowercase();
    let mut matched: Vec<&Playbook> = playbooks
        .iter()
        .filter(|p| p.pattern != GENERAL_PATTERN)
        .filter(|p| {
            let needle = p.pattern.trim().to_lowercase();
            !needle.is_empty() && haystack.contains(&needle)
        })
        .collect();
    matched.sort_by(|a, b| {
        b.success_rate
            .total_cmp(&a.success_rate)
            .then_with(|| a.pattern.cmp(&b.pattern))
    });
    matched.truncate(limit);

    let mut selected: Vec<Playbook> = matched.into_iter().cloned().collect();
    if let Some(general) = playbooks.iter().find(|p| p.pattern == GENERAL_PATTERN) {
        selected.push(general.clone());
    }
    selected
}

/// Topics of `topics` that occur in the PRD text, plus `general`.
pub fn topics_for(prd: &PrdRequest, topics: &[String]) -> Vec<String> {
    let haystack = prd.match_text().to_lowercase();
    let mut matched: Vec<String> = topics
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty() && t != GENERAL_PATTERN && haystack.contains(t.as_str()))
        .collect();
    matched.sort();
    matched.dedup();
    matched.push(GENERAL_PATTERN.to_string());
    matched
}

/// Derive playbooks from the terminal tasks in `history`.
///
/// Every terminal task belongs to the `general` cluster and to each topic its
/// PRD mentions. Patterns without terminal tasks are not emitted, so their
/// stored rows are left untouched. Output is sorted by pattern.
pub fn mine_playbooks(history: &[TaskHistory], topics: &[String], now: &str) -> Vec<Playbook> {
    let mut clusters: BTreeMap<String, Vec<&TaskHistory>> = BTreeMap::new();
    for task in history.iter().filter(|t| t.status.is_terminal()) {
        for topic in topics_for(&task.prd, topics) {
            clusters.entry(topic).or_default().push(task);
        }
    }

    clusters
        .into_iter()
        .map(|(pattern, tasks)| summarize_cluster(pattern, &tasks, now))
        .collect()
}

fn summarize_cluster(pattern: String, tasks: &[&TaskHistory], now: &str) -> Playbook {
    let total = tasks.len() as f64;
    let successes = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Success)
        .count() as f64;
    let iteration_sum: u32 = tasks.iter().map(|t| t.iterations).sum();

    let mut escalated: Vec<&&TaskHistory> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Escalated)
        .collect();
    escalated.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.task_id.cmp(&b.task_id))
    });
    let common_errors = escalated
        .iter()
        .take(MAX_COMMON_ERRORS)
        .map(|t| truncate_with_ellipsis(&t.prd.description, COMMON_ERROR_BYTES))
        .collect();

    let winning_spec_template = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Success)
        .min_by(|a, b| {
            a.iterations
                .cmp(&b.iterations)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.task_id.cmp(&b.task_id))
        })
        .and_then(|t| t.final_spec.as_ref())
        .map(|spec| truncate_with_ellipsis(&render_spec_template(spec), TEMPLATE_BYTES))
        .unwrap_or_default();

    Playbook {
        pattern,
        success_rate: successes / total,
        avg_iterations: f64::from(iteration_sum) / total,
        common_errors,
        winning_spec_template,
        last_updated: now.to_string(),
    }
}
