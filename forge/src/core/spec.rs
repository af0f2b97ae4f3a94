//! Deterministic construction of task specs from a PRD.

use crate::core::text::truncate_with_ellipsis;
use crate::core::types::{Complexity, Playbook, PlaybookHint, PrdRequest, SpecContext, TaskSpec};

const HINT_TEMPLATE_BYTES: usize = 600;

/// Inputs for composing the first spec of a run.
#[derive(Debug, Clone)]
pub struct SpecInputs<'a> {
    pub task_id: &'a str,
    pub prd: &'a PrdRequest,
    pub playbooks: &'a [Playbook],
    pub project_context: Option<&'a str>,
    pub test_command: &'a str,
}

/// Compose the version-1 spec for a run.
pub fn compose_spec(inputs: &SpecInputs<'_>) -> TaskSpec {
    let prd = inputs.prd;
    let requirements: Vec<String> = prd
        .acceptance_criteria
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();

    TaskSpec {
        task_id: inputs.task_id.to_string(),
        version: 1,
        title: prd.title.trim().to_string(),
        description: compose_description(prd, &requirements),
        test_command: inputs.test_command.to_string(),
        context: SpecContext {
            gotchas: Vec::new(),
            project: inputs.project_context.unwrap_or_default().trim().to_string(),
            playbooks: inputs.playbooks.iter().map(playbook_hint).collect(),
        },
        estimated_complexity: Some(estimate_complexity(prd, requirements.len())),
        requirements,
    }
}

fn compose_description(prd: &PrdRequest, requirements: &[String]) -> String {
    let mut out = format!("{}\n\n{}", prd.title.trim(), prd.description.trim());
    if !requirements.is_empty() {
        out.push_str("\n\nAcceptance criteria:");
        for criterion in requirements {
            out.push_str("\n- ");
            out.push_str(criterion);
        }
    }
    out
}

/// Size heuristic: acceptance criteria count plus one point per 50 words.
pub fn estimate_complexity(prd: &PrdRequest, criteria: usize) -> Complexity {
    let words = prd.description.split_whitespace().count();
    match criteria + words / 50 {
        0..=2 => Complexity::Low,
        3..=5 => Complexity::Medium,
        _ => Complexity::High,
    }
}

fn playbook_hint(playbook: &Playbook) -> PlaybookHint {
    PlaybookHint {
        pattern: playbook.pattern.clone(),
        success_rate: playbook.success_rate,
        avg_iterations: playbook.avg_iterations,
        common_errors: playbook.common_errors.clone(),
        template_excerpt: truncate_with_ellipsis(
            &playbook.winning_spec_template,
            HINT_TEMPLATE_BYTES,
        ),
    }
}

/// Plain-text rendering of a spec used as a reusable playbook template.
pub fn render_spec_template(spec: &TaskSpec) -> String {
    let mut out = spec.description.trim().to_string();
    if !spec.context.gotchas.is_empty() {
        out.push_str("\n\nLessons from earlier iterations:");
        for gotcha in &spec.context.gotchas {
            out.push_str("\n- ");
            out.push_str(gotcha.trim());
        }
    }
    out.push_str("\n\nTest command: ");
    out.push_str(&spec.test_command);
    out
}
