//! Iteration controller: the success / retry / escalate decision.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::text::{tail, truncate_with_ellipsis};
use crate::core::types::{TaskSpec, TestResults};

pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

const EXCERPT_SOURCE_BYTES: usize = 4_000;
const EXCERPT_MAX_LINES: usize = 8;
const EXCERPT_MAX_BYTES: usize = 800;

static ERROR_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error|fail|panic|assert|expected|exception|traceback|timed out")
        .expect("error line pattern is valid")
});

/// Decision for the current iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Tests passed. Terminal.
    Success,
    /// Run another iteration with `feedback` appended to the spec's gotchas.
    Retry { feedback: String },
    /// Iteration budget exhausted. Terminal; `message` is shown to a human.
    Escalate { message: String },
}

/// Decide what happens after `iteration` (1-based) produced `results`.
pub fn decide(
    spec: &TaskSpec,
    results: &TestResults,
    iteration: u32,
    max_iterations: u32,
) -> Verdict {
    if results.passed {
        return Verdict::Success;
    }
    let excerpt = condense_failure(results);
    if iteration >= max_iterations {
        return Verdict::Escalate {
            message: format!(
                "Escalated task {} after {iteration} iteration(s) without passing tests. Last failure: {excerpt}",
                spec.task_id
            ),
        };
    }
    Verdict::Retry {
        feedback: format!("Iteration {iteration} failed: {excerpt}"),
    }
}

/// Condense a failed result to a short excerpt suitable for a gotcha.
///
/// Prefers error-looking lines near the end of the error text (or output when
/// no error was captured); falls back to the last few non-empty lines.
pub fn condense_failure(results: &TestResults) -> String {
    let source = results
        .error
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| results.output.trim());
    if source.is_empty() {
        return "tests failed without output".to_string();
    }

    let window = tail(source, EXCERPT_SOURCE_BYTES);
    let lines: Vec<&str> = window
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let flagged: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|l| ERROR_LINE_RE.is_match(l))
        .collect();
    let picked = if flagged.is_empty() { &lines } else { &flagged };
    let start = picked.len().saturating_sub(EXCERPT_MAX_LINES);
    truncate_with_ellipsis(&picked[start..].join("\n"), EXCERPT_MAX_BYTES)
}
