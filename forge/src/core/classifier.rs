//! Heuristic pass/fail classification of test and agent output.
//!
//! Backends do not guarantee structured output, so the verdict is derived
//! from phrases in the captured text. Kept pure so the pattern policy can be
//! revised without touching orchestration.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::text::tail;

/// Bytes from the end of agent output that are scanned for a verdict.
pub const AGENT_TAIL_BYTES: usize = 4_000;

static SUCCESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)all tests passed|\b\d+ passed, 0 failed\b|passed|success|✓|✔")
        .expect("success pattern is valid")
});

static FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[1-9]\d* failed\b|tests failed|error: \S").expect("failure pattern is valid")
});

/// Classify `text` as passed.
///
/// Passed requires a success phrase and no failure phrase. Empty or
/// ambiguous output is failed.
pub fn classify_output(text: &str) -> bool {
    if text.trim().is_empty() {
        return false;
    }
    SUCCESS_RE.is_match(text) && !FAILURE_RE.is_match(text)
}

/// Classify only the last `max_bytes` of `text`.
pub fn classify_tail(text: &str, max_bytes: usize) -> bool {
    classify_output(tail(text, max_bytes))
}
