//! Phase events for external subscribers.
//!
//! Publishing is best-effort: [`emit`] logs publisher errors and contains
//! panics so a broken subscriber never aborts a run.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::core::types::Phase;

/// One phase transition of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseEvent {
    /// RFC 3339 timestamp.
    pub at: String,
    /// Absent before a task id is allocated (clarification).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    pub message: String,
}

pub trait EventPublisher {
    fn publish(&self, event: &PhaseEvent) -> Result<()>;
}

/// Default publisher that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: &PhaseEvent) -> Result<()> {
        Ok(())
    }
}

/// Appends one JSON object per line.
#[derive(Debug)]
pub struct JsonlPublisher {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

impl EventPublisher for JsonlPublisher {
    fn publish(&self, event: &PhaseEvent) -> Result<()> {
        let mut line = serde_json::to_string(event).context("serialize event")?;
        line.push('\n');
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create events dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open events {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append events {}", self.path.display()))
    }
}

/// Publish `event`, swallowing errors and panics.
pub fn emit(publisher: &dyn EventPublisher, event: PhaseEvent) {
    trace!(phase = event.phase.as_str(), "emitting event");
    match panic::catch_unwind(AssertUnwindSafe(|| publisher.publish(&event))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(err = %err, phase = event.phase.as_str(), "event publish failed"),
        Err(_) => warn!(phase = event.phase.as_str(), "event publisher panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(phase: Phase) -> PhaseEvent {
        PhaseEvent {
            at: "2026-01-01T00:00:00Z".to_string(),
            task_id: Some("task-1".to_string()),
            phase,
            iteration: Some(1),
            message: "hello".to_string(),
        }
    }

    struct Panicking;

    impl EventPublisher for Panicking {
        fn publish(&self, _event: &PhaseEvent) -> Result<()> {
            panic!("subscriber bug");
        }
    }

    #[test]
    fn jsonl_appends_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/events.jsonl");
        let publisher = JsonlPublisher::new(&path);
        emit(&publisher, event(Phase::AgentRun));
        emit(&publisher, event(Phase::Validation));

        let contents = fs::read_to_string(&path).expect("read");
        let phases: Vec<Phase> = contents
            .lines()
            .map(|line| serde_json::from_str::<PhaseEvent>(line).expect("parse").phase)
            .collect();
        assert_eq!(phases, vec![Phase::AgentRun, Phase::Validation]);
        assert!(contents.contains("\"phase\":\"agent_run\""));
    }

    #[test]
    fn panicking_publisher_is_contained() {
        emit(&Panicking, event(Phase::Complete));
    }

    #[test]
    fn failing_publisher_is_contained() {
        let temp = tempfile::tempdir().expect("tempdir");
        // A directory where the file should be makes every append fail.
        let publisher = JsonlPublisher::new(temp.path());
        emit(&publisher, event(Phase::Escalate));
    }
}
