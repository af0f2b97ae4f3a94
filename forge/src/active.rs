//! Registry of runs currently in flight, keyed by task id.
//!
//! Each run owns an [`ActiveTaskGuard`]; dropping the guard removes the entry,
//! so a run that returns early or unwinds never leaves a stale record.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::core::types::Phase;

/// Snapshot of one in-flight run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveTask {
    pub task_id: String,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prd_title: Option<String>,
}

/// Shared handle; clones observe the same registry.
#[derive(Debug, Clone, Default)]
pub struct ActiveTasks {
    inner: Arc<Mutex<BTreeMap<String, ActiveTask>>>,
}

impl ActiveTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ActiveTask>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track `task_id` until the returned guard is dropped.
    pub fn register(&self, task_id: &str, prd_title: Option<&str>) -> ActiveTaskGuard {
        self.lock().insert(
            task_id.to_string(),
            ActiveTask {
                task_id: task_id.to_string(),
                phase: Phase::SpecGeneration,
                iteration: None,
                prd_title: prd_title.map(str::to_string),
            },
        );
        ActiveTaskGuard {
            registry: self.clone(),
            task_id: task_id.to_string(),
        }
    }

    pub fn get(&self, task_id: &str) -> Option<ActiveTask> {
        self.lock().get(task_id).cloned()
    }

    /// All in-flight runs ordered by task id.
    pub fn snapshot(&self) -> Vec<ActiveTask> {
        self.lock().values().cloned().collect()
    }
}

/// Keeps one registry entry alive.
#[derive(Debug)]
pub struct ActiveTaskGuard {
    registry: ActiveTasks,
    task_id: String,
}

impl ActiveTaskGuard {
    pub fn set_phase(&self, phase: Phase, iteration: Option<u32>) {
        if let Some(entry) = self.registry.lock().get_mut(&self.task_id) {
            entry.phase = phase;
            entry.iteration = iteration;
        }
    }
}

impl Drop for ActiveTaskGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.task_id);
    }
}
