//! Spec builder: allocates the task id, composes the first spec and writes its artifact.

use std::path::Path;

use anyhow::Result;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::core::playbook::select_playbooks;
use crate::core::spec::{SpecInputs, compose_spec};
use crate::core::types::{Playbook, PrdRequest, TaskSpec};
use crate::io::prompt::PromptEngine;
use crate::io::spec_store::{SpecPaths, write_spec};

/// Fresh task id: `task-` plus a simple-form UUID v4.
pub fn new_task_id() -> String {
    format!("task-{}", Uuid::new_v4().simple())
}

/// First spec of a run together with where its artifact lives.
#[derive(Debug, Clone)]
pub struct BuiltSpec {
    pub spec: TaskSpec,
    pub paths: SpecPaths,
}

/// Inputs that stay fixed for every build within one run.
pub struct SpecBuilder<'a> {
    pub specs_dir: &'a Path,
    pub prompts: &'a PromptEngine,
    pub test_command: &'a str,
    pub playbook_limit: usize,
}

impl SpecBuilder<'_> {
    /// Build version 1 of the spec for `prd` and persist it.
    ///
    /// Fails only when the artifact cannot be written.
    #[instrument(skip_all, fields(title = %prd.title))]
    pub fn build(
        &self,
        prd: &PrdRequest,
        playbooks: &[Playbook],
        project_context: Option<&str>,
    ) -> Result<BuiltSpec> {
        let task_id = new_task_id();
        let selected = select_playbooks(prd, playbooks, self.playbook_limit);
        let spec = compose_spec(&SpecInputs {
            task_id: &task_id,
            prd,
            playbooks: &selected,
            project_context,
            test_command: self.test_command,
        });
        let paths = write_spec(self.specs_dir, &spec, self.prompts)?;
        info!(
            task_id = %spec.task_id,
            playbooks = selected.len(),
            path = %paths.json_path.display(),
            "spec built"
        );
        Ok(BuiltSpec { spec, paths })
    }
}
