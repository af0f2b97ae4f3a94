//! Prompt and artifact rendering through minijinja templates.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::types::{PrdRequest, TaskSpec};

const INTAKE_TEMPLATE: &str = include_str!("prompts/intake.md");
const AGENT_TEMPLATE: &str = include_str!("prompts/agent.md");
const SPEC_TEMPLATE: &str = include_str!("prompts/spec.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("intake", INTAKE_TEMPLATE)
            .context("intake template")?;
        env.add_template("agent", AGENT_TEMPLATE)
            .context("agent template")?;
        env.add_template("spec", SPEC_TEMPLATE)
            .context("spec template")?;
        Ok(Self { env })
    }

    /// Clarification prompt for the reasoning oracle.
    pub fn render_intake(&self, prd: &PrdRequest, project: Option<&str>) -> Result<String> {
        let rendered = self.env.get_template("intake")?.render(context! {
            prd => prd,
            project => project.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        debug!(bytes = rendered.len(), "rendered intake prompt");
        Ok(rendered)
    }

    /// One-line-ish instruction for the interactive agent; the spec itself goes on stdin.
    pub fn render_agent_instruction(
        &self,
        spec: &TaskSpec,
        spec_path: &Path,
        workdir: &Path,
    ) -> Result<String> {
        let rendered = self.env.get_template("agent")?.render(context! {
            spec_path => spec_path.display().to_string(),
            workdir => workdir.display().to_string(),
            test_command => &spec.test_command,
            gotchas => &spec.context.gotchas,
        })?;
        Ok(rendered.trim().to_string())
    }

    /// Human-readable Markdown rendering of a spec artifact.
    pub fn render_spec_markdown(&self, spec: &TaskSpec) -> Result<String> {
        let rendered = self
            .env
            .get_template("spec")?
            .render(context! { spec => spec })?;
        Ok(rendered)
    }
}
