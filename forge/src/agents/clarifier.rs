//! Intake agent deciding whether a PRD is buildable as-is.

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::text::extract_json_object;
use crate::core::types::PrdRequest;
use crate::io::oracle::Oracle;
use crate::io::prompt::PromptEngine;

const INTAKE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/intake.schema.json"
));

/// Upper bound on clarifying questions returned to the operator.
pub const MAX_QUESTIONS: usize = 5;

/// Verdict of intake analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeOutcome {
    pub ready: bool,
    pub questions: Vec<String>,
}

impl IntakeOutcome {
    /// The fail-open verdict: proceed without questions.
    pub fn ready() -> Self {
        Self {
            ready: true,
            questions: Vec::new(),
        }
    }
}

/// Schema-checked reply; `ready` is derived from the questions instead.
#[derive(Debug, Deserialize)]
struct IntakeReply {
    questions: Vec<String>,
}

/// Clarifier backed by a reasoning oracle.
pub struct Clarifier<'a> {
    oracle: &'a dyn Oracle,
    prompts: &'a PromptEngine,
    schema: Validator,
    max_tokens: u32,
}

impl<'a> Clarifier<'a> {
    pub fn new(oracle: &'a dyn Oracle, prompts: &'a PromptEngine, max_tokens: u32) -> Result<Self> {
        let schema_json: Value =
            serde_json::from_str(INTAKE_SCHEMA).context("parse intake schema")?;
        let schema = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema_json)
            .context("compile intake schema")?;
        Ok(Self {
            oracle,
            prompts,
            schema,
            max_tokens,
        })
    }

    /// Ask the oracle whether `prd` needs clarification.
    ///
    /// Never fails: any oracle, parse, or schema problem yields a ready verdict.
    #[instrument(skip_all, fields(title = %prd.title))]
    pub fn analyze(&self, prd: &PrdRequest, project_context: Option<&str>) -> IntakeOutcome {
        match self.try_analyze(prd, project_context) {
            Ok(outcome) => {
                info!(
                    ready = outcome.ready,
                    questions = outcome.questions.len(),
                    "intake analyzed"
                );
                outcome
            }
            Err(err) => {
                warn!(err = %err, "intake failed, proceeding without clarification");
                IntakeOutcome::ready()
            }
        }
    }

    fn try_analyze(&self, prd: &PrdRequest, project_context: Option<&str>) -> Result<IntakeOutcome> {
        let prompt = self.prompts.render_intake(prd, project_context)?;
        let reply = self.oracle.complete(&prompt, self.max_tokens)?;
        debug!(reply_bytes = reply.len(), "intake reply received");
        self.parse_reply(&reply)
    }

    fn parse_reply(&self, reply: &str) -> Result<IntakeOutcome> {
        let raw = extract_json_object(reply).ok_or_else(|| anyhow!("no JSON object in reply"))?;
        let value: Value = serde_json::from_str(raw).context("parse intake reply")?;
        let messages: Vec<String> = self
            .schema
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            bail!("intake reply failed schema: {}", messages.join("; "));
        }
        let parsed: IntakeReply = serde_json::from_value(value).context("decode intake reply")?;
        let questions: Vec<String> = parsed
            .questions
            .iter()
            .map(|q| q.trim())
            .filter(|q| !q.is_empty())
            .take(MAX_QUESTIONS)
            .map(str::to_string)
            .collect();
        Ok(IntakeOutcome {
            ready: questions.is_empty(),
            questions,
        })
    }
}
