//! Reasoning oracle abstraction.
//!
//! The [`Oracle`] trait decouples intake from the model backend. The shipped
//! [`CommandOracle`] pipes the prompt into a configured CLI; tests use
//! scripted oracles that return canned replies.

use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::config::OracleConfig;
use crate::io::process::{ProcessLimits, run_command_with_timeout};

/// Free-text completion service.
pub trait Oracle {
    /// Complete `prompt`, spending at most `max_tokens` on the reply.
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String>;
}

/// Oracle backed by a CLI that reads the prompt on stdin and prints the reply.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    config: OracleConfig,
}

impl CommandOracle {
    pub fn new(config: OracleConfig) -> Self {
        Self { config }
    }

    fn command(&self, max_tokens: u32) -> Result<Command> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("oracle.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(flag) = &self.config.max_tokens_flag {
            cmd.arg(flag).arg(max_tokens.to_string());
        }
        Ok(cmd)
    }
}

impl Oracle for CommandOracle {
    #[instrument(skip_all, fields(program = ?self.config.command.first(), max_tokens))]
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let cmd = self.command(max_tokens)?;
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            ProcessLimits {
                timeout: Duration::from_secs(self.config.timeout_secs),
                output_limit_bytes: self.config.output_limit_bytes,
            },
            None,
        )?;
        if output.timed_out {
            warn!(timeout_secs = self.config.timeout_secs, "oracle timed out");
            return Err(anyhow!(
                "oracle timed out after {}s",
                self.config.timeout_secs
            ));
        }
        if !output.succeeded() {
            return Err(anyhow!(
                "oracle exited with status {:?}: {}",
                output.status.code(),
                output.stderr_lossy().trim()
            ));
        }
        let reply = output.stdout_lossy();
        debug!(reply_bytes = reply.len(), "oracle replied");
        Ok(reply)
    }
}
