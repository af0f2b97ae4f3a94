//! Test validator: re-runs the project test command after an agent iteration.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::classifier::classify_output;
use crate::core::types::TestResults;
use crate::io::config::TestsConfig;
use crate::io::process::{ProcessLimits, run_command_with_timeout};

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 8_000;

#[derive(Debug, Clone)]
pub struct TestRequest {
    /// Shell command line, run through `sh -c`.
    pub command: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub cancel: Option<CancelToken>,
}

impl TestRequest {
    pub fn from_config(config: &TestsConfig, command: &str, workdir: PathBuf) -> Self {
        let limits = config.limits();
        Self {
            command: command.to_string(),
            workdir,
            timeout: limits.timeout,
            output_limit_bytes: limits.output_limit_bytes,
            cancel: None,
        }
    }
}

pub trait TestValidator {
    /// Run the tests and classify the output. Never fails; faults are failed results.
    fn validate(&self, request: &TestRequest) -> TestResults;
}

/// Runs the test command in a shell and classifies its combined output.
pub struct ShellTestValidator;

impl TestValidator for ShellTestValidator {
    #[instrument(skip_all, fields(command = %request.command, timeout_secs = request.timeout.as_secs()))]
    fn validate(&self, request: &TestRequest) -> TestResults {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&request.workdir);

        let output = match run_command_with_timeout(
            cmd,
            None,
            ProcessLimits {
                timeout: request.timeout,
                output_limit_bytes: request.output_limit_bytes,
            },
            request.cancel.as_ref(),
        ) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %err, "test command could not start");
                return TestResults::failed(format!("test command could not start: {err:#}"), "");
            }
        };

        let combined = output.combined_lossy();
        if output.timed_out {
            return TestResults::failed(
                format!(
                    "test command timed out after {:?}\n{}",
                    request.timeout,
                    combined.trim_end()
                ),
                combined,
            );
        }
        if output.cancelled {
            return TestResults::failed(
                format!("test command cancelled\n{}", combined.trim_end()),
                combined,
            );
        }

        let passed = classify_output(&combined);
        info!(passed, exit_code = ?output.status.code(), "tests finished");
        if passed {
            TestResults::passed(combined)
        } else {
            TestResults::failed(combined.clone(), combined)
        }
    }
}
