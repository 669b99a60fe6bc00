//! Script executor: run a user-supplied script under an interpreter.
//!
//! The body is written to a scratch file, the prior-node output is
//! injected through the `CASCADE_INPUT` environment variable, and the
//! process is killed at the timeout. The scratch file is removed on all
//! exit paths (the temp handle deletes on drop).

use async_trait::async_trait;
use serde_json::json;
use std::io::Write;
use std::process::Stdio;
use tokio::process::Command;

use super::{config_mismatch, ExecutionContext, Executor, ExecutorOutcome};
use crate::dag::NodeConfig;
use crate::error::{CascadeError, Result};

const DEFAULT_TIMEOUT_MS: u64 = 60_000;

pub struct ScriptExecutor {
    /// Working directory for scratch files; system temp when unset
    script_dir: Option<String>,
}

impl ScriptExecutor {
    pub fn new(script_dir: Option<String>) -> Self {
        Self { script_dir }
    }
}

#[async_trait]
impl Executor for ScriptExecutor {
    fn kind(&self) -> &'static str {
        "script"
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        ctx: &ExecutionContext,
    ) -> Result<ExecutorOutcome> {
        let NodeConfig::Script(config) = config else {
            return Err(config_mismatch(self.kind()));
        };

        let mut builder = tempfile::Builder::new();
        builder.prefix("cascade-script-").suffix(config.language.file_suffix());

        let mut scratch = match &self.script_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|e| {
            CascadeError::executor_failure(format!("Failed to create scratch file: {}", e))
        })?;

        scratch
            .write_all(config.body.as_bytes())
            .map_err(|e| CascadeError::executor_failure(format!("Failed to write script: {}", e)))?;
        scratch
            .flush()
            .map_err(|e| CascadeError::executor_failure(format!("Failed to write script: {}", e)))?;

        let input = serde_json::to_string(&ctx.input)?;
        let timeout_ms = config.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);

        let child = Command::new(config.language.interpreter())
            .arg(scratch.path())
            .env("CASCADE_INPUT", input)
            .env("CASCADE_RUN_ID", ctx.run_id.to_string())
            .env("CASCADE_NODE_ID", &ctx.node_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => CascadeError::config_missing(format!(
                    "Interpreter {:?} is not installed on this worker",
                    config.language.interpreter()
                )),
                _ => CascadeError::executor_failure(format!("Failed to spawn script: {}", e)),
            })?;

        let output = tokio::time::timeout(
            std::time::Duration::from_millis(timeout_ms),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| {
            CascadeError::executor_timeout(format!("Script exceeded {} ms", timeout_ms))
        })?
        .map_err(|e| CascadeError::executor_failure(format!("Script wait failed: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            return Err(CascadeError::with_internal(
                crate::error::ErrorCode::ExecutorFailure,
                format!("Script exited with code {}", exit_code),
                stderr.clone(),
            ));
        }

        Ok(ExecutorOutcome::Success(json!({
            "stdout": stdout,
            "stderr": stderr,
            "exitCode": exit_code,
        })))
    }
}
