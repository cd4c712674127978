// ABOUTME: Runs source code and shell commands inside sandboxes
// ABOUTME: Every failure is folded into the returned result with a -1 exit code

use crate::engine::ExecRequest;
use crate::error::{Result, SandboxError};
use crate::files::{list_entries, FileTransfer};
use crate::manager::SandboxManager;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Exit code reported when the run never produced one
pub const FAILURE_EXIT_CODE: i64 = -1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    /// Files in the results directory changed since the run started
    pub new_files: Vec<String>,
    pub file_links: Vec<String>,
    pub machine_file_links: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    fn failure(message: String) -> Self {
        Self {
            stderr: message.clone(),
            exit_code: FAILURE_EXIT_CODE,
            error: Some(message),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    fn failure(message: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.clone(),
            exit_code: FAILURE_EXIT_CODE,
            error: Some(message),
        }
    }
}

/// Executes code and commands in sandboxes
pub struct CodeExecutor {
    manager: Arc<SandboxManager>,
    files: FileTransfer,
}

impl CodeExecutor {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        let files = FileTransfer::new(manager.clone());
        Self { manager, files }
    }

    /// Run `source` with the configured interpreter and report files it produced
    pub async fn run_code(&self, sandbox_id: &str, source: &str) -> ExecutionResult {
        match self.try_run_code(sandbox_id, source).await {
            Ok(result) => result,
            Err(e) => {
                error!(sandbox = %sandbox_id, "Code execution failed: {}", e);
                ExecutionResult::failure(e.to_string())
            }
        }
    }

    async fn try_run_code(&self, sandbox_id: &str, source: &str) -> Result<ExecutionResult> {
        self.manager.resolve(sandbox_id).await?;

        let execution = &self.manager.config().execution;
        let results_dir = self.manager.config().docker.container_work_dir.as_str();

        tokio::time::sleep(execution.settle_delay()).await;
        let start_ts = Utc::now().timestamp();

        let sandbox = self.manager.acquire_running(sandbox_id).await?;
        info!(sandbox_id = %sandbox.sandbox().short_id(), "Running code");
        debug!("Source:\n{}", source);

        let script_path = format!("/tmp/sandbox-run-{}.py", Uuid::new_v4().simple());

        let staged = sandbox
            .exec(
                ExecRequest::shell(format!("cat > {}", script_path))
                    .stdin(source.as_bytes().to_vec())
                    .working_dir(results_dir)
                    .combined(),
            )
            .await
            .map_err(|e| SandboxError::engine("staging source", e))?;

        if !staged.success() {
            let output = staged.stdout_lossy();
            error!(sandbox_id = %sandbox.sandbox().short_id(), "Failed to stage source: {}", output);
            return Ok(ExecutionResult {
                stderr: output,
                exit_code: staged.exit_code,
                error: Some("Failed to prepare code for execution".to_string()),
                ..Default::default()
            });
        }

        let run = sandbox
            .exec(
                ExecRequest::new([execution.interpreter.as_str(), script_path.as_str()])
                    .working_dir(results_dir),
            )
            .await;

        match sandbox
            .exec(ExecRequest::shell(format!("rm -f {}", script_path)))
            .await
        {
            Ok(output) if output.success() => {}
            Ok(output) => warn!("Failed to remove {}: {}", script_path, output.stderr_lossy()),
            Err(e) => warn!("Failed to remove {}: {}", script_path, e),
        }

        let output = run.map_err(|e| SandboxError::engine("running code", e))?;

        let new_files: Vec<String> = list_entries(&sandbox, results_dir, true)
            .await
            .into_iter()
            .filter(|entry| entry.change_time >= start_ts)
            .map(|entry| entry.path)
            .collect();

        let file_links = new_files
            .iter()
            .map(|path| self.files.file_link(sandbox.id(), path))
            .collect();
        let machine_file_links = new_files
            .iter()
            .map(|path| self.files.machine_file_link(sandbox.name(), path))
            .collect();

        let result = ExecutionResult {
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            exit_code: output.exit_code,
            new_files,
            file_links,
            machine_file_links,
            error: None,
        };

        info!(
            sandbox_id = %sandbox.sandbox().short_id(),
            exit_code = result.exit_code,
            new_files = result.new_files.len(),
            "Code finished"
        );
        if !result.stderr.is_empty() {
            warn!("stderr:\n{}", result.stderr);
        }

        Ok(result)
    }

    /// Run a shell command with stdout and stderr captured together
    pub async fn run_command(&self, sandbox_id: &str, command: &str) -> CommandResult {
        match self.try_run_command(sandbox_id, command).await {
            Ok(result) => result,
            Err(e) => {
                error!(sandbox = %sandbox_id, "Command failed: {}", e);
                CommandResult::failure(e.to_string())
            }
        }
    }

    async fn try_run_command(&self, sandbox_id: &str, command: &str) -> Result<CommandResult> {
        if command.trim().is_empty() {
            return Err(SandboxError::Validation(
                "command must not be empty".to_string(),
            ));
        }

        self.manager.resolve(sandbox_id).await?;
        let sandbox = self.manager.acquire_running(sandbox_id).await?;
        info!(sandbox_id = %sandbox.sandbox().short_id(), "Running command: {}", command);

        let output = sandbox
            .exec(ExecRequest::shell(command).combined())
            .await
            .map_err(|e| SandboxError::engine(format!("running {:?}", command), e))?;

        Ok(CommandResult {
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            exit_code: output.exit_code,
            error: None,
        })
    }
}
