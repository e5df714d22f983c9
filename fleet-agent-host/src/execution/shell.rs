//! Shell invocation with timeout and captured output
//!
//! Used both for operator commands and for every hypervisor CLI call.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Captured result of one shell invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: u128,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by a STDERR block when stderr is not empty
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\nSTDERR:\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("`{command}` exited with code {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },
}

#[async_trait]
pub trait Shell: Send + Sync {
    /// Run a command line and capture its output, whatever the exit code
    async fn execute(&self, command: &str) -> Result<ShellOutput, ShellError>;

    /// Run a command line, treating a non-zero exit as an error
    async fn run(&self, command: &str) -> Result<String, ShellError> {
        let output = self.execute(command).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(ShellError::Failed {
                command: command.to_string(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs command lines through the host shell (`bash -c` / `cmd /C`)
#[derive(Debug, Clone)]
pub struct SystemShell {
    program: String,
    timeout: Duration,
}

impl SystemShell {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn command(&self, command: &str) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(&self.program);
        if cfg!(target_os = "windows") {
            cmd.args(["/C", command]);
        } else {
            cmd.arg("-c").arg(command);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Shell for SystemShell {
    async fn execute(&self, command: &str) -> Result<ShellOutput, ShellError> {
        let start_time = Instant::now();
        debug!("Executing shell command: {} (timeout: {}s)", command, self.timeout.as_secs());

        let output = tokio::time::timeout(self.timeout, self.command(command).output())
            .await
            .map_err(|_| ShellError::Timeout {
                command: command.to_string(),
                secs: self.timeout.as_secs(),
            })?
            .map_err(|source| ShellError::Spawn {
                command: command.to_string(),
                source,
            })?;

        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }
}
