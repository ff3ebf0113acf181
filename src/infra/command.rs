// Subprocess runner
//
// Runs a command to completion with an absolute timeout, capturing combined
// stdout/stderr so callers can keep a log tail on failure.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// stdout followed by stderr.
    pub output: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command `{command}` exited with status {status}")]
    Failed {
        command: String,
        status: i32,
        output: Vec<u8>,
    },
    #[error("command `{command}` timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
}

impl CommandError {
    /// Captured output, when the process got far enough to produce any.
    pub fn output(&self) -> &[u8] {
        match self {
            CommandError::Failed { output, .. } => output,
            _ => &[],
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CommandRunner;

impl CommandRunner {
    pub async fn run(
        &self,
        cmd: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let command_str = cmd.join(" ");
        let (program, args) = cmd.split_first().ok_or_else(|| CommandError::Spawn {
            command: command_str.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;
        debug!(command = %command_str, cwd = %cwd.display(), "running command");

        let future = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let result = tokio::time::timeout(timeout, future).await.map_err(|_| {
            CommandError::TimedOut {
                command: command_str.clone(),
                timeout,
            }
        })?;
        let output = result.map_err(|source| CommandError::Spawn {
            command: command_str.clone(),
            source,
        })?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        if !output.status.success() {
            return Err(CommandError::Failed {
                command: command_str,
                status: output.status.code().unwrap_or(-1),
                output: combined,
            });
        }
        Ok(CommandOutput { output: combined })
    }
}
