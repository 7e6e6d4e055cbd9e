use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use testforge_core::{CommandSpec, Error, Result};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was terminated by a signal
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

/// Runs external commands in a working directory.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `command` in `cwd` and waits for it to exit.
    ///
    /// # Errors
    /// Returns `ExternalCommandFailed` on spawn failure or non-zero exit, and
    /// `Cancelled` if `cancel` fires first
    async fn run(
        &self,
        command: &CommandSpec,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput>;
}

/// Runs commands as child processes.
///
/// Children are killed when the wait is abandoned, so a cancelled attempt
/// never leaves an installer running in the background.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        command: &CommandSpec,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let rendered = command.to_string();
        debug!(command = %rendered, cwd = %cwd.display(), "Spawning command");

        let child = Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| Error::ExternalCommandFailed {
                command: rendered.clone(),
                exit_code: None,
                stderr: format!("Failed to spawn: {err}"),
            })?;

        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                warn!(command = %rendered, "Command cancelled, killing child");
                return Err(Error::Cancelled);
            }
            result = child.wait_with_output() => result.map_err(|err| Error::ExternalCommandFailed {
                command: rendered.clone(),
                exit_code: None,
                stderr: format!("Failed to collect output: {err}"),
            })?,
        };

        let captured = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!(
            command = %rendered,
            exit_code = ?captured.exit_code,
            "Command finished"
        );

        if output.status.success() {
            Ok(captured)
        } else {
            Err(Error::ExternalCommandFailed {
                command: rendered,
                exit_code: captured.exit_code,
                stderr: captured.stderr.trim().to_owned(),
            })
        }
    }
}
