use crate::error::{PadError, Result};
use std::process::{Output, Stdio};
use std::time::Duration;
use tracing::{debug, warn};

/// Build a command line for the platform shell. The child is killed when
/// its handle is dropped.
pub fn command(line: &str) -> tokio::process::Command {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = tokio::process::Command::new("cmd");
        cmd.arg("/C").arg(line);
        cmd
    };
    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c").arg(line);
        cmd
    };
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Run `line` to completion, killing it after `timeout`.
///
/// # Errors
/// `PadError::Io` if the shell cannot be spawned, `PadError::Shell` on timeout.
pub async fn output(line: &str, timeout: Duration) -> Result<Output> {
    let child = command(line).spawn()?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(PadError::Shell {
            command: line.to_string(),
            message: format!("timed out after {timeout:?}"),
        }),
    }
}

/// Execute a shell command as a chain action.
///
/// # Errors
/// Returns `PadError::Io` if the command cannot be spawned,
/// or `PadError::Shell` if it times out or exits with a non-zero status.
pub async fn execute(line: &str, timeout: Duration) -> Result<()> {
    let output = output(line, timeout).await?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.is_empty() {
            debug!("shell output: {stdout}");
        }
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("shell command failed ({}): {stderr}", output.status);
        Err(PadError::Shell {
            command: line.to_string(),
            message: format!("{}: {stderr}", output.status),
        })
    }
}
