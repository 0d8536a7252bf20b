//! Shell command helpers

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured result of a finished shell command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// stdout with trailing newlines removed
    pub stdout: String,
    /// stderr with trailing newlines removed
    pub stderr: String,
    pub code: Option<i32>,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run `command` through `/bin/bash -c` and wait for it.
///
/// A non-zero exit is not an error here; check [`ShellOutput::success`].
pub async fn run_shell(command: &str) -> Result<ShellOutput> {
    debug!("Executing local command [{}]", command);
    let output = Command::new("/bin/bash")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .with_context(|| format!("Failed to start command: {}", command))?;

    let result = ShellOutput {
        stdout: String::from_utf8_lossy(&output.stdout).trim_matches('\n').to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim_matches('\n').to_string(),
        code: output.status.code(),
    };
    if !result.success() {
        warn!(
            "Command [{}] exited with {:?}: {}",
            command, result.code, result.stderr
        );
    }
    Ok(result)
}
