//! Shell tool: execute system commands.
//!
//! The child process is killed when the running future is dropped, so an
//! interrupted turn never leaves a command running in the background.

use async_trait::async_trait;
use kestrel_core::error::ToolError;
use kestrel_core::tool::{ToolKind, ToolUse};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::Tool;

/// Execute shell commands in the workspace directory.
pub struct ShellTool {
    workdir: PathBuf,
}

impl ShellTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn command(&self, script: &str) -> Command {
        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", script]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", script]);
            c
        };
        cmd.current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Render command output the way the model sees it.
fn format_output(command: &str, stdout: &str, stderr: &str, code: Option<i32>) -> String {
    let mut out = format!("Ran command: `{}`\n", command.trim());
    let stdout = stdout.trim_end();
    let stderr = stderr.trim_end();

    if !stdout.is_empty() {
        out.push_str(&format!("\n```stdout\n{stdout}\n```\n"));
    }
    if !stderr.is_empty() {
        out.push_str(&format!("\n```stderr\n{stderr}\n```\n"));
    }
    if stdout.is_empty() && stderr.is_empty() {
        out.push_str("\nNo output\n");
    }
    match code {
        Some(0) => {}
        Some(code) => out.push_str(&format!("\nReturn code: {code}\n")),
        None => out.push_str("\nTerminated by signal\n"),
    }
    out.trim_end().to_string()
}

#[async_trait]
impl Tool for ShellTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Shell
    }

    async fn run(&self, tool_use: &ToolUse) -> Result<String, ToolError> {
        let command = tool_use.content.trim();
        if command.is_empty() {
            return Err(ToolError::InvalidArguments("shell: empty command".into()));
        }

        debug!(command = %command, "Executing shell command");

        let output = self
            .command(command)
            .output()
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "shell".into(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code();
        if !output.status.success() {
            warn!(command = %command, exit_code = ?code, "Command failed");
        }

        Ok(format_output(command, &stdout, &stderr, code))
    }
}
