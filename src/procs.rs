//! Cancellable subprocess execution.
//!
//! Every external tool (container runtime, orchestrator CLI, ssh) runs
//! through here so that firing a task's cancellation token terminates the
//! child process and the caller returns promptly.

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::errors::AgentError;

/// Result of a tool invocation. `output` is the combined stdout+stderr
/// bytes, preserved raw for the task log store.
#[derive(Debug)]
pub struct ToolOutput {
    pub success: bool,
    pub output: Vec<u8>,
}

impl ToolOutput {
    /// Combined output as lossy UTF-8, for error messages.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Human-readable command line, for `[COMMAND]` log headers.
pub fn display_command(program: &str, args: &[&str]) -> String {
    let mut s = String::from(program);
    for arg in args {
        s.push(' ');
        s.push_str(arg);
    }
    s
}

/// Spawn `program args..` and wait for it, killing the child if `cancel`
/// fires first. Returns `AgentError::Cancelled` in that case.
pub async fn run_tool(
    cancel: &CancellationToken,
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> Result<ToolOutput, AgentError> {
    if cancel.is_cancelled() {
        return Err(AgentError::Cancelled);
    }

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| AgentError::ToolError(format!("failed to spawn {}: {}", program, e)))?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let reader = tokio::spawn(async move {
        let mut out = Vec::new();
        let mut err = Vec::new();
        if let Some(ref mut s) = stdout {
            let _ = s.read_to_end(&mut out).await;
        }
        if let Some(ref mut s) = stderr {
            let _ = s.read_to_end(&mut err).await;
        }
        out.extend_from_slice(&err);
        out
    });

    tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            reader.abort();
            Err(AgentError::Cancelled)
        }
        status = child.wait() => {
            let status = status
                .map_err(|e| AgentError::ToolError(format!("failed to wait for {}: {}", program, e)))?;
            let output = reader.await.unwrap_or_default();
            Ok(ToolOutput { success: status.success(), output })
        }
    }
}

/// Like [`run_tool`], but a non-zero exit is an error carrying the captured
/// output text.
pub async fn run_tool_checked(
    cancel: &CancellationToken,
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> Result<ToolOutput, AgentError> {
    let out = run_tool(cancel, program, args, cwd).await?;
    if !out.success {
        return Err(AgentError::ToolError(format!(
            "{} failed: {}",
            display_command(program, args),
            out.text().trim()
        )));
    }
    Ok(out)
}

/// Sleep that aborts with `Cancelled` when the token fires.
pub async fn cancellable_sleep(
    cancel: &CancellationToken,
    duration: std::time::Duration,
) -> Result<(), AgentError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
