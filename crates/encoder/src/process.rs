use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use crate::error::{EncodeError, Result};

/// Captured output of a finished tool
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Keep only the tail of long tool logs in error messages
const STDERR_TAIL_LINES: usize = 20;

async fn collect_lines<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = Vec::new();
    let mut line_stream = BufReader::new(reader).lines();
    while let Ok(Some(line)) = line_stream.next_line().await {
        lines.push(line);
    }
    lines.join("\n")
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Run an external tool to completion, capturing stdout and stderr.
///
/// The child is killed if the returned future is dropped, which is how a
/// stop request interrupts a long encode.
pub async fn run_tool<I, S>(program: &Path, args: I) -> Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    run_tool_accepting(program, args, &[0]).await
}

/// Like [`run_tool`], for tools that signal warnings with a nonzero exit code
pub async fn run_tool_accepting<I, S>(program: &Path, args: I, accepted: &[i32]) -> Result<ToolOutput>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    let tool = program
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| program.display().to_string());
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();

    let cmd_str = format!(
        "{} {}",
        program.display(),
        args.iter().map(|a| a.to_string_lossy()).collect::<Vec<_>>().join(" ")
    );
    debug!("Executing: {}", cmd_str);

    let mut child = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| EncodeError::tool(&tool, format!("failed to spawn {}: {}", program.display(), e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EncodeError::tool(&tool, "failed to capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EncodeError::tool(&tool, "failed to capture stderr"))?;

    let stdout_handle = tokio::spawn(collect_lines(stdout));
    let stderr_handle = tokio::spawn(collect_lines(stderr));

    let status = child
        .wait()
        .await
        .map_err(|e| EncodeError::tool(&tool, format!("failed to wait for process: {}", e)))?;

    let stdout = stdout_handle.await.unwrap_or_default();
    let stderr = stderr_handle.await.unwrap_or_default();

    let ok = status.code().map(|c| accepted.contains(&c)).unwrap_or(false);
    if !ok {
        return Err(EncodeError::tool(
            &tool,
            format!(
                "exit code {}\nCommand: {}\nSTDERR:\n{}",
                status.code().unwrap_or(-1),
                cmd_str,
                tail(&stderr, STDERR_TAIL_LINES)
            ),
        ));
    }

    Ok(ToolOutput {
        exit_code: status.code(),
        stdout,
        stderr,
    })
}

/// Treat a missing or empty output file as a tool failure
pub fn ensure_output(tool: &str, output: &Path) -> Result<()> {
    match std::fs::metadata(output) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => Err(EncodeError::tool(tool, format!("output is empty: {}", output.display()))),
        Err(_) => Err(EncodeError::tool(tool, format!("output missing: {}", output.display()))),
    }
}
