// pgvault/src/utils/process.rs
//! Subprocess helpers for the dump and restore tools.
//!
//! Children are spawned with `kill_on_drop`, so dropping the surrounding
//! future (job cancellation or deadline) terminates the tool as well.

use flate2::read::MultiGzDecoder;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::io::SyncIoBridge;
use tracing::debug;

use crate::errors::{AppError, Result};
use crate::storage::ObjectReader;

pub fn tool_failure(tool: &str, status: ExitStatus, stderr: &[u8]) -> AppError {
    AppError::Command {
        tool: tool.to_string(),
        status: status.to_string(),
        stderr: String::from_utf8_lossy(stderr).trim().to_string(),
    }
}

/// Runs `command` to completion and returns its standard output.
pub async fn run_capture(mut command: Command, tool: &str) -> Result<Vec<u8>> {
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        return Err(tool_failure(tool, output.status, &output.stderr));
    }
    debug!(tool, bytes = output.stdout.len(), "tool finished");
    Ok(output.stdout)
}

/// Streams `reader` into the standard input of `command`, gunzipping on the
/// way when `gunzip` is set. Returns the number of bytes written to the tool.
pub async fn pipe_into(
    mut command: Command,
    tool: &str,
    reader: ObjectReader,
    gunzip: bool,
) -> Result<u64> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other(format!("{} stdin was not captured", tool)))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other(format!("{} stderr was not captured", tool)))?;

    // Drained concurrently so a chatty tool never blocks on a full pipe.
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let copied = if gunzip {
        let source = SyncIoBridge::new(reader);
        let mut sink = SyncIoBridge::new(stdin);
        tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
            let mut decoder = MultiGzDecoder::new(source);
            let written = std::io::copy(&mut decoder, &mut sink)?;
            sink.shutdown()?;
            Ok(written)
        })
        .await
        .map_err(std::io::Error::other)
        .and_then(|result| result)
    } else {
        let mut source = reader;
        let result = tokio::io::copy(&mut source, &mut stdin).await;
        let _ = stdin.shutdown().await;
        drop(stdin);
        result
    };

    let status = child.wait().await?;
    let stderr = stderr_task.await.unwrap_or_default();

    // A tool that exits early breaks the pipe; its own exit status and
    // stderr are the useful diagnostics then.
    if !status.success() {
        return Err(tool_failure(tool, status, &stderr));
    }
    let written = copied?;
    debug!(tool, bytes = written, "streamed input into tool");
    Ok(written)
}
