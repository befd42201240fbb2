//! Child process management for runner invocations.
//!
//! [`run_command`] spawns a prepared [`tokio::process::Command`], captures
//! stdout/stderr, and races the child against its timeout and a
//! cancellation token. Timeouts and cancellations kill the child and are
//! reported through [`CommandExit`], not as errors.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::RunnerError;

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: u64 = 10 * 1024 * 1024;

/// How long to wait for the output readers after the child has exited.
///
/// Grandchildren that inherited the pipes can keep them open after the
/// direct child is killed; the readers are abandoned after this bound.
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandExit {
    /// Exited on its own. `None` when terminated by a signal.
    Exited(Option<i32>),
    /// Killed after exceeding the timeout.
    TimedOut,
    /// Killed because the cancellation token fired.
    Cancelled,
}

/// Captured output of a finished child process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit: CommandExit,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Spawn `cmd`, capture its output, and wait for exit, timeout or cancel.
///
/// The caller sets program, arguments and working directory beforehand.
/// Stdin is closed.
pub async fn run_command(
    cmd: &mut Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CommandOutput, RunnerError> {
    // `kill_on_drop(true)` also covers the case where this future is dropped.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let start = Instant::now();

    let mut child = cmd
        .spawn()
        .map_err(|source| RunnerError::Spawn { program, source })?;

    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    let exit = tokio::select! {
        status = child.wait() => CommandExit::Exited(status?.code()),
        () = tokio::time::sleep(timeout) => {
            terminate(&mut child, "timeout").await;
            CommandExit::TimedOut
        }
        () = cancel.cancelled() => {
            terminate(&mut child, "cancellation").await;
            CommandExit::Cancelled
        }
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    let stdout = drain(stdout_task).await;
    let stderr = drain(stderr_task).await;

    Ok(CommandOutput {
        exit,
        stdout,
        stderr,
        duration_ms,
    })
}

/// Kill the child and reap it. Failures are logged: the process may have
/// exited on its own between the race and the kill.
async fn terminate(child: &mut Child, reason: &'static str) {
    tracing::debug!(pid = ?child.id(), reason, "Killing runner process");
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, reason, "Failed to kill runner process");
    }
}

/// Wait (bounded) for a reader task and decode its bytes lossily.
async fn drain(mut task: JoinHandle<Vec<u8>>) -> String {
    match tokio::time::timeout(STREAM_DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            task.abort();
            tracing::warn!("Output stream still open after process exit; discarding");
            String::new()
        }
    }
}

/// Read an entire output stream into a byte buffer, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.take(MAX_OUTPUT_BYTES).read_to_end(&mut buf).await;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bash(script: &str) -> Command {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let mut cmd = bash("echo out; echo err >&2; exit 3");
        let output = run_command(&mut cmd, Duration::from_secs(5), &CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(output.exit, CommandExit::Exited(Some(3)));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn timeout_kills_child() {
        let mut cmd = bash("exec sleep 30");
        let started = Instant::now();
        let output = run_command(
            &mut cmd,
            Duration::from_millis(200),
            &CancellationToken::new(),
        )
        .await
        .expect("run");
        assert_eq!(output.exit, CommandExit::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_kills_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let mut cmd = bash("exec sleep 30");
        let output = run_command(&mut cmd, Duration::from_secs(30), &cancel)
            .await
            .expect("run");
        assert_eq!(output.exit, CommandExit::Cancelled);
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let mut cmd = Command::new("/definitely/not/a/robot");
        let result =
            run_command(&mut cmd, Duration::from_secs(1), &CancellationToken::new()).await;
        assert!(matches!(result, Err(RunnerError::Spawn { .. })));
    }
}
