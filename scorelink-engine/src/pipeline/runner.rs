//! External command invocation
//!
//! [`CommandRunner`] is the seam between the executor and the operating
//! system. [`ProcessRunner`] spawns real child processes; tests can supply
//! their own runner.

use crate::error::StageError;
use async_trait::async_trait;
use scorelink_common::EntryId;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Maximum stderr bytes kept in a [`StageError::Process`]
pub const STDERR_LIMIT: usize = 2048;

/// One fully expanded external call
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub stage: String,
    /// Program followed by its arguments
    pub argv: Vec<String>,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
    /// Entry for per-entry invocations
    pub entry: Option<EntryId>,
}

/// Result of a successful (exit 0) invocation
#[derive(Debug, Clone, Default)]
pub struct InvocationOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Runs invocations; errors are already classified as [`StageError`]s
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutput, StageError>;
}

/// Spawns child processes with `tokio::process`
///
/// The child is killed when its future is dropped, so timeouts and
/// cancellation force-terminate it.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutput, StageError> {
        let stage = invocation.stage.clone();
        let (program, args) = invocation.argv.split_first().ok_or_else(|| StageError::Spawn {
            stage: stage.clone(),
            message: "empty command".to_string(),
        })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }

        let started = Instant::now();
        let child = command.spawn().map_err(|e| StageError::Spawn {
            stage: stage.clone(),
            message: format!("{}: {}", program, e),
        })?;
        debug!(
            stage = %stage,
            program = %program,
            pid = child.id().unwrap_or_default(),
            entry_id = ?invocation.entry,
            "Spawned stage process"
        );

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(StageError::Cancelled { stage });
            }
            result = tokio::time::timeout(invocation.timeout, child.wait_with_output()) => {
                match result {
                    Err(_) => {
                        return Err(StageError::Timeout {
                            stage,
                            timeout: invocation.timeout,
                        });
                    }
                    Ok(Err(e)) => {
                        return Err(StageError::Spawn {
                            stage,
                            message: format!("waiting for {}: {}", program, e),
                        });
                    }
                    Ok(Ok(output)) => output,
                }
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(StageError::Process {
                stage,
                code: output.status.code(),
                stderr: truncate(stderr.trim(), STDERR_LIMIT),
            });
        }

        Ok(InvocationOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
            duration: started.elapsed(),
        })
    }
}

/// Keep the last `limit` bytes (the tail of stderr carries the error)
fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(argv: &[&str], timeout: Duration) -> Invocation {
        Invocation {
            stage: "test".to_string(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
            timeout,
            working_dir: None,
            entry: None,
        }
    }

    #[test]
    fn test_truncate_keeps_tail() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("0123456789", 4), "...6789");
    }

    #[tokio::test]
    async fn test_empty_command_is_spawn_error() {
        let result = ProcessRunner
            .run(&invocation(&[], Duration::from_secs(1)), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StageError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let result = ProcessRunner
            .run(
                &invocation(&["/nonexistent/scorelink-tool"], Duration::from_secs(1)),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(StageError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_captures_stdout() {
        let output = ProcessRunner
            .run(
                &invocation(&["sh", "-c", "echo hello"], Duration::from_secs(5)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_process_error() {
        let result = ProcessRunner
            .run(
                &invocation(&["sh", "-c", "echo boom >&2; exit 3"], Duration::from_secs(5)),
                &CancellationToken::new(),
            )
            .await;
        match result {
            Err(StageError::Process { code, stderr, .. }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected process error, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_distinct_from_process_error() {
        let result = ProcessRunner
            .run(
                &invocation(&["sh", "-c", "sleep 5"], Duration::from_millis(100)),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(StageError::Timeout { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = ProcessRunner
            .run(&invocation(&["sh", "-c", "sleep 5"], Duration::from_secs(10)), &cancel)
            .await;

        assert!(matches!(result, Err(StageError::Cancelled { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
