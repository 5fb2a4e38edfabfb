//! Local command execution using `tokio::process`

use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, error, instrument};

use crate::error::ExecError;
use crate::process::{ProcessOutcome, run_process};
use crate::resolve::{needs_resolution, resolve_local};
use crate::result::{CommandResult, Encoding};

/// Local command executor
///
/// Executes an argv directly (no shell) on the local machine.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    /// Create a new local executor
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Run `argv`, resolving `argv[0]` through PATH and the sbin directories
    ///
    /// Failing to spawn an already-resolved binary is reported as exit
    /// status 1 with the error text on stderr.
    ///
    /// # Errors
    /// Returns `ExecError::NotFound` if the binary cannot be resolved and
    /// `ExecError::Timeout` if `timeout` elapses
    #[instrument(skip(self, encoding), level = "debug")]
    pub async fn run(
        &self,
        argv: &[String],
        timeout: Option<Duration>,
        encoding: Encoding,
    ) -> Result<CommandResult, ExecError> {
        let Some(program) = argv.first() else {
            return Err(ExecError::ConfigError("empty command".to_string()));
        };
        let cmd_str = argv.join(" ");
        let start = Instant::now();

        let binary = if needs_resolution(program) {
            resolve_local(program)?
        } else {
            program.into()
        };

        debug!(command = %cmd_str, binary = %binary.display(), "executing local command");

        let mut cmd = Command::new(&binary);
        cmd.args(&argv[1..]);

        let outcome = match run_process(cmd, timeout).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(command = %cmd_str, error = %e, "error executing local command");
                return Ok(CommandResult::from_bytes(
                    1,
                    Vec::new(),
                    e.to_string().into_bytes(),
                    encoding,
                    start.elapsed(),
                ));
            }
        };

        let duration = start.elapsed();

        match outcome {
            ProcessOutcome::Exited {
                status,
                stdout,
                stderr,
            } => {
                debug!(
                    command = %cmd_str,
                    status = status,
                    duration = ?duration,
                    "command completed"
                );
                Ok(CommandResult::from_bytes(
                    status, stdout, stderr, encoding, duration,
                ))
            }
            ProcessOutcome::TimedOut => {
                let timeout = timeout.unwrap_or(duration);
                error!(
                    command = %cmd_str,
                    timeout = ?timeout,
                    elapsed = ?duration,
                    "command timed out"
                );
                Err(ExecError::Timeout {
                    command: cmd_str,
                    host: None,
                    timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Output;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_run_success() {
        let executor = LocalExecutor::new();
        let result = executor
            .run(&argv(&["echo", "hi"]), None, Encoding::Utf8)
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.stderr, "");
    }

    #[tokio::test]
    async fn test_run_failure() {
        let executor = LocalExecutor::new();
        let result = executor
            .run(&argv(&["sh", "-c", "exit 42"]), None, Encoding::Utf8)
            .await
            .unwrap();

        assert!(!result.success());
        assert_eq!(result.status, 42);
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let executor = LocalExecutor::new();
        let err = executor
            .run(
                &argv(&["sleep", "5"]),
                Some(Duration::from_millis(100)),
                Encoding::Utf8,
            )
            .await
            .unwrap_err();

        match err {
            ExecError::Timeout { timeout, host, .. } => {
                assert_eq!(timeout, Duration::from_millis(100));
                assert!(host.is_none());
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_with_stderr() {
        let executor = LocalExecutor::new();
        let result = executor
            .run(&argv(&["sh", "-c", "echo error >&2"]), None, Encoding::Utf8)
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.stderr.as_text().trim(), "error");
        assert!(result.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_raw_encoding() {
        let executor = LocalExecutor::new();
        let result = executor
            .run(&argv(&["printf", "\\377"]), None, Encoding::Raw)
            .await
            .unwrap();

        assert_eq!(result.stdout, Output::Bytes(vec![0xff]));
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_found() {
        let executor = LocalExecutor::new();
        let err = executor
            .run(&argv(&["no-such-tool-xyz"]), None, Encoding::Utf8)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_exit_one() {
        let dir = tempfile::tempdir().unwrap();
        let vanished = dir.path().join("gone");

        let executor = LocalExecutor::new();
        let result = executor
            .run(
                &[vanished.display().to_string()],
                None,
                Encoding::Utf8,
            )
            .await
            .unwrap();

        assert_eq!(result.status, 1);
        assert!(!result.stderr.is_empty());
    }
}
