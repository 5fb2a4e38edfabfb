//! Child process plumbing shared by the local executor and the native SSH backend

use std::borrow::Cow;
use std::process::Stdio;
use std::time::Duration;

use shell_escape::unix::escape;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

/// How a child process ended
#[derive(Debug)]
pub(crate) enum ProcessOutcome {
    /// Exited (or was signalled) on its own
    Exited {
        status: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    /// Killed and reaped after exceeding the timeout
    TimedOut,
}

/// Spawn `cmd` with piped stdout/stderr and wait for it
///
/// On timeout the child is killed and then waited on so no zombie is left
/// behind.
///
/// # Errors
/// Returns the spawn or wait I/O error
pub(crate) async fn run_process(
    mut cmd: Command,
    limit: Option<Duration>,
) -> std::io::Result<ProcessOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let collect = async {
        let (out, err, status) = tokio::join!(
            read_all(stdout.as_mut()),
            read_all(stderr.as_mut()),
            child.wait()
        );
        Ok::<_, std::io::Error>((out?, err?, status?))
    };

    let finished = match limit {
        Some(limit) => timeout(limit, collect).await.ok(),
        None => Some(collect.await),
    };

    match finished {
        Some(result) => {
            let (stdout, stderr, status) = result?;
            Ok(ProcessOutcome::Exited {
                // killed by a signal: report the conventional non-zero code
                status: status.code().unwrap_or(-1),
                stdout,
                stderr,
            })
        }
        None => {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill timed out process");
            }
            Ok(ProcessOutcome::TimedOut)
        }
    }
}

/// Join `argv` into one POSIX shell command line
///
/// Remote hosts always run a POSIX shell, so the unix quoting rules apply
/// regardless of where this process runs.
pub(crate) fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| escape(Cow::from(arg.as_str())))
        .collect::<Vec<_>>()
        .join(" ")
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<&mut R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}
