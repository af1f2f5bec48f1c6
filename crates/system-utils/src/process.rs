use std::fmt;
use std::process::{Output, Stdio};

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::{timeout, Duration};

/// Raised when a child outlives its deadline. The child has been killed by then.
#[derive(Debug, Clone)]
pub struct CommandTimedOut {
    pub label: String,
    pub after: Duration,
}

impl fmt::Display for CommandTimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} timed out after {}s", self.label, self.after.as_secs())
    }
}

impl std::error::Error for CommandTimedOut {}

/// Runs `cmd` to completion with piped output, killing it once `command_timeout` elapses.
pub async fn run_command_with_timeout(
    cmd: &mut Command,
    command_timeout: Duration,
    label: &str,
) -> anyhow::Result<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {label}"))?;
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let collect = async {
        let (stdout, stderr, status) =
            tokio::join!(drain(stdout_pipe), drain(stderr_pipe), child.wait());
        status.map(|status| Output {
            status,
            stdout,
            stderr,
        })
    };
    let outcome = timeout(command_timeout, collect).await;
    match outcome {
        Ok(result) => result.with_context(|| format!("{label} failed")),
        Err(_) => {
            let _ = child.kill().await;
            Err(CommandTimedOut {
                label: label.to_string(),
                after: command_timeout,
            }
            .into())
        }
    }
}

/// Convenience wrapper for an argv vector; the first element is the program.
pub async fn run_argv_with_timeout(
    argv: &[String],
    command_timeout: Duration,
    label: &str,
) -> anyhow::Result<Output> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("{label}: empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    run_command_with_timeout(&mut cmd, command_timeout, label).await
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_status() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "echo hello; echo oops >&2".to_string()];
        let output = run_argv_with_timeout(&argv, Duration::from_secs(5), "echo")
            .await
            .expect("run");
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "oops");
    }

    #[tokio::test]
    async fn reports_timeout_as_typed_error() {
        let argv = vec!["sleep".to_string(), "5".to_string()];
        let err = run_argv_with_timeout(&argv, Duration::from_millis(100), "sleep")
            .await
            .expect_err("timeout");
        let timed_out = err.downcast_ref::<CommandTimedOut>().expect("typed");
        assert_eq!(timed_out.label, "sleep");
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn rejects_empty_argv() {
        let err = run_argv_with_timeout(&[], Duration::from_secs(1), "noop")
            .await
            .expect_err("empty");
        assert!(err.to_string().contains("empty command"));
    }
}
