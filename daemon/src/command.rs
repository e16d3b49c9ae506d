use anyhow::{anyhow, Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Captured result of one external command invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Everything this daemon does to the outside world goes through one of the
/// JACK/D-Bus/window-manager utilities, so the whole surface is "run a
/// command, capture output, get an exit code". Components take a runner
/// generically so tests can script the replies.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<CommandOutput>> + Send;
}

/// Runner backed by real child processes. The timeout kills the child via
/// `kill_on_drop` when it expires.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("`{program}` timed out after {}s", timeout.as_secs()))?
            .with_context(|| format!("failed to run `{program}`"))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = SystemRunner
            .run("sh", &["-c", "echo hello"], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_success() {
        let out = SystemRunner
            .run("sh", &["-c", "echo oops >&2; exit 3"], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn missing_executable_is_an_error() {
        let err = SystemRunner
            .run("definitely-not-a-real-binary-xyz", &[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("definitely-not-a-real-binary-xyz"));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = SystemRunner
            .run("sleep", &["5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
