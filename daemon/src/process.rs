use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, warn};

/// A child process this daemon launched and is responsible for stopping.
/// The handle is exclusively owned; only the watcher task that took the
/// output streams may read them.
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    child: Child,
}

/// Spawns `program` with piped stdout/stderr for line-by-line monitoring.
pub fn spawn_attached(name: &str, program: &str, args: &[String]) -> Result<ManagedProcess> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to start {name} (`{program}`)"))?;
    debug!(name, pid = child.id(), "spawned");
    Ok(ManagedProcess {
        name: name.to_string(),
        child,
    })
}

/// Spawns `program` in its own session with stdio discarded. Used for the
/// game launcher, which must outlive this daemon and must not receive our
/// terminal signals.
pub fn spawn_detached(program: &str, args: &[String]) -> Result<()> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    cmd.process_group(0);
    let child = cmd
        .spawn()
        .with_context(|| format!("failed to start `{program}`"))?;
    debug!(program, pid = child.id(), "spawned detached");
    // Dropping the handle leaves the child running; the runtime reaps it.
    drop(child);
    Ok(())
}

impl ManagedProcess {
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Cheap pid-only handle for signalling from another task.
    pub fn signal_handle(&self) -> SignalHandle {
        SignalHandle {
            name: self.name.clone(),
            pid: self.child.id(),
        }
    }

    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Graceful stop: SIGTERM, wait up to `grace`, then SIGKILL. Calling
    /// this on an already-exited child is a no-op.
    pub async fn terminate_and_wait(&mut self, grace: Duration) {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(name = %self.name, %status, "already exited");
            return;
        }
        self.signal_handle().terminate();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(name = %self.name, %status, "exited"),
            Ok(Err(e)) => warn!(name = %self.name, error = %e, "wait failed"),
            Err(_) => {
                warn!(
                    name = %self.name,
                    "did not exit within {}s, killing",
                    grace.as_secs()
                );
                if let Err(e) = self.child.kill().await {
                    warn!(name = %self.name, error = %e, "kill failed");
                }
            }
        }
    }
}

/// Pid-addressed termination, usable without the owning handle. Signalling
/// an already-dead pid is silently ignored (ESRCH).
#[derive(Debug, Clone)]
pub struct SignalHandle {
    name: String,
    pid: Option<u32>,
}

impl SignalHandle {
    pub fn terminate(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            debug!(name = %self.name, pid, "sending SIGTERM");
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = &self.name;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_missing_executable_fails() {
        let err = spawn_attached("nope", "definitely-not-a-real-binary-xyz", &[]).unwrap_err();
        assert!(err.to_string().contains("failed to start nope"));
    }

    #[tokio::test]
    async fn terminate_stops_a_running_child_within_grace() {
        let mut proc = spawn_attached("sleeper", "sleep", &["30".to_string()]).unwrap();
        assert!(!proc.has_exited());
        let start = std::time::Instant::now();
        proc.terminate_and_wait(Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(proc.has_exited());
    }

    #[tokio::test]
    async fn terminate_on_already_exited_child_is_a_noop() {
        let mut proc = spawn_attached("true", "true", &[]).unwrap();
        // Let it finish first.
        tokio::time::sleep(Duration::from_millis(200)).await;
        proc.terminate_and_wait(Duration::from_secs(1)).await;
        proc.terminate_and_wait(Duration::from_secs(1)).await;
        assert!(proc.has_exited());
    }

    #[tokio::test]
    async fn detached_spawn_of_missing_launcher_fails() {
        assert!(spawn_detached("/nonexistent/launcher.sh", &[]).is_err());
    }

    #[tokio::test]
    async fn detached_spawn_succeeds_for_real_binary() {
        spawn_detached("true", &[]).unwrap();
    }
}
