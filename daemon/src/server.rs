use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::command::CommandRunner;
use crate::config::TimingConfig;

/// Process names force-killed when the server needs a clean restart.
const SERVER_PROCESS_NAMES: &[&str] = &["jackd", "jackdbus"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioServerStatus {
    Started,
    Stopped,
    Unknown,
}

impl AudioServerStatus {
    /// Reads `jack_control status` output. The tool prints a `--- status`
    /// banner followed by `started` or `stopped`; anything else (including
    /// future formats) is Unknown.
    pub fn parse(text: &str) -> Self {
        if text.contains("started") {
            AudioServerStatus::Started
        } else if text.contains("stopped") {
            AudioServerStatus::Stopped
        } else {
            AudioServerStatus::Unknown
        }
    }
}

/// Keeps the JACK server usable before the session starts, and remembers
/// whether it was this session that (re)started it. A server we did not
/// start is never stopped on the way out; it may belong to someone else's
/// session.
pub struct AudioServerSupervisor<R> {
    runner: R,
    timing: TimingConfig,
    started_by_us: bool,
}

impl<R: CommandRunner> AudioServerSupervisor<R> {
    pub fn new(runner: R, timing: TimingConfig) -> Self {
        Self {
            runner,
            timing,
            started_by_us: false,
        }
    }

    /// Returns true only when THIS call restarted the server. A healthy
    /// pre-existing server returns false with no side effects; a failed
    /// restart also returns false (logged, never propagated).
    pub async fn ensure_running(&mut self) -> bool {
        let needs_restart = match self.query_status().await {
            AudioServerStatus::Started => {
                if self.probe_liveness().await {
                    info!("audio server is up and responsive");
                    false
                } else {
                    warn!("audio server reports started but is unresponsive");
                    true
                }
            }
            status => {
                info!(?status, "audio server not started");
                true
            }
        };

        if !needs_restart {
            return false;
        }

        match self.restart().await {
            Ok(()) => {
                info!("audio server restarted");
                true
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "audio server restart failed");
                false
            }
        }
    }

    pub fn started_by_us(&self) -> bool {
        self.started_by_us
    }

    /// Symmetric shutdown: stops the server only when [`ensure_running`]
    /// started it.
    ///
    /// [`ensure_running`]: Self::ensure_running
    pub async fn stop_if_started_by_us(&self) {
        if !self.started_by_us {
            return;
        }
        match self
            .runner
            .run("jack_control", &["stop"], self.timing.command_timeout())
            .await
        {
            Ok(out) if out.success() => info!("audio server stopped"),
            Ok(out) => warn!(code = ?out.code, "jack_control stop failed"),
            Err(e) => warn!(error = %e, "jack_control stop failed"),
        }
    }

    async fn query_status(&self) -> AudioServerStatus {
        match self
            .runner
            .run("jack_control", &["status"], self.timing.command_timeout())
            .await
        {
            // jack_control's exit code mirrors the status, so parse the text
            // regardless of the code.
            Ok(out) => AudioServerStatus::parse(&out.stdout),
            Err(e) => {
                warn!(error = %e, "status query failed");
                AudioServerStatus::Unknown
            }
        }
    }

    async fn probe_liveness(&self) -> bool {
        match self
            .runner
            .run("jack_lsp", &[], self.timing.command_timeout())
            .await
        {
            Ok(out) if out.success() => true,
            Ok(out) => {
                warn!(code = ?out.code, stderr = %out.stderr.trim(), "liveness probe failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "liveness probe failed");
                false
            }
        }
    }

    async fn restart(&mut self) -> Result<()> {
        for &name in SERVER_PROCESS_NAMES {
            // pkill exits 1 when nothing matched; that's fine.
            let _ = self
                .runner
                .run("pkill", &["-9", "-x", name], self.timing.command_timeout())
                .await;
        }
        tokio::time::sleep(self.timing.server_settle()).await;

        let out = self
            .runner
            .run("jack_control", &["start"], self.timing.command_timeout())
            .await?;
        if !out.success() {
            bail!(
                "jack_control start exited with {:?}: {}",
                out.code,
                out.stderr.trim()
            );
        }
        // The server is ours from this point. Record that before the
        // stabilize sleep: an interrupt landing mid-sleep cancels the rest
        // of this future, and cleanup must still stop the server we
        // started.
        self.started_by_us = true;
        tokio::time::sleep(self.timing.server_stabilize()).await;
        Ok(())
    }
}
