use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{self, BusListener};
use crate::command::CommandRunner;
use crate::config::{self, SessionConfig};
use crate::ports::PortConnector;
use crate::presence::{PresenceCounter, PresenceProbe};
use crate::process::{self, ManagedProcess};
use crate::server::AudioServerSupervisor;
use crate::watch::{abort_session, OutputWatcher};

/// Session phases. Transitions are strictly forward (Monitoring loops on
/// itself); any phase can jump to ShuttingDown on interrupt. The fatal
/// bridge marker bypasses ShuttingDown entirely, by design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingAudioServer,
    LaunchingChildren,
    AwaitingGameProcess,
    AwaitingAudioRegistration,
    Connecting,
    Monitoring,
    ShuttingDown,
    Terminated,
}

/// The only errors that surface out of a session: a child we cannot even
/// start. Everything recoverable is handled (and logged) in place.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not start audio bridge `{command}`: {reason:#}")]
    BridgeStartup {
        command: String,
        reason: anyhow::Error,
    },
    #[error("could not start game launcher `{command}`: {reason:#}")]
    LauncherStartup {
        command: String,
        reason: anyhow::Error,
    },
}

/// Drives one game session end to end: audio server check, children,
/// detection, port wiring, monitoring, cleanup. Owns every child it spawns;
/// cleanup runs exactly once no matter which path ends the session.
pub struct SessionOrchestrator<R, P> {
    config: SessionConfig,
    runner: R,
    probe: P,
    state: SessionState,
}

impl<R, P> SessionOrchestrator<R, P>
where
    R: CommandRunner + Clone,
    P: PresenceProbe,
{
    pub fn new(config: SessionConfig, runner: R, probe: P) -> Self {
        Self {
            config,
            runner,
            probe,
            state: SessionState::Idle,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SessionError> {
        let mut supervisor =
            AudioServerSupervisor::new(self.runner.clone(), self.config.timing.clone());

        self.transition(SessionState::AwaitingAudioServer);
        tokio::select! {
            started = supervisor.ensure_running() => {
                if started {
                    info!("audio server was (re)started for this session");
                }
            }
            _ = wait_flag(&mut shutdown) => {
                info!("interrupted during audio server check");
            }
        }

        let mut bridge: Option<ManagedProcess> = None;
        let mut watcher: Option<OutputWatcher> = None;
        let mut listener: Option<BusListener> = None;

        let result = self
            .drive(&mut bridge, &mut watcher, &mut listener, &mut shutdown)
            .await;

        // All exit paths converge here: normal completion, interrupt and
        // startup failure get the same cleanup.
        self.transition(SessionState::ShuttingDown);
        self.cleanup(bridge, watcher, listener, &supervisor).await;
        self.transition(SessionState::Terminated);
        result
    }

    async fn drive(
        &mut self,
        bridge: &mut Option<ManagedProcess>,
        watcher: &mut Option<OutputWatcher>,
        listener: &mut Option<BusListener>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        if *shutdown.borrow() {
            return Ok(());
        }
        let timing = self.config.timing.clone();

        self.transition(SessionState::LaunchingChildren);
        match BusListener::start(
            bus::BUS_MONITOR_COMMAND,
            &bus::monitor_args(),
            &self.config.game.audio_client,
        ) {
            Ok(l) => *listener = Some(l),
            Err(e) => warn!(
                error = %format!("{e:#}"),
                "bus subscriber unavailable, will connect on the deadline"
            ),
        }

        let mut bridge_proc = process::spawn_attached(
            "audio-bridge",
            &self.config.bridge.command,
            &self.config.bridge.args(),
        )
        .map_err(|reason| SessionError::BridgeStartup {
            command: self.config.bridge.command.clone(),
            reason,
        })?;
        let fatal_handle = bridge_proc.signal_handle();
        *watcher = Some(OutputWatcher::spawn(
            &mut bridge_proc,
            config::FATAL_BRIDGE_MARKER,
            |line| info!(target: "bridge", "{line}"),
            move |line| abort_session(&fatal_handle, line),
        ));
        *bridge = Some(bridge_proc);

        // Give the bridge a moment to register its ports before the
        // launcher starts competing for the machine.
        if sleep_interrupted(timing.bridge_warmup(), shutdown).await {
            return Ok(());
        }

        process::spawn_detached(&self.config.game.launcher_path, &[]).map_err(|reason| {
            SessionError::LauncherStartup {
                command: self.config.game.launcher_path.clone(),
                reason,
            }
        })?;
        info!(launcher = %self.config.game.launcher_path, "game launcher started");

        self.transition(SessionState::AwaitingGameProcess);
        info!(
            process = %self.config.game.process_name,
            "waiting for the game process (no deadline)"
        );
        let waited = await_presence(
            &mut self.probe,
            &self.config.game.process_name,
            timing.poll_interval(),
            shutdown,
        )
        .await;
        if waited == WaitExit::Interrupted {
            return Ok(());
        }

        self.transition(SessionState::AwaitingAudioRegistration);
        let deadline = timing.registration_deadline();
        let detected = match listener.as_mut() {
            Some(l) => tokio::select! {
                fired = l.wait_for_detection(deadline) => fired,
                _ = wait_flag(shutdown) => return Ok(()),
            },
            None => {
                if sleep_interrupted(deadline, shutdown).await {
                    return Ok(());
                }
                false
            }
        };
        if detected {
            if let Some(event) = listener.as_ref().and_then(|l| l.detection()) {
                info!(client = %event.client, "audio engine registered");
            }
        } else {
            warn!(
                "no audio client registration within {}s, connecting blind",
                deadline.as_secs()
            );
        }
        if sleep_interrupted(timing.stabilization(), shutdown).await {
            return Ok(());
        }

        self.transition(SessionState::Connecting);
        let connector = PortConnector::new(self.runner.clone(), timing.command_timeout());
        if !connector.port_visible(&self.config.game.audio_client).await {
            warn!(
                client = %self.config.game.audio_client,
                "game ports not visible in jack_lsp yet"
            );
        }
        let previous = connector.focus_window(&self.config.game.process_name).await;
        let outcomes = connector.connect_all(&self.config.connections).await;
        let failed = outcomes.iter().filter(|o| !o.success).count();
        if failed == 0 {
            info!("all {} connections up", outcomes.len());
        } else {
            warn!(
                "{failed}/{} connections failed, continuing with what we have",
                outcomes.len()
            );
        }
        if let Some(prev) = previous {
            connector.restore_focus(&prev).await;
        }
        if let Some(l) = listener.as_mut() {
            l.stop(timing.terminate_grace()).await;
        }

        self.transition(SessionState::Monitoring);
        monitor_until_gone(
            &mut self.probe,
            &self.config.game.process_name,
            timing.poll_interval(),
            timing.miss_threshold,
            shutdown,
        )
        .await;
        Ok(())
    }

    async fn cleanup(
        &mut self,
        bridge: Option<ManagedProcess>,
        watcher: Option<OutputWatcher>,
        listener: Option<BusListener>,
        supervisor: &AudioServerSupervisor<R>,
    ) {
        info!("cleaning up session");
        let grace = self.config.timing.terminate_grace();
        if let Some(mut bridge) = bridge {
            bridge.terminate_and_wait(grace).await;
        }
        drop(watcher);
        if let Some(mut listener) = listener {
            listener.stop(grace).await;
        }
        supervisor.stop_if_started_by_us().await;
        info!("cleanup complete");
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }
}

/// Resolves when the shutdown flag flips to true; pends forever when the
/// signal task is gone without firing.
async fn wait_flag(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
    std::future::pending::<()>().await
}

/// Sleeps for `dur`; returns true when interrupted instead.
async fn sleep_interrupted(dur: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => false,
        _ = wait_flag(shutdown) => true,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum WaitExit {
    Completed,
    Interrupted,
}

/// Polls until the target shows up in the process table. Deliberately has
/// no deadline: the player may sit in the launcher UI for as long as they
/// like. Only an interrupt exits early.
async fn await_presence<P: PresenceProbe>(
    probe: &mut P,
    target: &str,
    interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> WaitExit {
    loop {
        if probe.is_present(target) {
            info!("{target} is running");
            return WaitExit::Completed;
        }
        if sleep_interrupted(interval, shutdown).await {
            return WaitExit::Interrupted;
        }
    }
}

/// Polls until the target has been continuously absent for `threshold`
/// polls. A single sighting resets the count.
async fn monitor_until_gone<P: PresenceProbe>(
    probe: &mut P,
    target: &str,
    interval: Duration,
    threshold: u32,
    shutdown: &mut watch::Receiver<bool>,
) -> WaitExit {
    let mut counter = PresenceCounter::new(threshold);
    loop {
        if sleep_interrupted(interval, shutdown).await {
            return WaitExit::Interrupted;
        }
        let present = probe.is_present(target);
        if !present {
            debug!(misses = counter.misses() + 1, threshold, "{target} not seen");
        }
        if counter.record(present) {
            info!("{target} gone for {threshold} consecutive polls, ending session");
            return WaitExit::Completed;
        }
    }
}
