use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// One fresh process-table probe per call; no caching. Injected into the
/// orchestrator so the wait/monitor loops can be tested with scripted
/// results.
pub trait PresenceProbe: Send {
    fn is_present(&mut self, target: &str) -> bool;
}

/// sysinfo-backed probe. Matches when the process name or any command-line
/// argument contains `target`; the game runs under wine-preloader, so the
/// binary name alone is not reliable. Processes that vanish mid-scan simply
/// don't match.
pub struct SystemPresence {
    sys: System,
}

impl SystemPresence {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }
}

impl PresenceProbe for SystemPresence {
    fn is_present(&mut self, target: &str) -> bool {
        // Command lines are not part of the default refresh, and on Linux
        // the bare process name is the 15-char comm field, so ask for cmd
        // explicitly on every scan.
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        self.sys.processes().values().any(|p| {
            p.name().to_string_lossy().contains(target)
                || p.cmd()
                    .iter()
                    .any(|arg| arg.to_string_lossy().contains(target))
        })
    }
}

/// Consecutive-miss counter deciding when the game is really gone. A single
/// hit resets it; the game is judged gone only after `threshold` misses in a
/// row, so one flaky scan never ends the session.
#[derive(Debug)]
pub struct PresenceCounter {
    misses: u32,
    threshold: u32,
}

impl PresenceCounter {
    pub fn new(threshold: u32) -> Self {
        Self { misses: 0, threshold }
    }

    /// Records one probe result and returns whether the threshold was hit.
    pub fn record(&mut self, present: bool) -> bool {
        if present {
            self.misses = 0;
        } else {
            self.misses += 1;
        }
        self.misses >= self.threshold
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }
}
