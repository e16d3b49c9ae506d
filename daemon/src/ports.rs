use std::time::Duration;
use tracing::{debug, info, warn};

use crate::command::CommandRunner;
use crate::config::PortPair;

/// Result of one `jack_connect` invocation.
#[derive(Debug, Clone)]
pub struct ConnectionOutcome {
    pub src: String,
    pub dst: String,
    pub success: bool,
    pub detail: String,
}

/// Wires physical capture ports into the game's input ports through the
/// external `jack_connect` utility. Failures are per-pair: a bad or slow
/// connect never stops the remaining pairs.
pub struct PortConnector<R> {
    runner: R,
    timeout: Duration,
}

impl<R: CommandRunner> PortConnector<R> {
    pub fn new(runner: R, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    pub async fn connect_all(&self, pairs: &[PortPair]) -> Vec<ConnectionOutcome> {
        let mut outcomes = Vec::with_capacity(pairs.len());
        for pair in pairs {
            info!(src = %pair.src, dst = %pair.dst, "connecting");
            let outcome = match self
                .runner
                .run("jack_connect", &[pair.src.as_str(), pair.dst.as_str()], self.timeout)
                .await
            {
                Ok(out) if out.success() => ConnectionOutcome {
                    src: pair.src.clone(),
                    dst: pair.dst.clone(),
                    success: true,
                    detail: out.stdout.trim().to_string(),
                },
                Ok(out) => {
                    warn!(
                        src = %pair.src,
                        dst = %pair.dst,
                        code = ?out.code,
                        stderr = %out.stderr.trim(),
                        "connect failed"
                    );
                    ConnectionOutcome {
                        src: pair.src.clone(),
                        dst: pair.dst.clone(),
                        success: false,
                        detail: format!("exit {:?}: {}", out.code, out.stderr.trim()),
                    }
                }
                Err(e) => {
                    warn!(src = %pair.src, dst = %pair.dst, error = %e, "connect failed");
                    ConnectionOutcome {
                        src: pair.src.clone(),
                        dst: pair.dst.clone(),
                        success: false,
                        detail: e.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Diagnostic probe: whether `jack_lsp` currently lists a port
    /// containing `needle`. A failed probe just reads as "not visible".
    pub async fn port_visible(&self, needle: &str) -> bool {
        match self.runner.run("jack_lsp", &[], self.timeout).await {
            Ok(out) if out.success() => out.stdout.lines().any(|l| l.contains(needle)),
            Ok(out) => {
                debug!(code = ?out.code, "jack_lsp failed");
                false
            }
            Err(e) => {
                debug!(error = %e, "jack_lsp failed");
                false
            }
        }
    }

    /// Best-effort focus switch to the window whose title contains `title`,
    /// returning the previously active window name so it can be restored.
    /// Every failure here is cosmetic and only logged at debug.
    pub async fn focus_window(&self, title: &str) -> Option<String> {
        let listed = match self.runner.run("wmctrl", &["-l"], self.timeout).await {
            Ok(out) if out.success() => out.stdout.lines().any(|l| l.contains(title)),
            _ => false,
        };
        if !listed {
            debug!(title, "no matching window, skipping focus switch");
            return None;
        }

        let previous = match self
            .runner
            .run("xdotool", &["getactivewindow", "getwindowname"], self.timeout)
            .await
        {
            Ok(out) if out.success() => {
                let name = out.stdout.trim();
                (!name.is_empty()).then(|| name.to_string())
            }
            _ => None,
        };

        if !matches!(
            self.runner.run("wmctrl", &["-a", title], self.timeout).await,
            Ok(ref out) if out.success()
        ) {
            debug!(title, "focus switch failed");
        }
        previous
    }

    /// Best-effort counterpart to [`focus_window`](Self::focus_window).
    pub async fn restore_focus(&self, title: &str) {
        if !matches!(
            self.runner.run("wmctrl", &["-a", title], self.timeout).await,
            Ok(ref out) if out.success()
        ) {
            debug!(title, "focus restore failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use anyhow::{anyhow, Result};
    use std::sync::{Arc, Mutex};

    /// Scripted runner: responses keyed by the joined command line.
    #[derive(Clone, Default)]
    struct ScriptedRunner {
        calls: Arc<Mutex<Vec<String>>>,
        failures: Arc<Mutex<Vec<(String, Script)>>>,
    }

    #[derive(Clone)]
    enum Script {
        Exit(i32, &'static str),
        TimedOut,
    }

    impl ScriptedRunner {
        fn fail(&self, needle: &str, script: Script) {
            self.failures
                .lock()
                .unwrap()
                .push((needle.to_string(), script));
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            program: &str,
            args: &[&str],
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            let call = format!("{program} {}", args.join(" "));
            self.calls.lock().unwrap().push(call.clone());
            let script = self
                .failures
                .lock()
                .unwrap()
                .iter()
                .find(|(needle, _)| call.contains(needle.as_str()))
                .map(|(_, s)| s.clone());
            match script {
                Some(Script::Exit(code, stderr)) => Ok(CommandOutput {
                    code: Some(code),
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                }),
                Some(Script::TimedOut) => Err(anyhow!("`{program}` timed out after 5s")),
                None => Ok(CommandOutput {
                    code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                }),
            }
        }
    }

    fn pairs(specs: &[(&str, &str)]) -> Vec<PortPair> {
        specs
            .iter()
            .map(|(s, d)| PortPair {
                src: s.to_string(),
                dst: d.to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn success_iff_exit_code_zero() {
        let runner = ScriptedRunner::default();
        runner.fail("bad:port", Script::Exit(1, "cannot connect"));
        let connector = PortConnector::new(runner, Duration::from_secs(5));
        let outcomes = connector
            .connect_all(&pairs(&[
                ("RTC_2:capture_1", "Rocksmith2014:in_2"),
                ("bad:port", "Rocksmith2014:in_1"),
            ]))
            .await;
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert!(outcomes[1].detail.contains("cannot connect"));
    }

    #[tokio::test]
    async fn timeout_fails_the_pair_but_not_the_rest() {
        let runner = ScriptedRunner::default();
        runner.fail("slow:port", Script::TimedOut);
        let connector = PortConnector::new(runner.clone(), Duration::from_secs(5));
        let outcomes = connector
            .connect_all(&pairs(&[
                ("slow:port", "Rocksmith2014:in_1"),
                ("RTC_2:capture_1", "Rocksmith2014:in_2"),
            ]))
            .await;
        assert!(!outcomes[0].success);
        assert!(outcomes[0].detail.contains("timed out"));
        // The second pair was still attempted and succeeded.
        assert!(outcomes[1].success);
        assert_eq!(
            runner.calls(),
            vec![
                "jack_connect slow:port Rocksmith2014:in_1",
                "jack_connect RTC_2:capture_1 Rocksmith2014:in_2",
            ]
        );
    }

    #[tokio::test]
    async fn empty_spec_connects_nothing() {
        let runner = ScriptedRunner::default();
        let connector = PortConnector::new(runner.clone(), Duration::from_secs(5));
        assert!(connector.connect_all(&[]).await.is_empty());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn focus_failures_are_swallowed() {
        let runner = ScriptedRunner::default();
        runner.fail("wmctrl", Script::Exit(1, "no wm"));
        runner.fail("xdotool", Script::TimedOut);
        let connector = PortConnector::new(runner, Duration::from_secs(5));
        // No panic, no error surface; just a None previous window.
        assert!(connector.focus_window("Rocksmith2014").await.is_none());
        connector.restore_focus("kitty").await;
    }
}
