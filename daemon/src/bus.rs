use anyhow::Result;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::process::{self, ManagedProcess};

pub const BUS_MONITOR_COMMAND: &str = "dbus-monitor";
pub const JACK_PATCHBAY_INTERFACE: &str = "org.jackaudio.JackPatchbay";
pub const CLIENT_APPEARED_MEMBER: &str = "ClientAppeared";

/// `dbus-monitor` argument vector, filtered down to the one signal we care
/// about so the parser sees as little unrelated traffic as possible.
pub fn monitor_args() -> Vec<String> {
    vec![
        "--session".to_string(),
        format!(
            "type='signal',interface='{JACK_PATCHBAY_INTERFACE}',member='{CLIENT_APPEARED_MEMBER}'"
        ),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEventKind {
    ClientAppeared,
}

/// One parsed signal block. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub kind: BusEventKind,
    pub client: String,
    /// The source lines the event was parsed from, for diagnostics.
    pub raw: String,
}

/// Incremental parser over `dbus-monitor` output.
///
/// A line starting with `signal ` opens a new block and closes the previous
/// one. A closed block produces an event when its header names both the
/// patchbay interface and the ClientAppeared member AND the last quoted
/// string argument in its body contains the target pattern. Everything else
/// (method calls, other members, unknown header fields) is skipped opaquely.
/// Fires at most once; later matches are ignored.
#[derive(Debug)]
pub struct BlockParser {
    target: String,
    current: Option<Vec<String>>,
    fired: bool,
}

impl BlockParser {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            current: None,
            fired: false,
        }
    }

    /// Feeds one line; returns an event when the just-closed block matched.
    pub fn push_line(&mut self, line: &str) -> Option<BusEvent> {
        if line.starts_with("signal ") {
            let finished = self.current.take();
            self.current = Some(vec![line.to_string()]);
            return self.close(finished);
        }
        if let Some(block) = &mut self.current {
            block.push(line.to_string());
        }
        None
    }

    /// Closes the trailing block at end of stream.
    pub fn flush(&mut self) -> Option<BusEvent> {
        let finished = self.current.take();
        self.close(finished)
    }

    fn close(&mut self, block: Option<Vec<String>>) -> Option<BusEvent> {
        if self.fired {
            return None;
        }
        let block = block?;
        let header = &block[0];
        if !header.contains(&format!("member={CLIENT_APPEARED_MEMBER}"))
            || !header.contains(JACK_PATCHBAY_INTERFACE)
        {
            return None;
        }
        // ClientAppeared carries (graph version, client id, client name);
        // the name is the last string argument.
        let client = block[1..].iter().filter_map(|l| quoted_string(l)).last()?;
        if !client.contains(&self.target) {
            debug!(%client, "client appeared, not the target");
            return None;
        }
        self.fired = true;
        Some(BusEvent {
            kind: BusEventKind::ClientAppeared,
            client,
            raw: block.join("\n"),
        })
    }
}

fn quoted_string(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with("string ") {
        return None;
    }
    trimmed.split('"').nth(1).map(str::to_string)
}

/// Read side of the one-shot detection latch. Once fired it never resets for
/// the rest of the session; any number of clones may wait on it.
#[derive(Debug, Clone)]
pub struct DetectionSignal {
    rx: watch::Receiver<Option<BusEvent>>,
}

pub(crate) fn detection_channel() -> (watch::Sender<Option<BusEvent>>, DetectionSignal) {
    let (tx, rx) = watch::channel(None);
    (tx, DetectionSignal { rx })
}

impl DetectionSignal {
    pub fn fired(&self) -> Option<BusEvent> {
        self.rx.borrow().clone()
    }

    /// Blocks up to `timeout`, returning whether the latch fired.
    pub async fn wait(&mut self, timeout: Duration) -> bool {
        if self.rx.borrow().is_some() {
            return true;
        }
        let changed = async {
            while self.rx.changed().await.is_ok() {
                if self.rx.borrow().is_some() {
                    return true;
                }
            }
            if self.rx.borrow().is_some() {
                return true;
            }
            // Writer gone without firing. The subscriber dying early must
            // not cut the caller's deadline short: the client can still
            // register, we just can't see it, so hold out for the full
            // window before the caller falls back to a blind connect.
            std::future::pending::<bool>().await
        };
        tokio::time::timeout(timeout, changed).await.unwrap_or(false)
    }
}

/// Long-lived `dbus-monitor` subscription plus the parsing task feeding the
/// detection latch.
pub struct BusListener {
    subscriber: Option<ManagedProcess>,
    parser_task: Option<JoinHandle<()>>,
    signal: DetectionSignal,
}

impl BusListener {
    /// Spawns the subscriber process and starts parsing its output.
    pub fn start(program: &str, args: &[String], target: &str) -> Result<Self> {
        let mut subscriber = process::spawn_attached("bus-subscriber", program, args)?;
        let (tx, signal) = detection_channel();
        let parser_task = subscriber.take_stdout().map(|stdout| {
            let target = target.to_string();
            tokio::spawn(async move {
                let mut parser = BlockParser::new(&target);
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(event) = parser.push_line(&line) {
                        info!(client = %event.client, "target audio client appeared on the bus");
                        let _ = tx.send(Some(event));
                        return;
                    }
                }
                if let Some(event) = parser.flush() {
                    info!(client = %event.client, "target audio client appeared on the bus");
                    let _ = tx.send(Some(event));
                }
            })
        });
        Ok(Self {
            subscriber: Some(subscriber),
            parser_task,
            signal,
        })
    }

    pub fn detection(&self) -> Option<BusEvent> {
        self.signal.fired()
    }

    /// Blocks up to `timeout`; true when the target client registered.
    pub async fn wait_for_detection(&mut self, timeout: Duration) -> bool {
        self.signal.wait(timeout).await
    }

    /// Stops the subscriber. Idempotent: safe if never started or already
    /// stopped.
    pub async fn stop(&mut self, grace: Duration) {
        if let Some(mut subscriber) = self.subscriber.take() {
            subscriber.terminate_and_wait(grace).await;
        }
        if let Some(mut task) = self.parser_task.take() {
            // Terminating the subscriber closes the stream, so the parser
            // normally finishes on its own after flushing the last block.
            if tokio::time::timeout(Duration::from_millis(250), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
    }
}
