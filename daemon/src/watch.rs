use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use crate::process::{ManagedProcess, SignalHandle};

/// Watches a managed process's combined output on its own task, surfacing
/// every line and firing a one-shot fatal callback when the line contains
/// `marker`. Read errors are swallowed; only the marker is fatal.
pub struct OutputWatcher {
    handle: JoinHandle<()>,
}

impl OutputWatcher {
    pub fn spawn<L, F>(process: &mut ManagedProcess, marker: &str, on_line: L, on_fatal: F) -> Self
    where
        L: Fn(&str) + Send + 'static,
        F: FnOnce(&str) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = process.take_stdout() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = process.take_stderr() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let marker = marker.to_string();
        let handle = tokio::spawn(async move {
            let mut on_fatal = Some(on_fatal);
            while let Some(line) = rx.recv().await {
                on_line(&line);
                if line.contains(&marker) {
                    if let Some(fatal) = on_fatal.take() {
                        fatal(&line);
                    }
                    break;
                }
            }
        });
        Self { handle }
    }
}

impl Drop for OutputWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// The hard-fault path. A bridge that has printed the fatal marker keeps
/// running but routes no audio, so it must not be left attached: kill it and
/// exit on the spot, skipping all normal cleanup.
pub fn abort_session(bridge: &SignalHandle, line: &str) -> ! {
    error!(%line, "unrecoverable audio bridge error, aborting session");
    bridge.terminate();
    std::process::exit(1);
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            // EOF or a broken stream both just end the watch.
            Ok(None) | Err(_) => break,
        }
    }
}
