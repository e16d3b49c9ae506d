use tokio::sync::watch;
use tracing::{info, warn};

/// Spawns a listener for SIGINT/SIGTERM (Ctrl-C elsewhere) and returns a
/// receiver that flips to `true` once, ever. An interrupted session still
/// walks the normal cleanup path; the receiver is just another thing the
/// orchestrator's waits race against.
pub fn spawn_shutdown_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                let _ = tx.send(true);
            }
            Err(e) => warn!(error = %e, "signal registration failed"),
        }
    });
    rx
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
