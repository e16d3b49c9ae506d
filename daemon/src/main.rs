mod bus;
mod command;
mod config;
mod ports;
mod presence;
mod process;
mod server;
mod session;
mod signals;
mod watch;

use std::path::PathBuf;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = match config_path() {
        Some(path) => config::load_or_default(&path).unwrap_or_else(|e| {
            warn!(error = %format!("{e:#}"), "config unusable, using defaults");
            config::SessionConfig::default()
        }),
        None => config::SessionConfig::default(),
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        game = %config.game.process_name,
        "rocksession starting"
    );

    let shutdown = signals::spawn_shutdown_listener();
    let orchestrator = session::SessionOrchestrator::new(
        config,
        command::SystemRunner,
        presence::SystemPresence::new(),
    );

    match orchestrator.run(shutdown).await {
        Ok(()) => info!("session complete"),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}

/// `$XDG_CONFIG_HOME/rocksession/config.toml`, falling back to
/// `~/.config`. The file is optional; without it the compiled-in defaults
/// apply.
fn config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("rocksession").join("config.toml"))
}
