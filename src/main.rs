//! p2w-server: the Ping 2 Win contest server
//!
//! Clients race to register a win over short TCP exchanges:
//! - One text command per connection, one response, then close
//! - Per-address rate limiting of scored attempts
//! - Session tracking with heartbeat timeouts
//! - Gapless, first-come ranking of winners
//! - Debounced, crash-safe ledger persistence with periodic snapshots
//! - Configuration via CLI arguments or TOML file

mod blacklist;
mod config;
mod ledger;
mod persistence;
mod protocol;
mod rate_limiter;
mod server;
mod sessions;
mod state;
mod stats;
mod validation;

use blacklist::Blacklist;
use config::Config;
use server::Server;
use state::ContestState;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    if let Some(path) = &config.save_config {
        config.save(path)?;
        println!("Wrote configuration to {}", path.display());
        return Ok(());
    }

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        rate_limit_window_secs = config.rate_limit_window.as_secs(),
        session_timeout_secs = config.session_timeout.as_secs(),
        ledger = %config.ledger_path.display(),
        "Starting p2w server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let ledger_file = persistence::load_ledger(&config.ledger_path)?;
    let blacklist = Blacklist::load(&config.blacklist_path)?;
    let state = ContestState::new(&config, ledger_file, blacklist);

    #[cfg(unix)]
    tokio::spawn(reload_blacklist_on_hangup(std::sync::Arc::clone(&state)));

    let server = Server::new(config, state);
    server.run(shutdown_signal()).await
}

/// Resolves on ctrl+c
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        // Without a signal handler, run until killed
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Re-read the blacklist file whenever the process receives SIGHUP
#[cfg(unix)]
async fn reload_blacklist_on_hangup(state: std::sync::Arc<ContestState>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGHUP, blacklist reload disabled");
            return;
        }
    };

    while hangups.recv().await.is_some() {
        if let Err(e) = state.reload_blacklist() {
            warn!(error = %e, "Blacklist reload failed, keeping previous list");
        }
    }
}
