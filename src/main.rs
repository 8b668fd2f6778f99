//! ackd server binary.
//!
//! Runs until ctrl-c, then stops gracefully. Exits with an error if the
//! accept loop fails or the worker pool does not terminate.

use ackd::{Config, Server};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        dispatch = ?config.dispatch,
        workers = config.pool_size(),
        idle_timeout_ms = u64::try_from(config.idle_timeout.as_millis()).unwrap_or(u64::MAX),
        "Starting ackd server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(&config).await?;
    server.start();

    let accept_result = tokio::select! {
        result = server.wait() => result,
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                info!("Shutdown signal received");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for shutdown signal");
                server.wait().await
            }
        }
    };

    if let Some(outcome) = server.stop().await {
        if !outcome.is_terminated() {
            warn!(outcome = %outcome, "Shutdown incomplete");
            accept_result?;
            return Err(outcome.to_string().into());
        }
    }

    accept_result?;
    Ok(())
}
