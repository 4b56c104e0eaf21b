mod cli;
mod daemon;
#[cfg(test)]
mod daemon_tests;
mod error;
mod notify;
mod session;
mod settings;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::settings::Settings;

/// Route the subscriber to stderr or the `-L` file. `RUST_LOG` overrides
/// the `-D` flag when set.
fn init_tracing(settings: &Settings) -> Result<()> {
    let default_level = if settings.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &settings.log_file {
        Some(path) => {
            let file = std::fs::File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder.with_writer(Arc::new(file)).with_ansi(false).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Pre-flight: bad arguments, an unreadable -c file, or a failed bind
    // exit non-zero here, before any session work starts.
    let settings = Settings::from_argv(std::env::args())?;
    init_tracing(&settings)?;

    let daemon = daemon::Daemon::new(settings)?;
    let bound = daemon.bind().await?;

    // STOP and signals come back as Ok; anything else is a daemon-level
    // failure and exits 127.
    if let Err(e) = daemon.run(bound).await {
        error!(error = %e, "fatal error in main loop");
        std::process::exit(127);
    }
    Ok(())
}
