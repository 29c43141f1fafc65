use std::{
    fs::OpenOptions,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use karma_bot::{KarmaStore, SessionConfig, VERSION, cli::Cli, session, transport};

fn init_tracing(log_file: &Path) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter).with_target(false);

    match OpenOptions::new().create(true).append(true).open(log_file) {
        Ok(file) => {
            let _ = subscriber.with_ansi(false).with_writer(Mutex::new(file)).try_init();
        }
        Err(error) => {
            let _ = subscriber.with_writer(std::io::stderr).try_init();
            warn!(path = %log_file.display(), %error, "cannot open log file, logging to stderr");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("karma-bot version {VERSION}");
        return Ok(());
    }

    init_tracing(&cli.log_file);
    info!(version = VERSION, "starting");

    let config = SessionConfig::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))
        .inspect_err(|err| error!("{err:#}"))?;
    let store = KarmaStore::load(&cli.karma_file)
        .context("failed to load karma db")
        .inspect_err(|err| error!("{err:#}"))?;

    let config = Arc::new(config);
    let store = Arc::new(store);

    let transport = transport::connect(&config)
        .await
        .with_context(|| format!("failed to connect to {}:{}", config.server, config.port))
        .inspect_err(|err| error!("{err:#}"))?;

    session::run(transport, config, store, shutdown_signal()).await?;
    Ok(())
}

/// Completes on ctrl-c or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(?error, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                warn!(?error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, exiting"),
        _ = terminate => info!("received SIGTERM, exiting"),
    }
}
