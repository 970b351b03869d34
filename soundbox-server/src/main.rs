use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use soundbox_core::{
    Authenticator, ConnectionRegistry, DeviceServer, EngineContext, EngineError, spawn_supervisor,
};
use soundbox_server::{ServerConfig, StaticDirectory, TracingSink};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "soundbox-server", about = "Fleet server for networked sound boxes")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => ServerConfig::load(&path)?,
        None => ServerConfig::default(),
    };
    if config.engine.secret_key.is_empty() {
        warn!("secret_key is empty; Wi-Fi device logins will be rejected");
    }
    if config.devices.is_empty() {
        info!("no device roster configured; accepting any authenticated serial");
    }

    let ctx = EngineContext {
        auth: Arc::new(Authenticator::new(
            config.engine.secret_key.clone(),
            config.engine.api_key.clone(),
        )),
        registry: Arc::new(ConnectionRegistry::new()),
        directory: Arc::new(StaticDirectory::new(config.devices)),
        notify: Arc::new(TracingSink),
        config: Arc::new(config.engine),
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    spawn_supervisor(ctx.clone(), shutdown.clone());
    DeviceServer::new(ctx, shutdown).run().await
}
