use clap::Parser;
use percy_core::build_client::HttpBuildClient;
use percy_core::cli::{load_config, Cli, Commands};
use percy_core::core::PercyCore;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn setup_logging() -> percy_core::core::LogReloadHandle {
    let level = std::env::var("PERCY_LOGLEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::new(level);
    let (filter, reload) = tracing_subscriber::reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    reload
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    match args.command {
        Commands::Start { config, port, no_server } => {
            let reload = setup_logging();
            info!("starting percy-core v{}", env!("CARGO_PKG_VERSION"));

            let mut config = load_config(&config)?;
            if let Some(port) = port {
                config.port = port;
            }
            if no_server {
                config.server = false;
            }
            config.validate()?;

            let build_client = Arc::new(
                HttpBuildClient::new("https://percy.io/api/v1", config.token.clone())
                    .with_parallel(config.parallel_nonce.clone(), config.parallel_total),
            );
            let core = Arc::new(PercyCore::new(config, build_client, Some(reload)));

            let build = core.start().await?;
            info!("percy-core running, build {}", build.id);

            wait_for_shutdown_signal().await;
            info!("shutdown signal received, draining");
            core.stop().await;
            Ok(())
        }

        Commands::Validate { config } => {
            let config = load_config(&config)?;
            match config.validate() {
                Ok(()) => {
                    println!("config is valid");
                    Ok(())
                }
                Err(e) => {
                    error!("config validation failed: {e}");
                    Err(anyhow::anyhow!(e))
                }
            }
        }

        Commands::Health { port } => {
            let url = format!("http://127.0.0.1:{port}/percy/healthcheck");
            match reqwest::get(&url).await {
                Ok(response) if response.status().is_success() => {
                    println!("percy-core is healthy at {url}");
                    Ok(())
                }
                Ok(response) => Err(anyhow::anyhow!("unhealthy response: {}", response.status())),
                Err(e) => Err(anyhow::anyhow!("percy-core not reachable at {url}: {e}")),
            }
        }
    }
}
