use anyhow::Result;
use clap::Parser;
use deploy_server::routes;
use deploy_server::services::session_sweeper::start_session_sweeper;
use deploy_server::{AppConfig, AppState};
use deploy_sync::sites::RegistrySiteManager;
use deploy_sync::utils;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }

    utils::logger::init(&config.log.level)?;
    tracing::info!(
        "Starting deploy-server v{} on port {}",
        env!("CARGO_PKG_VERSION"),
        config.server.port
    );

    std::fs::create_dir_all(&config.server.data_dir)?;

    let sites = Arc::new(RegistrySiteManager::load(&config.sites.registry_file)?);
    let state = Arc::new(AppState::new(config.clone(), sites));

    let cancel = CancellationToken::new();
    start_session_sweeper(state.clone(), cancel.clone());

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();

    let abandoned = state.sessions.active_sessions();
    if abandoned > 0 {
        tracing::warn!(abandoned, "Upload sessions still open at shutdown");
    }
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
