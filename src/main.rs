use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use whisper_hub::{
    config::{Args, HubConfig},
    orchestrator::Orchestrator,
    queue::JobQueue,
    server::{self, ws::start_heartbeat, AppState},
};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env: {}", e);
        }
    }

    let args = Args::parse();

    // Initialize logging
    let log_level: tracing::Level = args.log_level.into();
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Starting Whisper Hub v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Bind address: {}", args.bind);
    info!("  Engine command: {} {}", args.engine_cmd, args.engine_args);
    info!("  Transcriptions: {}", args.transcriptions_dir.display());
    info!("  Uploads: {}", args.uploads_dir.display());
    info!("  Concurrent jobs: {}", args.concurrent_amount);
    info!("  Log level: {:?}", args.log_level);

    let config = HubConfig::from(args);
    info!("  Device pinning: {}", config.multi_device());
    if config.libretranslate.is_none() {
        warn!("LIBRETRANSLATE is not set, translation requests will be marked failed");
    }

    tokio::fs::create_dir_all(&config.uploads_dir)
        .await
        .context("Failed to create uploads directory")?;

    let orchestrator =
        Arc::new(Orchestrator::from_config(&config).context("Failed to create orchestrator")?);
    let queue = JobQueue::new(Arc::clone(&orchestrator), config.concurrent_amount);
    let heartbeat = start_heartbeat(Arc::clone(orchestrator.hub()), config.heartbeat_interval);

    let state = AppState {
        orchestrator: Arc::clone(&orchestrator),
        queue: queue.clone(),
        uploads_dir: config.uploads_dir.clone(),
    };

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!("Listening on {}", config.bind);

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    queue.close();
    heartbeat.abort();
    orchestrator.hub().shutdown_all().await;

    info!("Whisper Hub stopped");
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => info!("Received Ctrl+C signal"),
        _ = wait_for_term_signal() => info!("Received TERM signal"),
    }
}

/// Wait for TERM signal (Unix only)
#[cfg(unix)]
async fn wait_for_term_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    if let Ok(mut stream) = signal(SignalKind::terminate()) {
        stream.recv().await;
    }
}

#[cfg(not(unix))]
async fn wait_for_term_signal() {
    // On non-Unix systems, just wait indefinitely
    futures::future::pending::<()>().await;
}
