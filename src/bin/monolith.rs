//! Monolith Binary - Local deployment
//!
//! Wires up:
//! - Local adapters (filesystem, ffmpeg)
//! - Job registry and start coordination
//! - HTTP inbound adapter

use crooner::adapters::local::{http, FfmpegLauncher, LocalFs};
use crooner::application::lock::KeyedStartLock;
use crooner::application::{JobRegistry, StartCoordinator, StreamingService};
use crooner::config::StreamingConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = StreamingConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = tokio::fs::create_dir_all(&config.transcode_dir).await {
        error!("Cannot create {}: {}", config.transcode_dir, e);
        std::process::exit(1);
    }

    // 1. Adapters
    let fs = Arc::new(LocalFs::new());
    let launcher = Arc::new(FfmpegLauncher::new(&config.ffmpeg_path, &config.media_dir));

    // 2. Application services
    let registry = Arc::new(JobRegistry::new());
    let mut coordinator = StartCoordinator::new(
        registry,
        launcher,
        fs,
        config.poll_settings(),
        &config.transcode_dir,
    );
    if config.per_target_start_lock {
        coordinator = coordinator.with_start_lock(Arc::new(KeyedStartLock::new()));
    }
    let service = Arc::new(StreamingService::new(Arc::new(coordinator)));

    // 3. HTTP layer
    let app = http::router(service.clone());

    // 4. Start server
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.addr, config.port))
        .await
        .expect("Failed to bind TCP listener");
    info!("Listening at {}:{}", config.addr, config.port);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    };
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .expect("Server failed to start");

    service.shutdown().await;
}
