use anyhow::Context;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use vibetunnel::cli::Cli;
use vibetunnel::{build_router, AppState, Config, SessionInfoStore, StreamWatcher};

#[tokio::main]
async fn main() {
    // Default to WARN level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    if let Err(err) = run().await {
        error!("Server error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().apply_cli(&cli);
    info!(
        "Starting VibeTunnel stream server on {}:{}",
        config.bind, config.port
    );
    info!("Control directory: {}", config.control_dir.display());

    let info_store = SessionInfoStore::new(&config.control_dir);
    let streams = StreamWatcher::new(info_store.clone());

    let app = build_router(AppState {
        streams: streams.clone(),
        info_store,
    })
    .layer(CorsLayer::permissive())
    .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("VibeTunnel listening on {}", addr);
    println!("VibeTunnel listening on {}", addr);

    let shutdown_streams = streams.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown_streams.shutdown().await;
        })
        .await
        .context("server terminated unexpectedly")?;
    Ok(())
}
