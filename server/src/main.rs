mod ws;

use mrz_scanner_common::config::Config;
use mrz_scanner_common::engine::{check_engine_available, Engine};
use std::path::PathBuf;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let loaded = match &explicit {
        Some(path) => Config::load(path),
        None => Config::load_or_default(&PathBuf::from("config.toml")),
    };
    let config = match loaded {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let engine = match Engine::from_config(&config.engine) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Invalid engine configuration: {e}");
            std::process::exit(1);
        }
    };
    check_engine_available(engine.program()).await;

    let app = ws::router(engine, &config.server).layer(TraceLayer::new_for_http());

    let addr = config.server.bind.clone();
    info!(
        addr,
        path = config.server.path,
        engine = config.engine.command,
        engine_kind = config.engine.kind,
        "MRZ recognition server starting"
    );

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind to {addr}: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
    info!("server stopped");
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
    }
}
