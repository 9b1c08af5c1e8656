mod camera;
mod capture;
mod frame_buffer;
mod local;
mod mjpeg;
mod pacer;
mod recognition;
mod render;
mod service;
mod session;
mod state;
#[cfg(test)]
mod testing;

use camera::HttpCamera;
use local::LocalRecognitionService;
use mrz_scanner_common::config::Config;
use mrz_scanner_common::engine::{check_engine_available, Engine};
use render::ConsoleRenderer;
use service::{RecognitionService, WsRecognitionService};
use session::{Session, SessionOutcome, SessionSettings};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let code = run().await;
    // stdin stays blocked in the key reader; exiting here skips waiting on it.
    std::process::exit(code);
}

async fn run() -> i32 {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let loaded = match &explicit {
        Some(path) => Config::load(path),
        None => Config::load_or_default(&PathBuf::from("config.toml")),
    };
    let config = match loaded {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return 1;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        recognition = config.scanner.mode,
        server = config.scanner.server_url,
        camera = config.camera.url,
        mode = config.camera.mode,
        interval_ms = config.scanner.frame_interval_ms,
        "starting MRZ scanner"
    );

    let camera = match HttpCamera::from_config(&config.camera) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid camera configuration");
            return 1;
        }
    };

    let (keys_tx, keys_rx) = mpsc::unbounded_channel();
    render::spawn_key_reader(keys_tx.clone());
    let quit_key = config.scanner.quit_key;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted");
            let _ = keys_tx.send(quit_key);
        }
    });
    info!(key = %quit_key, "press the quit key and Enter to stop");

    let renderer = ConsoleRenderer::new(&config.render, keys_rx);
    let settings = SessionSettings::from_config(&config.scanner);

    match config.scanner.mode.as_str() {
        "remote" => {
            let service = WsRecognitionService::new(
                config.scanner.server_url.clone(),
                config.scanner.connect_timeout(),
            );
            scan(camera, renderer, service, settings).await
        }
        "local" => {
            let engine = match Engine::from_config(&config.engine) {
                Ok(e) => e,
                Err(e) => {
                    error!(error = %e, "invalid engine configuration");
                    return 1;
                }
            };
            check_engine_available(engine.program()).await;
            info!(
                engine = config.engine.command,
                engine_kind = config.engine.kind,
                "recognizing in-process"
            );
            scan(camera, renderer, LocalRecognitionService::new(engine), settings).await
        }
        other => {
            error!(mode = other, "unknown scanner mode, expected 'remote' or 'local'");
            1
        }
    }
}

async fn scan<S: RecognitionService>(
    camera: HttpCamera,
    renderer: ConsoleRenderer,
    service: S,
    settings: SessionSettings,
) -> i32 {
    match Session::new(camera, renderer, service, settings).run().await {
        Ok(SessionOutcome::Found(fields)) => {
            match serde_json::to_string_pretty(&fields) {
                Ok(json) => println!("{json}"),
                Err(e) => error!(error = %e, "failed to print result"),
            }
            0
        }
        Ok(SessionOutcome::Cancelled) => {
            info!("scan cancelled");
            0
        }
        Err(e) => {
            error!(error = %e, "scan failed");
            e.exit_code()
        }
    }
}
