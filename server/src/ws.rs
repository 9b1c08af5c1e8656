use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use mrz_scanner_common::config::ServerConfig;
use mrz_scanner_common::engine::{Detection, MrzEngine};
use mrz_scanner_common::frame::looks_like_jpeg;
use mrz_scanner_common::protocol::ScanResponse;
use tracing::{debug, error, info, warn};

struct AppState<E> {
    engine: E,
    max_frame_bytes: usize,
}

/// Router serving the scanner WebSocket at `config.path`.
pub fn router<E: MrzEngine>(engine: E, config: &ServerConfig) -> Router {
    let state = Arc::new(AppState {
        engine,
        max_frame_bytes: config.max_frame_bytes,
    });
    Router::new()
        .route(&config.path, get(ws_handler::<E>))
        .with_state(state)
}

async fn ws_handler<E: MrzEngine>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<E>>>,
) -> Response {
    ws.max_message_size(state.max_frame_bytes)
        .max_frame_size(state.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// One client: answer each image in arrival order until the socket closes.
async fn handle_socket<E: MrzEngine>(mut socket: WebSocket, state: Arc<AppState<E>>) {
    info!("client connected");
    let mut frames: u64 = 0;

    while let Some(msg) = socket.recv().await {
        let reply = match msg {
            Ok(Message::Binary(data)) => {
                frames += 1;
                respond(&state.engine, Bytes::from(data)).await
            }
            Ok(Message::Text(_)) => ScanResponse::error("expected a binary image message"),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, frames, "socket error");
                break;
            }
        };

        debug!(frames, status = reply.status(), "sending answer");
        let text = match serde_json::to_string(&reply) {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "failed to serialize answer");
                break;
            }
        };
        if let Err(e) = socket.send(Message::Text(text)).await {
            debug!(error = %e, "client went away before the answer was sent");
            break;
        }
    }

    info!(frames, "client disconnected");
}

/// Run one image through the engine and phrase the outcome as a response.
pub async fn respond<E: MrzEngine>(engine: &E, image: Bytes) -> ScanResponse {
    if !looks_like_jpeg(&image) {
        warn!(bytes = image.len(), "rejecting non-JPEG payload");
        return ScanResponse::error("payload is not a JPEG image");
    }
    match engine.recognize(image).await {
        Ok(Detection::Found(data)) => {
            info!(fields = data.len(), "MRZ detected");
            ScanResponse::Success { data }
        }
        Ok(Detection::NotFound) => ScanResponse::no_detection(),
        Err(e) => {
            error!(error = %e, "error processing frame");
            ScanResponse::error(e.to_string())
        }
    }
}
