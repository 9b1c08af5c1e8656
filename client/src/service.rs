use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use mrz_scanner_common::protocol::{FieldMap, ScanResponse};
use std::future::poll_fn;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outcome of one recognition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionResult {
    Success(FieldMap),
    NoDetection,
    /// The service answered with an error payload.
    ServiceError(String),
    /// No usable answer: timeout, malformed or unexpected message.
    TransportError(String),
}

impl From<ScanResponse> for RecognitionResult {
    fn from(resp: ScanResponse) -> Self {
        match resp {
            ScanResponse::Success { data } => Self::Success(data),
            ScanResponse::Scanning { .. } => Self::NoDetection,
            ScanResponse::Error { message } => Self::ServiceError(message),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// MRZ recognition, over a connection or in-process.
pub trait RecognitionService {
    async fn connect(&mut self) -> Result<(), RecognitionError>;

    /// Send one image and wait for its answer. Only `ConnectionLost` is an
    /// error; everything recoverable comes back as a [`RecognitionResult`].
    ///
    /// Dropping the future abandons the attempt, but the service keeps at
    /// most one image in flight: the next call first collects the abandoned
    /// answer and returns it in place of sending `image`.
    async fn submit(&mut self, image: Bytes) -> Result<RecognitionResult, RecognitionError>;

    async fn close(&mut self);
}

/// Recognition over one persistent WebSocket: a binary message per image,
/// a JSON text message per answer.
pub struct WsRecognitionService {
    url: String,
    connect_timeout: Duration,
    socket: Option<WsStream>,
    /// An image has been queued on the socket and its answer not read yet.
    awaiting_answer: bool,
}

impl WsRecognitionService {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            socket: None,
            awaiting_answer: false,
        }
    }

    fn lost(&mut self, reason: impl Into<String>) -> RecognitionError {
        self.socket = None;
        self.awaiting_answer = false;
        RecognitionError::ConnectionLost(reason.into())
    }

    /// Flush whatever is queued and read until the outstanding answer
    /// arrives.
    async fn read_answer(&mut self) -> Result<RecognitionResult, RecognitionError> {
        let flushed = match self.socket.as_mut() {
            Some(socket) => socket.flush().await,
            None => return Err(RecognitionError::ConnectionLost("not connected".into())),
        };
        if let Err(e) = flushed {
            return Err(self.lost(e.to_string()));
        }

        loop {
            let next = match self.socket.as_mut() {
                Some(socket) => socket.next().await,
                None => return Err(RecognitionError::ConnectionLost("not connected".into())),
            };
            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(self.lost(e.to_string())),
                None => return Err(self.lost("closed by server")),
            };

            let result = match msg {
                Message::Text(text) => parse_response(&text),
                Message::Binary(data) => RecognitionResult::TransportError(format!(
                    "unexpected binary response of {} bytes",
                    data.len()
                )),
                Message::Close(frame) => {
                    let reason = frame
                        .map(|f| format!("closed by server: {}", f.reason))
                        .unwrap_or_else(|| "closed by server".into());
                    return Err(self.lost(reason));
                }
                // Ping, pong and raw frames are not answers.
                _ => continue,
            };
            self.awaiting_answer = false;
            return Ok(result);
        }
    }
}

/// Queue `msg` on the socket without flushing it. Once this returns `Ok` the
/// message goes out with the next flush or read.
async fn enqueue(socket: &mut WsStream, msg: Message) -> Result<(), WsError> {
    poll_fn(|cx| socket.poll_ready_unpin(cx)).await?;
    socket.start_send_unpin(msg)
}

impl RecognitionService for WsRecognitionService {
    async fn connect(&mut self) -> Result<(), RecognitionError> {
        info!(url = self.url, "connecting to recognition service");
        let (socket, response) =
            match tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                .await
            {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    return Err(RecognitionError::Connect {
                        url: self.url.clone(),
                        reason: e.to_string(),
                    })
                }
                Err(_) => return Err(RecognitionError::ConnectTimeout(self.url.clone())),
            };
        info!(status = %response.status(), "connected to recognition service");
        self.socket = Some(socket);
        self.awaiting_answer = false;
        Ok(())
    }

    async fn submit(&mut self, image: Bytes) -> Result<RecognitionResult, RecognitionError> {
        if self.awaiting_answer {
            debug!("collecting the answer to an abandoned request instead of sending");
            return self.read_answer().await;
        }

        let queued = match self.socket.as_mut() {
            Some(socket) => enqueue(socket, Message::Binary(image.to_vec())).await,
            None => return Err(RecognitionError::ConnectionLost("not connected".into())),
        };
        if let Err(e) = queued {
            return Err(self.lost(e.to_string()));
        }
        // No await between queueing and marking, so a dropped call can never
        // leave a queued image unaccounted for.
        self.awaiting_answer = true;

        self.read_answer().await
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                debug!(error = %e, "error closing recognition connection");
            }
            info!("recognition connection closed");
        }
        self.awaiting_answer = false;
    }
}

/// Decode one text answer from the service.
pub fn parse_response(text: &str) -> RecognitionResult {
    match serde_json::from_str::<ScanResponse>(text) {
        Ok(resp) => resp.into(),
        Err(e) => {
            warn!(error = %e, "malformed response from recognition service");
            RecognitionResult::TransportError(format!("malformed response: {e}"))
        }
    }
}
