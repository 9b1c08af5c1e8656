use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use mrz_scanner_common::config::CameraConfig;
use mrz_scanner_common::frame::Frame;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::mjpeg::{boundary_from_content_type, MjpegParser};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("camera connection failed: {0}")]
    Connect(String),
    #[error("camera returned HTTP status {0}")]
    HttpStatus(u16),
    #[error("camera read failed: {0}")]
    Read(String),
    #[error("camera stream ended")]
    StreamEnded,
    #[error("camera is not open")]
    NotOpen,
    #[error("unknown camera mode '{0}', expected 'mjpeg' or 'polling'")]
    UnknownMode(String),
}

/// A source of encoded frames.
pub trait Camera {
    async fn open(&mut self) -> Result<(), CaptureError>;
    /// Wait for the next frame. Must be safe to drop mid-await.
    async fn read(&mut self) -> Result<Frame, CaptureError>;
    fn close(&mut self);
}

/// An opened camera. Dropping the guard closes the camera, whichever way
/// the session ends.
pub struct CameraGuard<'a, C: Camera> {
    camera: &'a mut C,
}

impl<'a, C: Camera> CameraGuard<'a, C> {
    pub async fn open(camera: &'a mut C) -> Result<Self, CaptureError> {
        camera.open().await?;
        Ok(Self { camera })
    }

    pub async fn read(&mut self) -> Result<Frame, CaptureError> {
        self.camera.read().await
    }
}

impl<C: Camera> Drop for CameraGuard<'_, C> {
    fn drop(&mut self) {
        self.camera.close();
        debug!("camera released");
    }
}

/// Network camera selected by `camera.mode`.
pub enum HttpCamera {
    Mjpeg(MjpegCamera),
    Polling(PollingCamera),
}

impl HttpCamera {
    pub fn from_config(config: &CameraConfig) -> Result<Self, CaptureError> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        match config.mode.as_str() {
            "mjpeg" => {
                let url = format!(
                    "{}?quality={}&fps={}",
                    config.url, config.quality, config.fps
                );
                Ok(Self::Mjpeg(MjpegCamera::new(url, connect_timeout)?))
            }
            "polling" => {
                let url = format!(
                    "{}?quality={}",
                    config.url.replace("/stream", "/frame"),
                    config.quality
                );
                let period = Duration::from_secs_f64(1.0 / config.fps.max(0.1));
                Ok(Self::Polling(PollingCamera::new(url, period, connect_timeout)?))
            }
            other => Err(CaptureError::UnknownMode(other.to_string())),
        }
    }
}

impl Camera for HttpCamera {
    async fn open(&mut self) -> Result<(), CaptureError> {
        match self {
            Self::Mjpeg(cam) => cam.open().await,
            Self::Polling(cam) => cam.open().await,
        }
    }

    async fn read(&mut self) -> Result<Frame, CaptureError> {
        match self {
            Self::Mjpeg(cam) => cam.read().await,
            Self::Polling(cam) => cam.read().await,
        }
    }

    fn close(&mut self) {
        match self {
            Self::Mjpeg(cam) => cam.close(),
            Self::Polling(cam) => cam.close(),
        }
    }
}

fn http_client(connect_timeout: Duration) -> Result<reqwest::Client, CaptureError> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| CaptureError::Connect(e.to_string()))
}

/// Reads a `multipart/x-mixed-replace` MJPEG stream over HTTP.
pub struct MjpegCamera {
    url: String,
    client: reqwest::Client,
    stream: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    parser: MjpegParser,
    seq: u64,
}

impl MjpegCamera {
    pub fn new(url: String, connect_timeout: Duration) -> Result<Self, CaptureError> {
        Ok(Self {
            url,
            client: http_client(connect_timeout)?,
            stream: None,
            parser: MjpegParser::new(),
            seq: 0,
        })
    }
}

impl Camera for MjpegCamera {
    async fn open(&mut self) -> Result<(), CaptureError> {
        info!(url = self.url, "connecting to MJPEG stream");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CaptureError::Connect(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CaptureError::HttpStatus(response.status().as_u16()));
        }

        let boundary = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(boundary_from_content_type);
        self.parser = match &boundary {
            Some(b) => MjpegParser::with_boundary(b),
            None => MjpegParser::new(),
        };

        info!(status = %response.status(), boundary, "connected to MJPEG stream");
        self.stream = Some(response.bytes_stream().boxed());
        Ok(())
    }

    async fn read(&mut self) -> Result<Frame, CaptureError> {
        let stream = self.stream.as_mut().ok_or(CaptureError::NotOpen)?;
        loop {
            if let Some(jpeg) = self.parser.next_jpeg() {
                let seq = self.seq;
                self.seq += 1;
                return Ok(Frame::captured_now(jpeg, seq));
            }
            match stream.next().await {
                Some(Ok(chunk)) => self.parser.push(&chunk),
                Some(Err(e)) => return Err(CaptureError::Read(e.to_string())),
                None => return Err(CaptureError::StreamEnded),
            }
        }
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            info!(url = self.url, "closed MJPEG stream");
        }
    }
}

/// Fetches single JPEG snapshots at a fixed rate.
pub struct PollingCamera {
    url: String,
    client: reqwest::Client,
    period: Duration,
    ticker: Option<Interval>,
    seq: u64,
}

impl PollingCamera {
    pub fn new(
        url: String,
        period: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, CaptureError> {
        Ok(Self {
            url,
            client: http_client(connect_timeout)?,
            period,
            ticker: None,
            seq: 0,
        })
    }

    async fn fetch(&self) -> Result<Bytes, CaptureError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CaptureError::Read(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CaptureError::HttpStatus(resp.status().as_u16()));
        }
        resp.bytes()
            .await
            .map_err(|e| CaptureError::Read(e.to_string()))
    }
}

impl Camera for PollingCamera {
    async fn open(&mut self) -> Result<(), CaptureError> {
        info!(url = self.url, period = ?self.period, "checking camera frame endpoint");
        // A failed first fetch is reported as an open failure, not a read failure.
        self.fetch().await.map_err(|e| match e {
            CaptureError::Read(msg) => CaptureError::Connect(msg),
            other => other,
        })?;
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        Ok(())
    }

    async fn read(&mut self) -> Result<Frame, CaptureError> {
        self.ticker
            .as_mut()
            .ok_or(CaptureError::NotOpen)?
            .tick()
            .await;
        let jpeg = self.fetch().await?;
        let seq = self.seq;
        self.seq += 1;
        Ok(Frame::captured_now(jpeg, seq))
    }

    fn close(&mut self) {
        self.ticker = None;
    }
}
