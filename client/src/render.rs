use image::{ImageFormat, Rgb, RgbImage};
use mrz_scanner_common::config::RenderConfig;
use mrz_scanner_common::frame::Frame;
use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::state::ScanState;

/// What the display shows on top of the live frame. Derived purely from
/// [`ScanState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlay {
    Connecting,
    Scanning,
    Found,
    Failed,
}

impl Overlay {
    pub fn for_state(state: &ScanState) -> Self {
        match state {
            ScanState::Connecting => Self::Connecting,
            // A user quit keeps the last live look.
            ScanState::Scanning | ScanState::Stopped => Self::Scanning,
            ScanState::Found(_) => Self::Found,
            ScanState::Error(_) => Self::Failed,
        }
    }

    pub fn caption(self) -> &'static str {
        match self {
            Self::Connecting => "Connecting...",
            Self::Scanning => "Scanning...",
            Self::Found => "MRZ FOUND",
            Self::Failed => "SCAN FAILED",
        }
    }

    /// Banner colour and height in pixels, clamped to the frame height.
    fn banner(self, height: u32) -> (Rgb<u8>, u32) {
        match self {
            Self::Connecting => (Rgb([230, 200, 0]), height.min(8)),
            Self::Scanning => (Rgb([220, 0, 0]), height.min(8)),
            Self::Found => (Rgb([0, 200, 0]), height.min(80)),
            Self::Failed => (Rgb([140, 0, 0]), height.min(80)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to decode frame: {0}")]
    Decode(image::ImageError),
    #[error("failed to encode preview: {0}")]
    Encode(image::ImageError),
    #[error("failed to write preview {0}: {1}")]
    Write(String, std::io::Error),
}

/// Display sink for the capture loop.
pub trait Renderer {
    fn show(&mut self, frame: &Frame, overlay: Overlay);

    /// Last render before the session exits.
    fn finish(&mut self, frame: &Frame, overlay: Overlay) {
        self.show(frame, overlay);
    }

    /// Wait up to `timeout` for a key press.
    async fn wait_key(&mut self, timeout: Duration) -> Option<char>;
}

/// Renderer for headless use: status changes go to the log, an optional
/// preview JPEG is kept up to date on disk, keys come from a channel.
pub struct ConsoleRenderer {
    title: String,
    preview_path: Option<PathBuf>,
    keys: mpsc::UnboundedReceiver<char>,
    last_overlay: Option<Overlay>,
    frames_shown: u64,
}

impl ConsoleRenderer {
    pub fn new(config: &RenderConfig, keys: mpsc::UnboundedReceiver<char>) -> Self {
        Self {
            title: config.window_title.clone(),
            preview_path: config.preview_path.as_ref().map(PathBuf::from),
            keys,
            last_overlay: None,
            frames_shown: 0,
        }
    }

    fn write_preview(&self, frame: &Frame, overlay: Overlay) {
        let Some(path) = &self.preview_path else {
            return;
        };
        let result = annotate(&frame.jpeg, overlay).and_then(|jpeg| {
            std::fs::write(path, jpeg).map_err(|e| RenderError::Write(path.display().to_string(), e))
        });
        match result {
            Ok(()) => debug!(path = %path.display(), seq = frame.seq, "preview updated"),
            Err(e) => warn!(error = %e, seq = frame.seq, "failed to write preview"),
        }
    }
}

impl Renderer for ConsoleRenderer {
    fn show(&mut self, frame: &Frame, overlay: Overlay) {
        self.frames_shown += 1;
        if self.last_overlay == Some(overlay) {
            trace!(seq = frame.seq, "frame shown");
            return;
        }
        info!(
            window = self.title,
            status = overlay.caption(),
            seq = frame.seq,
            frames_shown = self.frames_shown,
            "display status"
        );
        self.write_preview(frame, overlay);
        self.last_overlay = Some(overlay);
    }

    fn finish(&mut self, frame: &Frame, overlay: Overlay) {
        info!(window = self.title, status = overlay.caption(), seq = frame.seq, "final frame");
        self.write_preview(frame, overlay);
        self.last_overlay = Some(overlay);
    }

    async fn wait_key(&mut self, timeout: Duration) -> Option<char> {
        match tokio::time::timeout(timeout, self.keys.recv()).await {
            Ok(key) => key,
            Err(_) => None,
        }
    }
}

/// Draw the overlay banner onto a JPEG frame and re-encode it.
pub fn annotate(jpeg: &[u8], overlay: Overlay) -> Result<Vec<u8>, RenderError> {
    let mut img: RgbImage = image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
        .map_err(RenderError::Decode)?
        .to_rgb8();
    let (width, height) = img.dimensions();
    let (color, band) = overlay.banner(height);
    for y in 0..band {
        for x in 0..width {
            img.put_pixel(x, y, color);
        }
    }
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
        .map_err(RenderError::Encode)?;
    Ok(out)
}

/// Forward the first character of every stdin line as a key press.
pub fn spawn_key_reader(keys: mpsc::UnboundedSender<char>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(key) = line.trim().chars().next() {
                if keys.send(key).is_err() {
                    break;
                }
            }
        }
        debug!("stdin closed, key reader stopped");
    });
}
