use bytes::Bytes;
use chrono::Utc;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// One encoded camera frame.
///
/// The JPEG bytes are reference counted, so cloning a frame to hand it to
/// the recognition path never copies image data and never observes a
/// partially written buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub jpeg: Bytes,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl Frame {
    pub fn new(jpeg: impl Into<Bytes>, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            jpeg: jpeg.into(),
            captured_at_ms,
            seq,
        }
    }

    /// Stamp a freshly captured frame with the current wall-clock time.
    pub fn captured_now(jpeg: impl Into<Bytes>, seq: u64) -> Self {
        Self::new(jpeg, Utc::now().timestamp_millis(), seq)
    }

    pub fn payload_size(&self) -> usize {
        self.jpeg.len()
    }

    pub fn looks_like_jpeg(&self) -> bool {
        looks_like_jpeg(&self.jpeg)
    }
}

/// Returns true if `data` starts with the JPEG start-of-image marker.
pub fn looks_like_jpeg(data: &[u8]) -> bool {
    data.starts_with(&JPEG_SOI)
}
