//! In-memory camera, renderer and recognition service for session tests.

use bytes::Bytes;
use mrz_scanner_common::frame::Frame;
use mrz_scanner_common::protocol::FieldMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::camera::{Camera, CaptureError};
use crate::render::{Overlay, Renderer};
use crate::service::{RecognitionError, RecognitionResult, RecognitionService};

pub fn field_map() -> FieldMap {
    [
        ("document_type", "P"),
        ("country_code", "UTO"),
        ("surname", "ERIKSSON"),
        ("given_name", "ANNA MARIA"),
        ("document_number", "L898902C3"),
        ("nationality", "UTO"),
        ("birth_date", "1974-08-12"),
        ("sex", "F"),
        ("expiry_date", "2012-04-15"),
        ("status", "SUCCESS"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Default)]
pub struct CameraStats {
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl CameraStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct MockCamera {
    stats: Arc<CameraStats>,
    period: Duration,
    fail_open: bool,
    fail_after: Option<u64>,
    seq: u64,
}

impl MockCamera {
    pub fn new(stats: Arc<CameraStats>, period: Duration) -> Self {
        Self {
            stats,
            period,
            fail_open: false,
            fail_after: None,
            seq: 0,
        }
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Reads fail once `frames` frames have been delivered.
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }
}

impl Camera for MockCamera {
    async fn open(&mut self) -> Result<(), CaptureError> {
        if self.fail_open {
            return Err(CaptureError::Connect("no such device".into()));
        }
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&mut self) -> Result<Frame, CaptureError> {
        tokio::time::sleep(self.period).await;
        if self.fail_after.is_some_and(|n| self.seq >= n) {
            return Err(CaptureError::Read("device unplugged".into()));
        }
        let seq = self.seq;
        self.seq += 1;
        let mut jpeg = vec![0xFF, 0xD8];
        jpeg.extend_from_slice(&seq.to_be_bytes());
        Ok(Frame::new(jpeg, 0, seq))
    }

    fn close(&mut self) {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RenderLog {
    overlays: Mutex<Vec<Overlay>>,
    finals: Mutex<Vec<Overlay>>,
}

impl RenderLog {
    pub fn overlays(&self) -> Vec<Overlay> {
        self.overlays.lock().unwrap().clone()
    }

    pub fn finals(&self) -> Vec<Overlay> {
        self.finals.lock().unwrap().clone()
    }
}

pub struct MockRenderer {
    stats: Arc<RenderLog>,
    quit_after: Option<(usize, char)>,
}

impl MockRenderer {
    pub fn new(stats: Arc<RenderLog>) -> Self {
        Self {
            stats,
            quit_after: None,
        }
    }

    /// Report `key` as pressed once `frames` frames have been shown.
    pub fn quit_after(mut self, frames: usize, key: char) -> Self {
        self.quit_after = Some((frames, key));
        self
    }
}

impl Renderer for MockRenderer {
    fn show(&mut self, _frame: &Frame, overlay: Overlay) {
        self.stats.overlays.lock().unwrap().push(overlay);
    }

    fn finish(&mut self, _frame: &Frame, overlay: Overlay) {
        self.stats.finals.lock().unwrap().push(overlay);
    }

    async fn wait_key(&mut self, _timeout: Duration) -> Option<char> {
        let (frames, key) = self.quit_after?;
        (self.stats.overlays.lock().unwrap().len() >= frames).then_some(key)
    }
}

#[derive(Default)]
pub struct ServiceStats {
    connects: AtomicUsize,
    closes: AtomicUsize,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    submit_times: Mutex<Vec<Instant>>,
}

impl ServiceStats {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn submit_times(&self) -> Vec<Instant> {
        self.submit_times.lock().unwrap().clone()
    }
}

/// Counts a call as in flight until dropped, including when the caller
/// abandons it.
struct InFlight<'a>(&'a ServiceStats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a ServiceStats) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockService {
    stats: Arc<ServiceStats>,
    script: VecDeque<RecognitionResult>,
    fallback: RecognitionResult,
    delay: Duration,
    first_delay: Option<Duration>,
    lose_after: Option<usize>,
    fail_connect: bool,
    served: usize,
}

impl MockService {
    /// Answers from `script` in order, then `NoDetection` forever.
    pub fn scripted(stats: Arc<ServiceStats>, script: Vec<RecognitionResult>) -> Self {
        Self {
            stats,
            script: script.into(),
            fallback: RecognitionResult::NoDetection,
            delay: Duration::ZERO,
            first_delay: None,
            lose_after: None,
            fail_connect: false,
            served: 0,
        }
    }

    pub fn always(stats: Arc<ServiceStats>, result: RecognitionResult) -> Self {
        let mut service = Self::scripted(stats, Vec::new());
        service.fallback = result;
        service
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_first_delay(mut self, delay: Duration) -> Self {
        self.first_delay = Some(delay);
        self
    }

    /// The call after `calls` successful ones reports a dropped connection.
    pub fn lose_connection_after(mut self, calls: usize) -> Self {
        self.lose_after = Some(calls);
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }
}

impl RecognitionService for MockService {
    async fn connect(&mut self) -> Result<(), RecognitionError> {
        if self.fail_connect {
            return Err(RecognitionError::Connect {
                url: "mock://recognition".into(),
                reason: "connection refused".into(),
            });
        }
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn submit(&mut self, _image: Bytes) -> Result<RecognitionResult, RecognitionError> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        self.stats.submit_times.lock().unwrap().push(Instant::now());
        let _in_flight = InFlight::enter(&self.stats);

        self.served += 1;
        if self.lose_after.is_some_and(|n| self.served > n) {
            return Err(RecognitionError::ConnectionLost("mock connection dropped".into()));
        }

        let result = self
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let delay = match (self.served, self.first_delay) {
            (1, Some(first)) => first,
            _ => self.delay,
        };
        tokio::time::sleep(delay).await;
        Ok(result)
    }

    async fn close(&mut self) {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
    }
}
