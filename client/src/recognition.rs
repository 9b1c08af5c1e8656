use mrz_scanner_common::frame::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::pacer::Pacer;
use crate::service::{RecognitionError, RecognitionResult, RecognitionService};
use crate::session::SessionContext;
use crate::state::ScanState;

/// Set while a recognition attempt is outstanding.
pub struct PendingFlag(AtomicBool);

impl PendingFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Claim the flag. Fails if another attempt already holds it.
    pub fn try_acquire(&self) -> Option<PendingGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PendingGuard { flag: self })
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for PendingFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the [`PendingFlag`] when the attempt ends, however it ends.
pub struct PendingGuard<'a> {
    flag: &'a PendingFlag,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.flag.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    /// Pacer interval.
    pub interval: Duration,
    /// Per-attempt deadline; expiry counts as a transport error.
    pub timeout: Duration,
    /// Sleep when there is nothing to submit.
    pub idle_poll: Duration,
}

/// Decides when the next frame may go out.
struct Submitter {
    pacer: Pacer,
    last_seq: Option<u64>,
}

impl Submitter {
    fn new(interval: Duration) -> Self {
        Self {
            pacer: Pacer::new(interval),
            last_seq: None,
        }
    }

    /// Idle -> Submitting guard. On success the caller holds the pending
    /// flag and a snapshot of the freshest frame.
    fn try_begin<'a>(
        &mut self,
        ctx: &'a SessionContext,
        now: Instant,
    ) -> Option<(PendingGuard<'a>, Frame)> {
        if ctx.state.is_terminal() {
            return None;
        }
        let frame = ctx.frames.snapshot()?;
        if self.last_seq == Some(frame.seq) {
            return None;
        }
        let pending = ctx.pending.try_acquire()?;
        if !self.pacer.allow_submit(now) {
            return None;
        }
        self.last_seq = Some(frame.seq);
        Some((pending, frame))
    }
}

/// Submit paced frames until the state becomes terminal.
///
/// Returns the number of attempts made. Only a lost connection is an error;
/// every other failure is logged and the loop carries on.
pub async fn run_recognition_loop<S: RecognitionService>(
    service: &mut S,
    ctx: &SessionContext,
    settings: &RecognitionSettings,
) -> Result<u64, RecognitionError> {
    let mut submitter = Submitter::new(settings.interval);
    let mut attempts: u64 = 0;
    debug!(
        interval = ?submitter.pacer.interval(),
        timeout = ?settings.timeout,
        "recognition loop started"
    );

    while !ctx.state.is_terminal() {
        let Some((_pending, frame)) = submitter.try_begin(ctx, Instant::now()) else {
            tokio::time::sleep(settings.idle_poll).await;
            continue;
        };

        attempts += 1;
        debug!(
            attempt = attempts,
            seq = frame.seq,
            bytes = frame.payload_size(),
            "submitting frame"
        );

        let submission = tokio::time::timeout(settings.timeout, service.submit(frame.jpeg));
        let outcome = tokio::select! {
            biased;
            _ = ctx.state.wait_terminal() => None,
            r = submission => Some(r),
        };

        let result = match outcome {
            None => {
                debug!(attempt = attempts, "session ended during attempt, discarding it");
                break;
            }
            Some(Ok(result)) => result?,
            Some(Err(_)) => RecognitionResult::TransportError(format!(
                "no answer within {:?}",
                settings.timeout
            )),
        };

        if apply_result(ctx, attempts, result) {
            break;
        }
    }

    Ok(attempts)
}

/// Fold one answer into the shared state. Returns true once the scan is done.
fn apply_result(ctx: &SessionContext, attempt: u64, result: RecognitionResult) -> bool {
    match result {
        RecognitionResult::Success(fields) => {
            info!(attempt, fields = ?fields, "MRZ detected");
            ctx.state.transition(ScanState::Found(fields));
            true
        }
        RecognitionResult::NoDetection => {
            debug!(attempt, "no MRZ in frame");
            ctx.state.transition(ScanState::Scanning);
            false
        }
        RecognitionResult::ServiceError(message) => {
            warn!(attempt, error = %message, "recognition service reported an error");
            ctx.state.transition(ScanState::Scanning);
            false
        }
        RecognitionResult::TransportError(message) => {
            warn!(attempt, error = %message, "recognition attempt failed");
            false
        }
    }
}
