use mrz_scanner_common::frame::Frame;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::camera::{Camera, CameraGuard, CaptureError};
use crate::render::{Overlay, Renderer};
use crate::session::SessionContext;
use crate::state::ScanState;

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Sleep at the end of every iteration so the recognition side gets
    /// scheduled.
    pub yield_interval: Duration,
    /// How long each iteration waits for a key press.
    pub key_poll: Duration,
    /// How long the success frame stays up before the loop returns. A quit
    /// redraws the last frame without waiting.
    pub success_hold: Duration,
    pub quit_key: char,
}

/// Pull frames at device rate, publish each to the frame buffer and render
/// it with the overlay for the current state.
///
/// Returns the number of frames captured once the state is terminal. A
/// camera failure is returned as an error and ends the session.
pub async fn run_capture_loop<C: Camera, R: Renderer>(
    camera: &mut CameraGuard<'_, C>,
    renderer: &mut R,
    ctx: &SessionContext,
    settings: &CaptureSettings,
) -> Result<u64, CaptureError> {
    let mut frames: u64 = 0;
    let mut last_frame: Option<Frame> = None;

    while !ctx.state.is_terminal() {
        let read = tokio::select! {
            biased;
            _ = ctx.state.wait_terminal() => None,
            frame = camera.read() => Some(frame),
        };
        let frame = match read {
            None => break,
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                error!(error = %e, frames, "camera read failed");
                return Err(e);
            }
        };

        frames += 1;
        if frames % 100 == 0 {
            debug!(frames, "frames captured");
        }

        ctx.frames.store(frame.clone());
        let overlay = ctx.state.inspect(Overlay::for_state);
        renderer.show(&frame, overlay);
        last_frame = Some(frame);

        if renderer.wait_key(settings.key_poll).await == Some(settings.quit_key) {
            info!("quit requested");
            ctx.state.transition(ScanState::Stopped);
            break;
        }

        tokio::time::sleep(settings.yield_interval).await;
    }

    let end = ctx.state.inspect(|s| match s {
        ScanState::Found(_) => Some(true),
        ScanState::Stopped => Some(false),
        _ => None,
    });
    if let (Some(found), Some(frame)) = (end, &last_frame) {
        let overlay = ctx.state.inspect(Overlay::for_state);
        renderer.finish(frame, overlay);
        if found {
            info!(hold = ?settings.success_hold, "holding result on screen");
            tokio::time::sleep(settings.success_hold).await;
        }
    }

    Ok(frames)
}
