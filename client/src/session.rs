use mrz_scanner_common::config::ScannerConfig;
use mrz_scanner_common::protocol::FieldMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::camera::{Camera, CameraGuard, CaptureError};
use crate::capture::{run_capture_loop, CaptureSettings};
use crate::frame_buffer::FrameBuffer;
use crate::recognition::{run_recognition_loop, PendingFlag, RecognitionSettings};
use crate::render::Renderer;
use crate::service::{RecognitionError, RecognitionService};
use crate::state::{ScanState, SharedScanState};

/// Everything the two session activities share. Owned by [`Session::run`]
/// and borrowed by both loops.
pub struct SessionContext {
    pub frames: FrameBuffer,
    pub state: SharedScanState,
    pub pending: PendingFlag,
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            frames: FrameBuffer::new(),
            state: SharedScanState::new(),
            pending: PendingFlag::new(),
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub capture: CaptureSettings,
    pub recognition: RecognitionSettings,
}

impl SessionSettings {
    pub fn from_config(config: &ScannerConfig) -> Self {
        Self {
            capture: CaptureSettings {
                yield_interval: config.capture_yield(),
                key_poll: Duration::from_millis(1),
                success_hold: config.success_hold(),
                quit_key: config.quit_key,
            },
            recognition: RecognitionSettings {
                interval: config.frame_interval(),
                timeout: config.recognition_timeout(),
                idle_poll: config.idle_poll(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Found(FieldMap),
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("could not open camera: {0}")]
    CameraOpen(CaptureError),
    #[error("camera failed: {0}")]
    Capture(CaptureError),
    #[error("recognition service unreachable: {0}")]
    ServiceUnreachable(RecognitionError),
    #[error("recognition service {0}")]
    ConnectionLost(RecognitionError),
}

impl SessionError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CameraOpen(_) | Self::Capture(_) | Self::ServiceUnreachable(_) => 1,
            Self::ConnectionLost(_) => 2,
        }
    }
}

/// One scan: owns the collaborators and runs capture and recognition side
/// by side until a result, a quit, or a fatal error.
pub struct Session<C, R, S> {
    camera: C,
    renderer: R,
    service: S,
    settings: SessionSettings,
}

impl<C: Camera, R: Renderer, S: RecognitionService> Session<C, R, S> {
    pub fn new(camera: C, renderer: R, service: S, settings: SessionSettings) -> Self {
        Self {
            camera,
            renderer,
            service,
            settings,
        }
    }

    pub async fn run(self) -> Result<SessionOutcome, SessionError> {
        let Session {
            mut camera,
            mut renderer,
            mut service,
            settings,
        } = self;

        info!("opening camera");
        let mut opened = CameraGuard::open(&mut camera).await.map_err(|e| {
            error!(error = %e, "could not open camera");
            SessionError::CameraOpen(e)
        })?;

        let ctx = SessionContext::new();

        let capture = async {
            let result =
                run_capture_loop(&mut opened, &mut renderer, &ctx, &settings.capture).await;
            if let Err(e) = &result {
                ctx.state.transition(ScanState::Error(e.to_string()));
            }
            result
        };
        let recognition = async {
            let result = connect_and_recognize(&mut service, &ctx, &settings.recognition).await;
            if let Err(e) = &result {
                error!(error = %e, "recognition stopped");
                ctx.state.transition(ScanState::Error(e.to_string()));
            }
            result
        };

        let (captured, recognized) = tokio::join!(capture, recognition);

        drop(opened);
        service.close().await;

        let frames = captured.map_err(SessionError::Capture)?;
        let attempts = recognized?;
        debug_assert!(!ctx.pending.is_set(), "recognition attempt outlived the session");
        info!(
            frames,
            attempts,
            last_seq = ?ctx.frames.latest_seq(),
            "scan session finished"
        );

        match ctx.state.snapshot() {
            ScanState::Found(fields) => Ok(SessionOutcome::Found(fields)),
            ScanState::Stopped => Ok(SessionOutcome::Cancelled),
            other => {
                warn!(state = other.label(), "session ended without a terminal result");
                Ok(SessionOutcome::Cancelled)
            }
        }
    }
}

async fn connect_and_recognize<S: RecognitionService>(
    service: &mut S,
    ctx: &SessionContext,
    settings: &RecognitionSettings,
) -> Result<u64, SessionError> {
    let connected = tokio::select! {
        biased;
        _ = ctx.state.wait_terminal() => None,
        r = service.connect() => Some(r),
    };
    match connected {
        None => {
            debug!("session ended before the recognition service was reached");
            return Ok(0);
        }
        Some(Err(e)) => return Err(SessionError::ServiceUnreachable(e)),
        Some(Ok(())) => {}
    }

    ctx.state.transition(ScanState::Scanning);
    run_recognition_loop(service, ctx, settings)
        .await
        .map_err(SessionError::ConnectionLost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::RecognitionResult;
    use crate::testing::{
        field_map, CameraStats, MockCamera, MockRenderer, MockService, RenderLog, ServiceStats,
    };
    use std::sync::Arc;

    fn settings() -> SessionSettings {
        SessionSettings {
            capture: CaptureSettings {
                yield_interval: Duration::from_millis(10),
                key_poll: Duration::from_millis(1),
                success_hold: Duration::from_secs(3),
                quit_key: 'q',
            },
            recognition: RecognitionSettings {
                interval: Duration::from_millis(300),
                timeout: Duration::from_secs(5),
                idle_poll: Duration::from_millis(10),
            },
        }
    }

    struct Trackers {
        camera: Arc<CameraStats>,
        render: Arc<RenderLog>,
        service: Arc<ServiceStats>,
    }

    fn trackers() -> Trackers {
        Trackers {
            camera: Arc::new(CameraStats::default()),
            render: Arc::new(RenderLog::default()),
            service: Arc::new(ServiceStats::default()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn found_after_n_plus_one_attempts_regardless_of_frame_rate() {
        for frame_period_ms in [5u64, 33, 120] {
            let p = trackers();
            let misses = 4;
            let mut script = vec![RecognitionResult::NoDetection; misses];
            script.push(RecognitionResult::Success(field_map()));

            let session = Session::new(
                MockCamera::new(Arc::clone(&p.camera), Duration::from_millis(frame_period_ms)),
                MockRenderer::new(Arc::clone(&p.render)),
                MockService::scripted(Arc::clone(&p.service), script),
                settings(),
            );
            let outcome = session.run().await.unwrap();

            assert_eq!(outcome, SessionOutcome::Found(field_map()));
            assert_eq!(p.service.calls(), misses + 1, "period {frame_period_ms} ms");
            assert_eq!(p.service.connects(), 1);
            assert_eq!(p.service.closes(), 1);
            assert_eq!(p.camera.opens(), 1);
            assert_eq!(p.camera.closes(), 1);
            assert_eq!(p.render.finals(), vec![crate::render::Overlay::Found]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn result_is_delivered_unmodified() {
        let p = trackers();
        let mut fields = field_map();
        fields.insert("optional_data".into(), "  <<ZE184226B<<<<<1 ".into());
        fields.insert("names".into(), "ANNA MARIA".into());
        let session = Session::new(
            MockCamera::new(Arc::clone(&p.camera), Duration::from_millis(20)),
            MockRenderer::new(Arc::clone(&p.render)),
            MockService::scripted(
                Arc::clone(&p.service),
                vec![RecognitionResult::Success(fields.clone())],
            ),
            settings(),
        );
        assert_eq!(session.run().await.unwrap(), SessionOutcome::Found(fields));
    }

    #[tokio::test(start_paused = true)]
    async fn camera_open_failure_never_contacts_service() {
        let p = trackers();
        let session = Session::new(
            MockCamera::new(Arc::clone(&p.camera), Duration::from_millis(20)).failing_open(),
            MockRenderer::new(Arc::clone(&p.render)),
            MockService::always(Arc::clone(&p.service), RecognitionResult::NoDetection),
            settings(),
        );
        let err = session.run().await.unwrap_err();

        assert!(matches!(err, SessionError::CameraOpen(_)));
        assert_ne!(err.exit_code(), 0);
        assert_eq!(p.camera.opens(), 0);
        assert_eq!(p.camera.closes(), 0);
        assert_eq!(p.service.connects(), 0);
        assert_eq!(p.service.calls(), 0);
        assert!(p.render.overlays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_service_aborts_and_releases_camera() {
        let p = trackers();
        let session = Session::new(
            MockCamera::new(Arc::clone(&p.camera), Duration::from_millis(20)),
            MockRenderer::new(Arc::clone(&p.render)),
            MockService::always(Arc::clone(&p.service), RecognitionResult::NoDetection)
                .failing_connect(),
            settings(),
        );
        let err = session.run().await.unwrap_err();

        assert!(matches!(err, SessionError::ServiceUnreachable(_)));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(p.service.calls(), 0);
        assert_eq!(p.camera.opens(), 1);
        assert_eq!(p.camera.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn user_quit_is_a_clean_exit() {
        let p = trackers();
        let session = Session::new(
            MockCamera::new(Arc::clone(&p.camera), Duration::from_millis(20)),
            MockRenderer::new(Arc::clone(&p.render)).quit_after(50, 'q'),
            MockService::always(Arc::clone(&p.service), RecognitionResult::NoDetection),
            settings(),
        );
        assert_eq!(session.run().await.unwrap(), SessionOutcome::Cancelled);
        assert!(p.service.calls() > 0);
        assert_eq!(p.service.in_flight(), 0);
        assert_eq!(p.camera.opens(), 1);
        assert_eq!(p.camera.closes(), 1);
        assert_eq!(p.render.finals(), vec![crate::render::Overlay::Scanning]);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_lost_mid_session_ends_with_code_two() {
        let p = trackers();
        let session = Session::new(
            MockCamera::new(Arc::clone(&p.camera), Duration::from_millis(20)),
            MockRenderer::new(Arc::clone(&p.render)),
            MockService::always(Arc::clone(&p.service), RecognitionResult::NoDetection)
                .lose_connection_after(3),
            settings(),
        );
        let err = session.run().await.unwrap_err();

        assert!(matches!(err, SessionError::ConnectionLost(_)));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(p.camera.closes(), 1);
        assert_eq!(
            p.render.overlays().last().copied(),
            Some(crate::render::Overlay::Scanning)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn camera_failure_mid_session_stops_recognition() {
        let p = trackers();
        let session = Session::new(
            MockCamera::new(Arc::clone(&p.camera), Duration::from_millis(20)).fail_after(30),
            MockRenderer::new(Arc::clone(&p.render)),
            MockService::always(Arc::clone(&p.service), RecognitionResult::NoDetection)
                .with_delay(Duration::from_millis(50)),
            settings(),
        );
        let err = session.run().await.unwrap_err();

        assert!(matches!(err, SessionError::Capture(CaptureError::Read(_))));
        assert_eq!(p.service.in_flight(), 0);
        assert_eq!(p.service.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_service_keeps_one_attempt_outstanding() {
        let p = trackers();
        let session = Session::new(
            MockCamera::new(Arc::clone(&p.camera), Duration::from_millis(5)),
            MockRenderer::new(Arc::clone(&p.render)).quit_after(400, 'q'),
            MockService::always(Arc::clone(&p.service), RecognitionResult::NoDetection)
                .with_delay(Duration::from_millis(900)),
            settings(),
        );
        assert_eq!(session.run().await.unwrap(), SessionOutcome::Cancelled);
        assert!(p.service.calls() >= 3);
        assert_eq!(p.service.max_in_flight(), 1);
    }

    #[test]
    fn settings_follow_config() {
        let config = ScannerConfig {
            frame_interval_ms: 450,
            quit_key: 'x',
            ..ScannerConfig::default()
        };
        let settings = SessionSettings::from_config(&config);
        assert_eq!(settings.recognition.interval, Duration::from_millis(450));
        assert_eq!(settings.capture.quit_key, 'x');
        assert_eq!(settings.capture.yield_interval, Duration::from_millis(10));
    }
}
