use bytes::Bytes;
use mrz_scanner_common::engine::{Detection, EngineError, MrzEngine};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::service::{RecognitionError, RecognitionResult, RecognitionService};

/// Recognition in the scanner process itself. Each image runs on its own
/// task so an attempt abandoned by the caller keeps the engine busy until it
/// finishes, and its answer is what the next call returns.
pub struct LocalRecognitionService<E> {
    engine: Arc<E>,
    in_flight: Option<JoinHandle<Result<Detection, EngineError>>>,
}

impl<E: MrzEngine> LocalRecognitionService<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine: Arc::new(engine),
            in_flight: None,
        }
    }
}

impl<E: MrzEngine> RecognitionService for LocalRecognitionService<E> {
    async fn connect(&mut self) -> Result<(), RecognitionError> {
        info!("using the in-process recognition engine");
        Ok(())
    }

    async fn submit(&mut self, image: Bytes) -> Result<RecognitionResult, RecognitionError> {
        if self.in_flight.is_some() {
            debug!(bytes = image.len(), "engine still busy, collecting its answer instead");
        }
        let engine = &self.engine;
        let task = self.in_flight.get_or_insert_with(|| {
            let engine = Arc::clone(engine);
            tokio::spawn(async move { engine.recognize(image).await })
        });
        let joined = task.await;
        self.in_flight = None;

        Ok(match joined {
            Ok(Ok(Detection::Found(fields))) => RecognitionResult::Success(fields),
            Ok(Ok(Detection::NotFound)) => RecognitionResult::NoDetection,
            Ok(Err(e)) => {
                warn!(error = %e, "engine error");
                RecognitionResult::ServiceError(e.to_string())
            }
            Err(e) => RecognitionResult::ServiceError(format!("engine task failed: {e}")),
        })
    }

    async fn close(&mut self) {
        if let Some(task) = self.in_flight.take() {
            debug!("cancelling engine call");
            task.abort();
            let _ = task.await;
        }
    }
}
