//! MRZ recognition engines shared by the server and the co-located client.
//!
//! Both engines hand the image to an external program as a temporary JPEG
//! file. [`CommandEngine`] starts the program once per image and reads one
//! JSON object from its stdout. [`WorkerEngine`] keeps the program running,
//! writes one image path per line to its stdin and reads one JSON line back,
//! so the model is loaded only once.

use bytes::Bytes;
use serde_json::Value;
use std::future::Future;
use std::io::Write;
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::protocol::{fields_from_json, FieldMap};

/// What the engine made of one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    Found(FieldMap),
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown engine kind '{0}', expected 'worker' or 'oneshot'")]
    UnknownKind(String),
    #[error("failed to stage image: {0}")]
    TempFile(String),
    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },
    #[error("engine did not finish within {0:?}")]
    Timeout(Duration),
    #[error("engine failed: {0}")]
    Failed(String),
    #[error("unreadable engine output: {0}")]
    Output(String),
}

/// Reads the machine-readable zone off a document image.
pub trait MrzEngine: Send + Sync + 'static {
    fn recognize(&self, image: Bytes) -> impl Future<Output = Result<Detection, EngineError>> + Send;
}

/// Engine selected by `engine.kind`.
pub enum Engine {
    Worker(WorkerEngine),
    Oneshot(CommandEngine),
}

impl Engine {
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let timeout = config.timeout();
        match config.kind.as_str() {
            "worker" => Ok(Self::Worker(WorkerEngine::new(
                config.command.clone(),
                config.args.clone(),
                timeout,
            ))),
            "oneshot" => Ok(Self::Oneshot(CommandEngine::new(
                config.command.clone(),
                config.args.clone(),
                timeout,
            ))),
            other => Err(EngineError::UnknownKind(other.to_string())),
        }
    }

    pub fn program(&self) -> &str {
        match self {
            Self::Worker(e) => &e.program,
            Self::Oneshot(e) => &e.program,
        }
    }
}

impl MrzEngine for Engine {
    async fn recognize(&self, image: Bytes) -> Result<Detection, EngineError> {
        match self {
            Self::Worker(e) => e.recognize(image).await,
            Self::Oneshot(e) => e.recognize(image).await,
        }
    }
}

/// Runs an external recognizer once per image. The image path is appended
/// to `args`; the program prints one JSON object on stdout.
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

impl MrzEngine for CommandEngine {
    async fn recognize(&self, image: Bytes) -> Result<Detection, EngineError> {
        // Removed from disk when `staged` drops, on every path out of here.
        let staged = stage(image).await?;

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(staged.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Spawn {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(EngineError::Failed(e.to_string())),
            Err(_) => {
                warn!(timeout = ?self.timeout, "engine timed out, killing it");
                return Err(EngineError::Timeout(self.timeout));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(status = %output.status, stderr = %stderr.trim(), "engine exited with error");
            return Err(EngineError::Failed(format!(
                "{}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let detection = parse_engine_output(&output.stdout)?;
        debug!(found = matches!(detection, Detection::Found(_)), "engine finished");
        Ok(detection)
    }
}

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    /// False while a request is unanswered. A worker left in that state by
    /// a dropped call is replaced, since its next line belongs to that call.
    idle: bool,
}

/// Keeps one recognizer process alive across images. Requests are
/// serialized: the process sees one image path at a time.
pub struct WorkerEngine {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    worker: Mutex<Option<Worker>>,
}

impl WorkerEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            worker: Mutex::new(None),
        }
    }

    fn spawn(&self) -> Result<Worker, EngineError> {
        let spawn_error = |reason: String| EngineError::Spawn {
            program: self.program.clone(),
            reason,
        };
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("could not get stdin handle".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("could not get stdout handle".into()))?;
        info!(program = self.program, pid = child.id(), "engine worker started");
        Ok(Worker {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            idle: true,
        })
    }

    async fn exchange(worker: &mut Worker, path: &str) -> Result<String, EngineError> {
        worker.idle = false;
        worker
            .stdin
            .write_all(format!("{path}\n").as_bytes())
            .await
            .map_err(|e| EngineError::Failed(format!("write to worker: {e}")))?;
        worker
            .stdin
            .flush()
            .await
            .map_err(|e| EngineError::Failed(format!("write to worker: {e}")))?;
        let line = worker
            .stdout
            .next_line()
            .await
            .map_err(|e| EngineError::Failed(format!("read from worker: {e}")))?
            .ok_or_else(|| EngineError::Failed("worker exited".into()))?;
        worker.idle = true;
        Ok(line)
    }
}

impl MrzEngine for WorkerEngine {
    async fn recognize(&self, image: Bytes) -> Result<Detection, EngineError> {
        let staged = stage(image).await?;
        let path = staged.path().display().to_string();

        let mut slot = self.worker.lock().await;
        if slot.as_ref().is_some_and(|w| !w.idle) {
            warn!("engine worker was interrupted mid-request, restarting it");
            *slot = None;
        }
        let worker = match slot.as_mut() {
            Some(w) => w,
            None => slot.insert(self.spawn()?),
        };

        let answer = tokio::time::timeout(self.timeout, Self::exchange(worker, &path)).await;
        let line = match answer {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                error!(error = %e, "engine worker failed, it will be restarted");
                *slot = None;
                return Err(e);
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "engine worker timed out, killing it");
                if let Some(mut w) = slot.take() {
                    let _ = w.child.start_kill();
                }
                return Err(EngineError::Timeout(self.timeout));
            }
        };
        drop(slot);

        let detection = parse_engine_output(line.as_bytes())?;
        debug!(found = matches!(detection, Detection::Found(_)), "engine finished");
        Ok(detection)
    }
}

async fn stage(image: Bytes) -> Result<NamedTempFile, EngineError> {
    tokio::task::spawn_blocking(move || {
        let mut file = tempfile::Builder::new()
            .prefix("mrz-")
            .suffix(".jpg")
            .tempfile()
            .map_err(|e| EngineError::TempFile(e.to_string()))?;
        file.write_all(&image)
            .and_then(|()| file.flush())
            .map_err(|e| EngineError::TempFile(e.to_string()))?;
        Ok(file)
    })
    .await
    .map_err(|e| EngineError::TempFile(e.to_string()))?
}

/// Interpret one engine answer. A JSON object is a detection unless its
/// `status` is `FAILURE` (nothing found) or `ERROR` (the engine gave up on
/// this image). Any other JSON value means nothing was found.
pub fn parse_engine_output(stdout: &[u8]) -> Result<Detection, EngineError> {
    let value: Value =
        serde_json::from_slice(stdout).map_err(|e| EngineError::Output(e.to_string()))?;
    let Value::Object(object) = value else {
        return Ok(Detection::NotFound);
    };
    match object.get("status").and_then(Value::as_str) {
        Some("FAILURE") => Ok(Detection::NotFound),
        Some("ERROR") => {
            let message = object
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("engine error");
            Err(EngineError::Failed(message.to_string()))
        }
        _ => Ok(Detection::Found(fields_from_json(object))),
    }
}

/// Check whether the engine program can be started. Logs a warning if not.
pub async fn check_engine_available(program: &str) {
    match Command::new(program).arg("--version").output().await {
        Ok(out) if out.status.success() => {
            debug!(program, "recognition engine is available");
        }
        Ok(_) => {
            warn!(program, "engine returned non-zero for --version; recognition may fail");
        }
        Err(e) => {
            warn!(
                program,
                error = %e,
                "engine not found on PATH; every frame will be answered with an error"
            );
        }
    }
}
