use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// `remote` talks to a recognition server at `server_url`; `local`
    /// runs the `[engine]` in-process.
    #[serde(default = "default_scanner_mode")]
    pub mode: String,
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Minimum spacing between two recognition attempts.
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    /// Sleep at the end of every capture iteration.
    #[serde(default = "default_capture_yield_ms")]
    pub capture_yield_ms: u64,
    /// Sleep of the recognition loop when it has nothing to submit.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Per-attempt deadline. Keep it above `engine.timeout_ms` so a slow
    /// engine reports its own timeout before the client gives up.
    #[serde(default = "default_recognition_timeout_ms")]
    pub recognition_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long the success frame stays on screen before the session exits.
    #[serde(default = "default_success_hold_ms")]
    pub success_hold_ms: u64,
    #[serde(default = "default_quit_key")]
    pub quit_key: char,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_camera_url")]
    pub url: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_quality")]
    pub quality: u32,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_camera_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    /// When set, an annotated JPEG is written here on every overlay change.
    #[serde(default)]
    pub preview_path: Option<String>,
    #[serde(default = "default_window_title")]
    pub window_title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_ws_path")]
    pub path: String,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

/// The external MRZ recognizer, used by the server and by the scanner in
/// `local` mode.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// `worker` keeps one process running and feeds it one image path per
    /// stdin line; `oneshot` starts the program per image with the path as
    /// its last argument.
    #[serde(default = "default_engine_kind")]
    pub kind: String,
    #[serde(default = "default_engine_command")]
    pub command: String,
    #[serde(default = "default_engine_args")]
    pub args: Vec<String>,
    #[serde(default = "default_engine_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            mode: default_scanner_mode(),
            server_url: default_server_url(),
            frame_interval_ms: default_frame_interval_ms(),
            capture_yield_ms: default_capture_yield_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            recognition_timeout_ms: default_recognition_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            success_hold_ms: default_success_hold_ms(),
            quit_key: default_quit_key(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            url: default_camera_url(),
            mode: default_mode(),
            quality: default_quality(),
            fps: default_fps(),
            connect_timeout_secs: default_camera_connect_timeout(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            preview_path: None,
            window_title: default_window_title(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            path: default_ws_path(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: default_engine_kind(),
            command: default_engine_command(),
            args: default_engine_args(),
            timeout_ms: default_engine_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ScannerConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn capture_yield(&self) -> Duration {
        Duration::from_millis(self.capture_yield_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn recognition_timeout(&self) -> Duration {
        Duration::from_millis(self.recognition_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn success_hold(&self) -> Duration {
        Duration::from_millis(self.success_hold_ms)
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Default value functions
fn default_scanner_mode() -> String {
    "remote".into()
}
fn default_server_url() -> String {
    "ws://127.0.0.1:8000/ws/mrz-scanner".into()
}
fn default_frame_interval_ms() -> u64 {
    300
}
fn default_capture_yield_ms() -> u64 {
    10
}
fn default_idle_poll_ms() -> u64 {
    10
}
fn default_recognition_timeout_ms() -> u64 {
    5_000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_success_hold_ms() -> u64 {
    3_000
}
fn default_quit_key() -> char {
    'q'
}
fn default_camera_url() -> String {
    "http://127.0.0.1:8080/stream".into()
}
fn default_mode() -> String {
    "mjpeg".into()
}
fn default_quality() -> u32 {
    80
}
fn default_fps() -> f64 {
    10.0
}
fn default_camera_connect_timeout() -> u64 {
    10
}
fn default_window_title() -> String {
    "MRZ Scanner".into()
}
fn default_bind() -> String {
    "0.0.0.0:8000".into()
}
fn default_ws_path() -> String {
    "/ws/mrz-scanner".into()
}
fn default_engine_kind() -> String {
    "worker".into()
}
fn default_engine_command() -> String {
    "python3".into()
}
// Loads the model once, then answers one JSON line per image path.
const FASTMRZ_WORKER: &str = "\
import json, sys
from fastmrz import FastMRZ
fast_mrz = FastMRZ()
for line in sys.stdin:
    try:
        result = fast_mrz.get_details(line.strip())
    except Exception as e:
        result = {'status': 'ERROR', 'message': str(e)}
    print(json.dumps(result), flush=True)
";
fn default_engine_args() -> Vec<String> {
    vec!["-u".into(), "-c".into(), FASTMRZ_WORKER.into()]
}
fn default_engine_timeout_ms() -> u64 {
    4_000
}
fn default_max_frame_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".into()
}
