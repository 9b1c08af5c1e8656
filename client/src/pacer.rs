use std::time::Duration;
use tokio::time::Instant;

/// Minimum spacing between recognition attempts, independent of the camera
/// frame rate. Every granted slot counts, whatever the attempt's outcome.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    last_submit: Option<Instant>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_submit: None,
        }
    }

    /// Returns true at most once per interval and records `now` when it does.
    pub fn allow_submit(&mut self, now: Instant) -> bool {
        match self.last_submit {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_submit = Some(now);
                true
            }
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
