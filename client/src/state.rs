use mrz_scanner_common::protocol::FieldMap;
use tokio::sync::watch;
use tracing::{debug, info};

/// Progress of one scan session.
///
/// `Found`, `Error` and `Stopped` are terminal. `Connecting` is only ever
/// the initial state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanState {
    Connecting,
    Scanning,
    Found(FieldMap),
    Error(String),
    Stopped,
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Found(_) | Self::Error(_) | Self::Stopped)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Scanning => "scanning",
            Self::Found(_) => "found",
            Self::Error(_) => "error",
            Self::Stopped => "stopped",
        }
    }
}

/// ScanState shared between the capture loop (reader) and the recognition
/// side (writer). Transitions are atomic with respect to readers and wake
/// everyone waiting in [`SharedScanState::wait_terminal`].
pub struct SharedScanState {
    tx: watch::Sender<ScanState>,
}

impl SharedScanState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ScanState::Connecting);
        Self { tx }
    }

    /// Move to `next`. Returns false, leaving the state untouched, if the
    /// current state is terminal, `next` equals it, or `next` is
    /// `Connecting`.
    pub fn transition(&self, next: ScanState) -> bool {
        let mut from = "";
        let changed = self.tx.send_if_modified(|current| {
            if current.is_terminal() || *current == next || next == ScanState::Connecting {
                return false;
            }
            from = current.label();
            *current = next.clone();
            true
        });
        if changed {
            info!(from, to = next.label(), "scan state changed");
        } else {
            debug!(to = next.label(), "scan state transition ignored");
        }
        changed
    }

    pub fn snapshot(&self) -> ScanState {
        self.tx.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.tx.borrow().is_terminal()
    }

    /// Apply `f` to the current state without cloning it.
    pub fn inspect<T>(&self, f: impl FnOnce(&ScanState) -> T) -> T {
        f(&self.tx.borrow())
    }

    /// Resolves once the state is terminal.
    pub async fn wait_terminal(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(ScanState::is_terminal).await;
    }
}

impl Default for SharedScanState {
    fn default() -> Self {
        Self::new()
    }
}
