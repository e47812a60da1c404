use std::path::PathBuf;

/// Error type for discovery operations.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to spawn discovery worker {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Worker returned error {code}: {message}")]
    Worker { code: i64, message: String },

    #[error("Discovery worker exited")]
    WorkerExited,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Worker pool is shut down")]
    PoolClosed,
}

impl DiscoveryError {
    /// Cancellation is not a failure: callers skip error reporting for it.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DiscoveryError::Cancelled)
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(e: serde_json::Error) -> Self {
        DiscoveryError::Protocol(e.to_string())
    }
}
