use std::path::PathBuf;

use env_discovery::DiscoveryError;

use crate::model::BackendKind;
use crate::tools::ToolError;

/// Error type for registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("Failed to persist state at {path:?}: {message}")]
    State { path: PathBuf, message: String },

    #[error("{backend} environments do not support {operation}")]
    Unsupported {
        backend: BackendKind,
        operation: &'static str,
    },

    #[error("Environment {id} belongs to {actual}, not {expected}")]
    WrongBackend {
        id: String,
        expected: BackendKind,
        actual: BackendKind,
    },

    #[error("No {backend} environment found at {path:?}")]
    NotFound { backend: BackendKind, path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Cancellation from either the worker or a tool subprocess.
    pub fn is_cancelled(&self) -> bool {
        match self {
            RegistryError::Discovery(e) => e.is_cancelled(),
            RegistryError::Tool(e) => matches!(e, ToolError::Cancelled),
            _ => false,
        }
    }
}
