//! Python environment discovery through an external worker process.
//!
//! The worker (a `pet`-compatible binary started as `<worker> server`) scans
//! the machine for interpreters and streams what it finds over JSON-RPC.
//! This crate owns that process and layers two policies on top:
//!
//! - refreshes are serialized through a single-slot [`WorkerPool`], so scans
//!   from different callers never interleave against the one worker;
//! - refresh results are cached per [`RefreshScope`], with hard (bypass and
//!   repopulate) and soft (serve if present) refreshes.
//!
//! ```no_run
//! # async fn demo() -> Result<(), env_discovery::DiscoveryError> {
//! use std::sync::Arc;
//! use env_discovery::{DiscoveryConfig, DiscoveryService, ProcessLocator, RefreshScope};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = DiscoveryConfig::default();
//! let locator = ProcessLocator::new(&config.worker_path, config.configure_options());
//! let service = DiscoveryService::new(Arc::new(locator));
//! let found = service
//!     .refresh(false, &RefreshScope::All, &CancellationToken::new())
//!     .await?;
//! println!("{} items", found.len());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod framing;
pub mod locator;
pub mod protocol;
pub mod rpc;
pub mod service;
pub mod shutdown;
pub mod worker_pool;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use cache::{DiscoveryCache, RefreshScope, ScopeKey};
pub use error::DiscoveryError;
pub use locator::{Connector, NativeLocator, ProcessLocator};
pub use protocol::{
    ConfigureOptions, NativeEnvInfo, NativeEnvKind, NativeEnvManagerInfo, NativeInfo,
    RefreshOptions,
};
pub use rpc::RpcConnection;
pub use service::DiscoveryService;
pub use shutdown::ShutdownHandle;
pub use worker_pool::WorkerPool;

/// Default worker binary, looked up on PATH.
pub const DEFAULT_WORKER: &str = "pet";

/// Base cache directory (`~/.cache/pyenvs` on Linux).
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("pyenvs")
}

/// How to start and configure the discovery worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub worker_path: PathBuf,
    pub workspace_directories: Vec<PathBuf>,
    pub environment_directories: Vec<PathBuf>,
    pub conda_executable: Option<PathBuf>,
    pub poetry_executable: Option<PathBuf>,
    pub cache_directory: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            worker_path: PathBuf::from(DEFAULT_WORKER),
            workspace_directories: Vec::new(),
            environment_directories: Vec::new(),
            conda_executable: None,
            poetry_executable: None,
            cache_directory: Some(default_cache_dir().join("worker")),
        }
    }
}

impl DiscoveryConfig {
    pub fn configure_options(&self) -> ConfigureOptions {
        ConfigureOptions {
            workspace_directories: self.workspace_directories.clone(),
            environment_directories: self.environment_directories.clone(),
            conda_executable: self.conda_executable.clone(),
            poetry_executable: self.poetry_executable.clone(),
            cache_directory: self.cache_directory.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.worker_path, PathBuf::from("pet"));
        assert!(config
            .cache_directory
            .as_ref()
            .is_some_and(|dir| dir.ends_with("pyenvs/worker")));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: DiscoveryConfig =
            serde_json::from_str(r#"{"workspace_directories": ["/work"]}"#).unwrap();
        assert_eq!(config.worker_path, PathBuf::from("pet"));
        assert_eq!(
            config.configure_options().workspace_directories,
            vec![PathBuf::from("/work")]
        );
    }
}
