//! Cached discovery on top of a locator.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

use crate::cache::{DiscoveryCache, RefreshScope};
use crate::error::DiscoveryError;
use crate::locator::NativeLocator;
use crate::protocol::{NativeEnvInfo, NativeInfo};
use crate::shutdown::ShutdownHandle;
use crate::worker_pool::WorkerPool;

/// Discovery entry point shared by every registry.
///
/// Refreshes are serialized through a single-slot [`WorkerPool`] and their
/// results cached per [`RefreshScope`]. Resolves go straight to the locator.
pub struct DiscoveryService {
    locator: Arc<dyn NativeLocator>,
    pool: WorkerPool,
    cache: Arc<StdMutex<DiscoveryCache>>,
}

impl DiscoveryService {
    /// Must be called inside a tokio runtime.
    pub fn new(locator: Arc<dyn NativeLocator>) -> Self {
        Self {
            locator,
            pool: WorkerPool::new("discovery"),
            cache: Arc::new(StdMutex::new(DiscoveryCache::default())),
        }
    }

    /// Enumerate environments in `scope`.
    ///
    /// A hard refresh drops the cached entry and always goes to the worker.
    /// A soft refresh serves the cached entry when there is one and otherwise
    /// behaves like a hard refresh. Concurrent hard refreshes are not merged;
    /// they queue behind each other.
    pub async fn refresh(
        &self,
        hard: bool,
        scope: &RefreshScope,
        cancel: &CancellationToken,
    ) -> Result<Vec<NativeInfo>, DiscoveryError> {
        let key = scope.key();

        if !hard {
            if let Some(items) = self.cache.lock().unwrap().get(&key) {
                debug!("[discovery] Serving {} from cache", key);
                return Ok(items.clone());
            }
        }

        self.cache.lock().unwrap().remove(&key);

        let locator = self.locator.clone();
        let cache = self.cache.clone();
        let options = scope.to_options();
        let job_cancel = cancel.clone();
        let job_key = key.clone();
        let result = self
            .pool
            .submit(async move {
                if job_cancel.is_cancelled() {
                    return Err(DiscoveryError::Cancelled);
                }
                info!("[discovery] Refreshing {}", job_key);
                let items = locator.refresh(options, &job_cancel).await?;
                cache.lock().unwrap().insert(job_key, items.clone());
                Ok(items)
            })
            .await;

        match &result {
            Ok(items) => debug!("[discovery] {} refreshed: {} items", key, items.len()),
            Err(e) if e.is_cancelled() => info!("[discovery] Refresh of {} cancelled", key),
            Err(e) => error!("[discovery] Refresh of {} failed: {}", key, e),
        }
        result
    }

    /// Resolve one interpreter path. Never cached.
    pub async fn resolve(
        &self,
        executable: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<NativeEnvInfo>, DiscoveryError> {
        let result = self.locator.resolve(executable, cancel).await;
        if let Err(e) = &result {
            if !e.is_cancelled() {
                error!("[discovery] Resolve of {:?} failed: {}", executable, e);
            }
        }
        result
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// Refreshes queued or running right now.
    pub fn pending_refreshes(&self) -> usize {
        self.pool.queued()
    }

    /// Stop the queue and the worker.
    pub fn shutdown(&self) {
        self.pool.close();
        self.locator.shutdown();
    }

    pub fn shutdown_handle(self: &Arc<Self>) -> ShutdownHandle {
        let service = self.clone();
        ShutdownHandle::from_fn(move || service.shutdown())
    }
}
