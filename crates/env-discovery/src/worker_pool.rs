//! Single-concurrency job queue.
//!
//! Jobs run one at a time, in the order they were submitted, on a dedicated
//! processor task. Each submission hands back a future for its own result.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, info};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::DiscoveryError;

type Job = BoxFuture<'static, ()>;

pub struct WorkerPool {
    name: &'static str,
    tx: StdMutex<Option<mpsc::UnboundedSender<Job>>>,
    queued: Arc<AtomicUsize>,
    processor: JoinHandle<()>,
}

impl WorkerPool {
    /// Start the processor task. Must be called inside a tokio runtime.
    pub fn new(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let queued = Arc::new(AtomicUsize::new(0));

        let processor_queued = queued.clone();
        let processor = tokio::spawn(async move {
            debug!("[worker-pool:{}] Processor started", name);
            while let Some(job) = rx.recv().await {
                // A panicking job must not take the queue down with it.
                if let Err(e) = tokio::spawn(job).await {
                    error!("[worker-pool:{}] Job failed: {}", name, e);
                }
                processor_queued.fetch_sub(1, Ordering::SeqCst);
            }
            debug!("[worker-pool:{}] Processor stopped", name);
        });

        Self {
            name,
            tx: StdMutex::new(Some(tx)),
            queued,
            processor,
        }
    }

    /// Jobs submitted but not yet finished, including the running one.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Queue a job. Its place in line is fixed when `submit` is called, not
    /// when the returned future is first polled.
    pub fn submit<F, T>(&self, job: F) -> impl Future<Output = Result<T, DiscoveryError>>
    where
        F: Future<Output = Result<T, DiscoveryError>> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let wrapped: Job = async move {
            let _ = result_tx.send(job.await);
        }
        .boxed();

        let sent = match self.tx.lock().unwrap().as_ref() {
            Some(tx) => {
                self.queued.fetch_add(1, Ordering::SeqCst);
                tx.send(wrapped).is_ok()
            }
            None => false,
        };
        if !sent {
            debug!("[worker-pool:{}] Rejecting job, pool is closed", self.name);
        } else {
            debug!("[worker-pool:{}] Job queued ({} in line)", self.name, self.queued());
        }

        async move {
            if !sent {
                return Err(DiscoveryError::PoolClosed);
            }
            result_rx.await.map_err(|_| DiscoveryError::PoolClosed)?
        }
    }

    /// Stop accepting jobs and abandon anything still queued.
    pub fn close(&self) {
        if self.tx.lock().unwrap().take().is_some() {
            info!("[worker-pool:{}] Closing", self.name);
        }
        self.processor.abort();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let pool = WorkerPool::new("test");
        let log = Arc::new(StdMutex::new(Vec::new()));

        let mut results = Vec::new();
        for i in 0..5u64 {
            let log = log.clone();
            results.push(pool.submit(async move {
                // Earlier jobs sleep longer; order must still hold.
                tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                log.lock().unwrap().push(i);
                Ok(i)
            }));
        }

        let values = futures::future::join_all(results).await;
        let values: Vec<u64> = values.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_job_error_is_returned_to_submitter() {
        let pool = WorkerPool::new("test");
        let err = pool
            .submit(async { Err::<(), _>(DiscoveryError::WorkerExited) })
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::WorkerExited));

        // The pool keeps working after a failed job.
        assert_eq!(pool.submit(async { Ok(7) }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_pool() {
        let pool = WorkerPool::new("test");
        let panicked = pool.submit(async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        assert!(matches!(panicked.await, Err(DiscoveryError::PoolClosed)));
        assert_eq!(pool.submit(async { Ok("next") }).await.unwrap(), "next");
    }

    #[tokio::test]
    async fn test_submit_after_close() {
        let pool = WorkerPool::new("test");
        pool.close();
        let err = pool.submit(async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::PoolClosed));
    }
}
