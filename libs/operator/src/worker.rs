//! Per resource worker pools executing asynchronous jobs against the cloud
//! API. Submissions never block: a full queue drops the job with a counter
//! so callers holding locks are never parked on the channel.

use crate::error::{Error, Result};
use crate::metrics::WorkerMetrics;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

/// Outcome of a single job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkResult {
    Done,
    Requeue,
    RequeueAfter(Duration),
}

struct QueuedJob<J> {
    job: J,
    attempt: u32,
}

/// The pieces each worker task owns: enough to execute, requeue and drop
/// jobs without a handle back to the pool itself.
struct WorkerRuntime<J> {
    resource: &'static str,
    max_requeue: u32,
    tx: mpsc::Sender<QueuedJob<J>>,
    shutdown: CancellationToken,
    metrics: Arc<WorkerMetrics>,
}

impl<J> Clone for WorkerRuntime<J> {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource,
            max_requeue: self.max_requeue,
            tx: self.tx.clone(),
            shutdown: self.shutdown.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<J> WorkerRuntime<J>
where
    J: Send + Clone + 'static,
{
    fn enqueue(&self, queued: QueuedJob<J>) {
        match self.tx.try_send(queued) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.dropped_inc(self.resource);
                warn!(msg = "work queue full, dropping job", resource = self.resource);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(msg = "work queue closed, dropping job", resource = self.resource);
            }
        }
    }

    async fn run_job<F, Fut>(&self, queued: QueuedJob<J>, job_fn: &F)
    where
        F: Fn(J) -> Fut,
        Fut: Future<Output = Result<WorkResult>>,
    {
        let requeue_after = match job_fn(queued.job.clone()).await {
            Ok(WorkResult::Done) => return,
            Ok(WorkResult::Requeue) => None,
            Ok(WorkResult::RequeueAfter(after)) => Some(after),
            Err(e) if e.is_retryable() => {
                warn!(msg = "job failed, requeuing", resource = self.resource, %e);
                None
            }
            Err(e) => {
                error!(msg = "job failed, dropping", resource = self.resource, %e);
                self.metrics.dropped_inc(self.resource);
                return;
            }
        };

        let attempt = queued.attempt + 1;
        if attempt > self.max_requeue {
            self.metrics.dropped_inc(self.resource);
            warn!(
                msg = "job exceeded requeue budget, dropping",
                resource = self.resource,
                attempt
            );
            return;
        }
        self.metrics.requeued_inc(self.resource);

        let queued = QueuedJob {
            job: queued.job,
            attempt,
        };
        match requeue_after {
            None => self.enqueue(queued),
            Some(after) => {
                let runtime = self.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = runtime.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(after) => runtime.enqueue(queued),
                    }
                });
            }
        }
    }
}

/// A named pool of worker tasks draining a bounded queue of jobs.
///
/// Jobs submitted by a single caller are executed in FIFO order only when
/// the pool runs a single worker; the resource providers rely on this to
/// serialise cloud mutations per node.
pub struct WorkerPool<J> {
    runtime: WorkerRuntime<J>,
    worker_count: usize,
    rx: Mutex<Option<mpsc::Receiver<QueuedJob<J>>>>,
    started: AtomicBool,
}

impl<J> WorkerPool<J>
where
    J: Send + Clone + 'static,
{
    pub fn new(
        resource: &'static str,
        worker_count: usize,
        max_requeue: u32,
        queue_capacity: usize,
        shutdown: CancellationToken,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity);
        Self {
            runtime: WorkerRuntime {
                resource,
                max_requeue,
                tx,
                shutdown,
                metrics,
            },
            worker_count: worker_count.max(1),
            rx: Mutex::new(Some(rx)),
            started: AtomicBool::new(false),
        }
    }

    /// Launch the worker tasks. Fails if the pool was already started.
    pub async fn start<F, Fut>(&self, job_fn: F) -> Result<()>
    where
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkResult>> + Send,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted(self.runtime.resource));
        }

        let rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or(Error::AlreadyStarted(self.runtime.resource))?;
        let rx = Arc::new(Mutex::new(rx));
        let job_fn = Arc::new(job_fn);

        info!(
            msg = "starting worker pool",
            resource = self.runtime.resource,
            workers = self.worker_count
        );
        for _ in 0..self.worker_count {
            let runtime = self.runtime.clone();
            let rx = Arc::clone(&rx);
            let job_fn = Arc::clone(&job_fn);
            tokio::spawn(async move {
                loop {
                    let queued = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            _ = runtime.shutdown.cancelled() => break,
                            queued = guard.recv() => queued,
                        }
                    };
                    let Some(queued) = queued else { break };
                    runtime.run_job(queued, job_fn.as_ref()).await;
                }
                trace!(msg = "worker exiting", resource = runtime.resource);
            });
        }
        Ok(())
    }

    /// Non blocking submission. A full queue drops the job.
    pub fn submit(&self, job: J) {
        self.runtime.metrics.submitted_inc(self.runtime.resource);
        self.runtime.enqueue(QueuedJob { job, attempt: 0 });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use opentelemetry::global;

    fn test_pool<J: Send + Clone + 'static>(
        worker_count: usize,
        max_requeue: u32,
    ) -> Arc<WorkerPool<J>> {
        let meter = global::meter("test");
        Arc::new(WorkerPool::new(
            "vpc.amazonaws.com/pod-eni",
            worker_count,
            max_requeue,
            64,
            CancellationToken::new(),
            Arc::new(WorkerMetrics::new(&meter)),
        ))
    }

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_submitted_jobs_run() {
        let pool = test_pool::<u32>(1, 3);
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        pool.start(move |_job| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(WorkResult::Done)
            }
        })
        .await
        .unwrap();

        pool.submit(1);
        pool.submit(2);
        wait_for(&seen, 2).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let pool = test_pool::<u32>(1, 3);
        pool.start(|_| async { Ok(WorkResult::Done) }).await.unwrap();

        let result = pool.start(|_| async { Ok(WorkResult::Done) }).await;
        assert!(matches!(result, Err(Error::AlreadyStarted(_))));
    }

    #[tokio::test]
    async fn test_failing_job_runs_max_requeue_plus_one_times() {
        let max_requeue = 3;
        let pool = test_pool::<u32>(1, max_requeue);
        let invoked = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&invoked);
        pool.start(move |_job| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::NodeNotReady("test-node".to_string()))
            }
        })
        .await
        .unwrap();

        pool.submit(1);
        wait_for(&invoked, max_requeue as usize + 1).await;
        // Give the pool a chance to run it again if the budget were broken.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(invoked.load(Ordering::SeqCst), max_requeue as usize + 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_drops_job() {
        let pool = test_pool::<u32>(1, 3);
        let invoked = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&invoked);
        pool.start(move |_job| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Invalid("bad job".to_string()))
            }
        })
        .await
        .unwrap();

        pool.submit(1);
        wait_for(&invoked, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
    }
}
