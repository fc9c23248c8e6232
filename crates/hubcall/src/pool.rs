//! A fixed-size pool of workers for blocking implementor bodies.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::HubcallError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs on tokio's blocking threads, at most `size` at a time, in the
/// order they were submitted.
///
/// Each worker is an async task that takes the next job off a shared FIFO
/// queue and awaits it on [`tokio::task::spawn_blocking`]. The submitting
/// side never waits.
pub struct WorkerPool {
    queue: mpsc::UnboundedSender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers. Must be called inside a Tokio runtime.
    pub fn new(size: usize) -> Self {
        let (queue, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..size)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        if let Err(e) = tokio::task::spawn_blocking(job).await {
                            tracing::warn!(worker, error = %e, "job did not complete");
                        }
                    }
                    tracing::debug!(worker, "worker stopped");
                })
            })
            .collect();

        Self { queue, workers }
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `job`.
    ///
    /// # Errors
    /// [`HubcallError::IllegalState`] after the pool has been shut down.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<(), HubcallError> {
        self.queue
            .send(Box::new(job))
            .map_err(|_| HubcallError::IllegalState("worker pool is shut down".into()))
    }

    /// Stops every worker. Queued jobs are dropped; jobs already running
    /// finish on their blocking thread.
    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_jobs_run_in_submission_order_with_one_worker() {
        let pool = WorkerPool::new(1);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        for i in 0..10 {
            let seen = Arc::clone(&seen);
            pool.execute(move || seen.lock().unwrap().push(i)).unwrap();
        }
        pool.execute(move || {
            let _ = done_tx.send(());
        })
        .unwrap();

        done_rx.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pool_never_exceeds_its_size() {
        let pool = WorkerPool::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for _ in 0..12 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done_tx = done_tx.clone();
            pool.execute(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            })
            .unwrap();
        }
        for _ in 0..12 {
            done_rx.recv().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.size(), 3);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1);
        let (done_tx, done_rx) = oneshot::channel();
        pool.execute(|| panic!("job failed")).unwrap();
        pool.execute(move || {
            let _ = done_tx.send(());
        })
        .unwrap();
        done_rx.await.unwrap();
    }
}
