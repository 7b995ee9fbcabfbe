//! Fixed-size worker pool: anonymous callables, FIFO, no identity or
//! cancellation (that is [`crate::task_manager::TaskManager`]'s job). Used
//! by the session to run dispatched RPC calls off the read loop.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Default worker count when a caller doesn't have a specific figure in mind.
pub const DEFAULT_WORKERS: usize = 4;

pub struct WorkerPool {
    tx: mpsc::UnboundedSender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers pulling from one shared FIFO queue. Submission
    /// order is preserved; because several workers race to dequeue, execution
    /// order across workers is not.
    pub fn new(size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = std::sync::Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    // The lock is held only to dequeue, never while the job runs.
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
            }));
        }
        WorkerPool { tx, workers }
    }

    /// Non-blocking: hands `fut` to the FIFO queue for the next free worker.
    pub fn submit<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // The channel is unbounded and the sender half always outlives the
        // pool, so this only fails if every worker has already been joined.
        let _ = self.tx.send(Box::pin(fut));
    }

    /// Closes the queue and joins every worker. A worker that has already
    /// dequeued a task runs it to completion before observing the close
    /// (drain semantics); nothing still in the channel is dropped mid-run,
    /// but nothing new is accepted past this call since `self` is consumed.
    pub async fn stop(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::time::sleep;

    #[tokio::test]
    async fn submitted_jobs_all_run() {
        let pool = WorkerPool::new(3);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let count = count.clone();
            pool.submit(async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.stop().await;
        assert_eq!(count.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn single_worker_preserves_submission_order() {
        let pool = WorkerPool::new(1);
        let order = Arc::new(AsyncMutex::new(Vec::new()));
        for i in 0..10 {
            let order = order.clone();
            pool.submit(async move {
                order.lock().await.push(i);
            });
        }
        pool.stop().await;
        let order = order.lock().await;
        assert_eq!(*order, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn stop_drains_in_flight_and_queued_jobs() {
        let pool = WorkerPool::new(2);
        let completed = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let completed = completed.clone();
            pool.submit(async move {
                sleep(Duration::from_millis(20)).await;
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.stop().await;
        assert_eq!(completed.load(Ordering::SeqCst), 5);
    }
}
