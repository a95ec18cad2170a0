//! Fixed-size worker pool: exactly twice the CPU count, draining a bounded
//! task queue sized at four times the worker count. One panicking task
//! never brings a worker down — each task body runs inside its own spawned
//! task so a panic surfaces as a `JoinError` the worker just logs.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::RelayError;

use super::backpressure::{BackpressureController, PressureLevel};
use super::telemetry::PipelineTelemetry;

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), RelayError>> + Send>>;
pub type TaskHandler = Box<dyn FnOnce() -> TaskFuture + Send>;

pub struct Task {
    pub id: u64,
    pub priority: i32,
    pub handler: TaskHandler,
}

impl Task {
    pub fn new(id: u64, priority: i32, handler: impl FnOnce() -> TaskFuture + Send + 'static) -> Self {
        Self {
            id,
            priority,
            handler: Box::new(handler),
        }
    }
}

pub struct WorkerPool {
    tx: mpsc::Sender<Task>,
    queue_capacity: usize,
    worker_count: usize,
    backpressure: Arc<BackpressureController>,
    telemetry: Arc<PipelineTelemetry>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    next_task_id: AtomicU64,
}

impl WorkerPool {
    /// Spawns `2 * num_cpus` workers sharing a queue sized `4 * worker_count`.
    pub fn start() -> Self {
        let worker_count = 2 * num_cpus::get();
        let queue_capacity = 4 * worker_count;
        let (tx, rx) = mpsc::channel(queue_capacity);
        let rx = Arc::new(AsyncMutex::new(rx));
        let backpressure = Arc::new(BackpressureController::new(queue_capacity));
        let telemetry = Arc::new(PipelineTelemetry::new(worker_count));
        let cancel = CancellationToken::new();

        let workers = (0..worker_count)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let telemetry = Arc::clone(&telemetry);
                let cancel = cancel.clone();
                tokio::spawn(worker_loop(worker_id, rx, telemetry, cancel))
            })
            .collect();

        Self {
            tx,
            queue_capacity,
            worker_count,
            backpressure,
            telemetry,
            cancel,
            workers,
            next_task_id: AtomicU64::new(1),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn backpressure(&self) -> Arc<BackpressureController> {
        Arc::clone(&self.backpressure)
    }

    pub fn telemetry(&self) -> Arc<PipelineTelemetry> {
        Arc::clone(&self.telemetry)
    }

    pub fn next_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    fn sample_depth(&self) -> PressureLevel {
        let depth = self.queue_capacity.saturating_sub(self.tx.capacity());
        self.backpressure.sample(depth)
    }

    /// Non-blocking submission; returns `false` (without enqueuing) if the
    /// queue is full. Updates the backpressure level either way.
    pub fn submit(&self, task: Task) -> bool {
        let accepted = self.tx.try_send(task).is_ok();
        self.sample_depth();
        accepted
    }

    /// Blocks until there is room in the queue or the pool has shut down.
    pub async fn submit_blocking(&self, task: Task) -> Result<(), RelayError> {
        self.tx.send(task).await.map_err(|_| RelayError::NoConnection)?;
        self.sample_depth();
        Ok(())
    }

    pub fn pressure(&self) -> PressureLevel {
        self.backpressure.current()
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        drop(self.tx);
        for handle in self.workers.drain(..) {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<AsyncMutex<mpsc::Receiver<Task>>>,
    telemetry: Arc<PipelineTelemetry>,
    cancel: CancellationToken,
) {
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            task = async {
                let mut guard = rx.lock().await;
                guard.recv().await
            } => task,
        };

        let Some(task) = task else { break };
        let started = Instant::now();

        // Each task body runs in its own spawned task so a panic inside the
        // handler is caught as a `JoinError` here instead of killing this
        // worker loop.
        let handle = tokio::spawn((task.handler)());
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(worker_id, task_id = task.id, error = %e, "task handler returned an error"),
            Err(join_err) => warn!(worker_id, task_id = task.id, panicked = join_err.is_panic(), "task handler failed"),
        }

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        telemetry.record(worker_id, latency_ms, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn submitted_task_runs_and_reports_success() {
        let pool = WorkerPool::start();
        let (done_tx, done_rx) = oneshot::channel();
        let id = pool.next_id();
        let task = Task::new(id, 0, move || {
            Box::pin(async move {
                let _ = done_tx.send(());
                Ok(())
            })
        });
        assert!(pool.submit(task));
        done_rx.await.unwrap();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_the_worker() {
        let pool = WorkerPool::start();
        let id = pool.next_id();
        let panicking = Task::new(id, 0, || Box::pin(async move { panic!("boom") }));
        assert!(pool.submit(panicking));

        let (done_tx, done_rx) = oneshot::channel();
        let id2 = pool.next_id();
        let follow_up = Task::new(id2, 0, move || {
            Box::pin(async move {
                let _ = done_tx.send(());
                Ok(())
            })
        });
        assert!(pool.submit(follow_up));
        done_rx.await.unwrap();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn worker_count_is_twice_cpu_count() {
        let pool = WorkerPool::start();
        assert_eq!(pool.worker_count(), 2 * num_cpus::get());
        pool.shutdown().await;
    }
}
