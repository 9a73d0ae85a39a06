//! Fixed-size pool of workers draining the task queue.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::queue::TaskQueue;

/// Upper bound on how long an idle worker sleeps before polling again.
pub const IDLE_POLL: Duration = Duration::from_millis(100);

pub struct WorkerPool {
    queue: TaskQueue,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(queue: TaskQueue, concurrency: usize) -> Self {
        Self {
            queue,
            concurrency: concurrency.max(1),
        }
    }

    /// Number of logical cores, or 1 if that cannot be determined.
    pub fn default_concurrency() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run the workers. Never returns under normal operation.
    pub async fn run(self) {
        info!(workers = self.concurrency, "Worker pool started");

        let mut workers = JoinSet::new();
        for id in 0..self.concurrency {
            workers.spawn(worker_loop(id, self.queue.clone()));
        }

        while let Some(exited) = workers.join_next().await {
            error!(?exited, "Worker exited unexpectedly");
        }
    }
}

async fn worker_loop(id: usize, queue: TaskQueue) {
    loop {
        match queue.pop_if_ready() {
            Some(task) => {
                debug!(worker = id, ready_at = %task.ready_at, "Running task");
                // Run on its own task so a panicking check cannot take the
                // worker down with it.
                if let Err(e) = tokio::spawn(task.run()).await {
                    error!(worker = id, error = %e, "Task panicked");
                }
            }
            None => {
                let wait = queue
                    .next_ready_at()
                    .and_then(|at| (at - Utc::now()).to_std().ok())
                    .map_or(IDLE_POLL, |until| until.min(IDLE_POLL));

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = queue.enqueued() => {}
                }
            }
        }
    }
}
