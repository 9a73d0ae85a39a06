//! Self-perpetuating check scheduler: a readiness-ordered queue drained by a
//! fixed pool of workers.

pub mod clock;
pub mod pool;
pub mod queue;

use std::sync::Arc;

use crate::checker::CheckExecutor;
use crate::config::ServiceCheck;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::pool::WorkerPool;
pub use self::queue::{Task, TaskQueue};

/// Seed the queue with the first run of every configured check.
pub async fn start_schedule(executor: &Arc<CheckExecutor>, checks: &[Arc<ServiceCheck>]) {
    tracing::info!(checks = checks.len(), "Seeding schedule");
    for check in checks {
        executor.schedule_initial(Arc::clone(check)).await;
    }
}

/// Run `concurrency` workers against `queue` forever.
pub async fn run_worker_pool(queue: TaskQueue, concurrency: usize) {
    WorkerPool::new(queue, concurrency).run().await
}
