//! Patrol -- container-backed health checks with history and notifications.
//!
//! This crate provides the check scheduler, the per-check state machine,
//! the SQLite history store, the docker runtime adapter and notification
//! dispatch.

pub mod checker;
pub mod config;
pub mod container;
pub mod events;
pub mod notify;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::checker::state::{self, CheckState, Overall};
use crate::checker::CheckExecutor;
use crate::config::{PatrolConfig, ServiceCheck};
use crate::container::DockerCli;
use crate::scheduler::{TaskQueue, WorkerPool};
use crate::storage::{HistoryStore, SqliteHistory};

/// Open the configured history database, creating its directory if needed.
pub fn open_history(config: &PatrolConfig) -> Result<SqliteHistory> {
    let db_path = config.db_path();
    if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create database directory {}", dir.display()))?;
    }
    tracing::info!(db = %db_path.display(), "Initializing history store");
    let pool = storage::open_pool(&db_path.to_string_lossy())?;
    Ok(SqliteHistory::new(pool))
}

/// Start the patrol engine: seed the schedule and run workers until Ctrl-C.
pub async fn serve(config: &PatrolConfig, concurrency: Option<usize>) -> Result<()> {
    // 1. Resolve checks
    let checks = config.checks()?;

    // 2. Initialize storage
    let history = Arc::new(open_history(config)?);

    // 3. Container runtime
    let runtime = DockerCli::default();
    if !runtime.is_available().await {
        tracing::warn!("Docker daemon is not reachable; checks will fail until it is");
    }

    // 4. Seed the schedule
    let queue = TaskQueue::new();
    let executor = Arc::new(CheckExecutor::new(queue.clone(), history, Arc::new(runtime)));
    scheduler::start_schedule(&executor, &checks).await;

    // 5. Run workers
    let workers = concurrency
        .or(config.concurrency)
        .unwrap_or_else(WorkerPool::default_concurrency);
    tokio::select! {
        _ = scheduler::run_worker_pool(queue, workers) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}

/// Latest known state of one check.
#[derive(Debug, Clone)]
pub struct CheckStatus {
    pub check: Arc<ServiceCheck>,
    pub state: CheckState,
}

/// Current state of every check plus the aggregate.
pub async fn current_status(
    history: &dyn HistoryStore,
    checks: &[Arc<ServiceCheck>],
) -> Result<(Overall, Vec<CheckStatus>)> {
    let mut statuses = Vec::with_capacity(checks.len());
    for check in checks {
        let latest = history.find_latest(&check.key(), None).await?;
        statuses.push(CheckStatus {
            check: Arc::clone(check),
            state: CheckState::from(latest),
        });
    }
    let overall = state::aggregate(statuses.iter().map(|s| &s.state));
    Ok((overall, statuses))
}
