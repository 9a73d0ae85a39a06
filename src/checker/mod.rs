//! Check executor: runs one check in a container, records the outcome and
//! schedules the next run.
//!
//! Every run of a check ends by enqueuing the following run, whatever
//! happened in between. Because a check's next task only exists once its
//! current run finishes, two runs of the same check never overlap.

pub mod output;
pub mod state;

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{CheckType, ServiceCheck};
use crate::container::{container_name, image_ref, ContainerRuntime, ContainerSpec, RuntimeError};
use crate::events::{HistoryEvents, HistoryUpdate};
use crate::notify::{Dispatcher, NotificationContext};
use crate::scheduler::{Clock, SystemClock, TaskQueue};
use crate::storage::{day_bucket, CheckKey, HistoryStore, SortOrder, Status};

use self::state::{CheckState, RunResult, Verdict, WriteAction};

#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("metric output is not a number: {output:?}")]
    MetricParse { output: String },

    #[error("history store failed: {0:#}")]
    Store(anyhow::Error),
}

/// What one completed run did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub verdict: Verdict,
    /// Status of the row written or refreshed.
    pub status: Status,
    pub inserted: bool,
    pub pruned: usize,
    pub duration_ms: u64,
}

pub struct CheckExecutor {
    queue: TaskQueue,
    history: Arc<dyn HistoryStore>,
    runtime: Arc<dyn ContainerRuntime>,
    dispatcher: Dispatcher,
    events: HistoryEvents,
    clock: Arc<dyn Clock>,
}

impl CheckExecutor {
    pub fn new(queue: TaskQueue, history: Arc<dyn HistoryStore>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            queue,
            history,
            runtime,
            dispatcher: Dispatcher::default(),
            events: HistoryEvents::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_events(mut self, events: HistoryEvents) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn events(&self) -> &HistoryEvents {
        &self.events
    }

    /// Enqueue the first run of `check` according to its last known result.
    pub async fn schedule_initial(self: &Arc<Self>, check: Arc<ServiceCheck>) {
        let state = match self.history.find_latest(&check.key(), None).await {
            Ok(latest) => CheckState::from(latest),
            Err(e) => {
                warn!(
                    service = %check.service,
                    check = %check.name,
                    error = %e,
                    "Could not read last result, checking immediately"
                );
                CheckState::NoHistory
            }
        };

        let now = self.clock.now();
        let first_run = state.first_run_at(check.interval, now);
        if first_run > now {
            info!(
                service = %check.service,
                check = %check.name,
                in_secs = (first_run - now).num_seconds(),
                "Last result is fresh, deferring first run"
            );
        } else {
            info!(service = %check.service, check = %check.name, state = state.label(), "Scheduling check now");
        }
        self.schedule_at(check, first_run);
    }

    fn schedule_at(self: &Arc<Self>, check: Arc<ServiceCheck>, ready_at: chrono::DateTime<chrono::Utc>) {
        let executor = Arc::clone(self);
        self.queue.enqueue_at(ready_at, move || executor.run(check));
    }

    /// Perform one run of `check`. Never fails: errors are logged and the
    /// next run is enqueued regardless.
    pub async fn run(self: Arc<Self>, check: Arc<ServiceCheck>) {
        let _next = Reschedule {
            executor: Arc::clone(&self),
            check: Arc::clone(&check),
        };

        debug!(service = %check.service, check = %check.name, "Running check");
        match self.run_once(&check).await {
            Ok(report) => info!(
                service = %check.service,
                check = %check.name,
                verdict = %report.verdict,
                status = %report.status,
                duration_ms = report.duration_ms,
                pruned = report.pruned,
                "Check completed"
            ),
            Err(e) => error!(
                service = %check.service,
                check = %check.name,
                error = %e,
                "Check run failed"
            ),
        }
    }

    async fn run_once(&self, check: &ServiceCheck) -> Result<RunReport, CheckError> {
        let name = container_name(&check.service, &check.name);
        if self.runtime.remove_container_if_exists(&name).await? {
            info!(container = %name, "Removed leftover container");
        }

        self.ensure_image(&check.image).await?;

        let spec = ContainerSpec::shell(&name, &check.image, &check.command).with_timeout(check.timeout);
        let started = Instant::now();
        let id = self.runtime.create_container(&spec).await?;
        let running = self.runtime.start(&id, &spec).await?;
        let exit = running.wait().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let verdict = if exit.succeeded() {
            Verdict::Healthy
        } else {
            Verdict::Unhealthy
        };
        let metric = match (check.check_type, verdict) {
            (CheckType::Metric, Verdict::Healthy) => Some(parse_metric(&exit.stdout)?),
            _ => None,
        };

        let created_at = self.clock.now();
        let key = check.key();
        let latest = CheckState::from(self.history.find_latest(&key, None).await.map_err(CheckError::Store)?);
        let today = match check.check_type {
            CheckType::Boolean => self
                .history
                .find_latest(&key, Some(day_bucket(created_at)))
                .await
                .map_err(CheckError::Store)?,
            CheckType::Metric => None,
        };

        let result = RunResult {
            verdict,
            output: output::combine(&exit.stdout, &exit.stderr),
            error: exit.failure(),
            metric,
            created_at,
            duration_ms,
        };
        let action = state::plan_write(check, result, today.as_ref(), &latest);
        let pruned = self.prune(check, &key, action.inserts()).await?;

        let status = action.status();
        let inserted = action.inserts();
        let output = match action {
            WriteAction::Insert(record) => {
                self.history.insert(&record).await.map_err(CheckError::Store)?;
                record.output
            }
            WriteAction::Touch { id, created_at, .. } => {
                self.history
                    .update_in_place(id, created_at)
                    .await
                    .map_err(CheckError::Store)?;
                output::combine(&exit.stdout, &exit.stderr)
            }
        };

        self.events.emit(HistoryUpdate {
            service: check.service.clone(),
            check_name: check.name.clone(),
        });
        self.notify(check, verdict, status, output);

        Ok(RunReport {
            verdict,
            status,
            inserted,
            pruned,
            duration_ms,
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        let wanted = image_ref(image);
        let local = self.runtime.list_images().await?;
        if local.iter().any(|i| image_ref(i) == wanted) {
            return Ok(());
        }
        info!(%image, "Pulling image");
        self.runtime.pull_image(image).await
    }

    /// Delete the oldest records so that, after this run's write, the check
    /// holds at most `history_size` of them.
    async fn prune(&self, check: &ServiceCheck, key: &CheckKey, inserting: bool) -> Result<usize, CheckError> {
        let keep = if inserting {
            check.history_size.saturating_sub(1)
        } else {
            check.history_size
        };

        let count = self.history.count(key).await.map_err(CheckError::Store)?;
        if count <= keep {
            return Ok(0);
        }

        let oldest = self
            .history
            .find_range(key, SortOrder::Ascending, count - keep)
            .await
            .map_err(CheckError::Store)?;
        let ids: Vec<Uuid> = oldest.iter().map(|r| r.id).collect();
        let deleted = self.history.delete_many(&ids).await.map_err(CheckError::Store)?;
        debug!(%key, deleted, keep, "Pruned history");
        Ok(deleted)
    }

    fn notify(&self, check: &ServiceCheck, verdict: Verdict, status: Status, output: String) {
        let hooks = &check.notifications;
        if hooks.is_empty() {
            return;
        }

        let ctx = NotificationContext {
            service: check.service.clone(),
            check_name: check.name.clone(),
            status,
            output,
        };
        match verdict {
            Verdict::Unhealthy => self.dispatcher.dispatch(&hooks.on_failure, &ctx),
            Verdict::Healthy => {
                self.dispatcher.dispatch(&hooks.on_success, &ctx);
                if status == Status::WasUnhealthy {
                    self.dispatcher.dispatch(&hooks.on_recovered, &ctx);
                }
            }
        }
    }
}

/// Enqueues the next run of a check when dropped, so it fires on every exit
/// path of a run, including panics.
struct Reschedule {
    executor: Arc<CheckExecutor>,
    check: Arc<ServiceCheck>,
}

impl Drop for Reschedule {
    fn drop(&mut self) {
        let next = state::after(self.executor.clock.now(), self.check.interval);
        debug!(service = %self.check.service, check = %self.check.name, %next, "Rescheduling check");
        self.executor.schedule_at(Arc::clone(&self.check), next);
    }
}

/// Parse a metric sample from a check's stdout.
pub fn parse_metric(stdout: &[u8]) -> Result<f64, CheckError> {
    let text = output::sanitize(stdout);
    let trimmed = text.trim();
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(CheckError::MetricParse {
            output: trimmed.chars().take(200).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metric() {
        assert_eq!(parse_metric(b"42\n").unwrap(), 42.0);
        assert_eq!(parse_metric(b"  0.125 \r\n").unwrap(), 0.125);
        assert_eq!(parse_metric(b"-3e2").unwrap(), -300.0);
        assert!(matches!(parse_metric(b"fast"), Err(CheckError::MetricParse { .. })));
        assert!(parse_metric(b"").is_err());
        assert!(parse_metric(b"12 ms").is_err());
        assert!(parse_metric(b"NaN").is_err());
        assert!(parse_metric(b"inf").is_err());
    }

    #[test]
    fn test_store_error_keeps_context() {
        let err = CheckError::Store(anyhow::anyhow!("disk full").context("insert failed"));
        assert_eq!(err.to_string(), "history store failed: insert failed: disk full");
    }
}
