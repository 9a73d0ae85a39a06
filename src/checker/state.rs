//! Per-check state machine.
//!
//! The state of a check is its most recent history record, or nothing at
//! all before the first run:
//!
//! ```text
//! (no history) -> healthy | unhealthy
//! healthy       -> healthy | unhealthy
//! unhealthy     -> was-unhealthy | unhealthy
//! was-unhealthy -> healthy | unhealthy
//! ```
//!
//! [`plan_write`] turns one run's verdict into the history write that
//! records the transition.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use super::output;
use crate::config::{CheckType, ServiceCheck};
use crate::storage::{day_bucket, CheckRecord, Status};

/// Immediate pass/fail outcome of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Unhealthy,
}

impl Verdict {
    pub fn status(self) -> Status {
        match self {
            Verdict::Healthy => Status::Healthy,
            Verdict::Unhealthy => Status::Unhealthy,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.status().as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckState {
    NoHistory,
    Record(CheckRecord),
}

impl From<Option<CheckRecord>> for CheckState {
    fn from(record: Option<CheckRecord>) -> Self {
        record.map_or(CheckState::NoHistory, CheckState::Record)
    }
}

impl CheckState {
    pub fn status(&self) -> Option<Status> {
        match self {
            CheckState::NoHistory => None,
            CheckState::Record(record) => Some(record.status),
        }
    }

    pub fn label(&self) -> &'static str {
        self.status().map_or("inprogress", |s| s.as_str())
    }

    /// When the first run after startup should happen. A fresh healthy
    /// result waits out its interval; everything else runs right away.
    pub fn first_run_at(&self, interval: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            CheckState::Record(record) if record.status.is_healthy() => {
                let due = after(record.created_at, interval);
                if now < due {
                    due
                } else {
                    now
                }
            }
            _ => now,
        }
    }
}

/// `at + interval`, saturating at the largest representable time so that
/// an oversized interval parks the check instead of panicking.
pub fn after(at: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    at.checked_add_signed(interval).unwrap_or_else(|| {
        warn!(%at, interval_secs = interval.num_seconds(), "Next run time overflows, parking check");
        DateTime::<Utc>::MAX_UTC
    })
}

/// Everything one run observed.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub verdict: Verdict,
    pub output: String,
    pub error: Option<String>,
    pub metric: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// The history write for one run.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteAction {
    Insert(CheckRecord),
    /// Same verdict as earlier today: only refresh the timestamp.
    Touch {
        id: Uuid,
        created_at: DateTime<Utc>,
        status: Status,
    },
}

impl WriteAction {
    pub fn inserts(&self) -> bool {
        matches!(self, WriteAction::Insert(_))
    }

    pub fn status(&self) -> Status {
        match self {
            WriteAction::Insert(record) => record.status,
            WriteAction::Touch { status, .. } => *status,
        }
    }
}

/// Decide how to persist a run.
///
/// `today` is the latest record in the run's day bucket, `latest` the latest
/// record overall. Metric checks always insert. Boolean checks coalesce a
/// repeated verdict within a day into one row; a healthy verdict right after
/// an unhealthy record is stored as `was-unhealthy` and keeps the failure's
/// output in front of its own.
pub fn plan_write(
    check: &ServiceCheck,
    run: RunResult,
    today: Option<&CheckRecord>,
    latest: &CheckState,
) -> WriteAction {
    let verdict_status = run.verdict.status();

    if check.check_type == CheckType::Boolean {
        if let Some(prior) = today.filter(|p| p.status == verdict_status) {
            return WriteAction::Touch {
                id: prior.id,
                created_at: run.created_at,
                status: prior.status,
            };
        }
    }

    let (status, output) = match (check.check_type, run.verdict, latest) {
        (CheckType::Boolean, Verdict::Healthy, CheckState::Record(prior))
            if prior.status == Status::Unhealthy =>
        {
            (Status::WasUnhealthy, output::join_recovery(&prior.output, &run.output))
        }
        _ => (verdict_status, run.output),
    };

    WriteAction::Insert(CheckRecord {
        id: Uuid::new_v4(),
        service: check.service.clone(),
        check_name: check.name.clone(),
        created_at: run.created_at,
        day_bucket: day_bucket(run.created_at),
        duration_ms: run.duration_ms,
        check_type: check.check_type,
        output,
        metric: run.metric,
        metric_unit: check.metric_unit.clone(),
        status,
        error: run.error,
    })
}

/// Overall health across all checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Overall {
    Healthy,
    /// At least one check is currently unhealthy.
    Degraded,
    /// Nothing is failing but some checks have not reported yet.
    InProgress,
}

impl std::fmt::Display for Overall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Overall::Healthy => "healthy",
            Overall::Degraded => "degraded",
            Overall::InProgress => "inprogress",
        })
    }
}

pub fn aggregate<'a>(states: impl IntoIterator<Item = &'a CheckState>) -> Overall {
    let mut pending = false;
    for state in states {
        match state.status() {
            Some(Status::Unhealthy) => return Overall::Degraded,
            None => pending = true,
            Some(_) => {}
        }
    }
    if pending {
        Overall::InProgress
    } else {
        Overall::Healthy
    }
}
