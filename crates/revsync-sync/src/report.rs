use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStep {
    EnsureTarget,
    Watermark,
    SelectPending,
    Fetch,
    Annotate,
    Stage,
    Merge,
    DropStaging,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Skipped,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: SyncStep,
    #[serde(flatten)]
    pub status: StepStatus,
}

/// Outcome of one sync run. Returned to the trigger with HTTP 200 even when
/// `degraded` is set.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub task: &'static str,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub watermark: Option<NaiveDate>,
    pub pages_fetched: u32,
    pub records_fetched: usize,
    pub rows_staged: u64,
    pub rows_skipped: usize,
    pub rows_merged: u64,
    pub degraded: bool,
    pub steps: Vec<StepReport>,
}

impl SyncReport {
    pub fn new(run_id: Uuid, task: &'static str, target: impl Into<String>) -> Self {
        Self {
            run_id,
            task,
            target: target.into(),
            started_at: Utc::now(),
            finished_at: None,
            watermark: None,
            pages_fetched: 0,
            records_fetched: 0,
            rows_staged: 0,
            rows_skipped: 0,
            rows_merged: 0,
            degraded: false,
            steps: Vec::new(),
        }
    }

    pub fn record(&mut self, step: SyncStep, status: StepStatus) {
        if matches!(status, StepStatus::Failed { .. }) {
            self.degraded = true;
        }
        self.steps.push(StepReport { step, status });
    }

    pub fn record_ok(&mut self, step: SyncStep) {
        self.record(step, StepStatus::Ok);
    }

    pub fn record_failed(&mut self, step: SyncStep, error: impl ToString) {
        self.record(
            step,
            StepStatus::Failed {
                error: error.to_string(),
            },
        );
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn step(&self, step: SyncStep) -> Option<&StepStatus> {
        self.steps.iter().find(|s| s.step == step).map(|s| &s.status)
    }
}
