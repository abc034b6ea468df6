use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use revsync_adapters::normalize_reviews;
use revsync_core::{ColumnDef, ColumnType, ReviewRow, TableRef};
use tracing::warn;

use crate::fetch::fetch_all;
use crate::pipeline::{run_incremental, Extractor};
use crate::report::{StepStatus, SyncReport, SyncStep};
use crate::request::{parse_payload, products_param, require_str, Payload};
use crate::watermark::{resolve_watermark, Watermark};
use crate::{TaskContext, TaskError};

pub const TASK: &str = "review_sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewSyncRequest {
    pub target: TableRef,
    /// Product ids joined with `;`.
    pub products: String,
}

impl ReviewSyncRequest {
    pub fn from_payload(payload: &Payload) -> Result<Self, TaskError> {
        let target = TableRef::new(
            require_str(payload, "project_id")?,
            require_str(payload, "dataset_id")?,
            require_str(payload, "reviews_table_id")?,
        )
        .map_err(crate::ConfigError::from)?;
        Ok(Self {
            target,
            products: products_param(payload)?,
        })
    }

    pub fn from_body(body: &[u8]) -> Result<Self, TaskError> {
        Self::from_payload(&parse_payload(body)?)
    }
}

/// Watermark, paginated fetch and normalization for the reviews table.
pub struct ReviewExtractor {
    pub request: ReviewSyncRequest,
    pub today: NaiveDate,
}

#[async_trait]
impl Extractor for ReviewExtractor {
    type Row = ReviewRow;

    fn task(&self) -> &'static str {
        TASK
    }

    fn target(&self) -> &TableRef {
        &self.request.target
    }

    async fn extract(&self, ctx: &TaskContext, report: &mut SyncReport) -> Vec<ReviewRow> {
        let date_column = ColumnDef::new("date", ColumnType::Timestamp);
        let watermark =
            resolve_watermark(ctx.warehouse.as_ref(), &self.request.target, &date_column, self.today).await;
        match &watermark {
            Watermark::Fallback { error, .. } => report.record_failed(SyncStep::Watermark, error),
            _ => report.record_ok(SyncStep::Watermark),
        }
        report.watermark = watermark.start();

        let outcome = fetch_all(ctx.review_api.as_ref(), &self.request.products, watermark.start()).await;
        report.pages_fetched = outcome.pages;
        report.records_fetched = outcome.records.len();
        if outcome.stop.is_failure() {
            warn!(stop = ?outcome.stop, records = outcome.records.len(), "fetch ended early");
            report.record(
                SyncStep::Fetch,
                StepStatus::Failed {
                    error: format!("{:?}", outcome.stop),
                },
            );
        } else {
            report.record_ok(SyncStep::Fetch);
        }

        normalize_reviews(&outcome.records)
    }
}

/// Incremental review sync. Only missing credentials abort the run; every
/// other failure is tolerated and reported.
pub async fn run_review_sync(ctx: &TaskContext, request: ReviewSyncRequest) -> Result<SyncReport, TaskError> {
    ctx.review_api
        .authorize()
        .await
        .map_err(TaskError::Credentials)?;
    let extractor = ReviewExtractor {
        request,
        today: Utc::now().date_naive(),
    };
    Ok(run_incremental(ctx, &extractor).await)
}
