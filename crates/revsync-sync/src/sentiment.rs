use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use revsync_adapters::SentimentAnalyzer;
use revsync_core::{CellValue, ColumnDef, ColumnType, SentimentRow, TableRef, KEY_COLUMN};
use tracing::{info, warn};

use crate::pipeline::{run_incremental, Extractor};
use crate::report::{StepStatus, SyncReport, SyncStep};
use crate::request::{parse_payload, require_str, Payload};
use crate::{ConfigError, TaskContext, TaskError};

pub const TASK: &str = "sentiment_sync";

const TEXT_COLUMN: &str = "review";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentimentSyncRequest {
    pub reviews: TableRef,
    pub target: TableRef,
}

impl SentimentSyncRequest {
    pub fn from_payload(payload: &Payload) -> Result<Self, TaskError> {
        let project = require_str(payload, "project_id")?;
        let dataset = require_str(payload, "dataset_id")?;
        let reviews = require_str(payload, "reviews_table_id")?;
        let sentiment = require_str(payload, "sentiment_table_id")?;
        Ok(Self {
            reviews: TableRef::new(project, dataset, reviews).map_err(ConfigError::from)?,
            target: TableRef::new(project, dataset, sentiment).map_err(ConfigError::from)?,
        })
    }

    pub fn from_body(body: &[u8]) -> Result<Self, TaskError> {
        Self::from_payload(&parse_payload(body)?)
    }
}

/// Score each `(id, text)` pair, at most `concurrency` calls in flight.
/// Output keeps input order; failed calls are logged and left out.
pub async fn annotate(
    analyzer: &dyn SentimentAnalyzer,
    pending: Vec<(String, String)>,
    concurrency: usize,
) -> (Vec<SentimentRow>, usize) {
    let results = stream::iter(pending)
        .map(|(id, text)| async move {
            let result = analyzer.analyze(&text).await;
            (id, result)
        })
        .buffered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut rows = Vec::with_capacity(results.len());
    let mut failed = 0;
    for (id, result) in results {
        match result {
            Ok(sentiment) => rows.push(SentimentRow {
                id,
                sentiment_score: sentiment.score,
                sentiment_magnitude: sentiment.magnitude,
            }),
            Err(err) => {
                warn!(id = %id, error = %err, "sentiment annotation failed, skipping row");
                failed += 1;
            }
        }
    }
    (rows, failed)
}

/// Reviews without a sentiment row yet, annotated one call per review.
pub struct SentimentExtractor {
    pub request: SentimentSyncRequest,
    pub concurrency: usize,
}

impl SentimentExtractor {
    fn pending_columns() -> [ColumnDef; 2] {
        [
            ColumnDef::new(KEY_COLUMN, ColumnType::Text),
            ColumnDef::new(TEXT_COLUMN, ColumnType::Text),
        ]
    }
}

#[async_trait]
impl Extractor for SentimentExtractor {
    type Row = SentimentRow;

    fn task(&self) -> &'static str {
        TASK
    }

    fn target(&self) -> &TableRef {
        &self.request.target
    }

    async fn extract(&self, ctx: &TaskContext, report: &mut SyncReport) -> Vec<SentimentRow> {
        let pending = match ctx
            .warehouse
            .anti_join(
                &self.request.reviews,
                &self.request.target,
                KEY_COLUMN,
                &Self::pending_columns(),
            )
            .await
        {
            Ok(rows) => {
                report.record_ok(SyncStep::SelectPending);
                rows
            }
            Err(err) => {
                warn!(reviews = %self.request.reviews, error = %err, "could not select unannotated reviews");
                report.record_failed(SyncStep::SelectPending, err);
                return Vec::new();
            }
        };
        report.records_fetched = pending.len();

        let mut skipped = 0;
        let mut work = Vec::with_capacity(pending.len());
        for row in pending {
            match (row.first(), row.get(1)) {
                (Some(CellValue::Text(id)), Some(CellValue::Text(text))) if !text.trim().is_empty() => {
                    work.push((id.clone(), text.clone()))
                }
                (id, _) => {
                    warn!(id = ?id, "review has no id or text, skipping annotation");
                    skipped += 1;
                }
            }
        }
        info!(pending = work.len(), skipped, "annotating reviews");

        if work.is_empty() {
            report.rows_skipped = skipped;
            report.record(SyncStep::Annotate, StepStatus::Skipped);
            return Vec::new();
        }

        let attempted = work.len();
        let (rows, failed) = annotate(ctx.sentiment.as_ref(), work, self.concurrency).await;
        report.rows_skipped = skipped + failed;
        if failed == attempted {
            report.record_failed(SyncStep::Annotate, format!("all {attempted} annotation calls failed"));
        } else {
            report.record_ok(SyncStep::Annotate);
        }
        rows
    }
}

/// Annotate every review missing from the sentiment table. Only missing
/// credentials abort the run.
pub async fn run_sentiment_sync(
    ctx: &TaskContext,
    request: SentimentSyncRequest,
) -> Result<SyncReport, TaskError> {
    ctx.sentiment.authorize().await.map_err(TaskError::Credentials)?;
    let extractor = SentimentExtractor {
        request,
        concurrency: ctx.config.annotation_concurrency,
    };
    Ok(run_incremental(ctx, &extractor).await)
}
