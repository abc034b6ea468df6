//! The incremental sync skeleton shared by the review and sentiment tasks:
//! lease, bootstrap target, extract, stage, merge.

use async_trait::async_trait;
use revsync_core::{StagedRow, StagingMode, TableRef};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::report::{SyncReport, SyncStep};
use crate::stage::{merge_staging, write_staging};
use crate::TaskContext;

/// Produces the rows one run stages. Extraction never fails outright; step
/// failures are recorded on the report and yield whatever rows were gathered.
#[async_trait]
pub trait Extractor: Send + Sync {
    type Row: StagedRow;

    fn task(&self) -> &'static str;

    fn target(&self) -> &TableRef;

    async fn extract(&self, ctx: &TaskContext, report: &mut SyncReport) -> Vec<Self::Row>;
}

fn staging_mode(ctx: &TaskContext, run_id: Uuid) -> StagingMode {
    if ctx.config.unique_staging {
        StagingMode::PerRun {
            suffix: run_id.simple().to_string(),
        }
    } else {
        StagingMode::Shared
    }
}

pub async fn run_incremental<E: Extractor>(ctx: &TaskContext, extractor: &E) -> SyncReport {
    let run_id = Uuid::new_v4();
    let target = extractor.target().clone();
    let span = info_span!("sync_run", task = extractor.task(), table = %target, %run_id);

    async move {
        let _lease = ctx.locks.acquire(&target).await;
        let warehouse = ctx.warehouse.as_ref();
        let mut report = SyncReport::new(run_id, extractor.task(), target.to_string());

        match warehouse.ensure_table(&target, &E::Row::schema()).await {
            Ok(()) => report.record_ok(SyncStep::EnsureTarget),
            Err(err) => {
                warn!(error = %err, "could not ensure target table exists");
                report.record_failed(SyncStep::EnsureTarget, err);
            }
        }

        let rows = extractor.extract(ctx, &mut report).await;

        let mode = staging_mode(ctx, run_id);
        let staging = target.staging(&mode);
        match write_staging(warehouse, rows, &staging).await {
            Ok(written) => {
                report.rows_staged = written;
                report.record_ok(SyncStep::Stage);
            }
            Err(err) => {
                warn!(staging = %staging, error = %err, "staging write failed");
                report.record_failed(SyncStep::Stage, err);
            }
        }

        match merge_staging::<E::Row>(warehouse, &staging, &target).await {
            Ok(merged) => {
                report.rows_merged = merged;
                report.record_ok(SyncStep::Merge);
            }
            Err(err) => {
                warn!(staging = %staging, error = %err, "merge failed");
                report.record_failed(SyncStep::Merge, err);
            }
        }

        if matches!(mode, StagingMode::PerRun { .. }) {
            match warehouse.drop_table(&staging).await {
                Ok(()) => report.record_ok(SyncStep::DropStaging),
                Err(err) => {
                    warn!(staging = %staging, error = %err, "could not drop run staging table");
                    report.record_failed(SyncStep::DropStaging, err);
                }
            }
        }

        let report = report.finish();
        info!(
            staged = report.rows_staged,
            merged = report.rows_merged,
            skipped = report.rows_skipped,
            degraded = report.degraded,
            "sync run finished"
        );
        report
    }
    .instrument(span)
    .await
}
