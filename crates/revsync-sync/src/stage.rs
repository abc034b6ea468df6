use revsync_core::{CellValue, ColumnDef, ColumnType, StagedRow, TableRef, TableSchema, INGEST_SEQ_COLUMN};
use revsync_storage::{MergeSpec, Warehouse, WarehouseError};
use tracing::info;

/// Row schema plus the ingest ordinal used to resolve duplicate keys.
pub fn staging_schema<R: StagedRow>() -> TableSchema {
    R::schema().with_column(ColumnDef::new(INGEST_SEQ_COLUMN, ColumnType::Int64))
}

/// Replace the staging table with `rows`. An empty batch still leaves an
/// empty table behind.
pub async fn write_staging<R: StagedRow>(
    warehouse: &dyn Warehouse,
    rows: Vec<R>,
    staging: &TableRef,
) -> Result<u64, WarehouseError> {
    let cells = rows
        .into_iter()
        .enumerate()
        .map(|(seq, row)| {
            let mut cells = row.into_cells();
            cells.push(CellValue::Int(seq as i64));
            cells
        })
        .collect::<Vec<_>>();
    let written = warehouse
        .overwrite_table(staging, &staging_schema::<R>(), cells)
        .await?;
    info!(staging = %staging, rows = written, "staging table replaced");
    Ok(written)
}

/// Upsert staging into target on `id`, updating every other row column.
pub async fn merge_staging<R: StagedRow>(
    warehouse: &dyn Warehouse,
    staging: &TableRef,
    target: &TableRef,
) -> Result<u64, WarehouseError> {
    let merged = warehouse.merge(&MergeSpec::for_rows::<R>(staging, target)).await?;
    info!(table = %target, rows = merged, "merge completed");
    Ok(merged)
}
