//! Warehouse access for revsync: the capability trait every task talks to,
//! SQL rendering per dialect, and the Postgres and in-memory backends.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use revsync_core::{
    CellValue, ColumnDef, StagedRow, TableRef, TableSchema, INGEST_SEQ_COLUMN, KEY_COLUMN,
};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

mod memory;
mod postgres;
pub mod sql;

pub use memory::{MemoryTable, MemoryWarehouse, WarehouseOp};
pub use postgres::PgWarehouse;
pub use sql::Dialect;

pub const CRATE_NAME: &str = "revsync-storage";

/// One row of cells, aligned with the schema it was read or written with.
pub type Row = Vec<CellValue>;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("table {0} not found")]
    TableNotFound(String),
    #[error("schema mismatch: {0}")]
    Schema(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("warehouse rejected {0}")]
    Rejected(String),
}

/// Upsert from a staging table into a target table keyed by one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSpec {
    pub target: TableRef,
    pub source: TableRef,
    pub key: String,
    /// Target columns, key included, in insert order.
    pub columns: Vec<String>,
    /// When set, duplicate keys in the source collapse to the row with the
    /// highest value of this column.
    pub order_column: Option<String>,
}

impl MergeSpec {
    /// Merge spec for a staged row type, keyed by `id` and ordered by ingest sequence.
    pub fn for_rows<R: StagedRow>(staging: &TableRef, target: &TableRef) -> Self {
        Self {
            target: target.clone(),
            source: staging.clone(),
            key: KEY_COLUMN.to_string(),
            columns: R::schema()
                .column_names()
                .into_iter()
                .map(ToString::to_string)
                .collect(),
            order_column: Some(INGEST_SEQ_COLUMN.to_string()),
        }
    }

    pub fn update_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .map(String::as_str)
            .filter(move |c| *c != self.key)
    }
}

/// Operations the sync and compose tasks need from a warehouse.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Create `table` with `schema` when it does not exist yet.
    async fn ensure_table(&self, table: &TableRef, schema: &TableSchema) -> Result<(), WarehouseError>;

    /// `SELECT MAX(column) FROM table`; `CellValue::Null` for an empty table.
    async fn max_value(&self, table: &TableRef, column: &ColumnDef) -> Result<CellValue, WarehouseError>;

    /// Rows of `source` whose `key` has no match in `exclude`, projected to `columns`.
    async fn anti_join(
        &self,
        source: &TableRef,
        exclude: &TableRef,
        key: &str,
        columns: &[ColumnDef],
    ) -> Result<Vec<Row>, WarehouseError>;

    /// Replace `table` wholesale with `rows`. An empty batch leaves an empty table.
    async fn overwrite_table(
        &self,
        table: &TableRef,
        schema: &TableSchema,
        rows: Vec<Row>,
    ) -> Result<u64, WarehouseError>;

    /// Apply `spec` as one atomic statement; returns affected target rows.
    async fn merge(&self, spec: &MergeSpec) -> Result<u64, WarehouseError>;

    /// Run a statement and wait for it to complete.
    async fn execute(&self, sql: &str) -> Result<(), WarehouseError>;

    async fn drop_table(&self, table: &TableRef) -> Result<(), WarehouseError>;
}

/// Per-table leases so overlapping runs against one target serialize.
#[derive(Debug, Default)]
pub struct TableLocks {
    locks: Mutex<HashMap<TableRef, Arc<Mutex<()>>>>,
}

impl TableLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, table: &TableRef) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            map.entry(table.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
