use async_trait::async_trait;
use chrono::NaiveDateTime;
use revsync_core::{CellValue, ColumnDef, ColumnType, TableRef, TableSchema};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder, Row as _};
use tracing::debug;

use crate::sql::{self, Dialect};
use crate::{MergeSpec, Row, Warehouse, WarehouseError};

/// Postgres bind parameter ceiling per statement.
const MAX_BIND_PARAMS: usize = 65_535;

/// Warehouse backed by Postgres. Each project and dataset pair maps to one
/// `project__dataset` schema.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    /// Build a pool that only connects on first use.
    pub fn connect_lazy(database_url: &str) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self, table: &TableRef) -> Result<(), WarehouseError> {
        let stmt = format!("CREATE SCHEMA IF NOT EXISTS {}", Dialect::Postgres.schema(table));
        sqlx::query(&stmt).execute(&self.pool).await?;
        Ok(())
    }
}

fn bind_cell<'args>(
    b: &mut Separated<'_, 'args, Postgres, &'static str>,
    kind: ColumnType,
    cell: &CellValue,
) {
    match (cell, kind) {
        (CellValue::Null, ColumnType::Text) => b.push_bind(None::<String>),
        (CellValue::Null, ColumnType::Int64) => b.push_bind(None::<i64>),
        (CellValue::Null, ColumnType::Float64) => b.push_bind(None::<f64>),
        (CellValue::Null, ColumnType::Bool) => b.push_bind(None::<bool>),
        (CellValue::Null, ColumnType::Timestamp) => b.push_bind(None::<NaiveDateTime>),
        (CellValue::Text(v), _) => b.push_bind(v.clone()),
        (CellValue::Int(v), _) => b.push_bind(*v),
        (CellValue::Float(v), _) => b.push_bind(*v),
        (CellValue::Bool(v), _) => b.push_bind(*v),
        (CellValue::Timestamp(v), _) => b.push_bind(*v),
    };
}

fn decode_cell(row: &PgRow, idx: usize, kind: ColumnType) -> Result<CellValue, sqlx::Error> {
    Ok(match kind {
        ColumnType::Text => row.try_get::<Option<String>, _>(idx)?.into(),
        ColumnType::Int64 => row.try_get::<Option<i64>, _>(idx)?.into(),
        ColumnType::Float64 => row.try_get::<Option<f64>, _>(idx)?.into(),
        ColumnType::Bool => row.try_get::<Option<bool>, _>(idx)?.into(),
        ColumnType::Timestamp => row.try_get::<Option<NaiveDateTime>, _>(idx)?.into(),
    })
}

#[async_trait]
impl Warehouse for PgWarehouse {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn ensure_table(&self, table: &TableRef, schema: &TableSchema) -> Result<(), WarehouseError> {
        self.ensure_schema(table).await?;
        let stmt = sql::render_create_if_missing(Dialect::Postgres, table, schema);
        sqlx::query(&stmt).execute(&self.pool).await?;
        Ok(())
    }

    async fn max_value(&self, table: &TableRef, column: &ColumnDef) -> Result<CellValue, WarehouseError> {
        let stmt = sql::render_max(Dialect::Postgres, table, column);
        let row = sqlx::query(&stmt).fetch_one(&self.pool).await?;
        Ok(decode_cell(&row, 0, column.kind)?)
    }

    async fn anti_join(
        &self,
        source: &TableRef,
        exclude: &TableRef,
        key: &str,
        columns: &[ColumnDef],
    ) -> Result<Vec<Row>, WarehouseError> {
        let stmt = sql::render_anti_join(Dialect::Postgres, source, exclude, key, columns);
        let rows = sqlx::query(&stmt).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let cells = columns
                .iter()
                .enumerate()
                .map(|(idx, c)| decode_cell(&row, idx, c.kind))
                .collect::<Result<Vec<_>, _>>()?;
            out.push(cells);
        }
        Ok(out)
    }

    async fn overwrite_table(
        &self,
        table: &TableRef,
        schema: &TableSchema,
        rows: Vec<Row>,
    ) -> Result<u64, WarehouseError> {
        if let Some(bad) = rows.iter().find(|r| r.len() != schema.len()) {
            return Err(WarehouseError::Schema(format!(
                "row has {} cells, {} expects {}",
                bad.len(),
                table,
                schema.len()
            )));
        }

        self.ensure_schema(table).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(&sql::render_drop(Dialect::Postgres, table))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&sql::render_create_table(Dialect::Postgres, table, schema))
            .execute(&mut *tx)
            .await?;

        let columns = schema
            .columns
            .iter()
            .map(|c| Dialect::Postgres.ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let chunk_rows = (MAX_BIND_PARAMS / schema.len().max(1)).max(1);
        let mut inserted = 0u64;
        for chunk in rows.chunks(chunk_rows) {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {} ({columns}) ",
                Dialect::Postgres.table(table)
            ));
            qb.push_values(chunk.iter(), |mut b, row| {
                for (column, cell) in schema.columns.iter().zip(row) {
                    bind_cell(&mut b, column.kind, cell);
                }
            });
            inserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        debug!(table = %table, rows = inserted, "overwrote table");
        Ok(inserted)
    }

    async fn merge(&self, spec: &MergeSpec) -> Result<u64, WarehouseError> {
        let stmt = sql::render_merge(Dialect::Postgres, spec);
        let result = sqlx::query(&stmt).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn execute(&self, statement: &str) -> Result<(), WarehouseError> {
        sqlx::raw_sql(statement).execute(&self.pool).await?;
        Ok(())
    }

    async fn drop_table(&self, table: &TableRef) -> Result<(), WarehouseError> {
        sqlx::query(&sql::render_drop(Dialect::Postgres, table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
