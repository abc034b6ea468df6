use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use revsync_core::{CellValue, ColumnDef, TableRef, TableSchema};
use tokio::sync::Mutex;

use crate::sql::Dialect;
use crate::{MergeSpec, Row, Warehouse, WarehouseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarehouseOp {
    EnsureTable,
    MaxValue,
    AntiJoin,
    OverwriteTable,
    Merge,
    Execute,
    DropTable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryTable {
    pub schema: TableSchema,
    pub rows: Vec<Row>,
}

impl MemoryTable {
    pub fn column(&self, row: usize, name: &str) -> Option<&CellValue> {
        let idx = self.schema.index_of(name)?;
        self.rows.get(row)?.get(idx)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<TableRef, MemoryTable>,
    calls: Vec<WarehouseOp>,
    executed: Vec<String>,
    failures: HashSet<WarehouseOp>,
}

/// In-process warehouse with the same merge semantics as the SQL backends.
/// Records every call and can be told to fail specific operations.
#[derive(Debug)]
pub struct MemoryWarehouse {
    dialect: Dialect,
    state: Mutex<MemoryState>,
}

impl Default for MemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::with_dialect(Dialect::BigQuery)
    }

    pub fn with_dialect(dialect: Dialect) -> Self {
        Self {
            dialect,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub async fn insert_table(&self, table: &TableRef, schema: TableSchema, rows: Vec<Row>) {
        let mut state = self.state.lock().await;
        state.tables.insert(table.clone(), MemoryTable { schema, rows });
    }

    pub async fn table(&self, table: &TableRef) -> Option<MemoryTable> {
        self.state.lock().await.tables.get(table).cloned()
    }

    pub async fn fail_on(&self, op: WarehouseOp) {
        self.state.lock().await.failures.insert(op);
    }

    pub async fn calls(&self) -> Vec<WarehouseOp> {
        self.state.lock().await.calls.clone()
    }

    pub async fn executed(&self) -> Vec<String> {
        self.state.lock().await.executed.clone()
    }
}

impl MemoryState {
    fn record(&mut self, op: WarehouseOp) -> Result<(), WarehouseError> {
        self.calls.push(op);
        if self.failures.contains(&op) {
            return Err(WarehouseError::Rejected(format!("{op:?} (injected failure)")));
        }
        Ok(())
    }

    fn get(&self, table: &TableRef) -> Result<&MemoryTable, WarehouseError> {
        self.tables
            .get(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.to_string()))
    }
}

fn column_index(table: &MemoryTable, name: &str, table_ref: &TableRef) -> Result<usize, WarehouseError> {
    table
        .schema
        .index_of(name)
        .ok_or_else(|| WarehouseError::Schema(format!("{table_ref} has no column {name}")))
}

fn compare_cells(a: &CellValue, b: &CellValue) -> Option<Ordering> {
    match (a, b) {
        (CellValue::Text(a), CellValue::Text(b)) => Some(a.cmp(b)),
        (CellValue::Int(a), CellValue::Int(b)) => Some(a.cmp(b)),
        (CellValue::Float(a), CellValue::Float(b)) => a.partial_cmp(b),
        (CellValue::Bool(a), CellValue::Bool(b)) => Some(a.cmp(b)),
        (CellValue::Timestamp(a), CellValue::Timestamp(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Join key representation; SQL equality never matches NULL.
fn key_of(cell: &CellValue) -> Option<String> {
    match cell {
        CellValue::Null => None,
        CellValue::Text(v) => Some(v.clone()),
        other => Some(format!("{other:?}")),
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn ensure_table(&self, table: &TableRef, schema: &TableSchema) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().await;
        state.record(WarehouseOp::EnsureTable)?;
        state.tables.entry(table.clone()).or_insert_with(|| MemoryTable {
            schema: schema.clone(),
            rows: Vec::new(),
        });
        Ok(())
    }

    async fn max_value(&self, table: &TableRef, column: &ColumnDef) -> Result<CellValue, WarehouseError> {
        let mut state = self.state.lock().await;
        state.record(WarehouseOp::MaxValue)?;
        let data = state.get(table)?;
        let idx = column_index(data, &column.name, table)?;
        let mut max = CellValue::Null;
        for row in &data.rows {
            let cell = &row[idx];
            if cell.is_null() {
                continue;
            }
            if max.is_null() || compare_cells(cell, &max) == Some(Ordering::Greater) {
                max = cell.clone();
            }
        }
        Ok(max)
    }

    async fn anti_join(
        &self,
        source: &TableRef,
        exclude: &TableRef,
        key: &str,
        columns: &[ColumnDef],
    ) -> Result<Vec<Row>, WarehouseError> {
        let mut state = self.state.lock().await;
        state.record(WarehouseOp::AntiJoin)?;
        let src = state.get(source)?;
        let excl = state.get(exclude)?;
        let src_key = column_index(src, key, source)?;
        let excl_key = column_index(excl, key, exclude)?;
        let projection = columns
            .iter()
            .map(|c| column_index(src, &c.name, source))
            .collect::<Result<Vec<_>, _>>()?;

        let seen = excl
            .rows
            .iter()
            .filter_map(|r| key_of(&r[excl_key]))
            .collect::<HashSet<_>>();

        Ok(src
            .rows
            .iter()
            .filter(|r| key_of(&r[src_key]).map_or(true, |k| !seen.contains(&k)))
            .map(|r| projection.iter().map(|&i| r[i].clone()).collect())
            .collect())
    }

    async fn overwrite_table(
        &self,
        table: &TableRef,
        schema: &TableSchema,
        rows: Vec<Row>,
    ) -> Result<u64, WarehouseError> {
        let mut state = self.state.lock().await;
        state.record(WarehouseOp::OverwriteTable)?;
        if rows.iter().any(|r| r.len() != schema.len()) {
            return Err(WarehouseError::Schema(format!(
                "row width does not match {} columns of {table}",
                schema.len()
            )));
        }
        let count = rows.len() as u64;
        state.tables.insert(
            table.clone(),
            MemoryTable {
                schema: schema.clone(),
                rows,
            },
        );
        Ok(count)
    }

    async fn merge(&self, spec: &MergeSpec) -> Result<u64, WarehouseError> {
        let mut state = self.state.lock().await;
        state.record(WarehouseOp::Merge)?;

        let source = state.get(&spec.source)?;
        let target = state.get(&spec.target)?;
        let src_idx = spec
            .columns
            .iter()
            .map(|c| column_index(source, c, &spec.source))
            .collect::<Result<Vec<_>, _>>()?;
        let tgt_idx = spec
            .columns
            .iter()
            .map(|c| column_index(target, c, &spec.target))
            .collect::<Result<Vec<_>, _>>()?;
        let key_pos = spec
            .columns
            .iter()
            .position(|c| *c == spec.key)
            .ok_or_else(|| WarehouseError::Schema(format!("merge key {} not in column list", spec.key)))?;
        let order_idx = match &spec.order_column {
            Some(order) => Some(column_index(source, order, &spec.source)?),
            None => None,
        };

        // One source row per key: the highest order value wins, else the last one.
        let mut latest: BTreeMap<String, (usize, Row)> = BTreeMap::new();
        for (pos, row) in source.rows.iter().enumerate() {
            let Some(key) = key_of(&row[src_idx[key_pos]]) else {
                continue;
            };
            let replace = match latest.get(&key) {
                None => true,
                Some((prev_pos, _)) => match order_idx {
                    Some(o) => {
                        compare_cells(&row[o], &source.rows[*prev_pos][o]) != Some(Ordering::Less)
                    }
                    None => true,
                },
            };
            if replace {
                latest.insert(key, (pos, src_idx.iter().map(|&i| row[i].clone()).collect()));
            }
        }
        let mut pending = latest.into_values().collect::<Vec<_>>();
        pending.sort_by_key(|(pos, _)| *pos);

        let width = target.schema.len();
        let tgt_key = tgt_idx[key_pos];
        let mut rows = target.rows.clone();
        let mut affected = 0u64;
        for (_, values) in pending {
            let key = key_of(&values[key_pos]);
            match rows.iter_mut().find(|r| key_of(&r[tgt_key]) == key) {
                Some(existing) => {
                    for (value, &i) in values.into_iter().zip(&tgt_idx) {
                        existing[i] = value;
                    }
                }
                None => {
                    let mut fresh = vec![CellValue::Null; width];
                    for (value, &i) in values.into_iter().zip(&tgt_idx) {
                        fresh[i] = value;
                    }
                    rows.push(fresh);
                }
            }
            affected += 1;
        }

        if let Some(t) = state.tables.get_mut(&spec.target) {
            t.rows = rows;
        }
        Ok(affected)
    }

    async fn execute(&self, sql: &str) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().await;
        state.record(WarehouseOp::Execute)?;
        state.executed.push(sql.to_string());
        Ok(())
    }

    async fn drop_table(&self, table: &TableRef) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().await;
        state.record(WarehouseOp::DropTable)?;
        state.tables.remove(table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revsync_core::{ColumnType, SentimentRow, StagedRow, StagingMode, INGEST_SEQ_COLUMN};

    fn tables() -> (TableRef, TableRef) {
        let target = TableRef::new("p", "d", "sentiment").unwrap();
        let staging = target.staging(&StagingMode::Shared);
        (target, staging)
    }

    fn staging_schema() -> TableSchema {
        SentimentRow::schema().with_column(ColumnDef::new(INGEST_SEQ_COLUMN, ColumnType::Int64))
    }

    fn staged(id: Option<&str>, score: f64, seq: i64) -> Row {
        vec![
            id.map(|s| CellValue::Text(s.into())).unwrap_or_default(),
            CellValue::Float(score),
            CellValue::Float(score * 2.0),
            CellValue::Int(seq),
        ]
    }

    async fn seeded() -> (MemoryWarehouse, TableRef, TableRef) {
        let wh = MemoryWarehouse::new();
        let (target, staging) = tables();
        wh.ensure_table(&target, &SentimentRow::schema()).await.unwrap();
        (wh, target, staging)
    }

    #[tokio::test]
    async fn merge_keeps_last_duplicate_and_is_idempotent() {
        let (wh, target, staging) = seeded().await;
        wh.overwrite_table(
            &staging,
            &staging_schema(),
            vec![
                staged(Some("a"), 0.1, 0),
                staged(Some("b"), 0.2, 1),
                staged(Some("a"), 0.9, 2),
            ],
        )
        .await
        .unwrap();
        let spec = MergeSpec::for_rows::<SentimentRow>(&staging, &target);

        wh.merge(&spec).await.unwrap();
        let first = wh.table(&target).await.unwrap();
        assert_eq!(first.rows.len(), 2);
        assert_eq!(first.column(0, "id"), Some(&CellValue::Text("b".into())));
        assert_eq!(first.column(1, "id"), Some(&CellValue::Text("a".into())));
        assert_eq!(first.column(1, "sentiment_score"), Some(&CellValue::Float(0.9)));

        wh.merge(&spec).await.unwrap();
        assert_eq!(wh.table(&target).await.unwrap(), first);
    }

    #[tokio::test]
    async fn merge_updates_matches_and_skips_null_keys() {
        let (wh, target, staging) = seeded().await;
        wh.insert_table(
            &target,
            SentimentRow::schema(),
            vec![vec![
                CellValue::Text("a".into()),
                CellValue::Float(0.0),
                CellValue::Float(0.0),
            ]],
        )
        .await;
        wh.overwrite_table(
            &staging,
            &staging_schema(),
            vec![staged(Some("a"), 0.5, 0), staged(None, 0.7, 1)],
        )
        .await
        .unwrap();

        let affected = wh
            .merge(&MergeSpec::for_rows::<SentimentRow>(&staging, &target))
            .await
            .unwrap();
        assert_eq!(affected, 1);
        let t = wh.table(&target).await.unwrap();
        assert_eq!(t.rows.len(), 1);
        assert_eq!(t.column(0, "sentiment_magnitude"), Some(&CellValue::Float(1.0)));
    }

    #[tokio::test]
    async fn merge_into_missing_target_fails() {
        let wh = MemoryWarehouse::new();
        let (target, staging) = tables();
        wh.overwrite_table(&staging, &staging_schema(), vec![]).await.unwrap();
        let err = wh
            .merge(&MergeSpec::for_rows::<SentimentRow>(&staging, &target))
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::TableNotFound(_)));
    }

    #[tokio::test]
    async fn max_value_ignores_nulls_and_reports_empty() {
        let (wh, target, _) = seeded().await;
        let score = ColumnDef::new("sentiment_score", ColumnType::Float64);
        assert_eq!(wh.max_value(&target, &score).await.unwrap(), CellValue::Null);

        wh.insert_table(
            &target,
            SentimentRow::schema(),
            vec![
                vec![CellValue::Text("a".into()), CellValue::Float(0.3), CellValue::Null],
                vec![CellValue::Text("b".into()), CellValue::Null, CellValue::Null],
                vec![CellValue::Text("c".into()), CellValue::Float(0.8), CellValue::Null],
            ],
        )
        .await;
        assert_eq!(wh.max_value(&target, &score).await.unwrap(), CellValue::Float(0.8));
    }

    #[tokio::test]
    async fn anti_join_returns_unmatched_rows() {
        let (wh, target, _) = seeded().await;
        let reviews = target.sibling("reviews");
        let review_schema = TableSchema::new(vec![
            ColumnDef::new("id", ColumnType::Text),
            ColumnDef::new("review", ColumnType::Text),
        ]);
        wh.insert_table(
            &reviews,
            review_schema.clone(),
            vec![
                vec![CellValue::Text("a".into()), CellValue::Text("great".into())],
                vec![CellValue::Text("b".into()), CellValue::Text("bad".into())],
            ],
        )
        .await;
        wh.insert_table(
            &target,
            SentimentRow::schema(),
            vec![vec![CellValue::Text("a".into()), CellValue::Float(1.0), CellValue::Float(1.0)]],
        )
        .await;

        let rows = wh
            .anti_join(&reviews, &target, "id", &review_schema.columns)
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![vec![CellValue::Text("b".into()), CellValue::Text("bad".into())]]
        );
    }

    #[tokio::test]
    async fn injected_failures_are_recorded() {
        let wh = MemoryWarehouse::new();
        wh.fail_on(WarehouseOp::Execute).await;
        assert!(wh.execute("SELECT 1").await.is_err());
        assert_eq!(wh.calls().await, vec![WarehouseOp::Execute]);
        assert!(wh.executed().await.is_empty());
    }
}
