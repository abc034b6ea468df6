//! Core domain model for revsync: table references, typed cells and the
//! fixed row shapes that land in the warehouse.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "revsync-core";

/// Name of the merge key shared by every target table.
pub const KEY_COLUMN: &str = "id";

/// Ordinal column appended to staging tables so merges can keep the last
/// occurrence of a duplicated key.
pub const INGEST_SEQ_COLUMN: &str = "_ingest_seq";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableRefError {
    #[error("table reference `{0}` must have the form project.dataset.table")]
    Shape(String),
    #[error("{part} `{value}` is empty or contains characters outside [A-Za-z0-9_-]")]
    InvalidPart { part: &'static str, value: String },
}

/// Fully qualified warehouse table: `project.dataset.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Result<Self, TableRefError> {
        let table_ref = Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        };
        validate_part("project", &table_ref.project)?;
        validate_part("dataset", &table_ref.dataset)?;
        validate_part("table", &table_ref.table)?;
        Ok(table_ref)
    }

    pub fn parse(qualified: &str) -> Result<Self, TableRefError> {
        let parts = qualified.trim().trim_matches('`').split('.').collect::<Vec<_>>();
        match parts.as_slice() {
            [project, dataset, table] => Self::new(*project, *dataset, *table),
            _ => Err(TableRefError::Shape(qualified.to_string())),
        }
    }

    /// Sibling table in the same dataset.
    pub fn sibling(&self, table: impl Into<String>) -> Self {
        Self {
            project: self.project.clone(),
            dataset: self.dataset.clone(),
            table: table.into(),
        }
    }

    /// Staging table that feeds merges into `self`.
    pub fn staging(&self, mode: &StagingMode) -> Self {
        match mode {
            StagingMode::Shared => self.sibling(format!("staging_{}", self.table)),
            StagingMode::PerRun { suffix } => {
                self.sibling(format!("staging_{}_{}", self.table, suffix))
            }
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

fn validate_part(part: &'static str, value: &str) -> Result<(), TableRefError> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(TableRefError::InvalidPart {
            part,
            value: value.to_string(),
        })
    }
}

/// True for plain SQL identifiers usable unquoted as CTE or column names.
pub fn is_sql_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// How staging tables are named for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingMode {
    /// One `staging_<table>` per target, overwritten by every run.
    Shared,
    /// A staging table unique to one run, dropped after the merge.
    PerRun { suffix: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Int64,
    Float64,
    Bool,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Ordered column set; the key column is always first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// One warehouse cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    #[default]
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(NaiveDateTime),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl From<Option<String>> for CellValue {
    fn from(value: Option<String>) -> Self {
        value.map(CellValue::Text).unwrap_or_default()
    }
}

impl From<Option<i64>> for CellValue {
    fn from(value: Option<i64>) -> Self {
        value.map(CellValue::Int).unwrap_or_default()
    }
}

impl From<Option<f64>> for CellValue {
    fn from(value: Option<f64>) -> Self {
        value.map(CellValue::Float).unwrap_or_default()
    }
}

impl From<Option<bool>> for CellValue {
    fn from(value: Option<bool>) -> Self {
        value.map(CellValue::Bool).unwrap_or_default()
    }
}

impl From<Option<NaiveDateTime>> for CellValue {
    fn from(value: Option<NaiveDateTime>) -> Self {
        value.map(CellValue::Timestamp).unwrap_or_default()
    }
}

/// Row shape that can be staged and merged into a target table.
pub trait StagedRow: Send + Sync + 'static {
    /// Target schema, key column first.
    fn schema() -> TableSchema;

    /// Cells in `schema()` order.
    fn into_cells(self) -> Vec<CellValue>;
}

/// Flattened review as stored in the reviews table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReviewRow {
    pub id: Option<String>,
    pub title: Option<String>,
    pub review: Option<String>,
    pub original_title: Option<String>,
    pub stars: Option<f64>,
    pub iso: Option<String>,
    pub version: Option<String>,
    pub date: Option<NaiveDateTime>,
    pub deleted: Option<bool>,
    pub has_response: Option<bool>,
    pub product: Option<i64>,
    pub product_id: Option<i64>,
    pub store: Option<String>,
}

impl StagedRow for ReviewRow {
    fn schema() -> TableSchema {
        use ColumnType::*;
        TableSchema::new(vec![
            ColumnDef::new(KEY_COLUMN, Text),
            ColumnDef::new("title", Text),
            ColumnDef::new("review", Text),
            ColumnDef::new("original_title", Text),
            ColumnDef::new("stars", Float64),
            ColumnDef::new("iso", Text),
            ColumnDef::new("version", Text),
            ColumnDef::new("date", Timestamp),
            ColumnDef::new("deleted", Bool),
            ColumnDef::new("has_response", Bool),
            ColumnDef::new("product", Int64),
            ColumnDef::new("product_id", Int64),
            ColumnDef::new("store", Text),
        ])
    }

    fn into_cells(self) -> Vec<CellValue> {
        vec![
            self.id.into(),
            self.title.into(),
            self.review.into(),
            self.original_title.into(),
            self.stars.into(),
            self.iso.into(),
            self.version.into(),
            self.date.into(),
            self.deleted.into(),
            self.has_response.into(),
            self.product.into(),
            self.product_id.into(),
            self.store.into(),
        ]
    }
}

/// Sentiment annotation for one review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentRow {
    pub id: String,
    pub sentiment_score: f64,
    pub sentiment_magnitude: f64,
}

impl StagedRow for SentimentRow {
    fn schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnDef::new(KEY_COLUMN, ColumnType::Text),
            ColumnDef::new("sentiment_score", ColumnType::Float64),
            ColumnDef::new("sentiment_magnitude", ColumnType::Float64),
        ])
    }

    fn into_cells(self) -> Vec<CellValue> {
        vec![
            CellValue::Text(self.id),
            CellValue::Float(self.sentiment_score),
            CellValue::Float(self.sentiment_magnitude),
        ]
    }
}

/// One country group feeding the one-big-table rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// CTE name and value of the literal `country` column.
    pub merge_label: String,
    pub country: String,
    pub short_code_replica: String,
    pub short_code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qualified_table_refs() {
        let t = TableRef::parse("`my-proj.reviews_ds.reviews`").unwrap();
        assert_eq!(t.project, "my-proj");
        assert_eq!(t.dataset, "reviews_ds");
        assert_eq!(t.table, "reviews");
        assert_eq!(t.to_string(), "my-proj.reviews_ds.reviews");
    }

    #[test]
    fn rejects_injection_in_table_parts() {
        assert!(matches!(
            TableRef::new("p", "d", "t; DROP TABLE x"),
            Err(TableRefError::InvalidPart { part: "table", .. })
        ));
        assert!(matches!(
            TableRef::parse("only.two"),
            Err(TableRefError::Shape(_))
        ));
        assert!(TableRef::new("p", "", "t").is_err());
    }

    #[test]
    fn staging_names_follow_mode() {
        let t = TableRef::new("p", "d", "reviews").unwrap();
        assert_eq!(t.staging(&StagingMode::Shared).table, "staging_reviews");
        assert_eq!(
            t.staging(&StagingMode::PerRun {
                suffix: "abc123".into()
            })
            .table,
            "staging_reviews_abc123"
        );
    }

    #[test]
    fn review_cells_follow_schema_order() {
        let row = ReviewRow {
            id: Some("r1".into()),
            stars: Some(4.0),
            deleted: Some(false),
            ..Default::default()
        };
        let schema = ReviewRow::schema();
        let cells = row.into_cells();
        assert_eq!(cells.len(), schema.len());
        assert_eq!(schema.columns[0].name, KEY_COLUMN);
        assert_eq!(cells[0], CellValue::Text("r1".into()));
        assert_eq!(cells[schema.index_of("stars").unwrap()], CellValue::Float(4.0));
        assert!(cells[schema.index_of("title").unwrap()].is_null());
    }

    #[test]
    fn sql_identifier_check() {
        assert!(is_sql_identifier("Mexico_MX"));
        assert!(is_sql_identifier("_a1"));
        assert!(!is_sql_identifier("1abc"));
        assert!(!is_sql_identifier("a-b"));
        assert!(!is_sql_identifier(""));
    }

    #[test]
    fn cell_values_serialize_tagged() {
        let json = serde_json::to_value(CellValue::Int(3)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "int", "value": 3}));
    }
}
