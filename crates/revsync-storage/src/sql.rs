//! SQL text for the warehouse operations, rendered per dialect.

use revsync_core::{is_sql_identifier, ColumnDef, ColumnType, TableRef, TableSchema, KEY_COLUMN};

use crate::MergeSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Backtick `project.dataset.table` references, `CREATE OR REPLACE TABLE`.
    BigQuery,
    /// `"project__dataset"."table"` references; one schema per project and dataset.
    Postgres,
}

impl Dialect {
    pub fn table(&self, table: &TableRef) -> String {
        match self {
            Dialect::BigQuery => format!("`{}.{}.{}`", table.project, table.dataset, table.table),
            Dialect::Postgres => format!("{}.{}", self.schema(table), self.ident(&table.table)),
        }
    }

    /// Quoted container of `table`: the dataset in BigQuery, a
    /// `project__dataset` schema in Postgres.
    pub fn schema(&self, table: &TableRef) -> String {
        match self {
            Dialect::BigQuery => format!("`{}.{}`", table.project, table.dataset),
            Dialect::Postgres => self.ident(&format!("{}__{}", table.project, table.dataset)),
        }
    }

    pub fn ident(&self, name: &str) -> String {
        match self {
            Dialect::BigQuery if is_sql_identifier(name) => name.to_string(),
            Dialect::BigQuery => format!("`{name}`"),
            Dialect::Postgres => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    pub fn column_type(&self, kind: ColumnType) -> &'static str {
        match (self, kind) {
            (Dialect::BigQuery, ColumnType::Text) => "STRING",
            (Dialect::BigQuery, ColumnType::Int64) => "INT64",
            (Dialect::BigQuery, ColumnType::Float64) => "FLOAT64",
            (Dialect::BigQuery, ColumnType::Bool) => "BOOL",
            (Dialect::BigQuery, ColumnType::Timestamp) => "DATETIME",
            (Dialect::Postgres, ColumnType::Text) => "TEXT",
            (Dialect::Postgres, ColumnType::Int64) => "BIGINT",
            (Dialect::Postgres, ColumnType::Float64) => "DOUBLE PRECISION",
            (Dialect::Postgres, ColumnType::Bool) => "BOOLEAN",
            (Dialect::Postgres, ColumnType::Timestamp) => "TIMESTAMP",
        }
    }

    /// Materialize `select` into `target`, replacing any previous table.
    pub fn replace_table_as(&self, target: &TableRef, select: &str) -> String {
        match self {
            Dialect::BigQuery => format!(
                "CREATE OR REPLACE TABLE {} AS (\n{select}\n)",
                self.table(target)
            ),
            Dialect::Postgres => format!(
                "DROP TABLE IF EXISTS {table};\nCREATE TABLE {table} AS (\n{select}\n)",
                table = self.table(target)
            ),
        }
    }
}

fn column_list(dialect: Dialect, columns: &[&str], qualifier: Option<&str>) -> String {
    columns
        .iter()
        .map(|c| match qualifier {
            Some(q) => format!("{q}.{}", dialect.ident(c)),
            None => dialect.ident(c),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_defs(dialect: Dialect, schema: &TableSchema) -> Vec<String> {
    schema
        .columns
        .iter()
        .map(|c| format!("{} {}", dialect.ident(&c.name), dialect.column_type(c.kind)))
        .collect()
}

pub fn render_max(dialect: Dialect, table: &TableRef, column: &ColumnDef) -> String {
    format!(
        "SELECT MAX({}) AS max_value FROM {}",
        dialect.ident(&column.name),
        dialect.table(table)
    )
}

pub fn render_anti_join(
    dialect: Dialect,
    source: &TableRef,
    exclude: &TableRef,
    key: &str,
    columns: &[ColumnDef],
) -> String {
    let names = columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
    let key = dialect.ident(key);
    format!(
        "SELECT {cols}\nFROM {source} AS s\nLEFT JOIN {exclude} AS d ON s.{key} = d.{key}\nWHERE d.{key} IS NULL",
        cols = column_list(dialect, &names, Some("s")),
        source = dialect.table(source),
        exclude = dialect.table(exclude),
    )
}

pub fn render_create_table(dialect: Dialect, table: &TableRef, schema: &TableSchema) -> String {
    format!(
        "CREATE TABLE {} (\n    {}\n)",
        dialect.table(table),
        column_defs(dialect, schema).join(",\n    ")
    )
}

pub fn render_create_if_missing(dialect: Dialect, table: &TableRef, schema: &TableSchema) -> String {
    let mut defs = column_defs(dialect, schema);
    if dialect == Dialect::Postgres && schema.index_of(KEY_COLUMN).is_some() {
        defs.push(format!("PRIMARY KEY ({})", dialect.ident(KEY_COLUMN)));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        dialect.table(table),
        defs.join(",\n    ")
    )
}

pub fn render_drop(dialect: Dialect, table: &TableRef) -> String {
    format!("DROP TABLE IF EXISTS {}", dialect.table(table))
}

/// Source side of a merge: non-null keys only, one row per key.
fn render_merge_source(dialect: Dialect, spec: &MergeSpec) -> String {
    let columns = spec.columns.iter().map(String::as_str).collect::<Vec<_>>();
    let cols = column_list(dialect, &columns, None);
    let key = dialect.ident(&spec.key);
    let source = dialect.table(&spec.source);
    match (&spec.order_column, dialect) {
        (None, _) => format!("SELECT {cols} FROM {source} WHERE {key} IS NOT NULL"),
        (Some(order), Dialect::BigQuery) => format!(
            "SELECT {cols} FROM {source} WHERE {key} IS NOT NULL\n    QUALIFY ROW_NUMBER() OVER (PARTITION BY {key} ORDER BY {order} DESC) = 1",
            order = dialect.ident(order)
        ),
        (Some(order), Dialect::Postgres) => format!(
            "SELECT DISTINCT ON ({key}) {cols} FROM {source} WHERE {key} IS NOT NULL\n    ORDER BY {key}, {order} DESC",
            order = dialect.ident(order)
        ),
    }
}

pub fn render_merge(dialect: Dialect, spec: &MergeSpec) -> String {
    let key = dialect.ident(&spec.key);
    let mut sql = format!(
        "MERGE {into}{target} AS target\nUSING (\n    {source}\n) AS source\nON target.{key} = source.{key}\n",
        into = if dialect == Dialect::Postgres { "INTO " } else { "" },
        target = dialect.table(&spec.target),
        source = render_merge_source(dialect, spec),
    );

    let updates = spec
        .update_columns()
        .map(|c| format!("{col} = source.{col}", col = dialect.ident(c)))
        .collect::<Vec<_>>();
    if !updates.is_empty() {
        sql.push_str("WHEN MATCHED THEN\n    UPDATE SET\n        ");
        sql.push_str(&updates.join(",\n        "));
        sql.push('\n');
    }

    let columns = spec.columns.iter().map(String::as_str).collect::<Vec<_>>();
    sql.push_str(match dialect {
        Dialect::BigQuery => "WHEN NOT MATCHED BY TARGET THEN\n",
        Dialect::Postgres => "WHEN NOT MATCHED THEN\n",
    });
    sql.push_str(&format!(
        "    INSERT ({})\n    VALUES ({})",
        column_list(dialect, &columns, None),
        column_list(dialect, &columns, Some("source"))
    ));
    sql
}
