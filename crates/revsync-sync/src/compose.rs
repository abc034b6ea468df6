//! Builds and runs the statement that rebuilds the one-big-table (OBT) from
//! every country's reviews, sentiment and classification tables.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use revsync_core::{is_sql_identifier, EntityDescriptor, TableRef, TableRefError};
use revsync_storage::Dialect;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::request::{optional_str, parse_payload, string_list, Payload};
use crate::{ConfigError, TaskContext, TaskError};

const REVIEW_COLUMNS: &[&str] = &["review", "id", "date", "store", "title", "stars", "version"];
const SENTIMENT_COLUMNS: &[&str] = &["sentiment_magnitude", "sentiment_score"];
const NEEDS_COLUMNS: &[&str] = &[
    "payment_method",
    "add_credit",
    "wallet",
    "loyalty_points",
    "collect_points",
    "add_money",
    "customer_service",
    "app_upgrade",
    "load_money",
    "collect_stars",
    "app_update",
    "password_change",
    "password_reset",
];
const COMPLAINT_COLUMNS: &[&str] = &["payment", "login", "order", "scan", "reward", "registration"];

/// Keywords either dialect refuses as a bare CTE name.
const RESERVED_WORDS: &[&str] = &[
    "all", "and", "any", "array", "as", "asc", "between", "by", "case", "cast", "collate", "create",
    "cross", "cube", "current", "default", "define", "desc", "distinct", "else", "end", "enum",
    "escape", "except", "exclude", "exists", "extract", "false", "fetch", "for", "from", "full",
    "group", "grouping", "groups", "hash", "having", "if", "ignore", "in", "inner", "intersect",
    "interval", "into", "is", "join", "lateral", "left", "like", "limit", "lookup", "merge", "natural",
    "new", "no", "not", "null", "nulls", "of", "offset", "on", "only", "or", "order", "outer", "over",
    "partition", "preceding", "proto", "qualify", "range", "recursive", "respect", "right", "rollup",
    "rows", "select", "set", "some", "struct", "table", "tablesample", "then", "to", "treat", "true",
    "union", "unnest", "user", "using", "when", "where", "window", "with", "within",
];

/// Source table suffixes in join order: t1 through t4.
const SOURCE_KINDS: [(&str, &[&str]); 4] = [
    ("reviews", REVIEW_COLUMNS),
    ("nlpapi_sentiment", SENTIMENT_COLUMNS),
    ("hf_needs", NEEDS_COLUMNS),
    ("hf_complaints", COMPLAINT_COLUMNS),
];

#[derive(Debug, Error)]
pub enum QueryBuildError {
    #[error("at least one entity is required")]
    NoEntities,
    #[error(
        "entity arrays differ in length: countries_merge={merge}, countries={countries}, \
         countries_short_replica={replica}, countries_short={short}"
    )]
    MismatchedLengths {
        merge: usize,
        countries: usize,
        replica: usize,
        short: usize,
    },
    #[error("merge label `{0}` is not a plain SQL identifier")]
    InvalidLabel(String),
    #[error("merge label `{0}` is a reserved SQL word")]
    ReservedLabel(String),
    #[error("merge label `{0}` appears more than once")]
    DuplicateLabel(String),
    #[error("{field} `{value}` of entity {label} may only contain letters, digits and `_`")]
    InvalidCode {
        label: String,
        field: &'static str,
        value: String,
    },
    #[error("source table for entity {label}: {source}")]
    InvalidSource {
        label: String,
        #[source]
        source: TableRefError,
    },
}

/// How an entity's four source tables are named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceNaming {
    pub project_prefix: String,
    pub dataset_prefix: String,
    pub table_prefix: String,
}

impl Default for SourceNaming {
    fn default() -> Self {
        Self {
            project_prefix: "client-".to_string(),
            dataset_prefix: "reviews".to_string(),
            table_prefix: "app".to_string(),
        }
    }
}

impl SourceNaming {
    /// `<project_prefix><country>.<dataset_prefix>_<replica>.<table_prefix>_<short>_<kind>`
    pub fn source_table(&self, entity: &EntityDescriptor, kind: &str) -> Result<TableRef, QueryBuildError> {
        TableRef::new(
            format!("{}{}", self.project_prefix, entity.country.to_lowercase()),
            format!("{}_{}", self.dataset_prefix, entity.short_code_replica),
            format!("{}_{}_{}", self.table_prefix, entity.short_code, kind),
        )
        .map_err(|source| QueryBuildError::InvalidSource {
            label: entity.merge_label.clone(),
            source,
        })
    }
}

fn check_code(entity: &EntityDescriptor, field: &'static str, value: &str) -> Result<(), QueryBuildError> {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Ok(());
    }
    Err(QueryBuildError::InvalidCode {
        label: entity.merge_label.clone(),
        field,
        value: value.to_string(),
    })
}

fn validate(entities: &[EntityDescriptor]) -> Result<(), QueryBuildError> {
    if entities.is_empty() {
        return Err(QueryBuildError::NoEntities);
    }
    let mut seen = HashSet::new();
    for entity in entities {
        if !is_sql_identifier(&entity.merge_label) {
            return Err(QueryBuildError::InvalidLabel(entity.merge_label.clone()));
        }
        if RESERVED_WORDS.contains(&entity.merge_label.to_ascii_lowercase().as_str()) {
            return Err(QueryBuildError::ReservedLabel(entity.merge_label.clone()));
        }
        if !seen.insert(entity.merge_label.to_ascii_lowercase()) {
            return Err(QueryBuildError::DuplicateLabel(entity.merge_label.clone()));
        }
        check_code(entity, "short_code_replica", &entity.short_code_replica)?;
        check_code(entity, "short_code", &entity.short_code)?;
    }
    Ok(())
}

fn render_cte(entity: &EntityDescriptor, naming: &SourceNaming, dialect: Dialect) -> Result<String, QueryBuildError> {
    let mut select = vec![format!("'{}' AS country", entity.merge_label)];
    let mut joins = Vec::with_capacity(SOURCE_KINDS.len());
    for (i, (kind, columns)) in SOURCE_KINDS.iter().enumerate() {
        let alias = format!("t{}", i + 1);
        select.extend(columns.iter().map(|c| format!("{alias}.{}", dialect.ident(c))));
        let table = dialect.table(&naming.source_table(entity, kind)?);
        joins.push(if i == 0 {
            format!("    FROM\n        {table} AS {alias}")
        } else {
            format!("    JOIN\n        {table} AS {alias}\n        ON t1.id = {alias}.id")
        });
    }
    Ok(format!(
        "{label} AS (\n    SELECT\n        {select}\n{joins}\n)",
        label = entity.merge_label,
        select = select.join(",\n        "),
        joins = joins.join("\n"),
    ))
}

/// One CTE per entity, a `UNION ALL` over all of them, materialized into
/// `target`. Fragments are joined, so one entity yields no dangling
/// separator and zero entities is an error.
pub fn compose_union_query(
    entities: &[EntityDescriptor],
    target: &TableRef,
    naming: &SourceNaming,
    dialect: Dialect,
) -> Result<String, QueryBuildError> {
    validate(entities)?;
    let ctes = entities
        .iter()
        .map(|e| render_cte(e, naming, dialect))
        .collect::<Result<Vec<_>, _>>()?;
    let union = entities
        .iter()
        .map(|e| format!("SELECT * FROM {}", e.merge_label))
        .collect::<Vec<_>>()
        .join("\nUNION ALL\n");
    let select = format!("WITH\n{}\n{union}", ctes.join(",\n"));
    Ok(dialect.replace_table_as(target, &select))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObtLoadRequest {
    pub entities: Vec<EntityDescriptor>,
    pub target: TableRef,
}

const LEGACY_FIELDS: [&str; 4] = ["countries_merge", "countries", "countries_short_replica", "countries_short"];

fn legacy_entities(payload: &Payload) -> Result<Vec<EntityDescriptor>, TaskError> {
    if LEGACY_FIELDS.iter().all(|f| !payload.contains_key(*f)) {
        return Err(ConfigError::MissingField("entities").into());
    }
    let merge = string_list(payload, "countries_merge")?.ok_or(ConfigError::MissingField("countries_merge"))?;
    let countries = string_list(payload, "countries")?.ok_or(ConfigError::MissingField("countries"))?;
    let replica = string_list(payload, "countries_short_replica")?
        .ok_or(ConfigError::MissingField("countries_short_replica"))?;
    let short = string_list(payload, "countries_short")?.ok_or(ConfigError::MissingField("countries_short"))?;

    let n = merge.len();
    if countries.len() != n || replica.len() != n || short.len() != n {
        return Err(QueryBuildError::MismatchedLengths {
            merge: n,
            countries: countries.len(),
            replica: replica.len(),
            short: short.len(),
        }
        .into());
    }
    Ok(merge
        .into_iter()
        .zip(countries)
        .zip(replica)
        .zip(short)
        .map(|(((merge_label, country), short_code_replica), short_code)| EntityDescriptor {
            merge_label,
            country,
            short_code_replica,
            short_code,
        })
        .collect())
}

fn entities_from_json(value: JsonValue) -> Result<Vec<EntityDescriptor>, ConfigError> {
    serde_json::from_value(value).map_err(|_| ConfigError::InvalidField {
        field: "entities",
        expected: "a list of {merge_label, country, short_code_replica, short_code} objects",
    })
}

impl ObtLoadRequest {
    /// Entities come from `entities` or the four parallel `countries*`
    /// arrays. `target_table` falls back to `default_target`.
    pub fn from_payload(payload: &Payload, default_target: Option<&TableRef>) -> Result<Self, TaskError> {
        let entities = match payload.get("entities") {
            Some(value) if !value.is_null() => entities_from_json(value.clone())?,
            _ => legacy_entities(payload)?,
        };
        let target = match optional_str(payload, "target_table")? {
            Some(raw) => TableRef::parse(raw).map_err(ConfigError::from)?,
            None => default_target
                .cloned()
                .ok_or(ConfigError::MissingField("target_table"))?,
        };
        Ok(Self { entities, target })
    }

    pub fn from_body(body: &[u8], default_target: Option<&TableRef>) -> Result<Self, TaskError> {
        Self::from_payload(&parse_payload(body)?, default_target)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EntitiesFile {
    List(Vec<EntityDescriptor>),
    Wrapped { entities: Vec<EntityDescriptor> },
}

/// Read entity descriptors from YAML (or JSON): a bare list or an
/// `entities:` key holding one.
pub fn load_entities_file(path: &Path) -> anyhow::Result<Vec<EntityDescriptor>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: EntitiesFile =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing entities from {}", path.display()))?;
    Ok(match parsed {
        EntitiesFile::List(entities) | EntitiesFile::Wrapped { entities } => entities,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ComposeReport {
    pub run_id: Uuid,
    pub target: String,
    pub entities: Vec<String>,
    pub message: String,
}

async fn load(ctx: &TaskContext, request: ObtLoadRequest, run_id: Uuid) -> Result<ComposeReport, TaskError> {
    let query = compose_union_query(
        &request.entities,
        &request.target,
        &ctx.config.source_naming,
        ctx.warehouse.dialect(),
    )
    .map_err(|err| {
        error!(error = %err, "could not compose OBT query");
        err
    })?;

    let _lease = ctx.locks.acquire(&request.target).await;
    if let Err(err) = ctx.warehouse.execute(&query).await {
        error!(error = %err, "Error executing query: {err}");
        return Err(TaskError::QueryExecution(err));
    }
    info!("Query executed successfully");
    Ok(ComposeReport {
        run_id,
        target: request.target.to_string(),
        entities: request.entities.iter().map(|e| e.merge_label.clone()).collect(),
        message: "Query executed successfully".to_string(),
    })
}

/// Compose and execute the OBT rebuild. Unlike the sync tasks every
/// failure here is returned to the caller.
pub async fn run_obt_load(ctx: &TaskContext, request: ObtLoadRequest) -> Result<ComposeReport, TaskError> {
    let run_id = Uuid::new_v4();
    let span = info_span!("obt_load", table = %request.target, %run_id, entities = request.entities.len());
    load(ctx, request, run_id).instrument(span).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{FakeAnalyzer, ScriptedReviewApi};
    use crate::SyncConfig;
    use revsync_storage::{MemoryWarehouse, WarehouseOp};

    fn entity(label: &str, country: &str) -> EntityDescriptor {
        EntityDescriptor {
            merge_label: label.into(),
            country: country.into(),
            short_code_replica: "mx".into(),
            short_code: "mx".into(),
        }
    }

    fn target() -> TableRef {
        TableRef::parse("analytics.obt.all_reviews").unwrap()
    }

    fn compact(sql: &str) -> String {
        sql.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn single_entity_has_no_dangling_separators() {
        let sql = compose_union_query(&[entity("mexico", "MX")], &target(), &SourceNaming::default(), Dialect::BigQuery)
            .unwrap();
        let flat = compact(&sql);
        assert!(flat.starts_with("CREATE OR REPLACE TABLE `analytics.obt.all_reviews` AS ( WITH mexico AS ("));
        assert!(flat.ends_with(") SELECT * FROM mexico )"));
        assert!(!sql.contains("UNION ALL"));
        assert!(!flat.contains("), SELECT"));
        assert!(flat.contains("FROM `client-mx.reviews_mx.app_mx_reviews` AS t1"));
        assert!(flat.contains("JOIN `client-mx.reviews_mx.app_mx_hf_complaints` AS t4 ON t1.id = t4.id"));
        assert!(flat.contains("'mexico' AS country, t1.review, t1.id,"));
        assert!(flat.contains("t4.order, t4.scan"));
    }

    #[test]
    fn two_entities_union_in_order() {
        let sql = compose_union_query(
            &[entity("mexico", "MX"), entity("chile", "CL")],
            &target(),
            &SourceNaming::default(),
            Dialect::BigQuery,
        )
        .unwrap();
        let flat = compact(&sql);
        assert!(flat.contains("SELECT * FROM mexico UNION ALL SELECT * FROM chile )"));
        assert!(flat.contains(") , chile AS (") || flat.contains("), chile AS ("));
        assert_eq!(sql.matches("UNION ALL").count(), 1);
        assert!(flat.contains("`client-cl.reviews_mx.app_mx_nlpapi_sentiment` AS t2"));
    }

    #[test]
    fn every_cte_selects_the_full_column_set() {
        let sql = compose_union_query(&[entity("mexico", "MX")], &target(), &SourceNaming::default(), Dialect::BigQuery)
            .unwrap();
        let select = sql.split("SELECT\n").nth(1).unwrap().split("    FROM").next().unwrap();
        assert_eq!(select.split(',').count(), 29);
    }

    #[test]
    fn postgres_dialect_quotes_reserved_columns() {
        let sql = compose_union_query(&[entity("mexico", "MX")], &target(), &SourceNaming::default(), Dialect::Postgres)
            .unwrap();
        assert!(sql.starts_with("DROP TABLE IF EXISTS \"analytics__obt\".\"all_reviews\";\nCREATE TABLE"));
        assert!(sql.contains("t4.\"order\""));
        assert!(sql.contains("\"client-mx__reviews_mx\".\"app_mx_hf_needs\" AS t3"));
    }

    #[test]
    fn postgres_reads_each_country_from_its_own_schema() {
        let sql = compose_union_query(
            &[entity("mexico", "MX"), entity("chile", "CL")],
            &target(),
            &SourceNaming::default(),
            Dialect::Postgres,
        )
        .unwrap();
        let (mexico, chile) = sql.split_once("chile AS (").unwrap();
        assert!(mexico.contains("\"client-mx__reviews_mx\".\"app_mx_reviews\" AS t1"));
        assert!(!mexico.contains("client-cl"));
        assert!(chile.contains("\"client-cl__reviews_mx\".\"app_mx_reviews\" AS t1"));
        assert!(!chile.contains("client-mx"));
    }

    #[test]
    fn invalid_entity_lists_are_rejected() {
        let naming = SourceNaming::default();
        let build = |entities: &[EntityDescriptor]| compose_union_query(entities, &target(), &naming, Dialect::BigQuery);

        assert!(matches!(build(&[]), Err(QueryBuildError::NoEntities)));
        assert!(matches!(
            build(&[entity("mexico; DROP", "MX")]),
            Err(QueryBuildError::InvalidLabel(_))
        ));
        for word in ["select", "ORDER", "all"] {
            assert!(matches!(
                build(&[entity(word, "MX")]),
                Err(QueryBuildError::ReservedLabel(label)) if label == word
            ));
        }
        assert!(matches!(
            build(&[entity("mexico", "MX"), entity("Mexico", "MX")]),
            Err(QueryBuildError::DuplicateLabel(_))
        ));
        let mut bad = entity("mexico", "MX");
        bad.short_code = "mx`".into();
        assert!(matches!(build(&[bad]), Err(QueryBuildError::InvalidCode { .. })));
        assert!(matches!(
            build(&[entity("mexico", "M X")]),
            Err(QueryBuildError::InvalidSource { .. })
        ));
    }

    #[test]
    fn payload_accepts_entities_or_parallel_arrays() {
        let req = ObtLoadRequest::from_body(
            br#"{"entities":[{"merge_label":"mexico","country":"MX","short_code_replica":"mx","short_code":"mx"}],
                "target_table":"analytics.obt.all_reviews"}"#,
            None,
        )
        .unwrap();
        assert_eq!(req.entities, vec![entity("mexico", "MX")]);
        assert_eq!(req.target, target());

        let legacy = ObtLoadRequest::from_body(
            br#"{"countries_merge":["mexico","chile"],"countries":["MX","CL"],
                "countries_short_replica":["mx","mx"],"countries_short":["mx","mx"]}"#,
            Some(&target()),
        )
        .unwrap();
        assert_eq!(legacy.entities, vec![entity("mexico", "MX"), entity("chile", "CL")]);
        assert_eq!(legacy.target, target());
    }

    #[test]
    fn payload_errors_are_client_errors() {
        let mismatched = ObtLoadRequest::from_body(
            br#"{"countries_merge":["mexico","chile"],"countries":["MX"],
                "countries_short_replica":["mx","mx"],"countries_short":["mx","mx"]}"#,
            Some(&target()),
        )
        .unwrap_err();
        assert!(matches!(
            mismatched,
            TaskError::QueryBuild(QueryBuildError::MismatchedLengths { countries: 1, .. })
        ));

        let no_target = ObtLoadRequest::from_body(br#"{"entities":[]}"#, None).unwrap_err();
        assert_eq!(no_target.to_string(), "missing required field `target_table`");

        let nothing = ObtLoadRequest::from_body(br#"{"target_table":"a.b.c"}"#, None).unwrap_err();
        assert_eq!(nothing.to_string(), "missing required field `entities`");

        for err in [mismatched, no_target, nothing] {
            assert!(err.is_client_error());
        }
    }

    #[test]
    fn entities_file_accepts_list_or_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("list.yaml");
        std::fs::write(
            &list,
            "- merge_label: mexico\n  country: MX\n  short_code_replica: mx\n  short_code: mx\n",
        )
        .unwrap();
        assert_eq!(load_entities_file(&list).unwrap(), vec![entity("mexico", "MX")]);

        let wrapped = dir.path().join("wrapped.json");
        std::fs::write(
            &wrapped,
            r#"{"entities":[{"merge_label":"chile","country":"CL","short_code_replica":"mx","short_code":"mx"}]}"#,
        )
        .unwrap();
        assert_eq!(load_entities_file(&wrapped).unwrap(), vec![entity("chile", "CL")]);

        assert!(load_entities_file(&dir.path().join("missing.yaml")).is_err());
    }

    fn context(warehouse: Arc<MemoryWarehouse>) -> TaskContext {
        TaskContext::new(
            SyncConfig::default(),
            warehouse,
            Arc::new(ScriptedReviewApi::default()),
            Arc::new(FakeAnalyzer::default()),
        )
    }

    #[tokio::test]
    async fn load_executes_composed_statement() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let ctx = context(warehouse.clone());
        let request = ObtLoadRequest {
            entities: vec![entity("mexico", "MX"), entity("chile", "CL")],
            target: target(),
        };
        let report = run_obt_load(&ctx, request).await.unwrap();
        assert_eq!(report.entities, vec!["mexico", "chile"]);
        assert_eq!(report.message, "Query executed successfully");

        let executed = warehouse.executed().await;
        assert_eq!(executed.len(), 1);
        assert!(executed[0].starts_with("CREATE OR REPLACE TABLE `analytics.obt.all_reviews`"));
    }

    #[tokio::test]
    async fn execution_failure_propagates() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        warehouse.fail_on(WarehouseOp::Execute).await;
        let ctx = context(warehouse);
        let request = ObtLoadRequest {
            entities: vec![entity("mexico", "MX")],
            target: target(),
        };
        let err = run_obt_load(&ctx, request).await.unwrap_err();
        assert!(matches!(err, TaskError::QueryExecution(_)));
        assert!(err.to_string().starts_with("Error executing query:"));
        assert!(!err.is_client_error());
    }

    #[tokio::test]
    async fn empty_entity_list_never_reaches_warehouse() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let ctx = context(warehouse.clone());
        let request = ObtLoadRequest {
            entities: vec![],
            target: target(),
        };
        let err = run_obt_load(&ctx, request).await.unwrap_err();
        assert!(matches!(err, TaskError::QueryBuild(QueryBuildError::NoEntities)));
        assert!(warehouse.calls().await.is_empty());
    }
}
