//! HTTP trigger surface: one POST route per task.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use revsync_sync::{
    run_obt_load, run_review_sync, run_sentiment_sync, ObtLoadRequest, ReviewSyncRequest,
    SentimentSyncRequest, TaskContext, TaskError,
};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "revsync-web";

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<TaskContext>,
}

impl AppState {
    pub fn new(ctx: TaskContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/reviews/sync", post(review_sync_handler))
        .route("/sentiment/sync", post(sentiment_sync_handler))
        .route("/obt/load", post(obt_load_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for task triggers");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn review_sync_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = match ReviewSyncRequest::from_body(&body) {
        Ok(request) => request,
        Err(err) => return task_error(err),
    };
    match run_review_sync(&state.ctx, request).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => task_error(err),
    }
}

async fn sentiment_sync_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = match SentimentSyncRequest::from_body(&body) {
        Ok(request) => request,
        Err(err) => return task_error(err),
    };
    match run_sentiment_sync(&state.ctx, request).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => task_error(err),
    }
}

async fn obt_load_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let default_target = match state.ctx.config.obt_target() {
        Ok(target) => target,
        Err(err) => return task_error(TaskError::Misconfigured(err)),
    };
    let request = match ObtLoadRequest::from_body(&body, default_target.as_ref()) {
        Ok(request) => request,
        Err(err) => return task_error(err),
    };
    match run_obt_load(&state.ctx, request).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => task_error(err),
    }
}

fn task_error(err: TaskError) -> Response {
    let status = if err.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    error!(status = status.as_u16(), error = %err, "task trigger rejected");
    (status, err.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use revsync_adapters::{AdapterError, ReviewApi, ReviewPage, ReviewQuery, Sentiment, SentimentAnalyzer};
    use revsync_core::TableRef;
    use revsync_storage::{MemoryWarehouse, WarehouseOp};
    use revsync_sync::SyncConfig;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct OnePageApi;

    #[async_trait]
    impl ReviewApi for OnePageApi {
        async fn fetch_page(&self, query: &ReviewQuery) -> Result<ReviewPage, AdapterError> {
            let reviews = if query.page == 1 {
                vec![json!({"id": "r1", "review": "fine", "date": "2024-04-01T12:00:00"})]
            } else {
                vec![]
            };
            Ok(ReviewPage {
                status: 200,
                reviews: Some(reviews),
            })
        }
    }

    struct NeutralAnalyzer;

    #[async_trait]
    impl SentimentAnalyzer for NeutralAnalyzer {
        async fn analyze(&self, _text: &str) -> Result<Sentiment, AdapterError> {
            Ok(Sentiment {
                score: 0.0,
                magnitude: 0.1,
            })
        }
    }

    fn state(warehouse: Arc<MemoryWarehouse>) -> AppState {
        state_with_obt_table(warehouse, "analytics.obt.all_reviews")
    }

    fn state_with_obt_table(warehouse: Arc<MemoryWarehouse>, obt_table: &str) -> AppState {
        let config = SyncConfig {
            obt_table: Some(obt_table.into()),
            ..SyncConfig::default()
        };
        AppState::new(TaskContext::new(
            config,
            warehouse,
            Arc::new(OnePageApi),
            Arc::new(NeutralAnalyzer),
        ))
    }

    fn post_json(uri: &str, body: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn missing_project_id_is_rejected_without_warehouse_calls() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let resp = app(state(warehouse.clone()))
            .oneshot(post_json(
                "/reviews/sync",
                r#"{"dataset_id":"ds","reviews_table_id":"reviews","products":"1"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(resp).await.contains("project_id"));
        assert!(warehouse.calls().await.is_empty());
    }

    #[tokio::test]
    async fn empty_body_is_a_client_error() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        for uri in ["/reviews/sync", "/sentiment/sync", "/obt/load"] {
            let resp = app(state(warehouse.clone()))
                .oneshot(post_json(uri, ""))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body_text(resp).await, "Invalid or missing JSON payload");
        }
        assert!(warehouse.calls().await.is_empty());
    }

    #[tokio::test]
    async fn other_methods_are_not_allowed() {
        let resp = app(state(Arc::new(MemoryWarehouse::new())))
            .oneshot(
                axum::http::Request::builder()
                    .uri("/reviews/sync")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn review_sync_returns_report() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let resp = app(state(warehouse.clone()))
            .oneshot(post_json(
                "/reviews/sync",
                r#"{"project_id":"proj","dataset_id":"ds","reviews_table_id":"reviews","products":["1","2"]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let report: Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(report["task"], "review_sync");
        assert_eq!(report["records_fetched"], 1);
        assert_eq!(report["degraded"], false);

        let target = TableRef::new("proj", "ds", "reviews").unwrap();
        assert_eq!(warehouse.table(&target).await.unwrap().rows.len(), 1);
    }

    #[tokio::test]
    async fn degraded_sync_still_returns_ok() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        warehouse.fail_on(WarehouseOp::Merge).await;
        let resp = app(state(warehouse))
            .oneshot(post_json(
                "/sentiment/sync",
                r#"{"project_id":"p","dataset_id":"d","reviews_table_id":"reviews","sentiment_table_id":"sentiment"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let report: Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(report["degraded"], true);
    }

    #[tokio::test]
    async fn obt_load_uses_configured_target() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let resp = app(state(warehouse.clone()))
            .oneshot(post_json(
                "/obt/load",
                r#"{"countries_merge":["mexico"],"countries":["MX"],"countries_short_replica":["mx"],"countries_short":["mx"]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let executed = warehouse.executed().await;
        assert!(executed[0].starts_with("CREATE OR REPLACE TABLE `analytics.obt.all_reviews`"));
    }

    #[tokio::test]
    async fn obt_load_failures_map_to_status() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let resp = app(state(warehouse.clone()))
            .oneshot(post_json("/obt/load", r#"{"entities":[]}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        warehouse.fail_on(WarehouseOp::Execute).await;
        let resp = app(state(warehouse))
            .oneshot(post_json(
                "/obt/load",
                r#"{"entities":[{"merge_label":"mexico","country":"MX","short_code_replica":"mx","short_code":"mx"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(resp).await.starts_with("Error executing query:"));
    }

    #[tokio::test]
    async fn invalid_configured_obt_table_is_a_server_error() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let resp = app(state_with_obt_table(warehouse.clone(), "not a table"))
            .oneshot(post_json(
                "/obt/load",
                r#"{"entities":[{"merge_label":"mexico","country":"MX","short_code_replica":"mx","short_code":"mx"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(resp).await.starts_with("server misconfigured:"));
        assert!(warehouse.calls().await.is_empty());
    }
}
