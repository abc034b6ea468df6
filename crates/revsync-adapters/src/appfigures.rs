use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::AUTHORIZATION;
use serde_json::Value as JsonValue;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::secrets::{secret_string, SecretProvider};
use crate::{AdapterError, HttpClientConfig};

pub const DEFAULT_BASE_URL: &str = "https://api.appfigures.com/v2";

/// One page request against the reviews endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewQuery {
    pub products: String,
    pub page: u32,
    /// Lower bound on review date; `None` fetches the full history.
    pub start: Option<NaiveDate>,
}

impl ReviewQuery {
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("products", self.products.clone()),
            ("page", self.page.to_string()),
        ];
        if let Some(start) = self.start {
            params.push(("start", start.format("%Y-%m-%d").to_string()));
        }
        params
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewPage {
    pub status: u16,
    /// `None` when the response carried no `reviews` array.
    pub reviews: Option<Vec<JsonValue>>,
}

impl ReviewPage {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn from_body(status: u16, body: &[u8]) -> Result<Self, AdapterError> {
        if !(200..300).contains(&status) {
            return Ok(Self {
                status,
                reviews: None,
            });
        }
        let value: JsonValue = serde_json::from_slice(body)
            .map_err(|err| AdapterError::Decode(format!("reviews page: {err}")))?;
        Ok(Self {
            status,
            reviews: value.get("reviews").and_then(JsonValue::as_array).cloned(),
        })
    }
}

#[async_trait]
pub trait ReviewApi: Send + Sync {
    /// Resolve credentials before the first page; failures are fatal to the task.
    async fn authorize(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn fetch_page(&self, query: &ReviewQuery) -> Result<ReviewPage, AdapterError>;
}

/// Reviews API client authenticated with a personal access token.
pub struct AppFiguresClient {
    http: reqwest::Client,
    base_url: String,
    secrets: Arc<dyn SecretProvider>,
    token_secret: String,
    token: OnceCell<String>,
}

impl AppFiguresClient {
    pub fn new(
        config: &HttpClientConfig,
        base_url: impl Into<String>,
        secrets: Arc<dyn SecretProvider>,
        token_secret: impl Into<String>,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            http: config.build_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secrets,
            token_secret: token_secret.into(),
            token: OnceCell::new(),
        })
    }

    async fn token(&self) -> Result<&str, AdapterError> {
        let token = self
            .token
            .get_or_try_init(|| async {
                let bytes = self.secrets.get_secret(&self.token_secret).await?;
                secret_string(&self.token_secret, bytes)
            })
            .await?;
        Ok(token.as_str())
    }
}

#[async_trait]
impl ReviewApi for AppFiguresClient {
    async fn authorize(&self) -> Result<(), AdapterError> {
        self.token().await.map(|_| ())
    }

    async fn fetch_page(&self, query: &ReviewQuery) -> Result<ReviewPage, AdapterError> {
        let token = self.token().await?;
        let url = format!("{}/reviews", self.base_url);
        let resp = self
            .http
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .query(&query.params())
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        debug!(page = query.page, status, bytes = body.len(), "reviews page fetched");
        ReviewPage::from_body(status, &body)
    }
}
