//! Clients for the external collaborators: secrets, the paginated review
//! API and the sentiment API, plus the raw-record normalizer.

use std::time::Duration;

use thiserror::Error;

mod appfigures;
mod language;
pub mod normalize;
mod secrets;

pub use appfigures::{
    AppFiguresClient, ReviewApi, ReviewPage, ReviewQuery, DEFAULT_BASE_URL as REVIEWS_API_URL,
};
pub use language::{
    parse_sentiment_response, LanguageApiClient, Sentiment, SentimentAnalyzer,
    DEFAULT_BASE_URL as LANGUAGE_API_URL,
};
pub use normalize::{normalize_review, normalize_reviews};
pub use secrets::{
    secret_string, EnvSecretProvider, FileSecretProvider, SecretProvider, StaticSecretProvider,
};

pub const CRATE_NAME: &str = "revsync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("secret {name} unavailable: {reason}")]
    Secret { name: String, reason: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> Result<reqwest::Client, AdapterError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);

        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(builder.build()?)
    }
}
