use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::OnceCell;

use crate::secrets::{secret_string, SecretProvider};
use crate::{AdapterError, HttpClientConfig};

pub const DEFAULT_BASE_URL: &str = "https://language.googleapis.com/v1";

/// Document-level sentiment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub score: f64,
    pub magnitude: f64,
}

#[async_trait]
pub trait SentimentAnalyzer: Send + Sync {
    /// Resolve credentials before the first document; failures are fatal to the task.
    async fn authorize(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn analyze(&self, text: &str) -> Result<Sentiment, AdapterError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeSentimentResponse {
    document_sentiment: Option<DocumentSentiment>,
}

// Zero-valued fields are omitted from the JSON encoding.
#[derive(Debug, Deserialize)]
struct DocumentSentiment {
    #[serde(default)]
    score: f64,
    #[serde(default)]
    magnitude: f64,
}

pub fn parse_sentiment_response(body: &[u8]) -> Result<Sentiment, AdapterError> {
    let resp: AnalyzeSentimentResponse = serde_json::from_slice(body)
        .map_err(|err| AdapterError::Decode(format!("analyzeSentiment: {err}")))?;
    let doc = resp
        .document_sentiment
        .ok_or_else(|| AdapterError::Decode("analyzeSentiment: no documentSentiment".to_string()))?;
    Ok(Sentiment {
        score: doc.score,
        magnitude: doc.magnitude,
    })
}

/// `documents:analyzeSentiment` client keyed by an API key secret.
pub struct LanguageApiClient {
    http: reqwest::Client,
    base_url: String,
    secrets: Arc<dyn SecretProvider>,
    key_secret: String,
    key: OnceCell<String>,
}

impl LanguageApiClient {
    pub fn new(
        config: &HttpClientConfig,
        base_url: impl Into<String>,
        secrets: Arc<dyn SecretProvider>,
        key_secret: impl Into<String>,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            http: config.build_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secrets,
            key_secret: key_secret.into(),
            key: OnceCell::new(),
        })
    }

    async fn api_key(&self) -> Result<&str, AdapterError> {
        let key = self
            .key
            .get_or_try_init(|| async {
                let bytes = self.secrets.get_secret(&self.key_secret).await?;
                secret_string(&self.key_secret, bytes)
            })
            .await?;
        Ok(key.as_str())
    }
}

#[async_trait]
impl SentimentAnalyzer for LanguageApiClient {
    async fn authorize(&self) -> Result<(), AdapterError> {
        self.api_key().await.map(|_| ())
    }

    async fn analyze(&self, text: &str) -> Result<Sentiment, AdapterError> {
        let key = self.api_key().await?;
        let url = format!("{}/documents:analyzeSentiment", self.base_url);
        let resp = self
            .http
            .post(&url)
            .query(&[("key", key)])
            .json(&json!({
                "document": { "type": "PLAIN_TEXT", "content": text },
                "encodingType": "UTF8",
            }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AdapterError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let body = resp.bytes().await?;
        parse_sentiment_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_document_sentiment() {
        let body = br#"{"documentSentiment":{"magnitude":1.6,"score":-0.4},"language":"en","sentences":[]}"#;
        assert_eq!(
            parse_sentiment_response(body).unwrap(),
            Sentiment {
                score: -0.4,
                magnitude: 1.6
            }
        );
    }

    #[test]
    fn omitted_zero_fields_default() {
        let body = br#"{"documentSentiment":{"magnitude":0.2}}"#;
        let sentiment = parse_sentiment_response(body).unwrap();
        assert_eq!(sentiment.score, 0.0);
        assert_eq!(sentiment.magnitude, 0.2);
    }

    #[test]
    fn missing_document_sentiment_is_an_error() {
        assert!(matches!(
            parse_sentiment_response(br#"{"language":"en"}"#),
            Err(AdapterError::Decode(_))
        ));
    }
}
