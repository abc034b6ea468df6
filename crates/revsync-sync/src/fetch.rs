use chrono::NaiveDate;
use revsync_adapters::{ReviewApi, ReviewQuery};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

/// Why pagination ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStop {
    /// A page came back with an empty record list.
    Exhausted,
    /// A page came back without a record list.
    NoRecords,
    /// A page came back with a non-success status.
    HttpStatus(u16),
    /// A request or decode error aborted the loop.
    Failed(String),
}

impl FetchStop {
    pub fn is_failure(&self) -> bool {
        matches!(self, FetchStop::HttpStatus(_) | FetchStop::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Records of every page that carried any, in page order.
    pub records: Vec<JsonValue>,
    /// Pages that contributed records.
    pub pages: u32,
    pub stop: FetchStop,
}

/// Walk pages 1, 2, ... until the API runs dry, refuses, or errors. Records
/// from pages fetched before an error are kept.
pub async fn fetch_all(api: &dyn ReviewApi, products: &str, start: Option<NaiveDate>) -> FetchOutcome {
    let mut records = Vec::new();
    let mut pages = 0u32;
    let mut page = 1u32;

    let stop = loop {
        let query = ReviewQuery {
            products: products.to_string(),
            page,
            start,
        };
        match api.fetch_page(&query).await {
            Ok(resp) if !resp.is_success() => break FetchStop::HttpStatus(resp.status),
            Ok(resp) => match resp.reviews {
                None => break FetchStop::NoRecords,
                Some(batch) if batch.is_empty() => break FetchStop::Exhausted,
                Some(batch) => {
                    records.extend(batch);
                    pages += 1;
                    page += 1;
                }
            },
            Err(err) => {
                warn!(page, error = %err, "review fetch aborted, keeping pages fetched so far");
                break FetchStop::Failed(err.to_string());
            }
        }
    };

    if let FetchStop::HttpStatus(status) = stop {
        warn!(page, status, "review API returned a non-success status");
    }
    info!(pages, records = records.len(), "Total pages processed: {pages}");
    FetchOutcome {
        records,
        pages,
        stop,
    }
}
