//! Projection of raw review records into [`ReviewRow`]s.
//!
//! Absent or unparseable fields become `None`; normalization never fails and
//! never drops or merges records.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use revsync_core::ReviewRow;
use serde_json::Value as JsonValue;

const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];

fn json_text(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn json_f64(value: &JsonValue, key: &str) -> Option<f64> {
    match value.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_i64(value: &JsonValue, key: &str) -> Option<i64> {
    match value.get(key)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_bool(value: &JsonValue, key: &str) -> Option<bool> {
    match value.get(key)? {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.naive_utc()))
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

pub fn normalize_review(record: &JsonValue) -> ReviewRow {
    ReviewRow {
        id: json_text(record, "id"),
        title: json_text(record, "title"),
        review: json_text(record, "review"),
        original_title: json_text(record, "original_title"),
        stars: json_f64(record, "stars"),
        iso: json_text(record, "iso"),
        version: json_text(record, "version"),
        date: json_text(record, "date").and_then(|d| parse_timestamp(&d)),
        deleted: json_bool(record, "deleted"),
        has_response: json_bool(record, "has_response"),
        product: json_i64(record, "product"),
        product_id: json_i64(record, "product_id"),
        store: json_text(record, "store"),
    }
}

pub fn normalize_reviews(records: &[JsonValue]) -> Vec<ReviewRow> {
    records.iter().map(normalize_review).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn full_record_projects_every_field() {
        let row = normalize_review(&json!({
            "id": "L2Fw",
            "title": "Love it",
            "review": "Works great",
            "original_title": "Me encanta",
            "stars": "5.00",
            "iso": "MX",
            "version": "3.2.1",
            "date": "2024-05-01T10:22:33",
            "deleted": false,
            "has_response": true,
            "product": 40328,
            "product_id": "40328",
            "store": "apple",
            "author": "ignored",
        }));
        assert_eq!(row.id.as_deref(), Some("L2Fw"));
        assert_eq!(row.stars, Some(5.0));
        assert_eq!(
            row.date,
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(10, 22, 33)
        );
        assert_eq!(row.deleted, Some(false));
        assert_eq!(row.has_response, Some(true));
        assert_eq!(row.product, Some(40328));
        assert_eq!(row.product_id, Some(40328));
        assert_eq!(row.store.as_deref(), Some("apple"));
    }

    #[test]
    fn missing_and_malformed_fields_become_null() {
        let row = normalize_review(&json!({"id": 17, "stars": null, "date": "yesterday", "deleted": "maybe"}));
        assert_eq!(row.id.as_deref(), Some("17"));
        assert_eq!(row.stars, None);
        assert_eq!(row.date, None);
        assert_eq!(row.deleted, None);
        assert_eq!(row.review, None);

        let empty = normalize_review(&json!("not an object"));
        assert_eq!(empty, ReviewRow::default());
    }

    #[test]
    fn batch_keeps_order_and_duplicates() {
        let rows = normalize_reviews(&[
            json!({"id": "a", "stars": 1}),
            json!({"id": "b"}),
            json!({"id": "a", "stars": 4}),
        ]);
        let ids = rows.iter().map(|r| r.id.as_deref().unwrap()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b", "a"]);
        assert_eq!(rows[2].stars, Some(4.0));
    }

    #[test]
    fn timestamps_accept_common_shapes() {
        assert!(parse_timestamp("2024-05-01 10:22:33").is_some());
        assert!(parse_timestamp("2024-05-01T10:22:33Z").is_some());
        assert!(parse_timestamp("2024-05-01T10:22:33.250").is_some());
        assert_eq!(
            parse_timestamp("2024-05-01"),
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(0, 0, 0)
        );
    }
}
