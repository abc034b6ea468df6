//! Trigger payload parsing shared by the HTTP and CLI entry points.

use revsync_core::TableRefError;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid or missing JSON payload")]
    MissingPayload,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
    #[error(transparent)]
    Table(#[from] TableRefError),
}

pub type Payload = Map<String, JsonValue>;

/// Decode a trigger body. Empty, malformed, non-object and empty-object
/// bodies are all treated as a missing payload.
pub fn parse_payload(body: &[u8]) -> Result<Payload, ConfigError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ConfigError::MissingPayload);
    }
    match serde_json::from_slice::<JsonValue>(body) {
        Ok(JsonValue::Object(map)) if !map.is_empty() => Ok(map),
        _ => Err(ConfigError::MissingPayload),
    }
}

pub fn optional_str<'a>(
    payload: &'a Payload,
    field: &'static str,
) -> Result<Option<&'a str>, ConfigError> {
    match payload.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.trim())),
        Some(_) => Err(ConfigError::InvalidField {
            field,
            expected: "a string",
        }),
    }
}

pub fn require_str<'a>(payload: &'a Payload, field: &'static str) -> Result<&'a str, ConfigError> {
    optional_str(payload, field)?.ok_or(ConfigError::MissingField(field))
}

/// A list of strings. `None` when the field is absent.
pub fn string_list(payload: &Payload, field: &'static str) -> Result<Option<Vec<String>>, ConfigError> {
    let invalid = ConfigError::InvalidField {
        field,
        expected: "a list of strings",
    };
    match payload.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|item| match item {
                JsonValue::String(s) => Some(s.trim().to_string()),
                JsonValue::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(Some)
            .ok_or(invalid),
        Some(_) => Err(invalid),
    }
}

/// `products` as the review API expects it: one string, ids joined with `;`.
pub fn products_param(payload: &Payload) -> Result<String, ConfigError> {
    let products = match payload.get("products") {
        Some(JsonValue::Array(_)) => string_list(payload, "products")?
            .unwrap_or_default()
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(";"),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => require_str(payload, "products")?.to_string(),
    };
    if products.is_empty() {
        return Err(ConfigError::MissingField("products"));
    }
    Ok(products)
}
