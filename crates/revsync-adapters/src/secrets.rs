use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::AdapterError;

/// Source of credentials, queried lazily by the API clients.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<Vec<u8>, AdapterError>;
}

/// Decode a secret payload as trimmed UTF-8.
pub fn secret_string(name: &str, bytes: Vec<u8>) -> Result<String, AdapterError> {
    let text = String::from_utf8(bytes).map_err(|err| AdapterError::Secret {
        name: name.to_string(),
        reason: format!("not valid UTF-8: {err}"),
    })?;
    let text = text.trim();
    if text.is_empty() {
        return Err(AdapterError::Secret {
            name: name.to_string(),
            reason: "empty payload".to_string(),
        });
    }
    Ok(text.to_string())
}

/// Reads `<prefix><NAME>` from the environment, with `-` and `.` mapped to `_`.
#[derive(Debug, Clone)]
pub struct EnvSecretProvider {
    prefix: String,
}

impl Default for EnvSecretProvider {
    fn default() -> Self {
        Self::new("REVSYNC_SECRET_")
    }
}

impl EnvSecretProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_for(&self, name: &str) -> String {
        let suffix = name
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect::<String>();
        format!("{}{suffix}", self.prefix)
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<Vec<u8>, AdapterError> {
        let var = self.variable_for(name);
        std::env::var(&var)
            .map(String::into_bytes)
            .map_err(|err| AdapterError::Secret {
                name: name.to_string(),
                reason: format!("{var}: {err}"),
            })
    }
}

/// Reads one file per secret from a mounted directory.
#[derive(Debug, Clone)]
pub struct FileSecretProvider {
    dir: PathBuf,
}

impl FileSecretProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SecretProvider for FileSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<Vec<u8>, AdapterError> {
        if name.contains('/') || name.contains("..") {
            return Err(AdapterError::Secret {
                name: name.to_string(),
                reason: "secret names cannot contain path separators".to_string(),
            });
        }
        let path = self.dir.join(name);
        tokio::fs::read(&path)
            .await
            .map_err(|err| AdapterError::Secret {
                name: name.to_string(),
                reason: format!("reading {}: {err}", path.display()),
            })
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticSecretProvider {
    secrets: HashMap<String, Vec<u8>>,
}

impl StaticSecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<Vec<u8>, AdapterError> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| AdapterError::Secret {
                name: name.to_string(),
                reason: "not configured".to_string(),
            })
    }
}
