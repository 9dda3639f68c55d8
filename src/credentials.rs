//! Credential lookup for nodes.
//!
//! Nodes reference a credential by id; the engine resolves it through a
//! [`CredentialProvider`] right before the call. Decrypted field values are
//! zeroized when dropped and never appear in `Debug` output, logs, or
//! monitor events.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Field names whose values are always redacted.
pub const SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "access_key",
    "secret_access_key",
    "private_key",
    "authorization",
    "cookie",
    "credential",
];

const REDACTED: &str = "[REDACTED]";

/// Prefix for environment-backed credentials.
pub const ENV_CREDENTIAL_PREFIX: &str = "FLOWRUN_CREDENTIAL_";

/// Decrypted credential fields.
#[derive(Clone, Default)]
pub struct CredentialData(HashMap<String, String>);

impl CredentialData {
    pub fn new(fields: HashMap<String, String>) -> Self {
        Self(fields)
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        if let Some(mut old) = self.0.insert(field.into(), value.into()) {
            old.zeroize();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Replace every credential value occurring in `text`.
    pub fn scrub(&self, text: &str) -> String {
        let mut out = text.to_string();
        for value in self.0.values().filter(|v| v.len() >= 4) {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), REDACTED);
            }
        }
        out
    }

    /// Build from a JSON object of string (or scalar) fields.
    pub fn from_json(value: &Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::Credential("credential data must be an object".to_string()))?;
        let mut data = Self::default();
        for (field, v) in map {
            let text = match v {
                Value::String(s) => s.clone(),
                Value::Null => continue,
                other => other.to_string(),
            };
            data.insert(field.clone(), text);
        }
        Ok(data)
    }
}

impl Drop for CredentialData {
    fn drop(&mut self) {
        for value in self.0.values_mut() {
            value.zeroize();
        }
    }
}

impl std::fmt::Debug for CredentialData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut fields: Vec<&str> = self.0.keys().map(String::as_str).collect();
        fields.sort_unstable();
        f.debug_struct("CredentialData")
            .field("fields", &fields)
            .field("values", &REDACTED)
            .finish()
    }
}

/// Source of decrypted credential data.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_credential_data(&self, id: &str) -> Result<CredentialData>;
}

/// Credentials held in memory (tests, CLI runs).
#[derive(Default)]
pub struct InMemoryCredentialProvider {
    credentials: RwLock<HashMap<String, CredentialData>>,
}

impl InMemoryCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, data: CredentialData) {
        self.credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), data);
    }
}

#[async_trait]
impl CredentialProvider for InMemoryCredentialProvider {
    async fn get_credential_data(&self, id: &str) -> Result<CredentialData> {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Credential(format!("credential '{}' not found", id)))
    }
}

/// Credentials from `FLOWRUN_CREDENTIAL_<ID>` environment variables, each
/// holding a JSON object of fields.
#[derive(Debug, Default)]
pub struct EnvCredentialProvider;

impl EnvCredentialProvider {
    pub fn env_var_name(id: &str) -> String {
        let normalized: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}{}", ENV_CREDENTIAL_PREFIX, normalized)
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn get_credential_data(&self, id: &str) -> Result<CredentialData> {
        let name = Self::env_var_name(id);
        let mut raw = std::env::var(&name)
            .map_err(|_| Error::Credential(format!("credential '{}' not found", id)))?;
        let parsed: std::result::Result<Value, _> = serde_json::from_str(&raw);
        raw.zeroize();
        let value = parsed
            .map_err(|_| Error::Credential(format!("credential '{}' is not valid JSON", id)))?;
        CredentialData::from_json(&value)
    }
}

/// True if a field name looks like it holds a secret.
pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase().replace('-', "_");
    SENSITIVE_FIELDS.iter().any(|f| lowered.contains(f))
}

/// Copy of `value` with sensitive fields replaced, recursively.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive_key(k) && !v.is_null() {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Mask a credential value for display.
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..2].iter().collect();
        let tail: String = chars[chars.len() - 2..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_debug_never_prints_values() {
        let mut data = CredentialData::default();
        data.insert("api_key", "sk-live-123456");
        let debug = format!("{:?}", data);
        assert!(debug.contains("api_key"));
        assert!(!debug.contains("sk-live-123456"));
    }

    #[test]
    fn test_scrub_and_redact() {
        let mut data = CredentialData::default();
        data.insert("token", "abcd1234");
        assert_eq!(data.scrub("bad token abcd1234 given"), "bad token [REDACTED] given");

        let redacted = redact(&json!({
            "url": "https://x",
            "headers": {"Authorization": "Bearer t", "Accept": "json"},
            "items": [{"password": "p"}]
        }));
        assert_eq!(redacted["headers"]["Authorization"], "[REDACTED]");
        assert_eq!(redacted["headers"]["Accept"], "json");
        assert_eq!(redacted["items"][0]["password"], "[REDACTED]");
        assert_eq!(redacted["url"], "https://x");
    }

    #[test]
    fn test_mask_value() {
        assert_eq!(mask_value("abc"), "***");
        assert_eq!(mask_value("secretvalue"), "se...ue");
    }

    #[tokio::test]
    async fn test_in_memory_provider() {
        let provider = InMemoryCredentialProvider::new();
        provider.insert(
            "sendgrid",
            CredentialData::from_json(&json!({"api_key": "SG.x", "port": 587})).unwrap(),
        );
        let data = provider.get_credential_data("sendgrid").await.unwrap();
        assert_eq!(data.get("api_key"), Some("SG.x"));
        assert_eq!(data.get("port"), Some("587"));
        assert!(matches!(
            provider.get_credential_data("nope").await,
            Err(Error::Credential(_))
        ));
    }

    #[tokio::test]
    async fn test_env_provider() {
        assert_eq!(EnvCredentialProvider::env_var_name("my-db"), "FLOWRUN_CREDENTIAL_MY_DB");
        std::env::set_var("FLOWRUN_CREDENTIAL_TEST_ENV_PROVIDER", r#"{"user":"u","password":"p"}"#);
        let data = EnvCredentialProvider
            .get_credential_data("test_env_provider")
            .await
            .unwrap();
        assert_eq!(data.get("user"), Some("u"));
        std::env::remove_var("FLOWRUN_CREDENTIAL_TEST_ENV_PROVIDER");
    }
}
