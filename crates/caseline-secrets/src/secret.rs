//! Structured secret payloads.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SecretsError, SecretsResult};

/// A structured secret blob: string keys mapped to JSON values, plus the
/// version identifier the secret service assigned to it (if any).
///
/// The `Debug` impl prints field names only. Values never reach logs.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(flatten)]
    fields: BTreeMap<String, Value>,
}

impl SecretValue {
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self {
            version: None,
            fields,
        }
    }

    /// Build a secret from string pairs (typical for credential secrets).
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let fields = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        Self::new(fields)
    }

    /// Parse a JSON object into a secret. Anything but an object is rejected.
    pub fn from_json(name: &str, raw: &str) -> SecretsResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| SecretsError::malformed(name, format!("invalid json: {e}")))?;
        match value {
            Value::Object(_) => serde_json::from_value(value)
                .map_err(|e| SecretsError::malformed(name, e.to_string())),
            other => Err(SecretsError::malformed(
                name,
                format!("expected a json object, found {}", json_kind(&other)),
            )),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// String value of `key`, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Like [`get_str`](Self::get_str) but reports a missing or non-string
    /// field as [`SecretsError::MissingField`].
    pub fn require_str(&self, secret_name: &str, key: &str) -> SecretsResult<&str> {
        self.get_str(key).ok_or_else(|| SecretsError::MissingField {
            name: secret_name.to_string(),
            field: key.to_string(),
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("version", &self.version)
            .field("keys", &self.fields.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_json_reads_fields_and_version() {
        let secret = SecretValue::from_json(
            "db",
            r#"{"version": "v7", "username": "app", "password": "hunter2", "port": 3306}"#,
        )
        .unwrap();

        assert_eq!(secret.version(), Some("v7"));
        assert_eq!(secret.get_str("username"), Some("app"));
        assert_eq!(secret.get("port"), Some(&Value::from(3306)));
        assert_eq!(secret.len(), 3);
    }

    #[test]
    fn from_json_rejects_non_objects() {
        let err = SecretValue::from_json("db", r#"["a", "b"]"#).unwrap_err();
        assert!(matches!(err, SecretsError::Malformed { .. }));
        assert!(err.to_string().contains("an array"));

        let err = SecretValue::from_json("db", "{not json").unwrap_err();
        assert!(matches!(err, SecretsError::Malformed { .. }));
    }

    #[test]
    fn require_str_reports_missing_field() {
        let secret = SecretValue::from_pairs([("username", "app")]);
        assert_eq!(secret.require_str("db", "username").unwrap(), "app");

        let err = secret.require_str("db", "password").unwrap_err();
        assert!(matches!(
            err,
            SecretsError::MissingField { ref field, .. } if field == "password"
        ));
    }

    #[test]
    fn debug_redacts_values() {
        let secret = SecretValue::from_pairs([("username", "app"), ("password", "hunter2")])
            .with_version("3");
        let rendered = format!("{secret:?}");
        assert!(rendered.contains("password"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("\"app\""));
    }
}
