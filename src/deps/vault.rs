//! Secret read query and the decoded secret payload, including detection of
//! the nested KV-v2 `data`/`metadata` layout.

use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::ConfigError;

/// Declarative read of a single secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultReadQuery {
    path: String,
    id: String,
}

impl VaultReadQuery {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let path = path.trim().trim_matches('/').to_string();
        if path.is_empty() {
            return Err(ConfigError::MissingField {
                stanza: "secret",
                field: "path",
            });
        }
        let id = format!("vault.read({path})");
        Ok(Self { path, id })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Stable identity keying the snapshot and the prefix-config table.
    pub fn identity(&self) -> &str {
        &self.id
    }
}

/// A decoded secret: the data mapping plus the lease length the store
/// reported, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Secret {
    pub data: Map<String, Value>,
    pub lease_duration: Option<Duration>,
}

impl Secret {
    pub fn new(data: Map<String, Value>) -> Self {
        Self {
            data,
            lease_duration: None,
        }
    }

    /// Builds a secret from an arbitrary JSON value; non-object values yield
    /// an empty secret.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(data) => Self::new(data),
            _ => Self::default(),
        }
    }

    /// True when the payload uses the nested KV-v2 layout, detected by the
    /// presence of `metadata.version`.
    pub fn is_kv2(&self) -> bool {
        self.data
            .get("metadata")
            .and_then(Value::as_object)
            .map(|m| m.contains_key("version"))
            .unwrap_or(false)
    }

    /// The effective data mapping.
    ///
    /// For a KV-v2 payload the inner `data` object is returned; `None` means
    /// the secret was deleted (inner `data` absent or null). KV-v1 payloads
    /// are returned as-is.
    pub fn payload(&self) -> Option<&Map<String, Value>> {
        if self.is_kv2() {
            self.data.get("data").and_then(Value::as_object)
        } else {
            Some(&self.data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kv1_payload_is_passthrough() {
        let secret = Secret::from_value(json!({ "user": "x", "pass": "y" }));
        assert!(!secret.is_kv2());
        let payload = secret.payload().unwrap();
        assert_eq!(payload.get("user"), Some(&json!("x")));
    }

    #[test]
    fn kv2_payload_unwraps_inner_data() {
        let secret = Secret::from_value(json!({
            "data": { "k": "v" },
            "metadata": { "version": 1 }
        }));
        assert!(secret.is_kv2());
        let payload = secret.payload().unwrap();
        assert_eq!(payload.get("k"), Some(&json!("v")));
    }

    #[test]
    fn kv2_deleted_secret_has_no_payload() {
        let secret = Secret::from_value(json!({
            "data": null,
            "metadata": { "version": 2 }
        }));
        assert!(secret.is_kv2());
        assert!(secret.payload().is_none());
    }

    #[test]
    fn metadata_without_version_is_kv1() {
        let secret = Secret::from_value(json!({
            "metadata": { "note": "just a key named metadata" },
            "k": "v"
        }));
        assert!(!secret.is_kv2());
    }
}
