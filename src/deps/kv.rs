//! KV list query: all pairs under a path in the hierarchical store.

use crate::error::ConfigError;

/// Declarative query for every key/value pair under `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvListQuery {
    path: String,
    id: String,
}

impl KvListQuery {
    /// Creates the query. The path must be non-empty; a trailing slash is
    /// stripped so `app/` and `app` share an identity.
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let path = path.trim().trim_end_matches('/').to_string();
        if path.is_empty() {
            return Err(ConfigError::MissingField {
                stanza: "prefix",
                field: "path",
            });
        }
        let id = format!("kv.list({path})");
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

/// One decoded key/value pair, key relative to the queried path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: String,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_and_distinct() {
        let a = KvListQuery::new("app/config").unwrap();
        let b = KvListQuery::new("app/config/").unwrap();
        let c = KvListQuery::new("app/other").unwrap();
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
    }

    #[test]
    fn empty_path_rejected() {
        assert!(KvListQuery::new("  ").is_err());
    }
}
