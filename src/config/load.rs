//! # Configuration loading.
//!
//! Documents are hierarchical JSON. A path given to [`from_path`] may be a
//! file or a directory; directories are walked recursively in lexicographic
//! order (symlinks are not followed) and every regular file is parsed and
//! merged in sequence.
//!
//! Before typed decoding, deprecated top-level keys are rewritten into their
//! modern nested locations with a warning (`auth`, `ssl`, `retry`, `splay`,
//! `timeout`, `token`); `path` is dropped. Unknown keys fail the load.

use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::error::ConfigError;

use super::model::Config;

/// Parses a single document.
pub fn parse(contents: &str) -> Result<Config, ConfigError> {
    parse_named(contents, Path::new("<inline>"))
}

/// Loads and parses one file.
pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_named(&contents, path)
}

/// Loads a file, or every regular file under a directory in lexicographic
/// walk order, merging in sequence.
pub fn from_path(path: &Path) -> Result<Config, ConfigError> {
    let meta = std::fs::metadata(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    if meta.is_dir() {
        let mut config = Config::default();
        for file in walk_sorted(path)? {
            config = config.merge(&from_file(&file)?);
        }
        Ok(config)
    } else {
        from_file(path)
    }
}

fn parse_named(contents: &str, path: &Path) -> Result<Config, ConfigError> {
    let decode_err = |reason: String| ConfigError::Decode {
        path: path.to_path_buf(),
        reason,
    };

    let mut value: Value =
        serde_json::from_str(contents).map_err(|e| decode_err(e.to_string()))?;

    let root = value
        .as_object_mut()
        .ok_or_else(|| decode_err("document root must be an object".to_string()))?;
    rewrite_deprecated(root);

    serde_json::from_value(value).map_err(|e| decode_err(e.to_string()))
}

/// Collects regular files under `dir`, depth-first, entries sorted by name at
/// each level. Symlinks are skipped entirely.
fn walk_sorted(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let read_err = |source: std::io::Error| ConfigError::Read {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(read_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?
        .into_iter()
        .map(|e| e.path())
        .collect();
    entries.sort();

    let mut files = Vec::new();
    for entry in entries {
        let meta = std::fs::symlink_metadata(&entry).map_err(|source| ConfigError::Read {
            path: entry.clone(),
            source,
        })?;
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            files.extend(walk_sorted(&entry)?);
        } else if meta.is_file() {
            files.push(entry);
        }
    }
    Ok(files)
}

/// Rewrites deprecated top-level keys into their nested locations.
fn rewrite_deprecated(root: &mut Map<String, Value>) {
    if let Some(auth) = root.remove("auth") {
        warn!(
            target: "config",
            "auth is now a child stanza inside consul; update auth {{}} to consul {{ auth {{ ... }} }}"
        );
        nested_object(root, "consul").insert("auth".to_string(), auth);
    }

    if let Some(ssl) = root.remove("ssl") {
        warn!(
            target: "config",
            "ssl is now a child stanza for both consul and vault; update ssl {{}} to consul {{ ssl {{ ... }} }} and vault {{ ssl {{ ... }} }}"
        );
        nested_object(root, "consul").insert("ssl".to_string(), ssl.clone());
        nested_object(root, "vault").insert("ssl".to_string(), ssl);
    }

    if let Some(retry) = root.remove("retry") {
        warn!(
            target: "config",
            "retry is now a child stanza for both consul and vault; update retry to consul {{ retry {{ ... }} }} and vault {{ retry {{ ... }} }}"
        );
        let rewritten = json!({ "backoff": retry, "max_backoff": retry });
        nested_object(root, "consul").insert("retry".to_string(), rewritten.clone());
        nested_object(root, "vault").insert("retry".to_string(), rewritten);
    }

    if let Some(splay) = root.remove("splay") {
        warn!(
            target: "config",
            "splay is now a child key of exec; update splay = ... to exec {{ splay = ... }}"
        );
        nested_object(root, "exec").insert("splay".to_string(), splay);
    }

    if let Some(timeout) = root.remove("timeout") {
        warn!(
            target: "config",
            "timeout is now exec.kill_timeout; update timeout = ... to exec {{ kill_timeout = ... }}"
        );
        nested_object(root, "exec").insert("kill_timeout".to_string(), timeout);
    }

    if let Some(token) = root.remove("token") {
        warn!(
            target: "config",
            "token is now a child key of consul; update token = ... to consul {{ token = ... }}"
        );
        nested_object(root, "consul").insert("token".to_string(), token);
    }

    if root.remove("path").is_some() {
        warn!(
            target: "config",
            "path is no longer a configuration key; remove it and use the CLI option instead"
        );
    }
}

fn nested_object<'a>(root: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let entry = root
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    match entry {
        Value::Object(map) => map,
        _ => unreachable!("entry was just made an object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_document() {
        let config = parse(
            r#"{
                "consul": { "address": "127.0.0.1:8500", "token": "abcd" },
                "vault": { "address": "https://127.0.0.1:8200" },
                "exec": {
                    "command": "server --port 8080",
                    "kill_timeout": "10s",
                    "env": { "denylist": ["AWS_*"] }
                },
                "wait": { "min": "150ms", "max": "2s" },
                "prefix": [ { "path": "app/config" } ],
                "secret": [ { "path": "secret/app", "no_prefix": true } ],
                "service": [ { "query": "redis" } ],
                "upcase": true,
                "pid_file": "/var/run/envisor.pid"
            }"#,
        )
        .unwrap();

        assert_eq!(config.prefixes().len(), 1);
        assert_eq!(config.secrets().len(), 1);
        assert_eq!(config.services()[0].query.as_deref(), Some("redis"));
        assert_eq!(config.upcase, Some(true));
        assert_eq!(
            config.exec().kill_timeout(),
            std::time::Duration::from_secs(10)
        );
    }

    #[test]
    fn unknown_keys_fail() {
        let err = parse(r#"{ "nonsense": true }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Decode { .. }));
    }

    #[test]
    fn unknown_nested_keys_fail() {
        let err = parse(r#"{ "exec": { "comand": "typo" } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Decode { .. }));
    }

    #[test]
    fn deprecated_token_moves_into_consul() {
        let config = parse(r#"{ "token": "abcd" }"#).unwrap();
        assert_eq!(config.consul().token.as_deref(), Some("abcd"));
    }

    #[test]
    fn deprecated_ssl_fans_out() {
        let config = parse(r#"{ "ssl": { "enabled": true, "verify": false } }"#).unwrap();
        assert!(config.consul().ssl().enabled());
        assert!(config.vault().ssl().enabled());
        assert!(!config.vault().ssl().verify());
    }

    #[test]
    fn deprecated_timeout_becomes_kill_timeout() {
        let config = parse(r#"{ "timeout": "5s" }"#).unwrap();
        assert_eq!(
            config.exec().kill_timeout(),
            std::time::Duration::from_secs(5)
        );
    }

    #[test]
    fn deprecated_path_is_dropped() {
        let config = parse(r#"{ "path": "ignored", "upcase": true }"#).unwrap();
        assert_eq!(config.upcase, Some(true));
    }

    #[test]
    fn directory_merge_is_lexicographic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("10-base.json"),
            r#"{ "pid_file": "/tmp/base.pid", "prefix": [ { "path": "app/a" } ] }"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("20-override.json"),
            r#"{ "pid_file": "/tmp/override.pid", "prefix": [ { "path": "app/b" } ] }"#,
        )
        .unwrap();

        let config = from_path(dir.path()).unwrap();
        assert_eq!(config.pid_file.as_deref(), Some("/tmp/override.pid"));
        let paths: Vec<_> = config
            .prefixes()
            .iter()
            .map(|p| p.path.clone().unwrap())
            .collect();
        assert_eq!(paths, vec!["app/a", "app/b"]);
    }

    #[test]
    fn missing_path_errors() {
        let err = from_path(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
