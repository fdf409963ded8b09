//! # Final child environment composition.
//!
//! Applied after a successful build, when the emitted environment actually
//! changed:
//!
//! 1. Start from the ambient OS environment — or nothing when `pristine`.
//! 2. Filter the ambient portion through the allow/deny globs (allowlist
//!    first, denylist wins). Emitted and custom variables bypass the globs.
//! 3. Overlay the emitted variables, then the customs; customs win over
//!    everything.
//!
//! `exec.env.pristine` short-circuits all of it: the result is exactly the
//! customs, or the empty map. The empty map is meaningful — it tells the
//! spawn layer to clear the environment rather than inherit.

use std::collections::HashMap;

use globset::{Glob, GlobMatcher};
use tracing::warn;

use crate::config::EnvSpec;

/// Composes the final child environment.
pub fn compose_child_env(
    emitted: &HashMap<String, String>,
    env_spec: &EnvSpec,
    pristine: bool,
    ambient: impl IntoIterator<Item = (String, String)>,
) -> HashMap<String, String> {
    let custom = parse_custom(env_spec.custom());

    if env_spec.pristine() {
        return custom;
    }

    let mut env: HashMap<String, String> = if pristine {
        HashMap::new()
    } else {
        ambient.into_iter().collect()
    };

    let allow = compile_globs(&env_spec.allowlist());
    if !allow.is_empty() {
        env.retain(|k, _| any_match(&allow, k));
    }
    let deny = compile_globs(&env_spec.denylist());
    if !deny.is_empty() {
        env.retain(|k, _| !any_match(&deny, k));
    }

    for (k, v) in emitted {
        env.insert(k.clone(), v.clone());
    }
    for (k, v) in custom {
        env.insert(k, v);
    }

    env
}

fn parse_custom(entries: &[String]) -> HashMap<String, String> {
    let mut custom = HashMap::with_capacity(entries.len());
    for entry in entries {
        match entry.split_once('=') {
            Some((k, v)) => {
                custom.insert(k.to_string(), v.to_string());
            }
            None => {
                warn!(target: "env", %entry, "ignoring custom entry without '='");
            }
        }
    }
    custom
}

/// Compiles shell-style globs; invalid patterns are dropped so they can never
/// match.
fn compile_globs(patterns: &[String]) -> Vec<GlobMatcher> {
    patterns
        .iter()
        .filter_map(|p| match Glob::new(p) {
            Ok(glob) => Some(glob.compile_matcher()),
            Err(e) => {
                warn!(target: "env", pattern = %p, error = %e, "ignoring invalid glob");
                None
            }
        })
        .collect()
}

fn any_match(globs: &[GlobMatcher], key: &str) -> bool {
    globs.iter().any(|g| g.is_match(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ambient(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn spec(
        allow: &[&str],
        deny: &[&str],
        custom: &[&str],
        pristine: Option<bool>,
    ) -> EnvSpec {
        EnvSpec {
            pristine,
            custom: Some(custom.iter().map(|s| s.to_string()).collect()),
            allowlist: Some(allow.iter().map(|s| s.to_string()).collect()),
            denylist: Some(deny.iter().map(|s| s.to_string()).collect()),
            ..EnvSpec::default()
        }
    }

    #[test]
    fn allow_then_deny() {
        // allowlist keeps PATH and HOME, denylist then removes HOME.
        let env = compose_child_env(
            &HashMap::new(),
            &spec(&["PATH", "HOME"], &["HO*"], &[], None),
            false,
            ambient(&[("PATH", "/x"), ("SECRET_A", "1"), ("HOME", "/h")]),
        );
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("PATH").map(String::as_str), Some("/x"));
    }

    #[test]
    fn emitted_bypasses_filters() {
        let mut emitted = HashMap::new();
        emitted.insert("APP_TOKEN".to_string(), "t".to_string());
        let env = compose_child_env(
            &emitted,
            &spec(&["PATH"], &["APP_*"], &[], None),
            false,
            ambient(&[("PATH", "/x"), ("HOME", "/h")]),
        );
        assert_eq!(env.get("APP_TOKEN").map(String::as_str), Some("t"));
        assert_eq!(env.get("PATH").map(String::as_str), Some("/x"));
        assert!(!env.contains_key("HOME"));
    }

    #[test]
    fn customs_bypass_filters_and_win() {
        let mut emitted = HashMap::new();
        emitted.insert("A".to_string(), "emitted".to_string());
        let env = compose_child_env(
            &emitted,
            &spec(&[], &["A", "B"], &["A=custom", "B=custom"], None),
            false,
            ambient(&[("B", "ambient")]),
        );
        assert_eq!(env.get("A").map(String::as_str), Some("custom"));
        assert_eq!(env.get("B").map(String::as_str), Some("custom"));
    }

    #[test]
    fn pristine_drops_ambient_keeps_emitted_and_custom() {
        let mut emitted = HashMap::new();
        emitted.insert("APP_A".to_string(), "1".to_string());
        let env = compose_child_env(
            &emitted,
            &spec(&[], &[], &["EXTRA=2"], None),
            true,
            ambient(&[("HOME", "/h"), ("PATH", "/x")]),
        );
        assert_eq!(env.len(), 2);
        assert_eq!(env.get("APP_A").map(String::as_str), Some("1"));
        assert_eq!(env.get("EXTRA").map(String::as_str), Some("2"));
    }

    #[test]
    fn env_pristine_is_exactly_customs() {
        let mut emitted = HashMap::new();
        emitted.insert("APP_A".to_string(), "1".to_string());
        let env = compose_child_env(
            &emitted,
            &spec(&[], &[], &["ONLY=this"], Some(true)),
            false,
            ambient(&[("HOME", "/h")]),
        );
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("ONLY").map(String::as_str), Some("this"));
    }

    #[test]
    fn env_pristine_without_customs_is_empty_not_inherit() {
        let env = compose_child_env(
            &HashMap::new(),
            &spec(&[], &[], &[], Some(true)),
            false,
            ambient(&[("HOME", "/h")]),
        );
        assert!(env.is_empty());
    }

    #[test]
    fn invalid_glob_never_matches() {
        let env = compose_child_env(
            &HashMap::new(),
            &spec(&[], &["[unclosed"], &[], None),
            false,
            ambient(&[("PATH", "/x")]),
        );
        assert_eq!(env.get("PATH").map(String::as_str), Some("/x"));
    }

    #[test]
    fn custom_without_separator_ignored() {
        let env = compose_child_env(
            &HashMap::new(),
            &spec(&[], &[], &["NOEQUALS"], None),
            true,
            Vec::new(),
        );
        assert!(env.is_empty());
    }
}
