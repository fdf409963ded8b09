//! # Emission stanzas: `prefix`, `secret`, `service`, `exec`.
//!
//! These drive what the supervisor watches and how the child is run. Every
//! field is optional during load so that documents can be merged; accessors
//! provide the finalized view with defaults applied.

use std::time::Duration;

use nix::sys::signal::Signal;
use serde::Deserialize;

use super::convert;

/// Default grace period between the kill signal and SIGKILL.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default signal used to stop the child.
pub const DEFAULT_CHILD_KILL_SIGNAL: Signal = Signal::SIGINT;

/// A source root to read from the KV store (`prefix`) or the secrets store
/// (`secret`).
///
/// The same shape serves both stanzas; the prefixing default differs by
/// source (see [`PrefixSpec::no_prefix`]).
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PrefixSpec {
    /// Path under the source root. Secret paths may reference the OS
    /// environment via `{{env "VAR"}}`.
    pub path: Option<String>,

    /// Three-valued prefix control. `None` means "not set in config":
    /// KV omits the path prefix unless this is explicitly `false`; secrets
    /// include it unless this is explicitly `true`.
    pub no_prefix: Option<bool>,

    /// Optional template applied to every emitted key (`{{key}}` bound).
    pub format: Option<String>,

    /// Per-key selection and formatting; secret sources only. When present
    /// (and no global `format` is set), only listed keys are emitted.
    pub keys: Option<Vec<KeyFormat>>,
}

impl PrefixSpec {
    /// Convenience constructor used by the CLI overlay.
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }
}

/// One entry of a secret stanza's `keys` list.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KeyFormat {
    /// The secret data key this entry applies to.
    pub name: Option<String>,
    /// Template producing the emitted key (`{{key}}` bound to `name`).
    pub format: Option<String>,
}

/// A service catalog query and the per-field key formats.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    /// Service name to query.
    pub query: Option<String>,
    /// Format for the `<name>/id` key (`{{service}}`/`{{key}}` bound).
    pub format_id: Option<String>,
    /// Format for the `<name>/name` key.
    pub format_name: Option<String>,
    /// Format for the `<name>/address` key.
    pub format_address: Option<String>,
    /// Format for the `<name>/tag` key.
    pub format_tag: Option<String>,
    /// Format for the `<name>/port` key.
    pub format_port: Option<String>,
}

impl ServiceSpec {
    pub fn from_query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }
}

/// The child process stanza.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecSpec {
    /// Command line. Shell metacharacters force an `sh -c` wrapper running
    /// in its own process group.
    pub command: Option<String>,

    /// Signal forwarded to the child on supervisor reload.
    #[serde(default, deserialize_with = "convert::opt_signal")]
    pub reload_signal: Option<Signal>,

    /// Signal used to stop the child gracefully.
    #[serde(default, deserialize_with = "convert::opt_signal")]
    pub kill_signal: Option<Signal>,

    /// Grace period before escalating to SIGKILL.
    #[serde(default, deserialize_with = "convert::opt_duration")]
    pub kill_timeout: Option<Duration>,

    /// Random delay applied before the child starts.
    #[serde(default, deserialize_with = "convert::opt_duration")]
    pub splay: Option<Duration>,

    /// Environment shaping for the child.
    pub env: Option<EnvSpec>,
}

impl ExecSpec {
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            command: other.command.clone().or_else(|| self.command.clone()),
            reload_signal: other.reload_signal.or(self.reload_signal),
            kill_signal: other.kill_signal.or(self.kill_signal),
            kill_timeout: other.kill_timeout.or(self.kill_timeout),
            splay: other.splay.or(self.splay),
            env: match (&self.env, &other.env) {
                (Some(a), Some(b)) => Some(a.merge(b)),
                (a, b) => b.clone().or_else(|| a.clone()),
            },
        }
    }

    pub fn kill_signal(&self) -> Signal {
        self.kill_signal.unwrap_or(DEFAULT_CHILD_KILL_SIGNAL)
    }

    pub fn kill_timeout(&self) -> Duration {
        self.kill_timeout.unwrap_or(DEFAULT_KILL_TIMEOUT)
    }

    pub fn splay(&self) -> Duration {
        self.splay.unwrap_or(Duration::ZERO)
    }

    pub fn env_spec(&self) -> EnvSpec {
        self.env.clone().unwrap_or_default()
    }
}

/// Environment shaping for the child: customs, pristine short-circuit, and
/// allow/deny glob lists for the inherited portion.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvSpec {
    /// When true the final environment is exactly the custom entries (or
    /// empty) regardless of everything else.
    pub pristine: Option<bool>,

    /// `KEY=VALUE` entries overlaid last; they win over every other source
    /// and bypass the filters.
    pub custom: Option<Vec<String>>,

    /// Globs selecting which inherited variables to keep.
    pub allowlist: Option<Vec<String>>,

    /// Deprecated alias for `allowlist`; unioned in, order preserved.
    #[serde(rename = "whitelist")]
    pub allowlist_deprecated: Option<Vec<String>>,

    /// Globs removing inherited variables; wins over the allowlist.
    pub denylist: Option<Vec<String>>,

    /// Deprecated alias for `denylist`; unioned in, order preserved.
    #[serde(rename = "blacklist")]
    pub denylist_deprecated: Option<Vec<String>>,
}

impl EnvSpec {
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            pristine: other.pristine.or(self.pristine),
            custom: other.custom.clone().or_else(|| self.custom.clone()),
            allowlist: other.allowlist.clone().or_else(|| self.allowlist.clone()),
            allowlist_deprecated: other
                .allowlist_deprecated
                .clone()
                .or_else(|| self.allowlist_deprecated.clone()),
            denylist: other.denylist.clone().or_else(|| self.denylist.clone()),
            denylist_deprecated: other
                .denylist_deprecated
                .clone()
                .or_else(|| self.denylist_deprecated.clone()),
        }
    }

    pub fn pristine(&self) -> bool {
        self.pristine.unwrap_or(false)
    }

    pub fn custom(&self) -> &[String] {
        self.custom.as_deref().unwrap_or_default()
    }

    /// The effective allowlist: modern list plus deprecated alias, order
    /// preserved, duplicates dropped.
    pub fn allowlist(&self) -> Vec<String> {
        combine_lists(
            self.allowlist.as_deref().unwrap_or_default(),
            self.allowlist_deprecated.as_deref().unwrap_or_default(),
        )
    }

    /// The effective denylist, combined the same way.
    pub fn denylist(&self) -> Vec<String> {
        combine_lists(
            self.denylist.as_deref().unwrap_or_default(),
            self.denylist_deprecated.as_deref().unwrap_or_default(),
        )
    }
}

/// Appends values from `b` missing from `a`, preserving order.
fn combine_lists(a: &[String], b: &[String]) -> Vec<String> {
    let mut combined: Vec<String> = a.to_vec();
    for v in b {
        if !combined.contains(v) {
            combined.push(v.clone());
        }
    }
    combined
}

/// Quiescence timers: `min` is settle time re-armed on every change, `max`
/// the absolute cap from the first change in a window.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitSpec {
    pub enabled: Option<bool>,

    #[serde(default, deserialize_with = "convert::opt_duration")]
    pub min: Option<Duration>,

    #[serde(default, deserialize_with = "convert::opt_duration")]
    pub max: Option<Duration>,
}

impl WaitSpec {
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            enabled: other.enabled.or(self.enabled),
            min: other.min.or(self.min),
            max: other.max.or(self.max),
        }
    }

    /// Providing timers without `enabled` activates the stanza.
    pub fn finalize(&mut self) {
        if self.enabled.is_none() {
            self.enabled = Some(self.min.is_some());
        }
        if self.min.is_none() {
            self.min = Some(Duration::ZERO);
        }
        if self.max.is_none() {
            // The conventional cap is 4x the settle time.
            self.max = Some(self.min.unwrap_or(Duration::ZERO) * 4);
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    pub fn min(&self) -> Duration {
        self.min.unwrap_or(Duration::ZERO)
    }

    pub fn max(&self) -> Duration {
        self.max.unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_preserves_order_and_dedups() {
        let a = vec!["PATH".to_string(), "HOME".to_string()];
        let b = vec!["HOME".to_string(), "TERM".to_string()];
        assert_eq!(combine_lists(&a, &b), vec!["PATH", "HOME", "TERM"]);
    }

    #[test]
    fn exec_merge_right_biases() {
        let base = ExecSpec {
            command: Some("sleep 1".into()),
            kill_timeout: Some(Duration::from_secs(5)),
            ..ExecSpec::default()
        };
        let over = ExecSpec {
            command: Some("sleep 2".into()),
            ..ExecSpec::default()
        };
        let merged = base.merge(&over);
        assert_eq!(merged.command.as_deref(), Some("sleep 2"));
        assert_eq!(merged.kill_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn wait_finalize_enables_on_min() {
        let mut wait = WaitSpec {
            min: Some(Duration::from_millis(100)),
            ..WaitSpec::default()
        };
        wait.finalize();
        assert!(wait.enabled());
        assert_eq!(wait.max(), Duration::from_millis(400));
    }

    #[test]
    fn wait_finalize_stays_disabled_without_timers() {
        let mut wait = WaitSpec::default();
        wait.finalize();
        assert!(!wait.enabled());
    }

    #[test]
    fn env_lists_union_deprecated_aliases() {
        let env = EnvSpec {
            allowlist: Some(vec!["PATH".into()]),
            allowlist_deprecated: Some(vec!["HOME".into(), "PATH".into()]),
            ..EnvSpec::default()
        };
        assert_eq!(env.allowlist(), vec!["PATH", "HOME"]);
    }
}
