//! # The typed configuration tree.
//!
//! [`Config`] mirrors the document structure: stanzas for the two sources
//! (`consul`, `vault`), the child (`exec`), `syslog`, quiescence (`wait`),
//! the emission lists (`prefix`, `secret`, `service`), and top-level scalars.
//!
//! Every field is optional while documents are loaded and merged; `merge` is
//! right-biased for scalars and concatenates the emission lists, and
//! `finalize` resolves the cross-field defaults. Unknown keys anywhere in the
//! tree are load errors.

use std::time::Duration;

use nix::sys::signal::Signal;
use serde::Deserialize;

use super::convert;
use super::specs::{ExecSpec, PrefixSpec, ServiceSpec, WaitSpec};

/// Default logging level.
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// Default staleness allowed for KV reads. Stale reads are on by default for
/// performance.
pub const DEFAULT_MAX_STALE: Duration = Duration::from_secs(2);

/// Default signal triggering a supervisor reload.
pub const DEFAULT_RELOAD_SIGNAL: Signal = Signal::SIGHUP;

/// Default signal triggering a graceful supervisor stop.
pub const DEFAULT_KILL_SIGNAL: Signal = Signal::SIGINT;

/// Environment variables consulted for the default log level, in order.
const LOG_LEVEL_ENV: &[&str] = &["ENVISOR_LOG", "CT_LOG"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// KV store connection.
    pub consul: Option<ConsulConfig>,

    /// Secrets store connection.
    pub vault: Option<VaultConfig>,

    /// Child process stanza.
    pub exec: Option<ExecSpec>,

    /// Syslog stanza, accepted for compatibility.
    pub syslog: Option<SyslogConfig>,

    /// Quiescence timers.
    pub wait: Option<WaitSpec>,

    /// KV source roots, in registration order.
    pub prefix: Option<Vec<PrefixSpec>>,

    /// Secret source roots; always registered after the KV roots so secret
    /// values win key collisions.
    pub secret: Option<Vec<PrefixSpec>>,

    /// Service catalog queries.
    pub service: Option<Vec<ServiceSpec>>,

    /// Logging level (`trace` … `error`).
    pub log_level: Option<String>,

    /// Maximum staleness for KV reads.
    #[serde(default, deserialize_with = "convert::opt_duration")]
    pub max_stale: Option<Duration>,

    /// Path of the PID file written at start.
    pub pid_file: Option<String>,

    /// When true the child does not inherit the supervisor's environment.
    pub pristine: Option<bool>,

    /// Replace non `[A-Za-z0-9_]` characters in emitted keys with `_`.
    pub sanitize: Option<bool>,

    /// Uppercase emitted keys.
    pub upcase: Option<bool>,

    /// Signal the supervisor listens to for graceful termination.
    #[serde(default, deserialize_with = "convert::opt_signal")]
    pub kill_signal: Option<Signal>,

    /// Signal the supervisor listens to for reload.
    #[serde(default, deserialize_with = "convert::opt_signal")]
    pub reload_signal: Option<Signal>,
}

impl Config {
    /// Merges `other` over `self`: scalars are right-biased, stanzas merge
    /// field-wise, and the `prefix`/`secret`/`service` lists concatenate in
    /// order.
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            consul: merge_opt(&self.consul, &other.consul, ConsulConfig::merge),
            vault: merge_opt(&self.vault, &other.vault, VaultConfig::merge),
            exec: merge_opt(&self.exec, &other.exec, ExecSpec::merge),
            syslog: merge_opt(&self.syslog, &other.syslog, SyslogConfig::merge),
            wait: merge_opt(&self.wait, &other.wait, WaitSpec::merge),
            prefix: concat_opt(&self.prefix, &other.prefix),
            secret: concat_opt(&self.secret, &other.secret),
            service: concat_opt(&self.service, &other.service),
            log_level: other.log_level.clone().or_else(|| self.log_level.clone()),
            max_stale: other.max_stale.or(self.max_stale),
            pid_file: other.pid_file.clone().or_else(|| self.pid_file.clone()),
            pristine: other.pristine.or(self.pristine),
            sanitize: other.sanitize.or(self.sanitize),
            upcase: other.upcase.or(self.upcase),
            kill_signal: other.kill_signal.or(self.kill_signal),
            reload_signal: other.reload_signal.or(self.reload_signal),
        }
    }

    /// Fills defaults so later reads are total. Safe to call repeatedly.
    pub fn finalize(&mut self) {
        self.consul.get_or_insert_with(ConsulConfig::default);
        if let Some(vault) = self.vault.as_mut() {
            vault.finalize();
        } else {
            self.vault = Some(VaultConfig::default());
        }
        self.exec.get_or_insert_with(ExecSpec::default);
        self.syslog.get_or_insert_with(SyslogConfig::default);

        let wait = self.wait.get_or_insert_with(WaitSpec::default);
        wait.finalize();

        self.prefix.get_or_insert_with(Vec::new);
        self.secret.get_or_insert_with(Vec::new);
        self.service.get_or_insert_with(Vec::new);

        if self.log_level.is_none() {
            self.log_level = Some(log_level_from_env());
        }
        if self.max_stale.is_none() {
            self.max_stale = Some(DEFAULT_MAX_STALE);
        }
        if self.pristine.is_none() {
            self.pristine = Some(false);
        }
        if self.sanitize.is_none() {
            self.sanitize = Some(false);
        }
        if self.upcase.is_none() {
            self.upcase = Some(false);
        }
        if self.kill_signal.is_none() {
            self.kill_signal = Some(DEFAULT_KILL_SIGNAL);
        }
        if self.reload_signal.is_none() {
            self.reload_signal = Some(DEFAULT_RELOAD_SIGNAL);
        }
    }

    pub fn consul(&self) -> ConsulConfig {
        self.consul.clone().unwrap_or_default()
    }

    pub fn vault(&self) -> VaultConfig {
        self.vault.clone().unwrap_or_default()
    }

    pub fn exec(&self) -> ExecSpec {
        self.exec.clone().unwrap_or_default()
    }

    pub fn wait(&self) -> WaitSpec {
        self.wait.clone().unwrap_or_default()
    }

    pub fn prefixes(&self) -> &[PrefixSpec] {
        self.prefix.as_deref().unwrap_or_default()
    }

    pub fn secrets(&self) -> &[PrefixSpec] {
        self.secret.as_deref().unwrap_or_default()
    }

    pub fn services(&self) -> &[ServiceSpec] {
        self.service.as_deref().unwrap_or_default()
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(log_level_from_env)
    }

    pub fn max_stale(&self) -> Duration {
        self.max_stale.unwrap_or(DEFAULT_MAX_STALE)
    }

    pub fn pristine(&self) -> bool {
        self.pristine.unwrap_or(false)
    }

    pub fn sanitize(&self) -> bool {
        self.sanitize.unwrap_or(false)
    }

    pub fn upcase(&self) -> bool {
        self.upcase.unwrap_or(false)
    }

    pub fn kill_signal(&self) -> Signal {
        self.kill_signal.unwrap_or(DEFAULT_KILL_SIGNAL)
    }

    pub fn reload_signal(&self) -> Signal {
        self.reload_signal.unwrap_or(DEFAULT_RELOAD_SIGNAL)
    }
}

fn merge_opt<T: Clone>(a: &Option<T>, b: &Option<T>, f: impl Fn(&T, &T) -> T) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(f(a, b)),
        (a, b) => b.clone().or_else(|| a.clone()),
    }
}

fn concat_opt<T: Clone>(a: &Option<Vec<T>>, b: &Option<Vec<T>>) -> Option<Vec<T>> {
    match (a, b) {
        (None, None) => None,
        (a, b) => {
            let mut out = a.clone().unwrap_or_default();
            out.extend(b.clone().unwrap_or_default());
            Some(out)
        }
    }
}

fn log_level_from_env() -> String {
    for var in LOG_LEVEL_ENV {
        if let Ok(v) = std::env::var(var) {
            let v = v.trim();
            if !v.is_empty() {
                return v.to_string();
            }
        }
    }
    DEFAULT_LOG_LEVEL.to_string()
}

/// KV store connection stanza.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsulConfig {
    pub address: Option<String>,
    pub token: Option<String>,
    pub auth: Option<AuthConfig>,
    pub ssl: Option<SslConfig>,
    pub retry: Option<RetryConfig>,
}

impl ConsulConfig {
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            address: other.address.clone().or_else(|| self.address.clone()),
            token: other.token.clone().or_else(|| self.token.clone()),
            auth: merge_opt(&self.auth, &other.auth, AuthConfig::merge),
            ssl: merge_opt(&self.ssl, &other.ssl, SslConfig::merge),
            retry: merge_opt(&self.retry, &other.retry, RetryConfig::merge),
        }
    }

    pub fn ssl(&self) -> SslConfig {
        self.ssl.clone().unwrap_or_default()
    }

    pub fn retry(&self) -> RetryConfig {
        self.retry.clone().unwrap_or_default()
    }
}

/// Secrets store connection stanza.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultConfig {
    pub address: Option<String>,
    pub namespace: Option<String>,
    pub token: Option<String>,
    pub vault_agent_token_file: Option<String>,
    pub unwrap_token: Option<bool>,
    pub renew_token: Option<bool>,

    /// Lease length assumed for secrets that do not report one; also drives
    /// the token renewal cadence.
    #[serde(default, deserialize_with = "convert::opt_duration")]
    pub default_lease_duration: Option<Duration>,

    /// Fraction of the lease after which renewal fires.
    pub lease_renewal_threshold: Option<f64>,

    pub ssl: Option<SslConfig>,
    pub retry: Option<RetryConfig>,
}

impl VaultConfig {
    pub const DEFAULT_LEASE: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_RENEWAL_THRESHOLD: f64 = 0.90;

    pub fn merge(&self, other: &Self) -> Self {
        Self {
            address: other.address.clone().or_else(|| self.address.clone()),
            namespace: other.namespace.clone().or_else(|| self.namespace.clone()),
            token: other.token.clone().or_else(|| self.token.clone()),
            vault_agent_token_file: other
                .vault_agent_token_file
                .clone()
                .or_else(|| self.vault_agent_token_file.clone()),
            unwrap_token: other.unwrap_token.or(self.unwrap_token),
            renew_token: other.renew_token.or(self.renew_token),
            default_lease_duration: other.default_lease_duration.or(self.default_lease_duration),
            lease_renewal_threshold: other
                .lease_renewal_threshold
                .or(self.lease_renewal_threshold),
            ssl: merge_opt(&self.ssl, &other.ssl, SslConfig::merge),
            retry: merge_opt(&self.retry, &other.retry, RetryConfig::merge),
        }
    }

    /// Reads the agent token file, if configured, into `token`.
    pub fn finalize(&mut self) {
        if self.token.is_none() {
            if let Some(file) = &self.vault_agent_token_file {
                if let Ok(contents) = std::fs::read_to_string(file) {
                    self.token = Some(contents.trim().to_string());
                }
            }
        }
        if self.renew_token.is_none() {
            self.renew_token = Some(self.token.is_some());
        }
    }

    pub fn ssl(&self) -> SslConfig {
        self.ssl.clone().unwrap_or_default()
    }

    pub fn retry(&self) -> RetryConfig {
        self.retry.clone().unwrap_or_default()
    }

    pub fn default_lease_duration(&self) -> Duration {
        self.default_lease_duration.unwrap_or(Self::DEFAULT_LEASE)
    }

    pub fn lease_renewal_threshold(&self) -> f64 {
        self.lease_renewal_threshold
            .unwrap_or(Self::DEFAULT_RENEWAL_THRESHOLD)
    }

    pub fn renew_token(&self) -> bool {
        self.renew_token.unwrap_or(false) && self.token.is_some()
    }
}

/// Basic auth for the KV store.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub enabled: Option<bool>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl AuthConfig {
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            enabled: other.enabled.or(self.enabled),
            username: other.username.clone().or_else(|| self.username.clone()),
            password: other.password.clone().or_else(|| self.password.clone()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(self.username.is_some())
    }
}

/// TLS settings shared by both stores.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SslConfig {
    pub enabled: Option<bool>,
    pub verify: Option<bool>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub ca_cert: Option<String>,
    pub ca_path: Option<String>,
    pub server_name: Option<String>,
}

impl SslConfig {
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            enabled: other.enabled.or(self.enabled),
            verify: other.verify.or(self.verify),
            cert: other.cert.clone().or_else(|| self.cert.clone()),
            key: other.key.clone().or_else(|| self.key.clone()),
            ca_cert: other.ca_cert.clone().or_else(|| self.ca_cert.clone()),
            ca_path: other.ca_path.clone().or_else(|| self.ca_path.clone()),
            server_name: other
                .server_name
                .clone()
                .or_else(|| self.server_name.clone()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    pub fn verify(&self) -> bool {
        self.verify.unwrap_or(true)
    }
}

/// Retry/backoff policy for a store's poll loop.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    pub enabled: Option<bool>,
    pub attempts: Option<u32>,

    #[serde(default, deserialize_with = "convert::opt_duration")]
    pub backoff: Option<Duration>,

    #[serde(default, deserialize_with = "convert::opt_duration")]
    pub max_backoff: Option<Duration>,
}

impl RetryConfig {
    pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(250);
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

    pub fn merge(&self, other: &Self) -> Self {
        Self {
            enabled: other.enabled.or(self.enabled),
            attempts: other.attempts.or(self.attempts),
            backoff: other.backoff.or(self.backoff),
            max_backoff: other.max_backoff.or(self.max_backoff),
        }
    }

    pub fn backoff(&self) -> Duration {
        self.backoff.unwrap_or(Self::DEFAULT_BACKOFF)
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff.unwrap_or(Self::DEFAULT_MAX_BACKOFF)
    }
}

/// Syslog stanza, accepted for compatibility with older configs. Output goes
/// through the tracing subscriber either way.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyslogConfig {
    pub enabled: Option<bool>,
    pub facility: Option<String>,
}

impl SyslogConfig {
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            enabled: other.enabled.or(self.enabled),
            facility: other.facility.clone().or_else(|| self.facility.clone()),
        }
    }
}
