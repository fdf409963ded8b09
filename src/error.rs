//! # Error types used across the supervisor runtime.
//!
//! Each layer has its own enum:
//!
//! - [`ConfigError`] — configuration load/decode failures (fatal at load).
//! - [`TemplateError`] — `format`/`path` template parse or execute failures.
//! - [`ClientError`] — transport client construction failures (fatal at start).
//! - [`StoreError`] — request-level failures talking to a remote store.
//! - [`BuildError`] — environment build failures for a single tick.
//! - [`ChildError`] — child process spawn/signal failures.
//! - [`SupervisorError`] — failures raised by the supervisor loop itself.
//!
//! The runtime-facing enums provide `as_label()` returning a short stable
//! snake_case label for logs and metrics.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while loading or decoding configuration.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A config file or directory could not be read.
    #[error("could not read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A config document failed to decode (syntax, unknown key, bad value).
    #[error("could not decode {path:?}: {reason}")]
    Decode { path: PathBuf, reason: String },

    /// A duration string such as `"5s"` or `"150ms"` failed to parse.
    #[error("invalid duration {value:?}")]
    InvalidDuration { value: String },

    /// A signal name such as `"SIGHUP"` failed to parse.
    #[error("invalid signal {value:?}")]
    InvalidSignal { value: String },

    /// A `prefix`/`secret` stanza is missing its `path` (or `service` its
    /// `query`).
    #[error("{stanza} stanza is missing {field:?}")]
    MissingField {
        stanza: &'static str,
        field: &'static str,
    },

    /// A dependency path template failed to render.
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Errors produced by the mini template engine behind `format` and `path`
/// templates.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TemplateError {
    /// The template text is malformed (unterminated `{{`, bad quoting).
    #[error("could not parse template {template:?}: {reason}")]
    Parse { template: String, reason: String },

    /// The template calls a function the current context does not bind.
    #[error("unknown function {name:?} in template {template:?}")]
    UnknownFunction { name: String, template: String },

    /// A function was called with the wrong number of arguments.
    #[error("{name} expects {expected} argument(s) in template {template:?}")]
    BadArity {
        name: String,
        expected: usize,
        template: String,
    },

    /// `env "VAR"` referenced an environment variable that is not set.
    #[error("unable to read environment variable {var:?} in template {template:?}")]
    MissingEnv { var: String, template: String },
}

/// Errors produced while constructing transport clients.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ClientError {
    /// A configured source has no address.
    #[error("{source_kind} source has no address configured")]
    MissingAddress { source_kind: &'static str },

    /// TLS material could not be loaded or was inconsistent.
    #[error("{source_kind} TLS configuration invalid: {reason}")]
    Tls {
        source_kind: &'static str,
        reason: String,
    },

    /// The underlying HTTP client failed to build.
    #[error("{source_kind} client construction failed: {reason}")]
    Build {
        source_kind: &'static str,
        reason: String,
    },
}

/// Request-level errors from a remote store.
///
/// These are advisory in normal operation (the watcher retries with backoff);
/// they become fatal only in once mode.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StoreError {
    /// The request could not be sent or the connection failed.
    #[error("request failed: {0}")]
    Request(String),

    /// The store answered with an unexpected status code.
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    /// The response payload did not have the expected shape.
    #[error("could not decode response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Request(e.to_string())
    }
}

/// Errors that abort a single environment build.
///
/// A build error never restarts or kills the child; the supervisor logs it
/// and keeps the last good environment.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BuildError {
    /// A snapshot entry did not match the dependency's expected data shape.
    #[error("dependency {identity} delivered {got}, expected {expected}")]
    Decode {
        identity: String,
        expected: &'static str,
        got: &'static str,
    },

    /// A dependency has no originating spec in the lookup tables.
    #[error("no spec registered for dependency {identity}")]
    MissingSpec { identity: String },

    /// A `format` or `path` template failed during the build.
    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl BuildError {
    /// Returns a short stable label for logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            BuildError::Decode { .. } => "build_decode",
            BuildError::MissingSpec { .. } => "build_missing_spec",
            BuildError::Template(_) => "build_template",
        }
    }
}

/// Errors produced while managing the child process.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ChildError {
    /// The exec command is empty after parsing.
    #[error("exec command is empty")]
    NoCommand,

    /// The OS failed to spawn the process.
    #[error("could not spawn {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A signal could not be delivered.
    #[error("could not signal pid {pid} with {signal}: {reason}")]
    Signal {
        pid: i32,
        signal: String,
        reason: String,
    },
}

/// Errors raised by the supervisor loop. All of these are fatal: the
/// supervisor's job is to run the child, so failing to do so ends the run.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The PID file could not be created at start.
    #[error("could not write pid file {path:?}: {reason}")]
    PidFile { path: PathBuf, reason: String },

    /// A dependency could not be constructed from its spec.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The child failed to spawn or be signalled.
    #[error(transparent)]
    Child(#[from] ChildError),

    /// A watcher error surfaced in once mode.
    #[error("watch failed for {dependency}: {source}")]
    Watch {
        dependency: String,
        #[source]
        source: StoreError,
    },

    /// The token renewal watcher failed in once mode.
    #[error("token renewal failed: {source}")]
    TokenRenewal {
        #[source]
        source: StoreError,
    },
}

impl SupervisorError {
    /// Returns a short stable label for logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::PidFile { .. } => "supervisor_pid_file",
            SupervisorError::Config(_) => "supervisor_config",
            SupervisorError::Child(_) => "supervisor_child",
            SupervisorError::Watch { .. } => "supervisor_watch",
            SupervisorError::TokenRenewal { .. } => "supervisor_token_renewal",
        }
    }
}
