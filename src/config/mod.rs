//! Configuration: the typed tree, emission stanzas, and document loading.
//!
//! - **model.rs**: [`Config`] and the connection stanzas, with
//!   `merge`/`finalize` semantics.
//! - **specs.rs**: the emission stanzas ([`PrefixSpec`], [`ServiceSpec`],
//!   [`ExecSpec`], [`EnvSpec`], [`WaitSpec`]).
//! - **load.rs**: JSON parsing, deprecated-key rewrites, file and directory
//!   loading.
//! - **convert.rs**: duration and signal string decoding.

pub mod convert;
mod load;
mod model;
mod specs;

pub use load::{from_file, from_path, parse};
pub use model::{
    AuthConfig, Config, ConsulConfig, RetryConfig, SslConfig, SyslogConfig, VaultConfig,
    DEFAULT_KILL_SIGNAL, DEFAULT_LOG_LEVEL, DEFAULT_MAX_STALE, DEFAULT_RELOAD_SIGNAL,
};
pub use specs::{
    EnvSpec, ExecSpec, KeyFormat, PrefixSpec, ServiceSpec, WaitSpec, DEFAULT_CHILD_KILL_SIGNAL,
    DEFAULT_KILL_TIMEOUT,
};
