//! # envisor
//!
//! **Envisor** supervises a child process whose environment is derived from
//! external sources: a hierarchical key/value store, a secrets store, and an
//! optional service catalog. It watches those sources, re-derives the
//! environment on change, and restarts the child only when the result
//! actually differs.
//!
//! ## Features
//!
//! | Area            | Description                                                   | Key types                                |
//! |-----------------|---------------------------------------------------------------|------------------------------------------|
//! | **Supervision** | Event loop, quiescence timers, child swap, PID file.          | [`Supervisor`], [`SupervisorOptions`]    |
//! | **Sources**     | Declarative queries with stable identities.                   | [`Dependency`], [`DependencyData`]       |
//! | **Watching**    | Long-poll loops and token renewal with advisory errors.       | [`Watcher`], [`TokenWatcher`]            |
//! | **Environment** | Deterministic build, prefixing, formats, globs, pristine.     | [`EnvironmentBuilder`], [`BuildOutcome`] |
//! | **Child**       | Spawn, signal, graceful stop with kill-timeout.               | [`Child`], [`ChildSpec`]                 |
//! | **Config**      | Mergeable stanza tree loaded from JSON files or directories.  | [`Config`]                               |
//! | **Transport**   | HTTP clients behind store traits; bring your own in tests.    | [`ClientSet`], [`KvStore`], [`SecretStore`] |
//!
//! ## Example
//!
//! ```no_run
//! use envisor::{ClientSet, Config, Supervisor, SupervisorOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config: Config = envisor::config::parse(r#"{
//!         "consul": { "address": "127.0.0.1:8500" },
//!         "exec": { "command": "server --port 8080" },
//!         "prefix": [ { "path": "app/config" } ],
//!         "upcase": true
//!     }"#)?;
//!
//!     let clients = ClientSet::from_config(&config)?;
//!     let supervisor = Supervisor::new(config, clients, SupervisorOptions::default())?;
//!     supervisor.start().await?;
//!     Ok(())
//! }
//! ```

mod child;
mod clients;
pub mod config;
mod core;
mod deps;
mod env;
mod error;
mod template;
pub mod testing;
mod watch;

// ---- Public re-exports ----

pub use child::{prep_command, Child, ChildSpec};
pub use clients::{ClientSet, HttpKvClient, HttpSecretClient, KvStore, SecretStore};
pub use config::Config;
pub use core::{Snapshot, Supervisor, SupervisorOptions};
pub use deps::{
    CatalogService, Dependency, DependencyData, KvListQuery, KvPair, Secret,
    ServiceCatalogQuery, VaultReadQuery,
};
pub use env::{compose_child_env, BuildOutcome, EnvironmentBuilder};
pub use error::{
    BuildError, ChildError, ClientError, ConfigError, StoreError, SupervisorError, TemplateError,
};
pub use template::{render, TemplateVars};
pub use watch::{RenewOptions, TokenWatcher, WatchError, Watcher, WatcherOptions, WatcherStreams};
