//! # Transport clients for the remote stores.
//!
//! The supervisor never talks HTTP directly: it goes through two seams,
//! [`KvStore`] for the hierarchical KV store and service catalog, and
//! [`SecretStore`] for the secrets store. [`ClientSet`] bundles one handle
//! per seam and is threaded through watcher construction.
//!
//! [`ClientSet::from_config`] builds the HTTP-backed implementations and
//! validates addresses and TLS material; construction failure is fatal at
//! start, before any watcher runs.

mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use http::{HttpKvClient, HttpSecretClient};

use crate::config::Config;
use crate::deps::{CatalogService, KvPair, Secret};
use crate::error::{ClientError, StoreError};

/// Access to the hierarchical KV store and its service catalog.
///
/// `index` carries the store's change index for blocking queries: the call
/// returns early when the data changes past `index`, or after `wait` with the
/// current state. Implementations without change indexes may return
/// immediately with `index` echoed back.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Lists all pairs under `path`, keys relative to it.
    async fn kv_list(
        &self,
        path: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(u64, Vec<KvPair>), StoreError>;

    /// Lists the catalog entries of service `name`.
    async fn catalog_service(
        &self,
        name: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(u64, Vec<CatalogService>), StoreError>;
}

/// Access to the secrets store.
#[async_trait]
pub trait SecretStore: Send + Sync + 'static {
    /// Reads the secret at `path`.
    async fn read_secret(&self, path: &str) -> Result<Secret, StoreError>;

    /// Renews the store token, returning the new lease length.
    async fn renew_token(&self) -> Result<Duration, StoreError>;
}

/// The configured transport clients, one per source.
#[derive(Clone)]
pub struct ClientSet {
    kv: Arc<dyn KvStore>,
    secrets: Arc<dyn SecretStore>,
}

impl std::fmt::Debug for ClientSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSet").finish_non_exhaustive()
    }
}

impl ClientSet {
    /// Bundles explicit store handles. Used by tests and embedders that bring
    /// their own transport.
    pub fn new(kv: Arc<dyn KvStore>, secrets: Arc<dyn SecretStore>) -> Self {
        Self { kv, secrets }
    }

    /// Builds HTTP clients from the `consul` and `vault` stanzas.
    pub fn from_config(config: &Config) -> Result<Self, ClientError> {
        let kv = HttpKvClient::new(&config.consul(), config.max_stale())?;
        let secrets = HttpSecretClient::new(&config.vault())?;
        Ok(Self {
            kv: Arc::new(kv),
            secrets: Arc::new(secrets),
        })
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn secrets(&self) -> &Arc<dyn SecretStore> {
        &self.secrets
    }
}
