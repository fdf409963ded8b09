//! # Test doubles for the store seams.
//!
//! [`MemoryStore`] implements both [`KvStore`](crate::clients::KvStore) and
//! [`SecretStore`](crate::clients::SecretStore) over in-memory maps, with a
//! change counter and notification so blocking queries behave like the real
//! transport: a poll with the current index parks until the data changes or
//! the wait elapses.
//!
//! Used by the crate's own tests; exported so embedders can drive a
//! supervisor hermetically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use crate::clients::{KvStore, SecretStore};
use crate::deps::{CatalogService, KvPair, Secret};
use crate::error::StoreError;

#[derive(Default)]
struct Inner {
    index: u64,
    kv: HashMap<String, Vec<KvPair>>,
    secrets: HashMap<String, Secret>,
    services: HashMap<String, Vec<CatalogService>>,
    kv_failures: usize,
    renew_failures: usize,
    renew_lease: Duration,
}

/// In-memory KV + secrets + catalog store with blocking-query emulation.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    changed: Notify,
    renewals: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                renew_lease: Duration::from_secs(300),
                ..Inner::default()
            }),
            changed: Notify::new(),
            renewals: AtomicUsize::new(0),
        }
    }

    fn bump(&self, mutate: impl FnOnce(&mut Inner)) {
        {
            let mut inner = self.inner.lock();
            mutate(&mut inner);
            inner.index += 1;
        }
        self.changed.notify_waiters();
    }

    /// Replaces the pairs under `path`.
    pub fn set_kv(&self, path: &str, pairs: &[(&str, &str)]) {
        let pairs = pairs
            .iter()
            .map(|(k, v)| KvPair::new(*k, *v))
            .collect::<Vec<_>>();
        self.bump(|inner| {
            inner.kv.insert(path.to_string(), pairs);
        });
    }

    /// Replaces the secret at `path` with a JSON payload.
    pub fn set_secret(&self, path: &str, value: Value) {
        self.bump(|inner| {
            inner.secrets.insert(path.to_string(), Secret::from_value(value));
        });
    }

    /// Replaces the catalog entries of `name`.
    pub fn set_services(&self, name: &str, services: Vec<CatalogService>) {
        self.bump(|inner| {
            inner.services.insert(name.to_string(), services);
        });
    }

    /// Makes the next `n` KV/catalog polls fail.
    pub fn fail_kv(&self, n: usize) {
        self.inner.lock().kv_failures = n;
    }

    /// Makes the next `n` token renewals fail.
    pub fn fail_renew(&self, n: usize) {
        self.inner.lock().renew_failures = n;
    }

    /// Sets the lease returned by successful renewals.
    pub fn set_renew_lease(&self, lease: Duration) {
        self.inner.lock().renew_lease = lease;
    }

    /// Number of successful token renewals so far.
    pub fn renew_count(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    fn take_kv_failure(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.kv_failures > 0 {
            inner.kv_failures -= 1;
            true
        } else {
            false
        }
    }

    /// Parks until the index moves past `index` or `wait` elapses, then
    /// reads `f` under the lock.
    async fn blocking_read<T>(
        &self,
        index: u64,
        wait: Duration,
        f: impl Fn(&Inner) -> T,
    ) -> (u64, T) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent bump cannot be missed.
            notified.as_mut().enable();
            {
                let inner = self.inner.lock();
                if inner.index != index {
                    return (inner.index, f(&inner));
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {
                    let inner = self.inner.lock();
                    return (inner.index, f(&inner));
                }
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn kv_list(
        &self,
        path: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(u64, Vec<KvPair>), StoreError> {
        if self.take_kv_failure() {
            return Err(StoreError::Request("injected kv failure".to_string()));
        }
        Ok(self
            .blocking_read(index, wait, |inner| {
                inner.kv.get(path).cloned().unwrap_or_default()
            })
            .await)
    }

    async fn catalog_service(
        &self,
        name: &str,
        index: u64,
        wait: Duration,
    ) -> Result<(u64, Vec<CatalogService>), StoreError> {
        if self.take_kv_failure() {
            return Err(StoreError::Request("injected catalog failure".to_string()));
        }
        Ok(self
            .blocking_read(index, wait, |inner| {
                inner.services.get(name).cloned().unwrap_or_default()
            })
            .await)
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn read_secret(&self, path: &str) -> Result<Secret, StoreError> {
        let inner = self.inner.lock();
        inner
            .secrets
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::UnexpectedStatus {
                status: 404,
                body: format!("no secret at {path}"),
            })
    }

    async fn renew_token(&self) -> Result<Duration, StoreError> {
        let lease = {
            let mut inner = self.inner.lock();
            if inner.renew_failures > 0 {
                inner.renew_failures -= 1;
                return Err(StoreError::Request("injected renew failure".to_string()));
            }
            inner.renew_lease
        };
        self.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(lease)
    }
}
