//! # Watcher: long-polling poll loops over the registered dependencies.
//!
//! One cancellable task per dependency. KV and catalog queries use the
//! store's blocking-query support (change index + wait); secrets are re-read
//! at half their lease. Results land on the data channel as
//! `(Dependency, DependencyData)` tuples; request failures are advisory and
//! go to the error channel while the loop retries with doubling backoff.
//!
//! ## Rules
//! - [`Watcher::stop`] is idempotent, cancels every poll, and drains the
//!   tasks before returning.
//! - In once mode each loop delivers exactly one result and ends.
//! - A successful poll resets the backoff.

mod token;

use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use token::{RenewOptions, TokenWatcher};

use crate::clients::ClientSet;
use crate::config::RetryConfig;
use crate::deps::{Dependency, DependencyData};
use crate::error::StoreError;

const DATA_CHANNEL_CAPACITY: usize = 256;
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Default server-side wait for blocking queries.
pub const DEFAULT_POLL_WAIT: Duration = Duration::from_secs(60);

/// An advisory error from one dependency's poll loop.
#[derive(Debug)]
pub struct WatchError {
    pub dependency: String,
    pub source: StoreError,
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watch {}: {}", self.dependency, self.source)
    }
}

/// Tuning for the poll loops.
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Deliver one result per dependency, then end the loop.
    pub once: bool,
    /// Server-side wait for blocking queries.
    pub poll_wait: Duration,
    /// Retry backoff for KV/catalog polls.
    pub kv_retry: RetryConfig,
    /// Retry backoff for secret reads.
    pub vault_retry: RetryConfig,
    /// Lease assumed for secrets that do not report one.
    pub vault_default_lease: Duration,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            once: false,
            poll_wait: DEFAULT_POLL_WAIT,
            kv_retry: RetryConfig::default(),
            vault_retry: RetryConfig::default(),
            vault_default_lease: Duration::from_secs(5 * 60),
        }
    }
}

/// Receiving ends of the watcher's channels.
pub struct WatcherStreams {
    pub data: mpsc::Receiver<(Dependency, DependencyData)>,
    pub errors: mpsc::Receiver<WatchError>,
}

/// Runs the poll loops for every registered dependency.
#[derive(Debug)]
pub struct Watcher {
    clients: ClientSet,
    opts: WatcherOptions,
    data_tx: mpsc::Sender<(Dependency, DependencyData)>,
    err_tx: mpsc::Sender<WatchError>,
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl Watcher {
    pub fn new(clients: ClientSet, opts: WatcherOptions) -> (Self, WatcherStreams) {
        let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        (
            Self {
                clients,
                opts,
                data_tx,
                err_tx,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(JoinSet::new()),
            },
            WatcherStreams {
                data: data_rx,
                errors: err_rx,
            },
        )
    }

    /// Begins polling `dependency`.
    pub async fn add(&self, dependency: Dependency) {
        debug!(target: "watch", dependency = %dependency, "adding");
        let poll = PollLoop {
            clients: self.clients.clone(),
            opts: self.opts.clone(),
            data_tx: self.data_tx.clone(),
            err_tx: self.err_tx.clone(),
            cancel: self.cancel.child_token(),
        };
        self.tasks.lock().await.spawn(poll.run(dependency));
    }

    /// Cancels all polls and drains the tasks. Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }
}

struct PollLoop {
    clients: ClientSet,
    opts: WatcherOptions,
    data_tx: mpsc::Sender<(Dependency, DependencyData)>,
    err_tx: mpsc::Sender<WatchError>,
    cancel: CancellationToken,
}

impl PollLoop {
    async fn run(self, dependency: Dependency) {
        let indexed = matches!(
            dependency,
            Dependency::KvList(_) | Dependency::CatalogService(_)
        );
        if indexed {
            self.run_indexed(dependency).await;
        } else {
            self.run_secret(dependency).await;
        }
    }

    /// Blocking-query loop for KV and catalog dependencies.
    async fn run_indexed(&self, dependency: Dependency) {
        let mut index = 0u64;
        let mut seen_data = false;
        let mut delay: Option<Duration> = None;

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = self.query_indexed(&dependency, index) => r,
            };

            match result {
                Ok((new_index, data)) => {
                    delay = None;
                    if !seen_data || new_index != index {
                        seen_data = true;
                        index = new_index;
                        if !self.deliver(&dependency, data).await {
                            return;
                        }
                        if self.opts.once {
                            return;
                        }
                    }
                    // Unchanged index: the blocking query timed out, poll
                    // again immediately.
                }
                Err(source) => {
                    let next = next_backoff(delay, &self.opts.kv_retry);
                    delay = Some(next);
                    if !self.report(&dependency, source, next).await {
                        return;
                    }
                }
            }
        }
    }

    /// Lease-driven re-read loop for secret dependencies.
    async fn run_secret(&self, dependency: Dependency) {
        let path = match &dependency {
            Dependency::VaultRead(q) => q.path().to_string(),
            _ => return,
        };
        let mut delay: Option<Duration> = None;

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                r = self.clients.secrets().read_secret(&path) => r,
            };

            match result {
                Ok(secret) => {
                    delay = None;
                    let lease = secret
                        .lease_duration
                        .unwrap_or(self.opts.vault_default_lease);
                    if !self
                        .deliver(&dependency, DependencyData::Secret(secret))
                        .await
                    {
                        return;
                    }
                    if self.opts.once {
                        return;
                    }
                    // Re-read at half the lease so a rotated value is picked
                    // up before it expires.
                    let sleep = (lease / 2).max(Duration::from_secs(1));
                    if !self.sleep(sleep).await {
                        return;
                    }
                }
                Err(source) => {
                    let next = next_backoff(delay, &self.opts.vault_retry);
                    delay = Some(next);
                    if !self.report(&dependency, source, next).await {
                        return;
                    }
                }
            }
        }
    }

    async fn query_indexed(
        &self,
        dependency: &Dependency,
        index: u64,
    ) -> Result<(u64, DependencyData), StoreError> {
        match dependency {
            Dependency::KvList(q) => {
                let (i, pairs) = self
                    .clients
                    .kv()
                    .kv_list(q.path(), index, self.opts.poll_wait)
                    .await?;
                Ok((i, DependencyData::KvPairs(pairs)))
            }
            Dependency::CatalogService(q) => {
                let (i, services) = self
                    .clients
                    .kv()
                    .catalog_service(q.name(), index, self.opts.poll_wait)
                    .await?;
                Ok((i, DependencyData::Services(services)))
            }
            Dependency::VaultRead(_) => unreachable!("secrets use run_secret"),
        }
    }

    /// Sends one result; false when the watcher is shutting down.
    async fn deliver(&self, dependency: &Dependency, data: DependencyData) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.data_tx.send((dependency.clone(), data)) => sent.is_ok(),
        }
    }

    /// Reports an advisory error and backs off; false when shutting down.
    async fn report(&self, dependency: &Dependency, source: StoreError, delay: Duration) -> bool {
        warn!(
            target: "watch",
            dependency = %dependency,
            error = %source,
            ?delay,
            "poll failed, backing off"
        );
        let err = WatchError {
            dependency: dependency.identity().to_string(),
            source,
        };
        let sent = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            sent = self.err_tx.send(err) => sent.is_ok(),
        };
        if !sent {
            return false;
        }
        self.sleep(delay).await
    }

    /// Cancellable sleep; false when shutting down.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Doubling backoff between failed polls, reset on success.
fn next_backoff(prev: Option<Duration>, retry: &RetryConfig) -> Duration {
    match prev {
        None => retry.backoff(),
        Some(d) => (d * 2).min(retry.max_backoff()),
    }
}
