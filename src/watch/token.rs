//! Dedicated watcher renewing the secret-store token.
//!
//! Renewal state is threaded through an explicit [`RenewOptions`] record, so
//! the cadence is per-supervisor rather than process-global.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clients::SecretStore;
use crate::error::StoreError;

/// Token renewal tuning.
#[derive(Debug, Clone)]
pub struct RenewOptions {
    /// Whether renewal runs at all (a token is present and renewal is on).
    pub enabled: bool,
    /// Lease assumed until the store reports one.
    pub lease: Duration,
    /// Fraction of the lease after which renewal fires.
    pub threshold: f64,
}

impl RenewOptions {
    /// Renewal disabled; the error channel stays silent.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            lease: Duration::from_secs(5 * 60),
            threshold: 0.9,
        }
    }
}

/// Periodically renews the store token, surfacing failures on its error
/// channel with the same advisory semantics as the main watcher.
#[derive(Debug)]
pub struct TokenWatcher {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokenWatcher {
    /// Starts the renewal loop (a no-op handle when disabled). When renewal
    /// is enabled this spawns onto the current runtime.
    pub fn start(
        secrets: Arc<dyn SecretStore>,
        opts: RenewOptions,
    ) -> (Self, mpsc::Receiver<StoreError>) {
        let (err_tx, err_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let task = if opts.enabled {
            let cancel = cancel.child_token();
            Some(tokio::spawn(async move {
                renew_loop(secrets, opts, err_tx, cancel).await;
            }))
        } else {
            None
        };

        (
            Self {
                cancel,
                task: Mutex::new(task),
            },
            err_rx,
        )
    }

    /// Cancels the loop and waits for it. Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn renew_loop(
    secrets: Arc<dyn SecretStore>,
    opts: RenewOptions,
    err_tx: mpsc::Sender<StoreError>,
    cancel: CancellationToken,
) {
    let mut lease = opts.lease;

    loop {
        let sleep = lease.mul_f64(opts.threshold).max(Duration::from_secs(1));
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(sleep) => {}
        }

        match secrets.renew_token().await {
            Ok(new_lease) => {
                debug!(target: "watch", ?new_lease, "token renewed");
                if new_lease > Duration::ZERO {
                    lease = new_lease;
                }
            }
            Err(e) => {
                warn!(target: "watch", error = %e, "token renewal failed");
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = err_tx.send(e) => sent.is_ok(),
                };
                if !sent {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn renews_on_the_lease_cadence() {
        let store = Arc::new(MemoryStore::new());
        store.set_renew_lease(Duration::from_secs(10));

        let opts = RenewOptions {
            enabled: true,
            lease: Duration::from_secs(10),
            threshold: 0.5,
        };
        let (watcher, _errors) = TokenWatcher::start(store.clone(), opts);
        tokio::time::sleep(Duration::from_secs(12)).await;
        watcher.stop().await;

        assert!(store.renew_count() >= 2);
    }

    #[tokio::test]
    async fn disabled_watcher_never_renews() {
        let store = Arc::new(MemoryStore::new());
        let (watcher, _errors) = TokenWatcher::start(store.clone(), RenewOptions::disabled());
        tokio::time::sleep(Duration::from_millis(100)).await;
        watcher.stop().await;
        assert_eq!(store.renew_count(), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let (watcher, _errors) = TokenWatcher::start(
            store,
            RenewOptions {
                enabled: true,
                lease: Duration::from_secs(60),
                threshold: 0.9,
            },
        );
        watcher.stop().await;
        watcher.stop().await;
    }
}
