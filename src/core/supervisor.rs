//! # Supervisor: the event loop driving the child from upstream data.
//!
//! The [`Supervisor`] owns the dependency list, the data snapshot, the
//! quiescence timers, the child handle, and the PID file. It multiplexes
//! over the watcher's data and error channels, the token watcher's error
//! channel, the quiescence deadlines, the child's exit channel, reload
//! requests, and the done signal.
//!
//! ```text
//! ConfigModel ──► dependencies ──► Watcher ──┐
//!                                            │ (dep, data) / errors
//!                     Supervisor::start() ◄──┘
//!                        │  receive + drain burst
//!                        │  quiescence min/max deadlines
//!                        ▼
//!                EnvironmentBuilder ──► not ready? unchanged? ──► keep child
//!                        │ changed
//!                        ▼
//!                stop old child ──► compose final env ──► spawn new child
//! ```
//!
//! ## Rules
//! - All snapshot/child/timer mutation happens on the loop; the watcher only
//!   feeds channels.
//! - A build error (template, decode) keeps the last good environment and
//!   never touches the child.
//! - Watcher and token errors are advisory; in once mode they are fatal.
//! - In once mode the first completed build ends the loop; a detached
//!   forwarder keeps the child's exit code flowing.
//! - `stop()` is idempotent: watchers halted, child stopped, PID file
//!   removed (warn on failure), done signal closed exactly once.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::child::{Child, ChildSpec};
use crate::clients::ClientSet;
use crate::config::{Config, PrefixSpec, ServiceSpec};
use crate::deps::{
    Dependency, DependencyData, KvListQuery, ServiceCatalogQuery, VaultReadQuery,
};
use crate::env::{compose_child_env, BuildOutcome, EnvironmentBuilder};
use crate::error::{ChildError, StoreError, SupervisorError};
use crate::template::{render, TemplateVars};
use crate::watch::{
    RenewOptions, TokenWatcher, WatchError, Watcher, WatcherOptions, WatcherStreams,
};

use super::{pid, Snapshot};

/// Construction-time options that are not part of the config tree.
#[derive(Debug, Clone, Default)]
pub struct SupervisorOptions {
    /// Fetch data once, run one build, and end the loop.
    pub once: bool,
}

/// Receiving ends owned by the event loop.
#[derive(Debug)]
struct LoopStreams {
    data: mpsc::Receiver<(Dependency, DependencyData)>,
    errors: mpsc::Receiver<WatchError>,
    token_errors: mpsc::Receiver<StoreError>,
    reload: mpsc::Receiver<()>,
}

/// Loop-local state.
struct LoopState {
    /// Exit channel of the current child, if one is running.
    exit_rx: Option<mpsc::Receiver<i32>>,
    /// Last emitted environment, for the no-change short circuit.
    last_env: Option<HashMap<String, String>>,
    min_deadline: Option<Instant>,
    max_deadline: Option<Instant>,
}

/// Orchestrates watchers, environment builds, and the child lifecycle.
#[derive(Debug)]
pub struct Supervisor {
    config: Config,
    once: bool,
    dependencies: Vec<Dependency>,
    prefix_specs: HashMap<String, PrefixSpec>,
    service_specs: HashMap<String, ServiceSpec>,

    /// Latest data per dependency. Shared with `receive` under a lock so the
    /// builder always sees a consistent snapshot.
    snapshot: SyncMutex<Snapshot>,

    /// The live child; `signal` takes read, swap/stop take write.
    child: RwLock<Option<Child>>,

    watcher: Watcher,
    token_watcher: TokenWatcher,
    streams: Mutex<Option<LoopStreams>>,

    exit_tx: mpsc::Sender<i32>,
    exit_rx: SyncMutex<Option<mpsc::Receiver<i32>>>,
    reload_tx: mpsc::Sender<()>,

    done: CancellationToken,
    stopped: Mutex<bool>,
}

impl Supervisor {
    /// Builds the supervisor: finalizes the config, constructs and registers
    /// the dependency list (KV prefixes, then services, then secrets — the
    /// order that gives secrets precedence), and wires the watchers.
    pub fn new(
        config: Config,
        clients: ClientSet,
        opts: SupervisorOptions,
    ) -> Result<Self, SupervisorError> {
        info!(target: "supervisor", once = opts.once, "creating supervisor");

        let mut config = config;
        config.finalize();

        let mut dependencies = Vec::new();
        let mut prefix_specs = HashMap::new();
        let mut service_specs = HashMap::new();

        for spec in config.prefixes() {
            let path = rendered_path(spec)?;
            let query = KvListQuery::new(&path)?;
            prefix_specs.insert(query.identity().to_string(), spec.clone());
            dependencies.push(Dependency::KvList(query));
        }

        for spec in config.services() {
            let query = ServiceCatalogQuery::new(spec.query.as_deref().unwrap_or_default())?;
            service_specs.insert(query.identity().to_string(), spec.clone());
            dependencies.push(Dependency::CatalogService(query));
        }

        // Secrets register after everything else so their values can
        // overwrite KV collisions, never the reverse.
        for spec in config.secrets() {
            let path = rendered_path(spec)?;
            let query = VaultReadQuery::new(&path)?;
            prefix_specs.insert(query.identity().to_string(), spec.clone());
            dependencies.push(Dependency::VaultRead(query));
        }

        let vault = config.vault();
        let (watcher, watcher_streams) = Watcher::new(
            clients.clone(),
            WatcherOptions {
                once: opts.once,
                kv_retry: config.consul().retry(),
                vault_retry: vault.retry(),
                vault_default_lease: vault.default_lease_duration(),
                ..WatcherOptions::default()
            },
        );

        let (token_watcher, token_errors) = TokenWatcher::start(
            clients.secrets().clone(),
            RenewOptions {
                enabled: vault.renew_token(),
                lease: vault.default_lease_duration(),
                threshold: vault.lease_renewal_threshold(),
            },
        );

        let (exit_tx, exit_rx) = mpsc::channel(1);
        let (reload_tx, reload_rx) = mpsc::channel(1);
        let WatcherStreams { data, errors } = watcher_streams;

        Ok(Self {
            config,
            once: opts.once,
            dependencies,
            prefix_specs,
            service_specs,
            snapshot: SyncMutex::new(Snapshot::default()),
            child: RwLock::new(None),
            watcher,
            token_watcher,
            streams: Mutex::new(Some(LoopStreams {
                data,
                errors,
                token_errors,
                reload: reload_rx,
            })),
            exit_tx,
            exit_rx: SyncMutex::new(Some(exit_rx)),
            reload_tx,
            done: CancellationToken::new(),
            stopped: Mutex::new(false),
        })
    }

    /// The registered dependencies, in registration order.
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Channel delivering child exit codes; available once.
    pub fn take_exit_ch(&self) -> Option<mpsc::Receiver<i32>> {
        self.exit_rx.lock().take()
    }

    /// Token that resolves when `stop()` has completed.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Runs the event loop. Blocks until stop, once-mode completion, or a
    /// fatal error.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        info!(target: "supervisor", "starting");

        if let Some(path) = &self.config.pid_file {
            pid::store(Path::new(path))?;
        }

        let mut streams = match self.streams.lock().await.take() {
            Some(streams) => streams,
            None => {
                warn!(target: "supervisor", "already started");
                return Ok(());
            }
        };

        for dep in &self.dependencies {
            self.watcher.add(dep.clone()).await;
        }

        let mut state = LoopState {
            exit_rx: None,
            last_env: None,
            min_deadline: None,
            max_deadline: None,
        };

        // With nothing registered there is nothing to wait for: run one
        // build so the child gets its ambient/custom environment.
        if self.dependencies.is_empty() && self.build_tick(&mut state).await? {
            return Ok(());
        }

        loop {
            let build = tokio::select! {
                maybe = streams.data.recv() => match maybe {
                    Some((dep, data)) => {
                        self.receive(&dep, data);
                        // Drain whatever else is immediately available so a
                        // burst folds into one build.
                        while let Ok((dep, data)) = streams.data.try_recv() {
                            self.receive(&dep, data);
                        }

                        let wait = self.config.wait();
                        if wait.enabled() {
                            debug!(target: "supervisor", "quiescence timers starting");
                            let now = Instant::now();
                            state.min_deadline = Some(now + wait.min());
                            if state.max_deadline.is_none() {
                                state.max_deadline = Some(now + wait.max());
                            }
                            false
                        } else {
                            true
                        }
                    }
                    None => return Ok(()),
                },

                _ = sleep_until_opt(state.min_deadline), if state.min_deadline.is_some() => {
                    debug!(target: "supervisor", "quiescence min timer fired");
                    state.min_deadline = None;
                    state.max_deadline = None;
                    true
                }

                _ = sleep_until_opt(state.max_deadline), if state.max_deadline.is_some() => {
                    debug!(target: "supervisor", "quiescence max timer fired");
                    state.min_deadline = None;
                    state.max_deadline = None;
                    true
                }

                maybe = streams.errors.recv() => {
                    if let Some(err) = maybe {
                        error!(target: "supervisor", error = %err, "watcher reported error");
                        if self.once {
                            return Err(SupervisorError::Watch {
                                dependency: err.dependency,
                                source: err.source,
                            });
                        }
                    }
                    false
                }

                maybe = streams.token_errors.recv() => {
                    if let Some(source) = maybe {
                        error!(target: "supervisor", error = %source, "token watcher reported error");
                        if self.once {
                            return Err(SupervisorError::TokenRenewal { source });
                        }
                    }
                    false
                }

                code = next_exit(&mut state.exit_rx), if state.exit_rx.is_some() => {
                    match code {
                        Some(code) => {
                            debug!(target: "supervisor", code, "child exited");
                            let _ = self.exit_tx.try_send(code);
                        }
                        None => state.exit_rx = None,
                    }
                    false
                }

                maybe = streams.reload.recv() => {
                    if maybe.is_some() {
                        info!(target: "supervisor", "reload requested");
                        let child = self.child.read().await;
                        if let Some(child) = &*child {
                            if let Err(e) = child.reload() {
                                warn!(target: "supervisor", error = %e, "reload signal failed");
                            }
                        }
                        true
                    } else {
                        false
                    }
                }

                _ = self.done.cancelled() => {
                    debug!(target: "supervisor", "received finish");
                    return Ok(());
                }
            };

            if build && self.build_tick(&mut state).await? {
                return Ok(());
            }
        }
    }

    /// Runs one build attempt; true when the loop should end (once mode).
    async fn build_tick(&self, state: &mut LoopState) -> Result<bool, SupervisorError> {
        if let Some(exit_rx) = self.try_build(&mut state.last_env).await? {
            state.exit_rx = Some(exit_rx);
            if self.once {
                // Keep the exit code flowing after the loop ends.
                if let Some(mut rx) = state.exit_rx.take() {
                    let exit_tx = self.exit_tx.clone();
                    tokio::spawn(async move {
                        if let Some(code) = rx.recv().await {
                            let _ = exit_tx.try_send(code);
                        }
                    });
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Builds the environment and swaps the child when it changed. Returns
    /// the new child's exit channel when one was spawned.
    async fn try_build(
        &self,
        last_env: &mut Option<HashMap<String, String>>,
    ) -> Result<Option<mpsc::Receiver<i32>>, SupervisorError> {
        debug!(target: "supervisor", "running build");

        let outcome = {
            let snapshot = self.snapshot.lock();
            let builder =
                EnvironmentBuilder::new(&self.config, &self.prefix_specs, &self.service_specs);
            builder.build(&self.dependencies, &snapshot)
        };

        let emitted = match outcome {
            Ok(BuildOutcome::Ready(env)) => env,
            Ok(BuildOutcome::NotReady { missing }) => {
                debug!(target: "supervisor", %missing, "missing data, not building");
                return Ok(None);
            }
            Err(e) => {
                // Keep running with the last good environment.
                error!(
                    target: "supervisor",
                    error = %e,
                    label = e.as_label(),
                    "environment build failed"
                );
                return Ok(None);
            }
        };

        if last_env.as_ref() == Some(&emitted) {
            debug!(target: "supervisor", "environment was the same");
            return Ok(None);
        }
        *last_env = Some(emitted.clone());

        let exec = self.config.exec();
        let env = compose_child_env(
            &emitted,
            &exec.env_spec(),
            self.config.pristine(),
            std::env::vars(),
        );

        let mut guard = self.child.write().await;
        if let Some(old) = guard.take() {
            info!(target: "supervisor", pid = old.pid(), "stopping existing child");
            old.stop().await;
        }

        let command = exec.command.clone().ok_or(ChildError::NoCommand)?;
        info!(target: "supervisor", %command, "spawning child");
        let (child, exit_rx) = Child::spawn(ChildSpec {
            command,
            env,
            reload_signal: exec.reload_signal,
            kill_signal: exec.kill_signal(),
            kill_timeout: exec.kill_timeout(),
            splay: exec.splay(),
        })
        .await?;
        *guard = Some(child);

        Ok(Some(exit_rx))
    }

    /// Stores fresh dependency data in the snapshot.
    fn receive(&self, dependency: &Dependency, data: DependencyData) {
        debug!(target: "supervisor", dependency = %dependency, "receiving dependency");
        self.snapshot
            .lock()
            .insert(dependency.identity().to_string(), data);
    }

    /// Forwards `signal` to the live child; no-op without one.
    pub async fn signal(&self, signal: nix::sys::signal::Signal) -> Result<(), ChildError> {
        let child = self.child.read().await;
        match &*child {
            Some(child) => child.signal(signal),
            None => Ok(()),
        }
    }

    /// Requests a reload: the loop forwards the exec reload signal to the
    /// child and re-runs a build.
    pub fn reload(&self) {
        let _ = self.reload_tx.try_send(());
    }

    /// Halts watchers and child, removes the PID file, and closes the done
    /// signal. Idempotent.
    pub async fn stop(&self) {
        let mut stopped = self.stopped.lock().await;
        if *stopped {
            return;
        }

        info!(target: "supervisor", "stopping");
        self.watcher.stop().await;
        self.token_watcher.stop().await;

        {
            let mut guard = self.child.write().await;
            if let Some(child) = guard.take() {
                child.stop().await;
            }
        }

        if let Some(path) = &self.config.pid_file {
            if let Err(e) = pid::delete(Path::new(path)) {
                warn!(target: "supervisor", error = %e, "could not remove pid file");
            }
        }

        *stopped = true;
        self.done.cancel();
    }
}

/// Renders a prefix/secret path template (`{{env "VAR"}}` resolves, and
/// fails when the variable is unset).
fn rendered_path(spec: &PrefixSpec) -> Result<String, SupervisorError> {
    let raw = spec.path.as_deref().unwrap_or_default();
    Ok(render(raw, &TemplateVars::for_path()).map_err(crate::error::ConfigError::Template)?)
}

/// Sleeps until the deadline; pends forever when unarmed (the select guard
/// keeps the unarmed branch from being polled).
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Receives from the current child's exit channel, if any.
async fn next_exit(rx: &mut Option<mpsc::Receiver<i32>>) -> Option<i32> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
