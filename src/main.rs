//! Binary entry point: parse flags, load and merge configuration, start the
//! supervisor, and translate signals and child exits into an exit code.

mod cli;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use envisor::{ClientSet, Config, ConfigError, Supervisor, SupervisorOptions};

use cli::Cli;

/// Configuration problems: unreadable files, bad documents, bad flags.
const EXIT_CONFIG_ERROR: i32 = 10;
/// Fatal supervisor-side failures at runtime.
const EXIT_RUNTIME_ERROR: i32 = 11;

fn main() {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("envisor: could not start runtime: {e}");
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    };
    let code = runtime.block_on(run());
    std::process::exit(code);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("envisor: {e}");
            return EXIT_CONFIG_ERROR;
        }
    };

    init_tracing(&config.log_level());

    if config.exec().command.is_none() {
        eprintln!("envisor: no command given; pass one after the flags or set exec.command");
        return EXIT_CONFIG_ERROR;
    }

    let clients = match ClientSet::from_config(&config) {
        Ok(clients) => clients,
        Err(e) => {
            error!(error = %e, "client construction failed");
            return EXIT_RUNTIME_ERROR;
        }
    };

    let reload_signal = config.reload_signal();
    let kill_signal = config.kill_signal();

    let supervisor = match Supervisor::new(config, clients, SupervisorOptions { once: cli.once }) {
        Ok(supervisor) => Arc::new(supervisor),
        Err(e) => {
            error!(error = %e, label = e.as_label(), "could not create supervisor");
            return EXIT_RUNTIME_ERROR;
        }
    };

    let mut exit_rx = match supervisor.take_exit_ch() {
        Some(rx) => rx,
        None => {
            error!("exit channel unavailable");
            return EXIT_RUNTIME_ERROR;
        }
    };

    let mut reload_rx = match signal(SignalKind::from_raw(reload_signal as i32)) {
        Ok(rx) => rx,
        Err(e) => {
            error!(error = %e, "could not install reload signal handler");
            return EXIT_RUNTIME_ERROR;
        }
    };
    let mut kill_rx = match signal(SignalKind::from_raw(kill_signal as i32)) {
        Ok(rx) => rx,
        Err(e) => {
            error!(error = %e, "could not install kill signal handler");
            return EXIT_RUNTIME_ERROR;
        }
    };

    let mut runner = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.start().await })
    };
    let mut runner_done = false;

    loop {
        tokio::select! {
            _ = reload_rx.recv() => {
                info!(signal = reload_signal.as_str(), "reload signal received");
                supervisor.reload();
            }

            _ = kill_rx.recv() => {
                info!(signal = kill_signal.as_str(), "terminate signal received, stopping");
                supervisor.stop().await;
                if !runner_done {
                    let _ = (&mut runner).await;
                }
                return 0;
            }

            code = exit_rx.recv() => {
                let code = code.unwrap_or(EXIT_RUNTIME_ERROR);
                info!(code, "child exited, stopping");
                supervisor.stop().await;
                if !runner_done {
                    let _ = (&mut runner).await;
                }
                return code;
            }

            result = &mut runner, if !runner_done => {
                runner_done = true;
                match result {
                    // Once-mode completion: keep waiting for the child.
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(error = %e, label = e.as_label(), "supervisor failed");
                        supervisor.stop().await;
                        return EXIT_RUNTIME_ERROR;
                    }
                    Err(e) => {
                        error!(error = %e, "supervisor task panicked");
                        supervisor.stop().await;
                        return EXIT_RUNTIME_ERROR;
                    }
                }
            }
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let mut config = Config::default();
    for path in &cli.config {
        config = config.merge(&envisor::config::from_path(Path::new(path))?);
    }
    config = config.merge(&cli.overlay()?);
    config.finalize();
    Ok(config)
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
