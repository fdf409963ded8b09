//! # Child process lifecycle.
//!
//! [`Child`] owns one OS process: spawn with an explicit environment, signal
//! forwarding, and graceful stop with kill-timeout escalation.
//!
//! ## Rules
//! - Commands containing shell metacharacters run under `sh -c` in a fresh
//!   process group, so signals reach the whole subtree.
//! - The exit channel is buffered with length 1 and fires exactly once, even
//!   if nobody is reading when the process dies.
//! - [`Child::stop`] is safe to call repeatedly and concurrently with the
//!   process exiting on its own: first delivery of the kill signal, then up
//!   to `kill_timeout` of waiting, then SIGKILL.
//! - A configured `splay` sleeps a random fraction of it before the spawn to
//!   spread restarts of many supervisors.

use std::collections::HashMap;
use std::time::Duration;

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::ChildError;

/// Characters that force the command through `sh -c`.
const SHELL_CHARS: &[char] = &[
    '|', '&', ';', '<', '>', '(', ')', '$', '`', '\\', '"', '\'', '*', '?', '[', ']', '#', '~',
    '\n',
];

/// Everything needed to spawn one child.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    /// Raw command line from `exec.command`.
    pub command: String,
    /// Exact environment; an empty map clears the environment rather than
    /// inheriting.
    pub env: HashMap<String, String>,
    /// Signal forwarded on reload, if any.
    pub reload_signal: Option<Signal>,
    /// Signal starting a graceful stop.
    pub kill_signal: Signal,
    /// Grace period before SIGKILL.
    pub kill_timeout: Duration,
    /// Upper bound of the random start delay.
    pub splay: Duration,
}

/// Splits a command line, detecting shell metacharacters. Returns the argv
/// and whether a subshell wrapper was used.
pub fn prep_command(command: &str) -> Result<(Vec<String>, bool), ChildError> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(ChildError::NoCommand);
    }

    if trimmed.contains(SHELL_CHARS) {
        return Ok((
            vec!["sh".to_string(), "-c".to_string(), trimmed.to_string()],
            true,
        ));
    }

    Ok((
        trimmed.split_whitespace().map(str::to_string).collect(),
        false,
    ))
}

/// A running child process.
#[derive(Debug)]
pub struct Child {
    pid: i32,
    /// Signals target the process group when a subshell wrapper was used.
    group: bool,
    reload_signal: Option<Signal>,
    kill_signal: Signal,
    kill_timeout: Duration,
    /// Observed exit code; `None` while running.
    status: watch::Receiver<Option<i32>>,
}

impl Child {
    /// Spawns the process and returns the handle plus the exit channel.
    ///
    /// The exit channel receives the exit code exactly once when the process
    /// terminates naturally or by signal.
    pub async fn spawn(spec: ChildSpec) -> Result<(Self, mpsc::Receiver<i32>), ChildError> {
        let (argv, subshell) = prep_command(&spec.command)?;

        if spec.splay > Duration::ZERO {
            let delay = spec.splay.mul_f64(rand::random::<f64>());
            debug!(target: "child", ?delay, "splay before start");
            tokio::time::sleep(delay).await;
        }

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env_clear();
        cmd.envs(&spec.env);
        if subshell {
            cmd.process_group(0);
        }

        let mut proc = cmd.spawn().map_err(|source| ChildError::Spawn {
            command: spec.command.clone(),
            source,
        })?;
        let pid = proc.id().map(|p| p as i32).unwrap_or_default();
        debug!(target: "child", pid, command = %spec.command, "spawned");

        let (exit_tx, exit_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(None);

        tokio::spawn(async move {
            let code = match proc.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!(target: "child", pid, error = %e, "wait failed");
                    -1
                }
            };
            debug!(target: "child", pid, code, "exited");
            let _ = status_tx.send(Some(code));
            let _ = exit_tx.try_send(code);
        });

        Ok((
            Self {
                pid,
                group: subshell,
                reload_signal: spec.reload_signal,
                kill_signal: spec.kill_signal,
                kill_timeout: spec.kill_timeout,
                status: status_rx,
            },
            exit_rx,
        ))
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// True once the process has been reaped.
    pub fn exited(&self) -> bool {
        self.status.borrow().is_some()
    }

    /// Delivers `signal` to the process, or to its process group when one was
    /// created. A process that already exited is not an error.
    pub fn signal(&self, signal: Signal) -> Result<(), ChildError> {
        if self.exited() {
            return Ok(());
        }
        let pid = Pid::from_raw(self.pid);
        let result = if self.group {
            killpg(pid, signal)
        } else {
            kill(pid, signal)
        };
        match result {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(ChildError::Signal {
                pid: self.pid,
                signal: signal.as_str().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Forwards the configured reload signal, if any.
    pub fn reload(&self) -> Result<(), ChildError> {
        match self.reload_signal {
            Some(signal) => self.signal(signal),
            None => Ok(()),
        }
    }

    /// Stops the process: kill signal, wait up to `kill_timeout`, escalate to
    /// SIGKILL. Returns once the process has been reaped.
    pub async fn stop(&self) {
        if self.exited() {
            return;
        }
        debug!(target: "child", pid = self.pid, signal = self.kill_signal.as_str(), "stopping");
        if let Err(e) = self.signal(self.kill_signal) {
            warn!(target: "child", error = %e, "kill signal failed");
        }

        let mut status = self.status.clone();
        let reaped_ok = timeout(self.kill_timeout, status.wait_for(Option::is_some))
            .await
            .is_ok();
        if reaped_ok {
            return;
        }

        warn!(target: "child", pid = self.pid, "kill timeout exceeded, sending SIGKILL");
        if let Err(e) = self.signal(Signal::SIGKILL) {
            warn!(target: "child", error = %e, "SIGKILL failed");
        }
        let _ = status.wait_for(Option::is_some).await;
    }
}

/// Exit code of a reaped process, using the `128 + signal` convention for
/// signal termination.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str) -> ChildSpec {
        ChildSpec {
            command: command.to_string(),
            env: HashMap::new(),
            reload_signal: None,
            kill_signal: Signal::SIGTERM,
            kill_timeout: Duration::from_secs(2),
            splay: Duration::ZERO,
        }
    }

    #[test]
    fn plain_command_splits_on_whitespace() {
        let (argv, subshell) = prep_command("server --port 8080").unwrap();
        assert_eq!(argv, vec!["server", "--port", "8080"]);
        assert!(!subshell);
    }

    #[test]
    fn shell_metacharacters_force_subshell() {
        let (argv, subshell) = prep_command("env > /tmp/out && sleep 1").unwrap();
        assert_eq!(argv[..2], ["sh", "-c"]);
        assert_eq!(argv[2], "env > /tmp/out && sleep 1");
        assert!(subshell);
    }

    #[test]
    fn empty_command_rejected() {
        assert!(matches!(prep_command("  "), Err(ChildError::NoCommand)));
    }

    #[tokio::test]
    async fn exit_code_is_delivered_once() {
        let (child, mut exit_rx) = Child::spawn(spec("true")).await.unwrap();
        let code = exit_rx.recv().await.unwrap();
        assert_eq!(code, 0);
        assert!(child.exited());
        assert!(exit_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn nonzero_exit_code_propagates() {
        let (_child, mut exit_rx) = Child::spawn(spec("false")).await.unwrap();
        assert_eq!(exit_rx.recv().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn env_reaches_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.out");
        let mut s = spec(&format!("env > {}", out.display()));
        // The cleared environment needs a PATH for the shell to find env.
        s.env
            .insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        s.env.insert("ENVISOR_CHECK".to_string(), "yes".to_string());
        let (_child, mut exit_rx) = Child::spawn(s).await.unwrap();
        exit_rx.recv().await.unwrap();

        let contents = std::fs::read_to_string(&out).unwrap();
        assert!(contents.contains("ENVISOR_CHECK=yes"));
    }

    #[tokio::test]
    async fn stop_terminates_a_long_running_child() {
        let (child, mut exit_rx) = Child::spawn(spec("sleep 30")).await.unwrap();
        child.stop().await;
        let code = exit_rx.recv().await.unwrap();
        assert_eq!(code, 128 + Signal::SIGTERM as i32);
    }

    #[tokio::test]
    async fn stop_escalates_when_signal_is_ignored() {
        let mut s = spec("trap '' TERM; while true; do sleep 1; done");
        s.kill_timeout = Duration::from_millis(200);
        let (child, mut exit_rx) = Child::spawn(s).await.unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        child.stop().await;
        let code = exit_rx.recv().await.unwrap();
        assert_eq!(code, 128 + Signal::SIGKILL as i32);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_safe_after_exit() {
        let (child, mut exit_rx) = Child::spawn(spec("true")).await.unwrap();
        exit_rx.recv().await.unwrap();
        child.stop().await;
        child.stop().await;
        assert!(child.signal(Signal::SIGTERM).is_ok());
    }
}
