//! Command-line surface. Flags become a configuration overlay merged over
//! the loaded files, so the CLI always has the last word.

use std::path::PathBuf;

use clap::Parser;

use envisor::config::convert::parse_duration;
use envisor::config::{ConsulConfig, ExecSpec, PrefixSpec, ServiceSpec, VaultConfig};
use envisor::{Config, ConfigError};

#[derive(Parser, Debug)]
#[command(name = "envisor")]
#[command(version)]
#[command(
    about = "Launch a subprocess with environment variables read from a KV store and a secrets store",
    long_about = None
)]
pub struct Cli {
    /// Config file or directory; repeatable, merged in order.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Vec<PathBuf>,

    /// Fetch data once, run the command, and exit with its code.
    #[arg(long)]
    pub once: bool,

    /// Do not inherit the current environment.
    #[arg(long)]
    pub pristine: bool,

    /// Replace invalid characters in keys with underscores.
    #[arg(long)]
    pub sanitize: bool,

    /// Uppercase all emitted keys.
    #[arg(long)]
    pub upcase: bool,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// KV source root; repeatable.
    #[arg(long, value_name = "PATH")]
    pub prefix: Vec<String>,

    /// Secret source root; repeatable.
    #[arg(long, value_name = "PATH")]
    pub secret: Vec<String>,

    /// Service catalog query; repeatable.
    #[arg(long, value_name = "NAME")]
    pub service: Vec<String>,

    /// KV store address.
    #[arg(long = "consul-addr", value_name = "ADDR")]
    pub consul_addr: Option<String>,

    /// KV store token.
    #[arg(long = "consul-token", value_name = "TOKEN")]
    pub consul_token: Option<String>,

    /// Secrets store address.
    #[arg(long = "vault-addr", value_name = "ADDR")]
    pub vault_addr: Option<String>,

    /// Secrets store token.
    #[arg(long = "vault-token", value_name = "TOKEN")]
    pub vault_token: Option<String>,

    /// Renew the secrets store token periodically.
    #[arg(long = "vault-renew-token", value_name = "BOOL")]
    pub vault_renew_token: Option<bool>,

    /// Maximum staleness for KV reads, e.g. "2s".
    #[arg(long = "max-stale", value_name = "DURATION")]
    pub max_stale: Option<String>,

    /// Path for the PID file.
    #[arg(long = "pid-file", value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    /// The command to supervise.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Cli {
    /// Builds the flag overlay, merged over file configs with highest
    /// precedence.
    pub fn overlay(&self) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        if self.consul_addr.is_some() || self.consul_token.is_some() {
            config.consul = Some(ConsulConfig {
                address: self.consul_addr.clone(),
                token: self.consul_token.clone(),
                ..ConsulConfig::default()
            });
        }

        if self.vault_addr.is_some()
            || self.vault_token.is_some()
            || self.vault_renew_token.is_some()
        {
            config.vault = Some(VaultConfig {
                address: self.vault_addr.clone(),
                token: self.vault_token.clone(),
                renew_token: self.vault_renew_token,
                ..VaultConfig::default()
            });
        }

        if !self.prefix.is_empty() {
            config.prefix = Some(self.prefix.iter().map(PrefixSpec::from_path).collect());
        }
        if !self.secret.is_empty() {
            config.secret = Some(self.secret.iter().map(PrefixSpec::from_path).collect());
        }
        if !self.service.is_empty() {
            config.service = Some(self.service.iter().map(ServiceSpec::from_query).collect());
        }

        if !self.command.is_empty() {
            config.exec = Some(ExecSpec {
                command: Some(self.command.join(" ")),
                ..ExecSpec::default()
            });
        }

        if self.pristine {
            config.pristine = Some(true);
        }
        if self.sanitize {
            config.sanitize = Some(true);
        }
        if self.upcase {
            config.upcase = Some(true);
        }

        if let Some(level) = &self.log_level {
            config.log_level = Some(level.clone());
        }
        if let Some(stale) = &self.max_stale {
            config.max_stale = Some(parse_duration(stale)?);
        }
        if let Some(pid) = &self.pid_file {
            config.pid_file = Some(pid.display().to_string());
        }

        Ok(config)
    }
}
