//! Command-line interface for the `termhost` binary.
//!
//! # Examples
//!
//! ```bash
//! # Serve SSH on 2222 and WebSocket on 8080 with defaults
//! termhost serve
//!
//! # At most 10 sessions per transport, evict after 5 minutes of silence
//! termhost serve --max-sessions 10 --idle-timeout 5m
//!
//! # Try the demo commands in this terminal
//! termhost console
//!
//! # Print the effective configuration
//! termhost -c termhost.toml config
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use termhost::Config;
use termhost::config::parse_duration;

/// Serve an interactive command shell over SSH and WebSocket.
#[derive(Parser, Debug, Clone)]
#[command(name = "termhost", author, version, about)]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, short = 'c', env = "TERMHOST_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    ///
    /// `RUST_LOG` takes precedence when set
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the enabled transports and serve sessions until Ctrl-C
    Serve(ServeArgs),

    /// Run one session in this terminal over the local transport
    Console,

    /// Print the effective configuration as TOML
    Config(ServeArgs),
}

/// Overrides applied on top of the configuration file.
#[derive(Parser, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Interface for both transports
    #[arg(long, env = "TERMHOST_HOST")]
    pub host: Option<String>,

    /// SSH port
    #[arg(long, env = "TERMHOST_SSH_PORT")]
    pub ssh_port: Option<u16>,

    /// WebSocket port
    #[arg(long, env = "TERMHOST_WS_PORT")]
    pub ws_port: Option<u16>,

    /// WebSocket endpoint path
    #[arg(long)]
    pub ws_path: Option<String>,

    /// Maximum sessions per transport (0 = unbounded)
    #[arg(long, env = "TERMHOST_MAX_SESSIONS")]
    pub max_sessions: Option<i64>,

    /// Idle timeout such as "30s" or "5m" (0 = never)
    #[arg(long, value_parser = duration_arg, env = "TERMHOST_IDLE_TIMEOUT")]
    pub idle_timeout: Option<Duration>,

    /// SSH host key file; an ephemeral key is generated when omitted
    #[arg(long)]
    pub host_key: Option<PathBuf>,

    /// Shared SSH password
    #[arg(long, env = "TERMHOST_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// OpenSSH authorized_keys file for public key authentication
    #[arg(long)]
    pub authorized_keys: Option<PathBuf>,

    /// Shell prompt
    #[arg(long)]
    pub prompt: Option<String>,

    /// Do not start the SSH transport
    #[arg(long)]
    pub no_ssh: bool,

    /// Do not start the WebSocket transport
    #[arg(long)]
    pub no_websocket: bool,
}

fn duration_arg(value: &str) -> Result<Duration, String> {
    parse_duration(value).map_err(|e| e.to_string())
}

impl ServeArgs {
    /// Applies the flags that were given to `config`.
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.ssh.host.clone_from(host);
            config.websocket.host.clone_from(host);
        }
        if let Some(port) = self.ssh_port {
            config.ssh.port = port;
        }
        if let Some(port) = self.ws_port {
            config.websocket.port = port;
        }
        if let Some(path) = &self.ws_path {
            config.websocket.path.clone_from(path);
        }
        if let Some(max) = self.max_sessions {
            config.ssh.limits.max_sessions = max;
            config.websocket.limits.max_sessions = max;
        }
        if let Some(timeout) = self.idle_timeout {
            config.ssh.limits.idle_timeout = timeout;
            config.websocket.limits.idle_timeout = timeout;
        }
        if let Some(path) = &self.host_key {
            config.ssh.host_key_file = Some(path.clone());
        }
        if let Some(password) = &self.password {
            config.ssh.password = Some(password.clone());
        }
        if let Some(path) = &self.authorized_keys {
            config.ssh.authorized_keys_file = Some(path.clone());
        }
        if let Some(prompt) = &self.prompt {
            config.shell.prompt.clone_from(prompt);
        }
        if self.no_ssh {
            config.ssh.enabled = false;
        }
        if self.no_websocket {
            config.websocket.enabled = false;
        }
    }
}

/// Default log filter for a `-v` count.
pub fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_flags() {
        let cli = Cli::parse_from([
            "termhost",
            "-vv",
            "serve",
            "--ssh-port",
            "2022",
            "--max-sessions",
            "2",
            "--idle-timeout",
            "2s",
            "--no-websocket",
        ]);
        assert_eq!(cli.verbose, 2);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };

        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.ssh.port, 2022);
        assert_eq!(config.ssh.limits.max_sessions, 2);
        assert_eq!(config.websocket.limits.idle_timeout, Duration::from_secs(2));
        assert!(config.ssh.enabled);
        assert!(!config.websocket.enabled);
    }

    #[test]
    fn test_unset_flags_keep_config() {
        let mut config = Config::default();
        ServeArgs::default().apply(&mut config);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_invalid_duration_rejected() {
        assert!(Cli::try_parse_from(["termhost", "serve", "--idle-timeout", "soon"]).is_err());
    }

    #[test]
    fn test_log_filter() {
        assert_eq!(log_filter(0), "info");
        assert_eq!(log_filter(1), "debug");
        assert_eq!(log_filter(5), "trace");
    }
}
