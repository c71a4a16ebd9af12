//! Runtime configuration.
//!
//! [`Config`] is the single source of truth for transport and shell settings,
//! independent of how they were specified (TOML file, CLI flags, or built in
//! code). It is passed explicitly to the transports that need it.
//!
//! # Examples
//!
//! ```toml
//! [ssh]
//! port = 2222
//! max_sessions = 10
//! idle_timeout = "5m"
//!
//! [websocket]
//! path = "/terminal"
//!
//! [shell]
//! prompt = "[termhost]$ "
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SSH transport settings.
    pub ssh: SshConfig,
    /// WebSocket transport settings.
    pub websocket: WebSocketConfig,
    /// Interpreter settings shared by every session.
    pub shell: ShellConfig,
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, [`Error::ConfigParse`]
    /// if it is not valid TOML, and [`Error::Configuration`] if a value is
    /// out of range.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// See [`Config::from_file`].
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.ssh.enabled && self.ssh.port == 0 {
            return Err(Error::Configuration("ssh.port must not be 0".to_string()));
        }
        if self.websocket.enabled && self.websocket.port == 0 {
            return Err(Error::Configuration(
                "websocket.port must not be 0".to_string(),
            ));
        }
        if !self.websocket.path.starts_with('/') {
            return Err(Error::Configuration(format!(
                "websocket.path must start with '/': {}",
                self.websocket.path
            )));
        }
        Ok(())
    }
}

/// Capacity and idle settings shared by every transport section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLimits {
    /// Maximum concurrent sessions. Zero or negative means unbounded.
    pub max_sessions: i64,
    /// Close sessions with no inbound data for this long. Zero disables eviction.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl SessionLimits {
    /// Returns the bound, or `None` when sessions are unbounded.
    pub fn bound(&self) -> Option<i64> {
        (self.max_sessions > 0).then_some(self.max_sessions)
    }

    /// Returns the idle timeout, or `None` when eviction is disabled.
    pub fn idle(&self) -> Option<Duration> {
        (!self.idle_timeout.is_zero()).then_some(self.idle_timeout)
    }
}

/// SSH transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Whether the SSH transport starts.
    pub enabled: bool,
    /// Interface to bind.
    pub host: String,
    /// Port to bind.
    pub port: u16,
    /// PEM/OpenSSH private host key. An ephemeral Ed25519 key is generated when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_key_file: Option<PathBuf>,
    /// Password accepted for every user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// OpenSSH `authorized_keys` file for public key authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized_keys_file: Option<PathBuf>,
    /// SSH identification string sent to clients.
    pub server_id: String,
    /// Capacity and idle settings.
    #[serde(flatten)]
    pub limits: SessionLimits,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 2222,
            host_key_file: None,
            password: None,
            authorized_keys_file: None,
            server_id: "SSH-2.0-termhost".to_string(),
            limits: SessionLimits::default(),
        }
    }
}

impl SshConfig {
    /// Returns the socket address to bind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddrParse`] when `host` is neither an IP address nor `localhost`.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        bind_addr(&self.host, self.port)
    }

    /// Returns true when neither password nor public key auth is configured.
    pub fn is_open(&self) -> bool {
        self.password.is_none() && self.authorized_keys_file.is_none()
    }
}

/// WebSocket transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Whether the WebSocket transport starts.
    pub enabled: bool,
    /// Interface to bind.
    pub host: String,
    /// Port to bind.
    pub port: u16,
    /// HTTP path of the terminal endpoint.
    pub path: String,
    /// Capacity and idle settings.
    #[serde(flatten)]
    pub limits: SessionLimits,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 8080,
            path: "/terminal".to_string(),
            limits: SessionLimits::default(),
        }
    }
}

impl WebSocketConfig {
    /// Returns the socket address to bind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddrParse`] when `host` is neither an IP address nor `localhost`.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        bind_addr(&self.host, self.port)
    }
}

/// Interpreter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Prompt printed before every line.
    pub prompt: String,
    /// Whether the built-in `exit` command is registered.
    pub add_exit_command: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            prompt: "[termhost]$ ".to_string(),
            add_exit_command: true,
        }
    }
}

fn bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let host = if host == "localhost" { "127.0.0.1" } else { host };
    Ok(format!("{host}:{port}").parse()?)
}

/// Parses durations such as `"500ms"`, `"2s"`, `"5m"` or `"1h 30m"`.
///
/// # Errors
///
/// Returns [`Error::Configuration`] when the value is malformed or too large.
pub fn parse_duration(value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| Error::Configuration(format!("invalid duration {value:?}: {e}")))
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for SessionLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bound() {
            Some(max) => write!(f, "max_sessions={max}")?,
            None => f.write_str("max_sessions=unbounded")?,
        }
        match self.idle() {
            Some(idle) => write!(f, " idle_timeout={}", humantime::format_duration(idle)),
            None => f.write_str(" idle_timeout=off"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert!(config.ssh.enabled);
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(config.ssh.host, "localhost");
        assert!(config.ssh.is_open());
        assert_eq!(config.websocket.path, "/terminal");
        assert_eq!(config.shell.prompt, "[termhost]$ ");
        assert!(config.shell.add_exit_command);
        assert_eq!(config.ssh.limits.bound(), None);
        assert_eq!(config.ssh.limits.idle(), None);
    }

    #[test]
    fn test_config_from_toml() {
        let config = Config::from_toml(
            r#"
            [ssh]
            port = 2200
            password = "secret"
            max_sessions = 2
            idle_timeout = "2s"

            [websocket]
            enabled = false
            idle_timeout = "30s"

            [shell]
            prompt = "> "
            add_exit_command = false
            "#,
        )
        .unwrap();

        assert_eq!(config.ssh.port, 2200);
        assert_eq!(config.ssh.password.as_deref(), Some("secret"));
        assert!(!config.ssh.is_open());
        assert_eq!(config.ssh.limits.bound(), Some(2));
        assert_eq!(config.ssh.limits.idle(), Some(Duration::from_secs(2)));
        assert!(!config.websocket.enabled);
        assert_eq!(config.websocket.limits.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.shell.prompt, "> ");
        assert!(!config.shell.add_exit_command);
    }

    #[test]
    fn test_negative_max_sessions_is_unbounded() {
        let config = Config::from_toml("[ssh]\nmax_sessions = -1\n").unwrap();
        assert_eq!(config.ssh.limits.bound(), None);
    }

    #[test]
    fn test_config_rejects_bad_path() {
        let err = Config::from_toml("[websocket]\npath = \"terminal\"\n").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_config_rejects_bad_toml() {
        let err = Config::from_toml("[ssh\nport = 1").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("termhost.toml");
        std::fs::write(&path, "[ssh]\nport = 2022\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.ssh.port, 2022);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h 30m").unwrap(), Duration::from_secs(5400));
        assert!(parse_duration("2 fortnights").is_err());
        assert!(parse_duration("ms").is_err());
    }

    #[test]
    fn test_parse_duration_overflow_is_an_error() {
        let err = parse_duration("5124095576030433h").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = Config::from_toml("[ssh]\nidle_timeout = \"5124095576030433h\"\n").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_idle_timeout_requires_a_unit() {
        let err = Config::from_toml("[ssh]\nidle_timeout = 30\n").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let mut config = Config::default();
        config.websocket.limits.idle_timeout = Duration::from_millis(750);
        let text = toml::to_string(&config).unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_bind_addr_localhost() {
        let addr = SshConfig::default().bind_addr().unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:2222");
    }

    #[test]
    fn test_session_limits_display() {
        let limits = SessionLimits {
            max_sessions: 3,
            idle_timeout: Duration::from_secs(2),
        };
        assert_eq!(limits.to_string(), "max_sessions=3 idle_timeout=2s");
        assert_eq!(
            SessionLimits::default().to_string(),
            "max_sessions=unbounded idle_timeout=off"
        );
    }
}
