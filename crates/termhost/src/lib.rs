#![forbid(unsafe_code)]
// Allow pedantic lints for early-stage API ergonomics.
#![allow(clippy::doc_markdown)]
#![allow(clippy::nursery)]
#![allow(clippy::pedantic)]

//! # termhost
//!
//! Serve an interactive command interpreter over remote terminal transports.
//!
//! Every accepted SSH channel or WebSocket connection becomes an independent
//! session that runs its own interpreter instance while sharing one set of
//! registered commands and injected services.
//!
//! ## Features
//!
//! - **Capacity limits**: per-transport session caps with a lock-free admit path
//! - **Idle eviction**: sessions without inbound data are closed after a timeout
//! - **Lifecycle events**: exactly one `opened` and one `closed` per session
//! - **Dependency injection**: services are injected into command trees and
//!   the completers, validators, converters and activators attached to options
//! - **Transports**: SSH (russh), WebSocket (axum) and an in-process local pair
//!
//! ## Example
//!
//! ```rust,ignore
//! use termhost::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> termhost::Result<()> {
//!     let host = SessionHost::builder()
//!         .registry_factory(|| Ok(CommandRegistry::new().with(CommandNode::new("hello", Hello))))
//!         .build();
//!
//!     let server = SshServer::new(SshConfig::default(), host)?;
//!     server.listen().await
//! }
//! ```

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod auth;
pub mod command;
pub mod config;
pub mod connection;
pub mod inject;
pub mod introspection;
pub mod local;
pub mod session;
pub mod shell;
pub mod ssh;
pub mod websocket;

pub use command::{Command, CommandNode, CommandRegistry, Invocation, RegistryFactory};
pub use config::Config;
pub use connection::{CloseHandler, Connection, Encoding};
pub use inject::{Container, DependencyInjector, Inject, ServiceContainer};
pub use introspection::{TransportSessionInfo, TransportStatus};
pub use session::{SessionHost, SessionId, SessionManager, SessionRunner};
pub use shell::{Interpreter, LineShell, ShellSettings};

/// Message written to a connection that arrives while its transport is full.
pub const REJECTION_MESSAGE: &str = "Connection rejected: maximum number of sessions reached.\r\n";

/// Message written to a connection that arrives while its transport shuts down.
pub const SHUTDOWN_MESSAGE: &str = "Connection rejected: server is shutting down.\r\n";

// -----------------------------------------------------------------------------
// Error Types
// -----------------------------------------------------------------------------

/// Errors that can occur while hosting terminal sessions.
///
/// # Recovery Strategies
///
/// | Error Variant | Recovery Strategy |
/// |--------------|-------------------|
/// | [`Io`](Error::Io) | Check permissions, port availability |
/// | [`Ssh`](Error::Ssh) | Log and continue for recoverable errors |
/// | [`Russh`](Error::Russh) | Check SSH protocol compatibility |
/// | [`KeyLoad`](Error::KeyLoad) | Verify key file format |
/// | [`Configuration`](Error::Configuration) | Fix the configuration file or flags |
/// | [`ConfigParse`](Error::ConfigParse) | Fix TOML syntax |
/// | [`Session`](Error::Session) | Close the session |
/// | [`Injection`](Error::Injection) | Fix the field type or the registered service |
/// | [`Registry`](Error::Registry) | Fix the command registry factory |
/// | [`Interpreter`](Error::Interpreter) | Close the session |
/// | [`AddrParse`](Error::AddrParse) | Validate address format |
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during server operations.
    ///
    /// Commonly occurs when:
    /// - The bind address is already in use
    /// - Permission denied on privileged ports
    /// - A key or config file cannot be read
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// SSH protocol error with a descriptive message.
    #[error("ssh error: {0}")]
    Ssh(String),

    /// Underlying russh library error.
    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),

    /// Key loading error from russh-keys.
    #[error("key loading error: {0}")]
    KeyLoad(#[from] russh_keys::Error),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Configuration file is not valid TOML for [`Config`].
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Error during an active session.
    #[error("session error: {0}")]
    Session(String),

    /// A resolved service could not be stored into a tagged field.
    ///
    /// Unresolvable services are not errors; the field is left untouched.
    #[error("failed to inject field `{field}` of `{owner}`: {reason}")]
    Injection {
        /// Type that declares the field.
        owner: &'static str,
        /// Field name.
        field: &'static str,
        /// Why the value could not be stored.
        reason: String,
    },

    /// The per-session command registry could not be built.
    #[error("registry error: {0}")]
    Registry(String),

    /// The interpreter loop failed.
    #[error("interpreter error: {0}")]
    Interpreter(String),

    /// Address parse error.
    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

/// A specialized [`Result`] type for termhost operations.
pub type Result<T> = std::result::Result<T, Error>;

// -----------------------------------------------------------------------------
// Transport Types
// -----------------------------------------------------------------------------

/// The transport a session arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Secure shell channel.
    Ssh,
    /// Browser WebSocket.
    WebSocket,
    /// In-process connection pair.
    Local,
}

impl TransportKind {
    /// Returns the name used in logs, events and status reports.
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Ssh => "ssh",
            TransportKind::WebSocket => "websocket",
            TransportKind::Local => "local",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// Terminal width in columns.
    pub width: u32,
    /// Terminal height in rows.
    pub height: u32,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}

impl Window {
    /// Creates a window size, substituting defaults for zero dimensions.
    pub fn new(width: u32, height: u32) -> Self {
        let default = Self::default();
        Self {
            width: if width == 0 { default.width } else { width },
            height: if height == 0 { default.height } else { height },
        }
    }
}

// -----------------------------------------------------------------------------
// Prelude
// -----------------------------------------------------------------------------

/// Commonly used types.
pub mod prelude {
    pub use crate::auth::{AcceptAllAuth, AuthHandler, AuthorizedKeysAuth, PasswordAuth};
    pub use crate::command::{
        Activator, Command, CommandNode, CommandRegistry, CommandResult, Completer, Converter,
        Invocation, OptionSlot, RegistryFactory, Validator,
    };
    pub use crate::config::{Config, ShellConfig, SshConfig, WebSocketConfig};
    pub use crate::connection::Connection;
    pub use crate::inject::{
        Container, DependencyInjector, FieldInjector, Inject, Injectable, ServiceContainer,
    };
    pub use crate::injectable;
    pub use crate::introspection::{TransportSessionInfo, TransportStatus};
    pub use crate::local::{LocalClient, LocalConnection};
    pub use crate::session::{
        SessionEvent, SessionEventKind, SessionHost, SessionObserver, SessionOutcome,
        SessionRunner,
    };
    pub use crate::shell::{Interpreter, LineShell, ShellCustomizer, ShellSettings};
    pub use crate::ssh::SshServer;
    pub use crate::websocket::WebSocketServer;
    pub use crate::{Error, Result, TransportKind, Window};
}
