//! WebSocket transport for browser terminals.
//!
//! Serves one HTTP route that upgrades to a WebSocket. The first valid
//! [`ClientMessage`] on a socket starts a session; later messages carry
//! keystrokes and resizes. Terminal output is sent back as text frames.

mod connection;
mod protocol;

pub use connection::{WebSocketConnection, WsOutput};
pub use protocol::ClientMessage;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures_util::sink::Sink;
use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::WebSocketConfig;
use crate::connection::Connection;
use crate::introspection::TransportSessionInfo;
use crate::session::{SessionHost, SessionManager, SessionRunner};
use crate::{Error, Result, TransportKind, Window};

/// WebSocket terminal server.
///
/// # Example
///
/// ```rust,ignore
/// let server = WebSocketServer::new(config.websocket.clone(), host)?;
/// server.listen().await?;
/// ```
pub struct WebSocketServer {
    config: WebSocketConfig,
    runner: SessionRunner,
    shutdown: watch::Sender<bool>,
}

impl WebSocketServer {
    /// Creates a server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the endpoint path does not start with `/`.
    pub fn new(config: WebSocketConfig, host: Arc<SessionHost>) -> Result<Self> {
        if !config.path.starts_with('/') {
            return Err(Error::Configuration(format!(
                "websocket path must start with '/': {:?}",
                config.path
            )));
        }
        let manager = Arc::new(SessionManager::new(TransportKind::WebSocket, config.limits));
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            runner: SessionRunner::new(host, manager),
            shutdown,
        })
    }

    /// Configuration.
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Session table of this transport.
    pub fn manager(&self) -> &Arc<SessionManager> {
        self.runner.manager()
    }

    /// Session runner shared by every socket.
    pub fn runner(&self) -> &SessionRunner {
        &self.runner
    }

    /// Router serving the terminal endpoint. Can be merged into a larger app.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.config.path, get(upgrade))
            .with_state(self.runner.clone())
    }

    /// Binds the configured address and serves until shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or cannot be bound.
    pub async fn listen(&self) -> Result<()> {
        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serves requests from `listener` until [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Returns an error if the listener has no local address or the HTTP
    /// server fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        let mut shutdown = self.shutdown.subscribe();
        info!(
            addr = %local_addr,
            path = %self.config.path,
            limits = %self.config.limits,
            "WebSocket server listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await?;

        info!(addr = %local_addr, "WebSocket server stopped accepting connections");
        Ok(())
    }

    /// Stops accepting connections and closes every session.
    ///
    /// Returns the number of sessions that did not close within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.shutdown.send_replace(true);
        self.manager().shutdown(timeout).await
    }
}

impl TransportSessionInfo for WebSocketServer {
    fn transport_name(&self) -> &str {
        self.manager().transport_name()
    }

    fn active_sessions(&self) -> usize {
        self.manager().active_sessions()
    }

    fn max_sessions(&self) -> i64 {
        self.manager().max_sessions()
    }

    fn is_running(&self) -> bool {
        TransportSessionInfo::is_running(self.manager().as_ref())
    }
}

impl fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("config", &self.config)
            .field("manager", self.manager())
            .finish()
    }
}

async fn upgrade(State(runner): State<SessionRunner>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(runner, socket))
}

async fn handle_socket(runner: SessionRunner, socket: WebSocket) {
    let (sink, stream) = socket.split();
    serve_stream(runner, stream, sink).await;
}

/// Runs one browser terminal over a stream of incoming frames and a sink
/// for outgoing frames.
///
/// Returns once the client disconnects or the session closes the
/// connection. Invalid frames are logged and skipped.
pub async fn serve_stream<St, Si, E>(runner: SessionRunner, mut incoming: St, mut outgoing: Si)
where
    St: Stream<Item = std::result::Result<Message, E>> + Unpin + Send,
    Si: Sink<Message> + Unpin + Send + 'static,
    E: fmt::Display + Send,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let connection = Arc::new(WebSocketConnection::new(Window::default(), tx));

    let closed = Arc::new(Notify::new());
    let signal = closed.clone();
    connection.set_close_handler(Arc::new(move || signal.notify_one()));

    let writer = tokio::spawn(async move {
        while let Some(output) = rx.recv().await {
            match output {
                WsOutput::Text(text) => {
                    if outgoing.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                WsOutput::Close => {
                    let _ = outgoing.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = outgoing.close().await;
    });

    let mut session = None;
    loop {
        tokio::select! {
            _ = closed.notified() => break,
            frame = incoming.next() => match frame {
                Some(Ok(Message::Text(text))) => match ClientMessage::parse(&text) {
                    Ok(message) => {
                        connection.apply(message);
                        if session.is_none() {
                            let as_dyn: Arc<dyn Connection> = connection.clone();
                            session = Some(runner.spawn(as_dyn));
                        }
                    }
                    Err(e) => debug!(error = %e, "Ignoring malformed WebSocket message"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket receive error");
                    break;
                }
            },
        }
    }

    connection.close();
    if let Some(session) = session {
        match session.await {
            Ok(outcome) => debug!(?outcome, "WebSocket session finished"),
            Err(e) => warn!(error = %e, "WebSocket session task failed"),
        }
    }
    let _ = writer.await;
}
