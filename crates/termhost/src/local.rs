//! In-process connection pair.
//!
//! [`local_pair`] returns a [`LocalConnection`] to hand to a session runner
//! and a [`LocalClient`] that plays the remote terminal. The `console`
//! command uses it to run a session on the controlling terminal, and the
//! integration tests use it to drive sessions without sockets.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connection::{
    CloseCallback, CloseHandler, Connection, ConnectionCore, SizeHandler, StdinHandler,
};
use crate::{Error, Result, TransportKind, Window};

/// Server side of a local pair.
pub struct LocalConnection {
    core: ConnectionCore,
    transport: TransportKind,
    output: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl LocalConnection {
    /// Feeds bytes as if typed by the client.
    pub fn deliver_input(&self, data: &[u8]) {
        self.core.deliver_input(data);
    }

    /// Changes the window size as if the client resized its terminal.
    pub fn resize(&self, window: Window) {
        self.core.resize(window);
    }
}

impl Connection for LocalConnection {
    fn transport(&self) -> TransportKind {
        self.transport
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let output = self.output.lock();
        let sender = output
            .as_ref()
            .ok_or_else(|| Error::Session("connection closed".to_string()))?;
        sender
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| Error::Session("client went away".to_string()))
    }

    fn set_stdin_handler(&self, handler: Option<StdinHandler>) {
        self.core.set_stdin_handler(handler);
    }

    fn stdin_handler(&self) -> Option<StdinHandler> {
        self.core.stdin_handler()
    }

    fn set_size_handler(&self, handler: Option<SizeHandler>) {
        self.core.set_size_handler(handler);
    }

    fn size(&self) -> Window {
        self.core.size()
    }

    fn set_close_handler(&self, callback: CloseCallback) {
        self.core.add_close_handler(callback);
    }

    fn close_handler(&self) -> CloseHandler {
        self.core.close_handler()
    }

    fn close(&self) {
        self.core.close(|| {
            self.output.lock().take();
        });
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

/// Client side of a local pair.
pub struct LocalClient {
    connection: Arc<LocalConnection>,
    output: mpsc::UnboundedReceiver<Bytes>,
    received: String,
}

/// Creates a connected pair for the given transport kind.
pub fn local_pair(transport: TransportKind, window: Window) -> (Arc<LocalConnection>, LocalClient) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = Arc::new(LocalConnection {
        core: ConnectionCore::new(window),
        transport,
        output: Mutex::new(Some(tx)),
    });
    let client = LocalClient {
        connection: connection.clone(),
        output: rx,
        received: String::new(),
    };
    (connection, client)
}

impl LocalClient {
    /// Returns the server side of the pair.
    pub fn connection(&self) -> Arc<LocalConnection> {
        self.connection.clone()
    }

    /// Sends raw bytes.
    pub fn send(&self, data: impl AsRef<[u8]>) {
        self.connection.deliver_input(data.as_ref());
    }

    /// Sends a line terminated with a carriage return, as a terminal would.
    pub fn send_line(&self, line: &str) {
        self.send(format!("{line}\r"));
    }

    /// Resizes the terminal.
    pub fn resize(&self, width: u32, height: u32) {
        self.connection.resize(Window::new(width, height));
    }

    /// Closes the connection from the client side.
    pub fn close(&self) {
        self.connection.close();
    }

    /// Returns true once either side closed the connection.
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Receives the next chunk of output, or `None` once the server closed.
    ///
    /// Chunks taken here are not seen by [`read_until`](Self::read_until).
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.output.recv().await
    }

    async fn buffer_next(&mut self) -> Option<()> {
        let chunk = self.output.recv().await?;
        self.received.push_str(&String::from_utf8_lossy(&chunk));
        Some(())
    }

    /// Reads output until `needle` appears and returns everything received so far.
    ///
    /// The accumulated text is consumed up to and including the needle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Session`] on timeout or if the connection closes first.
    pub async fn read_until(&mut self, needle: &str, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(pos) = self.received.find(needle) {
                let end = pos + needle.len();
                let text = self.received[..end].to_string();
                self.received.drain(..end);
                return Ok(text);
            }
            match tokio::time::timeout_at(deadline, self.buffer_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    return Err(Error::Session(format!(
                        "connection closed before {needle:?}; received {:?}",
                        self.received
                    )));
                }
                Err(_) => {
                    return Err(Error::Session(format!(
                        "timed out waiting for {needle:?}; received {:?}",
                        self.received
                    )));
                }
            }
        }
    }

    /// Waits for the server to close the output stream and returns remaining output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Session`] on timeout.
    pub async fn read_to_end(&mut self, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.buffer_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => return Ok(std::mem::take(&mut self.received)),
                Err(_) => {
                    return Err(Error::Session(format!(
                        "timed out waiting for close; received {:?}",
                        self.received
                    )));
                }
            }
        }
    }
}
