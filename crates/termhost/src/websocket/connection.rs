//! Connection adapter over one WebSocket.

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;

use super::protocol::ClientMessage;
use crate::connection::{
    CloseCallback, CloseHandler, Connection, ConnectionCore, SizeHandler, StdinHandler,
};
use crate::{Error, Result, TransportKind, Window};

/// Frames queued for the socket writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsOutput {
    /// Terminal output as a text frame.
    Text(String),
    /// Send a close frame.
    Close,
}

/// A browser terminal as a [`Connection`].
#[derive(Debug)]
pub struct WebSocketConnection {
    core: ConnectionCore,
    output: mpsc::UnboundedSender<WsOutput>,
    term: RwLock<Option<String>>,
}

impl WebSocketConnection {
    /// Creates a connection writing to `output`.
    pub fn new(window: Window, output: mpsc::UnboundedSender<WsOutput>) -> Self {
        Self {
            core: ConnectionCore::new(window),
            output,
            term: RwLock::new(None),
        }
    }

    /// Terminal type reported by the `init` message.
    pub fn term(&self) -> Option<String> {
        self.term.read().clone()
    }

    /// Applies one client message.
    pub fn apply(&self, message: ClientMessage) {
        match message {
            ClientMessage::Init { term, cols, rows } => {
                trace!(term = ?term, cols, rows, "WebSocket init");
                *self.term.write() = term;
                self.core.resize(Window::new(cols, rows));
            }
            ClientMessage::Read { data } => self.core.deliver_input(data.as_bytes()),
            ClientMessage::Resize { cols, rows } => self.core.resize(Window::new(cols, rows)),
        }
    }
}

impl Connection for WebSocketConnection {
    fn transport(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if self.core.is_closed() {
            return Err(Error::Session("connection closed".to_string()));
        }
        let text = self.output_encoding().decode(data);
        self.output
            .send(WsOutput::Text(text))
            .map_err(|_| Error::Session("websocket closed".to_string()))
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
            let _ = self.output.send(WsOutput::Close);
        });
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_apply_messages() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = WebSocketConnection::new(Window::default(), tx);

        conn.apply(ClientMessage::Init {
            term: Some("xterm-256color".to_string()),
            cols: 132,
            rows: 43,
        });
        assert_eq!(conn.size(), Window::new(132, 43));
        assert_eq!(conn.term().as_deref(), Some("xterm-256color"));

        let input = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = input.clone();
        conn.set_stdin_handler(Some(Arc::new(move |data: &[u8]| {
            sink.lock().extend_from_slice(data);
        })));
        conn.apply(ClientMessage::Read { data: "ls\r".to_string() });
        assert_eq!(input.lock().as_slice(), b"ls\r");

        conn.apply(ClientMessage::Resize { cols: 80, rows: 0 });
        assert_eq!(conn.size(), Window::new(80, 24));
    }

    #[test]
    fn test_write_and_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = WebSocketConnection::new(Window::default(), tx);
        conn.write_str("hello\r\n").unwrap();
        conn.close();
        conn.close();

        assert_eq!(rx.try_recv().unwrap(), WsOutput::Text("hello\r\n".to_string()));
        assert_eq!(rx.try_recv().unwrap(), WsOutput::Close);
        assert!(rx.try_recv().is_err());
        assert!(conn.write(b"x").is_err());
    }
}
