//! Connection adapter over one SSH session channel.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::{
    CloseCallback, CloseHandler, Connection, ConnectionCore, SizeHandler, StdinHandler,
};
use crate::{Error, Result, TransportKind, Window};

/// Output of a session, drained by the channel's output pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshOutput {
    /// Bytes for the client terminal.
    Data(Bytes),
    /// Send exit status 0 and close the channel.
    Close,
}

/// An SSH session channel as a [`Connection`].
///
/// Writes are queued to the output pump task that owns the russh channel,
/// so writing never blocks the interpreter.
#[derive(Debug)]
pub struct SshConnection {
    core: ConnectionCore,
    output: mpsc::UnboundedSender<SshOutput>,
}

impl SshConnection {
    /// Creates a connection writing to `output`.
    pub fn new(window: Window, output: mpsc::UnboundedSender<SshOutput>) -> Self {
        Self {
            core: ConnectionCore::new(window),
            output,
        }
    }

    /// Hands client bytes to the stdin handler.
    pub fn deliver_input(&self, data: &[u8]) {
        self.core.deliver_input(data);
    }

    /// Applies a window-change request.
    pub fn resize(&self, window: Window) {
        self.core.resize(window);
    }
}

impl Connection for SshConnection {
    fn transport(&self) -> TransportKind {
        TransportKind::Ssh
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if self.core.is_closed() {
            return Err(Error::Session("connection closed".to_string()));
        }
        self.output
            .send(SshOutput::Data(Bytes::copy_from_slice(data)))
            .map_err(|_| Error::Session("ssh channel closed".to_string()))
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
            let _ = self.output.send(SshOutput::Close);
        });
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}
