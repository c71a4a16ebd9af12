//! Uniform interface over a raw transport connection.
//!
//! Every transport (SSH channel, WebSocket, local pair) is exposed to the
//! session runner and the interpreter as an `Arc<dyn Connection>`. Adapters
//! keep their handler bookkeeping in a [`ConnectionCore`], which provides:
//!
//! - stdin delivery, buffering input that arrives before a handler is set
//! - resize notification and the current [`Window`]
//! - append-only close handlers that run once, on the first `close()`

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::{Result, TransportKind, Window};

/// Callback receiving inbound bytes.
pub type StdinHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback receiving terminal size changes.
pub type SizeHandler = Arc<dyn Fn(Window) + Send + Sync>;

/// Single close callback.
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// Character encoding of a connection's byte streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    /// UTF-8.
    #[default]
    Utf8,
    /// 7-bit ASCII. Non-ASCII characters are replaced with `?` on output.
    Ascii,
}

impl Encoding {
    /// Returns the canonical charset name.
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "UTF-8",
            Encoding::Ascii => "US-ASCII",
        }
    }

    /// Encodes text for writing to the connection.
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
        }
    }

    /// Decodes bytes read from the connection, replacing invalid sequences.
    pub fn decode(self, data: &[u8]) -> String {
        String::from_utf8_lossy(data).into_owned()
    }
}

/// Composite close handler.
///
/// Callbacks are appended, never replaced, and run in registration order.
#[derive(Clone, Default)]
pub struct CloseHandler {
    callbacks: Vec<CloseCallback>,
}

impl CloseHandler {
    /// Creates an empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handler that runs `self` first, then `callback`.
    pub fn then(mut self, callback: CloseCallback) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// Runs every callback in order.
    pub fn run(&self) {
        for callback in &self.callbacks {
            callback();
        }
    }

    /// Returns the number of composed callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Returns true if no callbacks are registered.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl fmt::Debug for CloseHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseHandler")
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// A bidirectional terminal connection.
///
/// Implementations must make [`close`](Connection::close) idempotent: the
/// composed close handler runs on the first call only.
pub trait Connection: Send + Sync {
    /// Returns the transport this connection belongs to.
    fn transport(&self) -> TransportKind;

    /// Writes raw bytes to the remote terminal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Session`](crate::Error::Session) when the connection is closed.
    fn write(&self, data: &[u8]) -> Result<()>;

    /// Installs (or clears) the handler receiving inbound bytes.
    fn set_stdin_handler(&self, handler: Option<StdinHandler>);

    /// Returns the current stdin handler.
    fn stdin_handler(&self) -> Option<StdinHandler>;

    /// Installs (or clears) the handler receiving resize notifications.
    fn set_size_handler(&self, handler: Option<SizeHandler>);

    /// Returns the current terminal size.
    fn size(&self) -> Window;

    /// Appends a close callback to the composed close handler.
    fn set_close_handler(&self, callback: CloseCallback);

    /// Returns the composed close handler.
    fn close_handler(&self) -> CloseHandler;

    /// Closes the connection. Only the first call has any effect.
    fn close(&self);

    /// Returns true once [`close`](Connection::close) has been called.
    fn is_closed(&self) -> bool;

    /// Whether the client renders ANSI escape sequences.
    fn supports_ansi(&self) -> bool {
        true
    }

    /// Encoding of inbound bytes.
    fn input_encoding(&self) -> Encoding {
        Encoding::Utf8
    }

    /// Encoding of outbound bytes.
    fn output_encoding(&self) -> Encoding {
        Encoding::Utf8
    }

    /// Writes text using the output encoding.
    ///
    /// # Errors
    ///
    /// See [`Connection::write`].
    fn write_str(&self, text: &str) -> Result<()> {
        self.write(&self.output_encoding().encode(text))
    }
}

#[derive(Default)]
struct StdinState {
    handler: Option<StdinHandler>,
    pending: Vec<u8>,
}

/// Handler bookkeeping shared by every transport adapter.
pub struct ConnectionCore {
    stdin: Mutex<StdinState>,
    size_handler: RwLock<Option<SizeHandler>>,
    window: RwLock<Window>,
    close_handler: Mutex<CloseHandler>,
    closed: AtomicBool,
}

impl ConnectionCore {
    /// Creates a core with the given initial window size.
    pub fn new(window: Window) -> Self {
        Self {
            stdin: Mutex::new(StdinState::default()),
            size_handler: RwLock::new(None),
            window: RwLock::new(window),
            close_handler: Mutex::new(CloseHandler::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Passes inbound bytes to the stdin handler.
    ///
    /// Bytes that arrive before a handler is installed are buffered and
    /// replayed when one is set. Input after close is dropped.
    pub fn deliver_input(&self, data: &[u8]) {
        if self.is_closed() || data.is_empty() {
            return;
        }
        let handler = {
            let mut stdin = self.stdin.lock();
            match stdin.handler.clone() {
                Some(handler) => handler,
                None => {
                    stdin.pending.extend_from_slice(data);
                    trace!(buffered = stdin.pending.len(), "Buffered input without stdin handler");
                    return;
                }
            }
        };
        handler(data);
    }

    /// Installs the stdin handler and replays any buffered input.
    pub fn set_stdin_handler(&self, handler: Option<StdinHandler>) {
        let replay = {
            let mut stdin = self.stdin.lock();
            stdin.handler = handler.clone();
            match handler {
                Some(handler) if !stdin.pending.is_empty() => {
                    Some((handler, std::mem::take(&mut stdin.pending)))
                }
                _ => None,
            }
        };
        if let Some((handler, pending)) = replay {
            handler(&pending);
        }
    }

    /// Returns the stdin handler.
    pub fn stdin_handler(&self) -> Option<StdinHandler> {
        self.stdin.lock().handler.clone()
    }

    /// Records a new window size and notifies the size handler.
    pub fn resize(&self, window: Window) {
        *self.window.write() = window;
        let handler = self.size_handler.read().clone();
        if let Some(handler) = handler {
            handler(window);
        }
    }

    /// Installs the size handler.
    pub fn set_size_handler(&self, handler: Option<SizeHandler>) {
        *self.size_handler.write() = handler;
    }

    /// Returns the current window size.
    pub fn size(&self) -> Window {
        *self.window.read()
    }

    /// Appends a close callback.
    pub fn add_close_handler(&self, callback: CloseCallback) {
        let mut handler = self.close_handler.lock();
        *handler = std::mem::take(&mut *handler).then(callback);
    }

    /// Returns the composed close handler.
    pub fn close_handler(&self) -> CloseHandler {
        self.close_handler.lock().clone()
    }

    /// Marks the connection closed, runs `shutdown` then the close handler.
    ///
    /// Returns false without doing anything if already closed.
    pub fn close(&self, shutdown: impl FnOnce()) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        shutdown();
        self.stdin.lock().handler = None;
        let handler = self.close_handler();
        handler.run();
        true
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for ConnectionCore {
    fn default() -> Self {
        Self::new(Window::default())
    }
}

impl fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("window", &self.size())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, CloseCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (count, Arc::new(move || {
            inner.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_close_handlers_compose_in_order() {
        let core = ConnectionCore::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = order.clone();
        core.add_close_handler(Arc::new(move || first.lock().push("first")));
        let second = order.clone();
        core.add_close_handler(Arc::new(move || second.lock().push("second")));

        assert_eq!(core.close_handler().len(), 2);
        assert!(core.close(|| {}));
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let core = ConnectionCore::default();
        let (count, callback) = counter();
        core.add_close_handler(callback);

        let shutdowns = AtomicUsize::new(0);
        assert!(core.close(|| {
            shutdowns.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!core.close(|| {
            shutdowns.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(core.is_closed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_from_many_threads_runs_once() {
        let core = Arc::new(ConnectionCore::default());
        let (count, callback) = counter();
        core.add_close_handler(callback);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let core = core.clone();
                std::thread::spawn(move || core.close(|| {}))
            })
            .collect();
        let winners = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_input_buffered_until_handler_set() {
        let core = ConnectionCore::default();
        core.deliver_input(b"ab");
        core.deliver_input(b"c");

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        core.set_stdin_handler(Some(Arc::new(move |data: &[u8]| {
            sink.lock().extend_from_slice(data);
        })));
        core.deliver_input(b"d");

        assert_eq!(&*received.lock(), b"abcd");
    }

    #[test]
    fn test_input_dropped_after_close() {
        let core = ConnectionCore::default();
        let received = Arc::new(AtomicUsize::new(0));
        let sink = received.clone();
        core.set_stdin_handler(Some(Arc::new(move |data: &[u8]| {
            sink.fetch_add(data.len(), Ordering::SeqCst);
        })));

        core.close(|| {});
        core.deliver_input(b"late");
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_resize_notifies_handler() {
        let core = ConnectionCore::default();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        core.set_size_handler(Some(Arc::new(move |window| {
            *sink.lock() = Some(window);
        })));

        core.resize(Window::new(132, 43));
        assert_eq!(core.size(), Window::new(132, 43));
        assert_eq!(*seen.lock(), Some(Window::new(132, 43)));
    }

    #[test]
    fn test_encoding() {
        assert_eq!(Encoding::Utf8.name(), "UTF-8");
        assert_eq!(Encoding::Ascii.encode("héllo"), b"h?llo".to_vec());
        assert_eq!(Encoding::Utf8.decode(b"ok"), "ok");
    }
}
