//! Session lifecycle notification.
//!
//! The [`LifecycleNotifier`] delivers `opened` and `closed` events to
//! registered [`SessionObserver`]s on a dedicated dispatcher thread. Sessions
//! never wait on observers, and a panicking observer is logged and skipped.
//! Events are delivered in the order they were fired, so an observer always
//! sees a session's `opened` before its `closed`.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, warn};

use super::handle::{SessionHandle, SessionId};
use crate::TransportKind;

/// Number of events kept by a [`SessionEventLog`] by default.
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 100;

/// Which lifecycle transition an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionEventKind {
    /// The session was admitted.
    Opened,
    /// The session ended.
    Closed,
}

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEvent {
    /// Transition.
    pub kind: SessionEventKind,
    /// Session id.
    pub session_id: SessionId,
    /// Transport the session arrived on.
    pub transport: TransportKind,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
}

impl SessionEvent {
    fn now(kind: SessionEventKind, session: &SessionHandle) -> Self {
        Self {
            kind,
            session_id: session.id(),
            transport: session.transport(),
            timestamp: Utc::now(),
        }
    }
}

/// Receives lifecycle events.
///
/// Callbacks run on the dispatcher thread and should return quickly.
pub trait SessionObserver: Send + Sync {
    /// Called once when a session is admitted.
    fn on_opened(&self, event: &SessionEvent) {
        let _ = event;
    }

    /// Called once when a session ends.
    fn on_closed(&self, event: &SessionEvent) {
        let _ = event;
    }
}

enum Dispatch {
    Event(SessionEvent, Vec<Arc<dyn SessionObserver>>),
    Flush(mpsc::Sender<()>),
}

/// Fires lifecycle events asynchronously.
pub struct LifecycleNotifier {
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
    observed: AtomicBool,
    sender: Mutex<Option<mpsc::Sender<Dispatch>>>,
}

impl LifecycleNotifier {
    /// Creates a notifier with no observers.
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            observed: AtomicBool::new(false),
            sender: Mutex::new(None),
        }
    }

    /// Registers an observer.
    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) {
        let mut observers = self.observers.write();
        observers.push(observer);
        self.observed.store(true, Ordering::Release);
        debug!(observers = observers.len(), "Session observer registered");
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Returns true if any observer is registered.
    ///
    /// Sessions read this once when they open and keep the answer, so event
    /// payloads are never built for sessions nobody was watching.
    pub fn is_observed(&self) -> bool {
        self.observed.load(Ordering::Acquire)
    }

    /// Fires `opened` for a session.
    pub fn opened(&self, session: &SessionHandle) {
        if session.is_observed() {
            self.dispatch(SessionEvent::now(SessionEventKind::Opened, session));
        }
    }

    /// Fires `closed` for a session.
    pub fn closed(&self, session: &SessionHandle) {
        if session.is_observed() {
            self.dispatch(SessionEvent::now(SessionEventKind::Closed, session));
        }
    }

    /// Blocks until every event fired so far has been delivered.
    pub fn flush(&self) {
        let (tx, rx) = mpsc::channel();
        if self.send(Dispatch::Flush(tx)) {
            let _ = rx.recv();
        }
    }

    fn dispatch(&self, event: SessionEvent) {
        let observers = self.observers.read().clone();
        if observers.is_empty() {
            return;
        }
        self.send(Dispatch::Event(event, observers));
    }

    fn send(&self, message: Dispatch) -> bool {
        let mut sender = self.sender.lock();
        if sender.is_none() {
            *sender = spawn_dispatcher();
        }
        let result = match sender.as_ref() {
            Some(tx) => tx.send(message),
            None => {
                deliver(message);
                return false;
            }
        };
        match result {
            Ok(()) => true,
            Err(mpsc::SendError(message)) => {
                warn!("Event dispatcher stopped, delivering inline");
                *sender = None;
                deliver(message);
                false
            }
        }
    }
}

impl Default for LifecycleNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifecycleNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleNotifier")
            .field("observers", &self.observer_count())
            .finish()
    }
}

fn spawn_dispatcher() -> Option<mpsc::Sender<Dispatch>> {
    let (tx, rx) = mpsc::channel::<Dispatch>();
    let spawned = thread::Builder::new()
        .name("termhost-events".to_string())
        .spawn(move || {
            while let Ok(message) = rx.recv() {
                deliver(message);
            }
            debug!("Event dispatcher finished");
        });
    match spawned {
        Ok(_) => Some(tx),
        Err(e) => {
            error!(error = %e, "Failed to start event dispatcher");
            None
        }
    }
}

fn deliver(message: Dispatch) {
    match message {
        Dispatch::Event(event, observers) => {
            for observer in observers {
                let result = catch_unwind(AssertUnwindSafe(|| match event.kind {
                    SessionEventKind::Opened => observer.on_opened(&event),
                    SessionEventKind::Closed => observer.on_closed(&event),
                }));
                if result.is_err() {
                    warn!(
                        session_id = %event.session_id,
                        event = ?event.kind,
                        "Session observer panicked"
                    );
                }
            }
        }
        Dispatch::Flush(ack) => {
            let _ = ack.send(());
        }
    }
}

/// Observer that keeps the most recent events, for dashboards and health pages.
pub struct SessionEventLog {
    events: Mutex<VecDeque<SessionEvent>>,
    capacity: usize,
}

impl SessionEventLog {
    /// Creates a log holding [`DEFAULT_EVENT_LOG_CAPACITY`] events.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_LOG_CAPACITY)
    }

    /// Creates a log holding up to `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Recorded events, oldest first.
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Events of one session, oldest first.
    pub fn events_for(&self, session_id: SessionId) -> Vec<SessionEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Drops every recorded event.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Recorded events as a JSON array.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.events()).unwrap_or(serde_json::Value::Null)
    }

    fn record(&self, event: &SessionEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

impl Default for SessionEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionObserver for SessionEventLog {
    fn on_opened(&self, event: &SessionEvent) {
        self.record(event);
    }

    fn on_closed(&self, event: &SessionEvent) {
        self.record(event);
    }
}
