//! Endpoint event monitoring.
//!
//! Owners of an endpoint opt in to lifecycle events by calling `monitor()`,
//! which hands out a fresh channel receiver. Events are fanned out to every
//! live receiver; receivers that were dropped are pruned on the next emit.

use crate::error::LettuceError;

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Endpoint lifecycle events.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// A client completed the registration handshake.
    ClientRegistered(String),

    /// A client was de-registered and its session detached.
    ClientDeregistered(String),

    /// A failure was reported by the I/O loop or the registry.
    Failure(Arc<LettuceError>),

    /// The I/O loop exited.
    Stopped,
}

impl fmt::Display for EndpointEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientRegistered(id) => write!(f, "Client {id} registered"),
            Self::ClientDeregistered(id) => write!(f, "Client {id} de-registered"),
            Self::Failure(err) => write!(f, "Failure: {err}"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Handle for receiving endpoint events.
pub type EndpointMonitor = flume::Receiver<EndpointEvent>;

/// Fan-out of events to every monitor receiver.
#[derive(Default)]
pub struct EventBus {
    senders: Mutex<Vec<flume::Sender<EndpointEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new monitor receiving every event emitted from now on.
    pub fn monitor(&self) -> EndpointMonitor {
        let (tx, rx) = flume::unbounded();
        self.senders.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: EndpointEvent) {
        let mut senders = self.senders.lock();
        if senders.is_empty() {
            return;
        }
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Convenience for reporting an error.
    pub fn emit_failure(&self, error: LettuceError) {
        self.emit(EndpointEvent::Failure(Arc::new(error)));
    }

    pub fn monitor_count(&self) -> usize {
        self.senders.lock().len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("monitors", &self.monitor_count())
            .finish()
    }
}
