//! Broadcast Hub
//!
//! Responsibilities:
//! - Map a message type identifier to an ordered list of subscribers.
//! - Fan a dispatched message out to every subscriber of its exact type.
//! - Isolate subscriber panics so one faulty callback cannot starve the rest.
//!
//! Concurrency model:
//! - Subscribing may happen from any thread.
//! - `publish` snapshots the subscriber list under a read lock and invokes
//!   callbacks without holding it, so callbacks may subscribe or publish
//!   re-entrantly.
//!
//! Every endpoint exposes one hub for its own inbound traffic; the server
//! additionally keeps one hub per client session (its mailbox).

use crate::message::{Envelope, Message};

use hashbrown::HashMap;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

type Callback = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Handle returned by `subscribe`, used to remove the subscription again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    callback: Callback,
}

/// Outcome of a single `publish` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that returned normally
    pub delivered: usize,
    /// Subscribers that panicked
    pub failed: usize,
}

impl PublishReport {
    /// No subscriber was registered for the message type.
    pub const fn is_unhandled(&self) -> bool {
        self.delivered == 0 && self.failed == 0
    }
}

/// Local publish/subscribe fan-out keyed by message type identifier.
#[derive(Default)]
pub struct BroadcastHub {
    subscribers: RwLock<HashMap<u32, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a typed callback to every `M` dispatched through this hub.
    pub fn subscribe<M, F>(&self, callback: F) -> SubscriptionId
    where
        M: Message,
        F: Fn(&M) + Send + Sync + 'static,
    {
        self.subscribe_raw(M::TYPE_ID, move |envelope: &Envelope| {
            if let Some(message) = envelope.downcast_ref::<M>() {
                callback(message);
            }
        })
    }

    /// Subscribe an untyped callback to a type identifier.
    ///
    /// There is no uniqueness constraint: subscribing the same callback twice
    /// makes it fire twice.
    pub fn subscribe_raw<F>(&self, type_id: u32, callback: F) -> SubscriptionId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(type_id)
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let mut removed = false;
        subscribers.retain(|_, list| {
            let before = list.len();
            list.retain(|s| s.id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Invoke every subscriber of the envelope's type, in subscription order.
    pub fn publish(&self, envelope: &Envelope) -> PublishReport {
        let type_id = envelope.type_id();

        // Snapshot so callbacks run without the lock held.
        let callbacks: Vec<(SubscriptionId, Callback)> = match self.subscribers.read().get(&type_id) {
            Some(list) => list.iter().map(|s| (s.id, s.callback.clone())).collect(),
            None => {
                trace!(type_id, "[HUB] No subscribers");
                return PublishReport::default();
            }
        };

        let mut report = PublishReport::default();
        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(envelope))) {
                Ok(()) => report.delivered += 1,
                Err(panic) => {
                    report.failed += 1;
                    error!(
                        type_id,
                        subscription = id.0,
                        reason = panic_message(panic.as_ref()),
                        "[HUB] Subscriber panicked"
                    );
                }
            }
        }
        report
    }

    pub fn subscriber_count(&self, type_id: u32) -> usize {
        self.subscribers.read().get(&type_id).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscribers = self.subscribers.read();
        f.debug_struct("BroadcastHub")
            .field("types", &subscribers.len())
            .field(
                "subscribers",
                &subscribers.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}
