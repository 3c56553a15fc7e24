//! Server-side client sessions keyed by identity.
//!
//! Mutated only on the server's I/O loop thread; read from any thread.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lettuce_core::error::{LettuceError, Result};
use lettuce_core::hub::BroadcastHub;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Bookkeeping for one client identity.
///
/// Callers may keep an `Arc` after de-registration; `is_registered` turns
/// false so in-flight holders can tell.
pub struct ClientSession {
    identity: String,
    mailbox: Arc<BroadcastHub>,
    publish_to_server: bool,
    registered: AtomicBool,
}

impl ClientSession {
    pub(crate) fn new(identity: String, mailbox: Arc<BroadcastHub>, publish_to_server: bool) -> Self {
        Self {
            identity,
            mailbox,
            publish_to_server,
            registered: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Subscribers for messages from this client.
    pub fn mailbox(&self) -> &Arc<BroadcastHub> {
        &self.mailbox
    }

    /// Whether inbound messages are also published to the server hub.
    pub const fn publishes_to_server(&self) -> bool {
        self.publish_to_server
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Release);
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("identity", &self.identity)
            .field("publish_to_server", &self.publish_to_server)
            .field("registered", &self.is_registered())
            .finish()
    }
}

/// Concurrent identity → session map.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    sessions: DashMap<String, Arc<ClientSession>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for `identity`, not yet marked registered.
    ///
    /// Fails with `DuplicateRegistration` if a registered session exists; that
    /// session is left untouched. A pre-registered (not yet registered)
    /// session is replaced.
    pub(crate) fn create_session(
        &self,
        identity: &str,
        mailbox: Arc<BroadcastHub>,
        publish_to_server: bool,
    ) -> Result<Arc<ClientSession>> {
        let session = Arc::new(ClientSession::new(
            identity.to_string(),
            mailbox,
            publish_to_server,
        ));

        match self.sessions.entry(identity.to_string()) {
            Entry::Occupied(existing) if existing.get().is_registered() => {
                Err(LettuceError::DuplicateRegistration(identity.to_string()))
            }
            Entry::Occupied(mut existing) => {
                existing.insert(session.clone());
                Ok(session)
            }
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(session)
            }
        }
    }

    pub fn get(&self, identity: &str) -> Option<Arc<ClientSession>> {
        self.sessions.get(identity).map(|s| s.value().clone())
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.sessions.contains_key(identity)
    }

    pub fn is_registered(&self, identity: &str) -> bool {
        self.sessions
            .get(identity)
            .is_some_and(|s| s.is_registered())
    }

    /// Detach the session and flip its registered flag.
    pub(crate) fn remove(&self, identity: &str) -> Option<Arc<ClientSession>> {
        let (_, session) = self.sessions.remove(identity)?;
        session.set_registered(false);
        Some(session)
    }

    /// Snapshot of registered identities, sorted.
    pub fn registered_identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_registered())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of every identity with a session, pre-registered ones
    /// included, sorted.
    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of sessions, pre-registered ones included.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(identity: &str) -> (ClientRegistry, Arc<ClientSession>) {
        let registry = ClientRegistry::new();
        let session = registry
            .create_session(identity, Arc::new(BroadcastHub::new()), false)
            .unwrap();
        (registry, session)
    }

    #[test]
    fn registered_session_cannot_be_replaced() {
        let (registry, session) = registry_with("c1");
        session.set_registered(true);

        let err = registry
            .create_session("c1", Arc::new(BroadcastHub::new()), true)
            .unwrap_err();
        assert!(matches!(err, LettuceError::DuplicateRegistration(ref id) if id == "c1"));
        assert!(Arc::ptr_eq(&registry.get("c1").unwrap(), &session));
    }

    #[test]
    fn pre_registered_session_is_replaced() {
        let (registry, first) = registry_with("c1");
        let second = registry
            .create_session("c1", Arc::new(BroadcastHub::new()), true)
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(registry.get("c1").unwrap().publishes_to_server());
    }

    #[test]
    fn remove_detaches_and_unflags() {
        let (registry, session) = registry_with("c1");
        session.set_registered(true);

        let removed = registry.remove("c1").unwrap();
        assert!(Arc::ptr_eq(&removed, &session));
        assert!(!session.is_registered());
        assert!(registry.get("c1").is_none());
        assert!(registry.remove("c1").is_none());
    }

    #[test]
    fn snapshots_with_and_without_pre_registered() {
        let registry = ClientRegistry::new();
        for id in ["b", "a", "pending"] {
            let s = registry
                .create_session(id, Arc::new(BroadcastHub::new()), false)
                .unwrap();
            if id != "pending" {
                s.set_registered(true);
            }
        }
        assert_eq!(registry.registered_identities(), vec!["a", "b"]);
        assert_eq!(registry.identities(), vec!["a", "b", "pending"]);
        assert_eq!(registry.len(), 3);
        assert!(registry.contains("pending"));
        assert!(!registry.is_registered("pending"));
    }
}
