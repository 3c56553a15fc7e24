//! The surface every endpoint topology shares.

use crate::send::SendRequest;
use crate::transport::LoopState;
use lettuce_core::error::Result;
use lettuce_core::hub::{BroadcastHub, SubscriptionId};
use lettuce_core::message::Message;

/// A local hub for inbound traffic plus a way to send.
pub trait Talker {
    /// Inbound messages are published here.
    fn hub(&self) -> &BroadcastHub;

    /// Queue a request for the I/O loop. Never touches the socket.
    fn send(&self, request: SendRequest) -> Result<()>;

    /// Stop the loop and release the socket. Safe to call repeatedly.
    fn close(&self);

    fn state(&self) -> LoopState;

    fn subscribe<M, F>(&self, callback: F) -> SubscriptionId
    where
        Self: Sized,
        M: Message,
        F: Fn(&M) + Send + Sync + 'static,
    {
        self.hub().subscribe::<M, F>(callback)
    }
}
