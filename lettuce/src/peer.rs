//! Peer endpoint: one named DEALER talking to a server or to another peer.
//!
//! Wire framing both ways is `[empty][payload]`. There is no registry on
//! this side: every inbound message goes to the local hub.

use crate::messages::{DeRegisterClient, RegisterClient};
use crate::send::{SendRequest, Target};
use crate::talker::Talker;
use crate::transport::{IoThread, LoopContext, LoopDriver, LoopState, OutboundQueue};
use async_trait::async_trait;
use bytes::Bytes;
use lettuce_core::endpoint::Endpoint;
use lettuce_core::error::{DecodeError, LettuceError, Result};
use lettuce_core::hub::BroadcastHub;
use lettuce_core::message::{DynMessage, Message, MessageRegistry};
use lettuce_core::monitor::{EndpointMonitor, EventBus};
use lettuce_core::options::EndpointOptions;
use lettuce_zmtp::DealerSocket;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

struct PeerDriver {
    socket: DealerSocket,
    hub: Arc<BroadcastHub>,
    codec: Arc<MessageRegistry>,
}

fn split_inbound(mut frames: Vec<Bytes>) -> std::result::Result<Bytes, DecodeError> {
    if frames.len() != 2 {
        return Err(DecodeError::FrameCount {
            expected: 2,
            got: frames.len(),
        });
    }
    if !frames[0].is_empty() {
        return Err(DecodeError::MissingDelimiter);
    }
    Ok(frames.pop().unwrap_or_default())
}

#[async_trait(?Send)]
impl LoopDriver for PeerDriver {
    type Item = Arc<dyn DynMessage>;
    type Control = Infallible;

    async fn recv(&mut self) -> io::Result<Option<Vec<Bytes>>> {
        self.socket.recv().await
    }

    fn on_inbound(&mut self, frames: Vec<Bytes>, cx: &LoopContext) -> Result<()> {
        let payload = split_inbound(frames)?;
        let envelope = self
            .codec
            .decode_bounded(&payload, cx.options.max_message_size)?;
        trace!("[PEER] Received type {}", envelope.type_id());
        let report = self.hub.publish(&envelope);
        if report.is_unhandled() {
            trace!("[PEER] No subscriber for type {}", envelope.type_id());
        }
        Ok(())
    }

    async fn on_outbound(&mut self, message: Arc<dyn DynMessage>, cx: &LoopContext) -> Result<()> {
        let payload = self.codec.encode(message.as_ref())?;
        self.socket
            .send(&[Bytes::new(), payload], cx.options.send_timeout)
            .await
            .map_err(|e| cx.send_error("<remote>", e))
    }

    fn on_control(&mut self, command: Infallible, _cx: &LoopContext) {
        match command {}
    }

    async fn on_idle(&mut self, cx: &LoopContext) -> Result<()> {
        if self.socket.has_pending() {
            self.socket
                .flush_pending(cx.options.send_timeout)
                .await
                .map_err(|e| cx.send_error("<pending>", e))?;
        }
        Ok(())
    }
}

/// A named endpoint with a single logical connection.
///
/// ```rust,no_run
/// use lettuce::prelude::*;
/// use std::sync::Arc;
///
/// let codec = Arc::new(lettuce::messages::registry_builder()?.build());
/// let peer = PeerEndpoint::connect(
///     "c1",
///     Endpoint::parse("tcp://127.0.0.1:5555")?,
///     EndpointOptions::default(),
///     codec,
/// )?;
/// peer.register_with_server(false, true)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct PeerEndpoint {
    name: String,
    hub: Arc<BroadcastHub>,
    queue: Arc<OutboundQueue<Arc<dyn DynMessage>>>,
    events: Arc<EventBus>,
    local_addr: Option<SocketAddr>,
    // Held so the loop's control branch stays pending.
    _control: flume::Sender<Infallible>,
    io: IoThread,
}

impl PeerEndpoint {
    pub fn connect(
        name: impl Into<String>,
        endpoint: Endpoint,
        options: EndpointOptions,
        codec: Arc<MessageRegistry>,
    ) -> Result<Self> {
        Self::new(name, endpoint, false, options, codec)
    }

    pub fn bind(
        name: impl Into<String>,
        endpoint: Endpoint,
        options: EndpointOptions,
        codec: Arc<MessageRegistry>,
    ) -> Result<Self> {
        Self::new(name, endpoint, true, options, codec)
    }

    /// Bind or connect, announcing `name` as this side's identity.
    ///
    /// An empty or invalid name fails before any thread starts.
    pub fn new(
        name: impl Into<String>,
        endpoint: Endpoint,
        is_bind: bool,
        options: EndpointOptions,
        codec: Arc<MessageRegistry>,
    ) -> Result<Self> {
        Self::with_hub(name, endpoint, is_bind, options, codec, Arc::new(BroadcastHub::new()))
    }

    /// Like [`new`](Self::new), dispatching into a caller-supplied hub.
    ///
    /// Subscriptions made on `hub` beforehand see every message from the
    /// first one on, including anything delivered during connect.
    pub fn with_hub(
        name: impl Into<String>,
        endpoint: Endpoint,
        is_bind: bool,
        options: EndpointOptions,
        codec: Arc<MessageRegistry>,
        hub: Arc<BroadcastHub>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(LettuceError::construction("peer name must not be empty"));
        }
        EndpointOptions::validate_identity(&name)
            .map_err(|e| LettuceError::construction(format!("invalid peer name: {e}")))?;

        let events = Arc::new(EventBus::new());
        let queue = Arc::new(OutboundQueue::new());
        let (control_tx, control_rx) = flume::bounded(1);
        let (addr_tx, addr_rx) = flume::bounded(1);

        let addr = endpoint.socket_addr();
        let identity = Bytes::from(name.clone().into_bytes());
        let loop_hub = hub.clone();
        let socket_options = options.clone();

        let cx = LoopContext {
            tag: "[PEER]",
            options,
            events: events.clone(),
        };

        let io = IoThread::spawn(
            format!("lettuce-peer-{name}"),
            cx,
            queue.clone(),
            control_rx,
            move || async move {
                let socket = if is_bind {
                    DealerSocket::bind(addr, Some(identity), socket_options).await?
                } else {
                    DealerSocket::connect(addr, Some(identity), socket_options).await?
                };
                let _ = addr_tx.send(socket.local_addr());
                Ok::<_, io::Error>(PeerDriver {
                    socket,
                    hub: loop_hub,
                    codec,
                })
            },
        )?;

        let local_addr = addr_rx.try_recv().ok().flatten();
        debug!("[PEER] {} {} {}", name, if is_bind { "bound to" } else { "connected to" }, addr);

        Ok(Self {
            name,
            hub,
            queue,
            events,
            local_addr,
            _control: control_tx,
            io,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound address, for peers created with `bind`.
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn send_message<M: Message>(&self, message: M) -> Result<()> {
        self.send_dyn(Arc::new(message))
    }

    pub fn send_dyn(&self, message: Arc<dyn DynMessage>) -> Result<()> {
        if self.io.state() != LoopState::Running {
            return Err(LettuceError::Closed);
        }
        self.queue.enqueue(message);
        Ok(())
    }

    /// Ask the server to register this peer. The ack arrives on the hub as
    /// `RegisterClientAck`.
    pub fn register_with_server(&self, publish_to_server: bool, pre_register: bool) -> Result<()> {
        self.send_message(RegisterClient::new(publish_to_server, pre_register))
    }

    /// The ack arrives on the hub as `DeRegisterClientAck`.
    pub fn deregister_from_server(&self) -> Result<()> {
        self.send_message(DeRegisterClient {})
    }

    pub fn monitor(&self) -> EndpointMonitor {
        self.events.monitor()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl Talker for PeerEndpoint {
    fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    /// The target is ignored: a peer has a single remote side.
    fn send(&self, request: SendRequest) -> Result<()> {
        if let Target::Client(id) = request.target() {
            trace!("[PEER] Ignoring target {} on a single-connection endpoint", id);
        }
        self.send_dyn(request.into_message())
    }

    fn close(&self) {
        self.io.shutdown();
    }

    fn state(&self) -> LoopState {
        self.io.state()
    }
}

impl std::fmt::Debug for PeerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerEndpoint")
            .field("name", &self.name)
            .field("state", &self.io.state())
            .finish()
    }
}
