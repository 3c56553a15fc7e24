//! Server endpoint: one ROUTER socket multiplexing many named clients.
//!
//! ## Registration handshake (per identity)
//!
//! ```text
//! Unregistered ──RegisterClient──► Registered ──DeRegisterClient──► Deregistered
//!                  (ack sent)                      (ack sent)
//! ```
//!
//! `Deregistered` is terminal for that session; registering the same identity
//! again creates a fresh session with a fresh mailbox.
//!
//! ## Wire framing
//!
//! Inbound and outbound: `[identity][empty][payload]`.

use crate::messages::{DeRegisterClient, DeRegisterClientAck, RegisterClient, RegisterClientAck};
use crate::registry::{ClientRegistry, ClientSession};
use crate::send::{SendRequest, Target};
use crate::talker::Talker;
use crate::transport::{IoThread, LoopContext, LoopDriver, LoopState, OutboundQueue};
use async_trait::async_trait;
use bytes::Bytes;
use lettuce_core::endpoint::Endpoint;
use lettuce_core::error::{DecodeError, LettuceError, Result};
use lettuce_core::hub::BroadcastHub;
use lettuce_core::message::{Envelope, Message, MessageRegistry};
use lettuce_core::monitor::{EndpointEvent, EndpointMonitor, EventBus};
use lettuce_core::options::{EndpointOptions, FailurePolicy};
use lettuce_zmtp::{RouterEvent, RouterSocket};
use smallvec::SmallVec;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Replies produced by one inbound message.
pub type Replies = SmallVec<[SendRequest; 1]>;

/// Registration and dispatch logic, free of sockets and threads.
///
/// Owned by the I/O loop; every registry mutation goes through here.
pub struct ServerCore {
    clients: Arc<ClientRegistry>,
    hub: Arc<BroadcastHub>,
    events: Arc<EventBus>,
    policy: FailurePolicy,
    pre_register_unknown: bool,
}

impl ServerCore {
    pub fn new(
        clients: Arc<ClientRegistry>,
        hub: Arc<BroadcastHub>,
        events: Arc<EventBus>,
        options: &EndpointOptions,
    ) -> Self {
        Self {
            clients,
            hub,
            events,
            policy: options.failure_policy,
            pre_register_unknown: options.pre_register_unknown_clients,
        }
    }

    /// Apply one decoded message from `identity`.
    ///
    /// Returns the replies to enqueue. Errors are reported by the caller;
    /// the registry is left as it was.
    pub fn on_inbound(&self, identity: &str, envelope: &Envelope) -> Result<Replies> {
        if let Some(request) = envelope.downcast_ref::<RegisterClient>() {
            return self.on_register(identity, request);
        }
        if envelope.is::<DeRegisterClient>() {
            return self.on_deregister(identity);
        }

        match self.clients.get(identity) {
            Some(session) => {
                trace!("[SERVER] {} -> mailbox (type {})", identity, envelope.type_id());
                session.mailbox().publish(envelope);
                if session.publishes_to_server() {
                    self.hub.publish(envelope);
                }
            }
            None if self.policy.is_strict() => {
                return Err(LettuceError::UnknownSender {
                    identity: identity.to_string(),
                    type_id: envelope.type_id(),
                });
            }
            None => {
                trace!("[SERVER] Unregistered {} -> server hub", identity);
                self.hub.publish(envelope);
            }
        }
        Ok(Replies::new())
    }

    fn on_register(&self, identity: &str, request: &RegisterClient) -> Result<Replies> {
        let session = match self.clients.get(identity) {
            Some(existing) if existing.is_registered() => {
                if request.pre_register_client {
                    return Err(LettuceError::DuplicateRegistration(identity.to_string()));
                }
                // Plain re-announcement of a live registration.
                debug!("[SERVER] {} re-announced its registration", identity);
                return Ok(smallvec::smallvec![ack(identity, RegisterClientAck {})]);
            }
            // A request that pre-registers itself brings its own publish
            // flag; the application's mailbox is kept either way.
            Some(pre_registered) if request.pre_register_client => self.clients.create_session(
                identity,
                pre_registered.mailbox().clone(),
                request.publish_messages_to_server,
            )?,
            Some(pre_registered) => pre_registered,
            None if request.pre_register_client || self.pre_register_unknown => {
                self.clients.create_session(
                    identity,
                    Arc::new(BroadcastHub::new()),
                    request.publish_messages_to_server,
                )?
            }
            None => {
                warn!(
                    "[SERVER] {} asked to register without pre-registration and has no session",
                    identity
                );
                return Ok(Replies::new());
            }
        };

        session.set_registered(true);
        debug!("[SERVER] Client {} registered", identity);
        self.events
            .emit(EndpointEvent::ClientRegistered(identity.to_string()));
        Ok(smallvec::smallvec![ack(identity, RegisterClientAck {})])
    }

    fn on_deregister(&self, identity: &str) -> Result<Replies> {
        self.deregister(identity)?;
        // The session is gone, so the ack must skip the registry check.
        Ok(smallvec::smallvec![
            ack(identity, DeRegisterClientAck {}).unchecked()
        ])
    }

    /// Create (or replace a not yet registered) session ahead of the
    /// client's `RegisterClient`.
    pub fn pre_register(
        &self,
        identity: &str,
        mailbox: Arc<BroadcastHub>,
        publish_to_server: bool,
    ) -> Result<Arc<ClientSession>> {
        EndpointOptions::validate_identity(identity)
            .map_err(|e| LettuceError::construction(format!("invalid client identity: {e}")))?;
        self.clients
            .create_session(identity, mailbox, publish_to_server)
    }

    /// Remove the session and announce it.
    pub fn deregister(&self, identity: &str) -> Result<Arc<ClientSession>> {
        let session = self
            .clients
            .remove(identity)
            .ok_or_else(|| LettuceError::UnknownSenderDeregistration(identity.to_string()))?;
        debug!("[SERVER] Client {} de-registered", identity);
        self.events
            .emit(EndpointEvent::ClientDeregistered(identity.to_string()));
        Ok(session)
    }

    /// Validate the target at dequeue time and build the wire frames.
    ///
    /// The target is checked here rather than at enqueue: a client may
    /// de-register between the two, and that race surfaces as
    /// `UnknownRecipient`.
    pub fn prepare_outbound(
        &self,
        request: &SendRequest,
        codec: &MessageRegistry,
    ) -> Result<[Bytes; 3]> {
        let identity = match request.target() {
            Target::Client(id) => id,
            Target::All => return Err(LettuceError::UnknownRecipient(String::new())),
        };
        if request.check_target && !self.clients.contains(identity) {
            return Err(LettuceError::UnknownRecipient(identity.clone()));
        }

        let payload = codec.encode(request.message().as_ref())?;
        Ok([Bytes::copy_from_slice(identity.as_bytes()), Bytes::new(), payload])
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }
}

fn ack<M: Message>(identity: &str, message: M) -> SendRequest {
    SendRequest::addressed(identity.to_string(), Arc::new(message))
}

/// Caller requests that mutate the registry, run on the loop thread.
pub(crate) enum ServerControl {
    PreRegister {
        identity: String,
        mailbox: Arc<BroadcastHub>,
        publish_to_server: bool,
        reply: flume::Sender<Result<Arc<ClientSession>>>,
    },
    Deregister {
        identity: String,
        reply: flume::Sender<Result<Arc<ClientSession>>>,
    },
}

struct ServerDriver {
    socket: RouterSocket,
    core: ServerCore,
    codec: Arc<MessageRegistry>,
    queue: Arc<OutboundQueue<SendRequest>>,
    /// Identities refused at handshake, reported on the next idle pass.
    refused: Vec<Bytes>,
}

/// Split `[identity][empty][payload]`.
fn split_inbound(mut frames: Vec<Bytes>) -> std::result::Result<(Bytes, Bytes), DecodeError> {
    if frames.len() != 3 {
        return Err(DecodeError::FrameCount {
            expected: 3,
            got: frames.len(),
        });
    }
    if !frames[1].is_empty() {
        return Err(DecodeError::MissingDelimiter);
    }
    let payload = frames.pop().unwrap_or_default();
    let identity = frames.swap_remove(0);
    Ok((identity, payload))
}

/// Routing identities are UTF-8 client names.
fn decode_identity(identity: &[u8]) -> std::result::Result<String, DecodeError> {
    std::str::from_utf8(identity)
        .map(str::to_owned)
        .map_err(|_| DecodeError::InvalidIdentity)
}

#[async_trait(?Send)]
impl LoopDriver for ServerDriver {
    type Item = SendRequest;
    type Control = ServerControl;

    async fn recv(&mut self) -> io::Result<Option<Vec<Bytes>>> {
        match self.socket.recv_event().await? {
            RouterEvent::Message(frames) => Ok(Some(frames)),
            RouterEvent::Refused(identity) => {
                self.refused.push(identity);
                Ok(None)
            }
        }
    }

    fn on_inbound(&mut self, frames: Vec<Bytes>, cx: &LoopContext) -> Result<()> {
        let (identity, payload) = split_inbound(frames)?;
        let identity = decode_identity(&identity)?;
        let envelope = self
            .codec
            .decode_bounded(&payload, cx.options.max_message_size)?;

        for reply in self.core.on_inbound(&identity, &envelope)? {
            self.queue.enqueue(reply);
        }
        Ok(())
    }

    async fn on_outbound(&mut self, request: SendRequest, cx: &LoopContext) -> Result<()> {
        let frames = self.core.prepare_outbound(&request, &self.codec)?;
        let target = request.target().identity();
        let timeout = cx.options.send_timeout;

        match self.socket.send(&frames, timeout).await {
            Ok(()) => {
                trace!("[SERVER] Sent type {} to {}", request.message().type_identifier(), target);
                Ok(())
            }
            // Registered but not connected (anymore).
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(LettuceError::UnknownRecipient(target.to_string()))
            }
            Err(e) => Err(cx.send_error(target, e)),
        }
    }

    fn on_control(&mut self, command: ServerControl, cx: &LoopContext) {
        match command {
            ServerControl::PreRegister {
                identity,
                mailbox,
                publish_to_server,
                reply,
            } => {
                let _ = reply.send(self.core.pre_register(&identity, mailbox, publish_to_server));
            }
            ServerControl::Deregister { identity, reply } => {
                let result = self.core.deregister(&identity);
                if let Err(e) = &result {
                    trace!("{} {}", cx.tag, e);
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn on_idle(&mut self, cx: &LoopContext) -> Result<()> {
        for identity in std::mem::take(&mut self.refused) {
            let identity = String::from_utf8_lossy(&identity).into_owned();
            cx.report(LettuceError::DuplicateRegistration(identity))?;
        }
        Ok(())
    }
}

/// Multi-client server endpoint.
///
/// ```rust,no_run
/// use lettuce::prelude::*;
/// use std::sync::Arc;
///
/// let codec = Arc::new(lettuce::messages::registry_builder()?.build());
/// let server = ServerEndpoint::bind(
///     Endpoint::parse("tcp://127.0.0.1:5555")?,
///     EndpointOptions::default(),
///     codec,
/// )?;
/// let events = server.monitor();
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct ServerEndpoint {
    hub: Arc<BroadcastHub>,
    clients: Arc<ClientRegistry>,
    queue: Arc<OutboundQueue<SendRequest>>,
    control: flume::Sender<ServerControl>,
    events: Arc<EventBus>,
    core: ServerCore,
    local_addr: SocketAddr,
    io: IoThread,
}

impl ServerEndpoint {
    /// Bind a ROUTER socket and start the loop.
    pub fn bind(endpoint: Endpoint, options: EndpointOptions, codec: Arc<MessageRegistry>) -> Result<Self> {
        Self::new(endpoint, true, options, codec)
    }

    /// Bind (the usual server) or connect.
    ///
    /// A connecting server dials one bound peer and addresses it by the
    /// identity that peer announced.
    pub fn new(
        endpoint: Endpoint,
        is_bind: bool,
        options: EndpointOptions,
        codec: Arc<MessageRegistry>,
    ) -> Result<Self> {
        let hub = Arc::new(BroadcastHub::new());
        let clients = Arc::new(ClientRegistry::new());
        let events = Arc::new(EventBus::new());
        let queue = Arc::new(OutboundQueue::new());
        let (control_tx, control_rx) = flume::unbounded();
        let (addr_tx, addr_rx) = flume::bounded(1);

        let addr = endpoint.socket_addr();
        let driver_core = ServerCore::new(clients.clone(), hub.clone(), events.clone(), &options);
        let driver_queue = queue.clone();
        let socket_options = options.clone();
        let loop_codec = codec.clone();

        let cx = LoopContext {
            tag: "[SERVER]",
            options: options.clone(),
            events: events.clone(),
        };

        let io = IoThread::spawn(
            format!("lettuce-server-{}", addr.port()),
            cx,
            queue.clone(),
            control_rx,
            move || async move {
                let socket = if is_bind {
                    RouterSocket::bind(addr, socket_options).await?
                } else {
                    RouterSocket::connect(addr, socket_options).await?
                };
                let _ = addr_tx.send(socket.local_addr());
                Ok::<_, io::Error>(ServerDriver {
                    socket,
                    core: driver_core,
                    codec: loop_codec,
                    queue: driver_queue,
                    refused: Vec::new(),
                })
            },
        )?;

        let local_addr = addr_rx
            .try_recv()
            .map_err(|_| LettuceError::construction("server socket reported no address"))?;
        debug!("[SERVER] Listening on {}", local_addr);

        Ok(Self {
            core: ServerCore::new(clients.clone(), hub.clone(), events.clone(), &options),
            hub,
            clients,
            queue,
            control: control_tx,
            events,
            local_addr,
            io,
        })
    }

    /// Bound address (the resolved port when binding port 0).
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn ensure_running(&self) -> Result<()> {
        match self.io.state() {
            LoopState::Running => Ok(()),
            _ => Err(LettuceError::Closed),
        }
    }

    /// Queue a request.
    ///
    /// An empty target enqueues one copy per session that exists right now,
    /// pre-registered ones included; clients registering later do not get
    /// it. A copy for a pre-registered client that has not connected fails
    /// at dequeue as `UnknownRecipient`. A named target is not checked here:
    /// the loop checks it when the request is dequeued.
    ///
    /// Returns how many copies were queued.
    pub fn send_message(&self, request: SendRequest) -> Result<usize> {
        self.ensure_running()?;
        match request.target() {
            Target::All => {
                let message = request.into_message();
                let targets = self.clients.identities();
                let count = targets.len();
                for identity in targets {
                    self.queue
                        .enqueue(SendRequest::addressed(identity, message.clone()));
                }
                trace!("[SERVER] Broadcast queued for {} clients", count);
                Ok(count)
            }
            Target::Client(_) => {
                self.queue.enqueue(request);
                Ok(1)
            }
        }
    }

    pub fn send_to<M: Message>(&self, identity: impl Into<String>, message: M) -> Result<()> {
        self.send_message(SendRequest::to(identity, message)?)
            .map(drop)
    }

    pub fn broadcast<M: Message>(&self, message: M) -> Result<usize> {
        self.send_message(SendRequest::broadcast(message))
    }

    /// Pre-register a client with a fresh mailbox.
    pub fn pre_register_client(&self, identity: &str, publish_to_server: bool) -> Result<Arc<ClientSession>> {
        self.pre_register_client_with(identity, Arc::new(BroadcastHub::new()), publish_to_server)
    }

    /// Pre-register a client with a caller-supplied mailbox.
    ///
    /// Fails with `DuplicateRegistration` if the identity is registered.
    pub fn pre_register_client_with(
        &self,
        identity: &str,
        mailbox: Arc<BroadcastHub>,
        publish_to_server: bool,
    ) -> Result<Arc<ClientSession>> {
        if self.io.is_loop_thread() {
            return self.core.pre_register(identity, mailbox, publish_to_server);
        }
        self.ensure_running()?;
        let (reply, response) = flume::bounded(1);
        self.control
            .send(ServerControl::PreRegister {
                identity: identity.to_string(),
                mailbox,
                publish_to_server,
                reply,
            })
            .map_err(|_| LettuceError::Closed)?;
        response.recv().map_err(|_| LettuceError::Closed)?
    }

    /// Remove a client's session. No acknowledgement is sent to the client.
    ///
    /// Fails with `UnknownSenderDeregistration` when there is no session.
    pub fn deregister_client(&self, identity: &str) -> Result<()> {
        if self.io.is_loop_thread() {
            return self.core.deregister(identity).map(drop);
        }
        self.ensure_running()?;
        let (reply, response) = flume::bounded(1);
        self.control
            .send(ServerControl::Deregister {
                identity: identity.to_string(),
                reply,
            })
            .map_err(|_| LettuceError::Closed)?;
        response.recv().map_err(|_| LettuceError::Closed)?.map(drop)
    }

    /// The mailbox of a client with a session.
    pub fn client_mailbox(&self, identity: &str) -> Option<Arc<BroadcastHub>> {
        self.clients.get(identity).map(|s| s.mailbox().clone())
    }

    pub fn client_session(&self, identity: &str) -> Option<Arc<ClientSession>> {
        self.clients.get(identity)
    }

    pub fn is_registered(&self, identity: &str) -> bool {
        self.clients.is_registered(identity)
    }

    pub fn registered_clients(&self) -> Vec<String> {
        self.clients.registered_identities()
    }

    /// Receive registration, failure and stop events from now on.
    pub fn monitor(&self) -> EndpointMonitor {
        self.events.monitor()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl Talker for ServerEndpoint {
    fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    fn send(&self, request: SendRequest) -> Result<()> {
        self.send_message(request).map(drop)
    }

    fn close(&self) {
        self.io.shutdown();
    }

    fn state(&self) -> LoopState {
        self.io.state()
    }
}

impl std::fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("local_addr", &self.local_addr)
            .field("state", &self.io.state())
            .field("clients", &self.clients.len())
            .finish()
    }
}
