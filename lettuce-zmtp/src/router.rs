//! ROUTER socket: binds, accepts any number of dealers, and addresses each
//! by the identity it announced in READY.
//!
//! Inbound messages arrive as `[identity, frames..]`. Outbound messages name
//! their connection in the first frame, which is stripped before writing.

use crate::command::SocketType;
use crate::pipe::{accept_loop, dial, start_pipe, Pipe, PipeContext, PipeEvent};
use bytes::Bytes;
use compio::net::TcpListener;
use futures::{select, FutureExt};
use hashbrown::HashMap;
use lettuce_core::options::EndpointOptions;
use lettuce_core::timeout::io_with_timeout;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, trace};

struct Connected {
    epoch: u64,
    pipe: Pipe,
}

/// What [`RouterSocket::recv_event`] yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// `[identity, frames..]`
    Message(Vec<Bytes>),
    /// A second connection announced this live identity and was turned
    /// away with an ERROR command.
    Refused(Bytes),
}

/// Identity-routed server socket.
///
/// Must be driven from the compio runtime that created it.
pub struct RouterSocket {
    local_addr: SocketAddr,
    peers: HashMap<Bytes, Connected>,
    refused: VecDeque<Bytes>,
    events: flume::Receiver<PipeEvent>,
    inbound: flume::Receiver<Vec<Bytes>>,
    _stop_accept: flume::Sender<()>,
}

impl RouterSocket {
    /// Bind and start accepting in the background.
    pub async fn bind(addr: SocketAddr, options: EndpointOptions) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!("[ROUTER] Bound to {}", local_addr);

        let (events_tx, events) = flume::unbounded();
        let (inbound_tx, inbound) = flume::unbounded();
        let (stop_tx, stop_rx) = flume::bounded(1);
        let ctx = PipeContext {
            local: SocketType::Router,
            identity: None,
            options,
            events: events_tx,
            inbound: inbound_tx,
        };
        compio::runtime::spawn(accept_loop(listener, ctx, stop_rx)).detach();

        Ok(Self {
            local_addr,
            peers: HashMap::new(),
            refused: VecDeque::new(),
            events,
            inbound,
            _stop_accept: stop_tx,
        })
    }

    /// Connect out to a bound dealer and address it by the identity it
    /// announced (or `\0peer-1` when it announced none).
    ///
    /// There is no redial: a dropped connection stays dropped.
    pub async fn connect(addr: SocketAddr, options: EndpointOptions) -> io::Result<Self> {
        let (events_tx, events) = flume::unbounded();
        let (inbound_tx, inbound) = flume::unbounded();
        let (stop_tx, _) = flume::bounded(1);
        let ctx = PipeContext {
            local: SocketType::Router,
            identity: None,
            options,
            events: events_tx,
            inbound: inbound_tx,
        };

        let (stream, identity) = dial(addr, &ctx).await?;
        let local_addr = stream.local_addr()?;
        let identity = identity.unwrap_or_else(|| Bytes::from_static(b"\0peer-1"));
        debug!("[ROUTER] Connected to {} as {:?}", addr, identity);

        let pipe = start_pipe(stream, identity.clone(), 1, &ctx, None);
        let mut peers = HashMap::new();
        peers.insert(identity, Connected { epoch: 1, pipe });

        Ok(Self {
            local_addr,
            peers,
            refused: VecDeque::new(),
            events,
            inbound,
            _stop_accept: stop_tx,
        })
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether a connection with this identity is currently up.
    pub fn is_connected(&mut self, identity: &[u8]) -> bool {
        self.apply_events();
        self.peers.contains_key(identity)
    }

    pub fn connection_count(&mut self) -> usize {
        self.apply_events();
        self.peers.len()
    }

    /// Receive the next message as `[identity, frames..]`, skipping
    /// refusals.
    ///
    /// Cancel-safe: dropping the future loses nothing.
    pub async fn recv(&mut self) -> io::Result<Vec<Bytes>> {
        loop {
            if let RouterEvent::Message(msg) = self.recv_event().await? {
                return Ok(msg);
            }
        }
    }

    /// Receive the next message or refused connection. Cancel-safe.
    pub async fn recv_event(&mut self) -> io::Result<RouterEvent> {
        loop {
            if let Some(identity) = self.refused.pop_front() {
                return Ok(RouterEvent::Refused(identity));
            }
            let inbound = self.inbound.clone();
            let events = self.events.clone();
            select! {
                msg = inbound.recv_async().fuse() => {
                    let msg = msg.map_err(|_| closed())?;
                    self.apply_events();
                    return Ok(RouterEvent::Message(msg));
                }
                event = events.recv_async().fuse() => {
                    let event = event.map_err(|_| closed())?;
                    self.apply(event);
                }
            }
        }
    }

    /// Send `[identity, frames..]` to the named connection within `timeout`.
    ///
    /// Fails with `NotFound` when no connection has that identity. A
    /// connection whose write failed or timed out is dropped.
    pub async fn send(&mut self, msg: &[Bytes], timeout: Duration) -> io::Result<()> {
        self.apply_events();
        let (identity, frames) = msg.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "missing identity frame")
        })?;

        let Some(peer) = self.peers.get_mut(identity) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no connection for identity {:?}", identity),
            ));
        };

        let result = io_with_timeout(Some(timeout), "send", peer.pipe.send(frames)).await;
        if result.is_err() && peer.pipe.is_poisoned() {
            debug!("[ROUTER] Dropping connection {:?} after failed write", identity);
            self.peers.remove(identity);
        }
        result
    }

    fn apply_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.apply(event);
        }
    }

    fn apply(&mut self, event: PipeEvent) {
        match event {
            PipeEvent::Up {
                identity,
                epoch,
                pipe,
            } => {
                trace!("[ROUTER] Connection up: {:?}", identity);
                self.peers.insert(identity, Connected { epoch, pipe });
            }
            PipeEvent::Down { identity, epoch } => {
                // A reconnect under the same identity has a newer epoch.
                if self.peers.get(&identity).is_some_and(|c| c.epoch == epoch) {
                    trace!("[ROUTER] Connection down: {:?}", identity);
                    self.peers.remove(&identity);
                }
            }
            PipeEvent::Refused { identity } => self.refused.push_back(identity),
        }
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        // Queued `Up` events own live pipes; readers hold the sending side.
        while self.events.try_recv().is_ok() {}
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "router socket closed")
}
