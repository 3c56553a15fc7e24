//! DEALER socket: connects to a router (redialing with backoff when the
//! connection drops) or binds and accepts any number of connections.
//!
//! Outbound messages round-robin over live connections. With none up,
//! messages wait in a bounded pending queue until one is.

use crate::command::SocketType;
use crate::pipe::{accept_loop, dial, start_pipe, Pipe, PipeContext, PipeEvent};
use bytes::Bytes;
use compio::net::TcpListener;
use futures::{select, FutureExt};
use lettuce_core::options::EndpointOptions;
use lettuce_core::reconnect::Backoff;
use lettuce_core::timeout::io_with_timeout;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Key of the single connection a connected dealer keeps.
const SERVER_PIPE: &[u8] = b"server";

#[derive(Debug, Clone, Copy)]
enum Mode {
    Connected { remote: SocketAddr },
    Bound { local: SocketAddr },
}

struct Connected {
    key: Bytes,
    epoch: u64,
    pipe: Pipe,
}

/// Round-robin client (or bound) socket.
///
/// Must be driven from the compio runtime that created it.
pub struct DealerSocket {
    ctx: PipeContext,
    mode: Mode,
    pipes: Vec<Connected>,
    next: usize,
    epoch: u64,
    redialing: bool,
    pending: VecDeque<Vec<Bytes>>,
    events: flume::Receiver<PipeEvent>,
    inbound: flume::Receiver<Vec<Bytes>>,
    // Dropping this stops the acceptor or any redial task.
    _stop: flume::Sender<()>,
    stop_rx: flume::Receiver<()>,
}

impl DealerSocket {
    fn with_mode(mode: Mode, identity: Option<Bytes>, options: EndpointOptions) -> Self {
        let (events_tx, events) = flume::unbounded();
        let (inbound_tx, inbound) = flume::unbounded();
        let (stop, stop_rx) = flume::bounded(1);
        Self {
            ctx: PipeContext {
                local: SocketType::Dealer,
                identity,
                options,
                events: events_tx,
                inbound: inbound_tx,
            },
            mode,
            pipes: Vec::new(),
            next: 0,
            epoch: 0,
            redialing: false,
            pending: VecDeque::new(),
            events,
            inbound,
            _stop: stop,
            stop_rx,
        }
    }

    /// Connect to a router (or bound dealer) and complete the handshake.
    ///
    /// Connection and handshake failures are returned here; later drops
    /// are redialed in the background.
    pub async fn connect(
        addr: SocketAddr,
        identity: Option<Bytes>,
        options: EndpointOptions,
    ) -> io::Result<Self> {
        let mut socket = Self::with_mode(Mode::Connected { remote: addr }, identity, options);
        let (stream, _) = dial(addr, &socket.ctx).await?;
        debug!("[DEALER] Connected to {}", addr);

        socket.epoch += 1;
        let pipe = start_pipe(stream, Bytes::from_static(SERVER_PIPE), socket.epoch, &socket.ctx, None);
        socket.pipes.push(Connected {
            key: Bytes::from_static(SERVER_PIPE),
            epoch: socket.epoch,
            pipe,
        });
        Ok(socket)
    }

    /// Bind and accept connections in the background.
    pub async fn bind(
        addr: SocketAddr,
        identity: Option<Bytes>,
        options: EndpointOptions,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        debug!("[DEALER] Bound to {}", local);

        let socket = Self::with_mode(Mode::Bound { local }, identity, options);
        compio::runtime::spawn(accept_loop(listener, socket.ctx.clone(), socket.stop_rx.clone()))
            .detach();
        Ok(socket)
    }

    /// Local address for bound dealers.
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        match self.mode {
            Mode::Bound { local } => Some(local),
            Mode::Connected { .. } => None,
        }
    }

    pub fn connection_count(&mut self) -> usize {
        self.apply_events();
        self.pipes.len()
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` when a connection came up or went down instead,
    /// so the caller can `flush_pending`. Cancel-safe.
    pub async fn recv(&mut self) -> io::Result<Option<Vec<Bytes>>> {
        let inbound = self.inbound.clone();
        let events = self.events.clone();
        select! {
            msg = inbound.recv_async().fuse() => {
                let msg = msg.map_err(|_| closed())?;
                self.apply_events();
                Ok(Some(msg))
            }
            event = events.recv_async().fuse() => {
                let event = event.map_err(|_| closed())?;
                self.apply(event);
                Ok(None)
            }
        }
    }

    /// Send one multipart message, or hold it while no connection is up.
    ///
    /// Held messages go out first, in order. Fails with `WouldBlock` when
    /// the pending queue is full.
    pub async fn send(&mut self, frames: &[Bytes], timeout: Duration) -> io::Result<()> {
        self.apply_events();
        if self.pipes.is_empty() {
            return self.hold(frames.to_vec());
        }
        self.flush_pending(timeout).await?;
        if self.pipes.is_empty() {
            return self.hold(frames.to_vec());
        }
        self.write_next(frames, timeout).await
    }

    /// Write held messages while a connection is up.
    pub async fn flush_pending(&mut self, timeout: Duration) -> io::Result<()> {
        self.apply_events();
        while !self.pipes.is_empty() {
            let Some(msg) = self.pending.pop_front() else {
                break;
            };
            self.write_next(&msg, timeout).await?;
        }
        Ok(())
    }

    fn hold(&mut self, msg: Vec<Bytes>) -> io::Result<()> {
        if self.pending.len() >= self.ctx.options.pending_limit {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!(
                    "no connection and {} messages already pending",
                    self.pending.len()
                ),
            ));
        }
        trace!("[DEALER] No connection, holding message");
        self.pending.push_back(msg);
        Ok(())
    }

    async fn write_next(&mut self, frames: &[Bytes], timeout: Duration) -> io::Result<()> {
        let idx = self.next % self.pipes.len();
        self.next = self.next.wrapping_add(1);

        let conn = &mut self.pipes[idx];
        let result = io_with_timeout(Some(timeout), "send", conn.pipe.send(frames)).await;
        if result.is_err() && conn.pipe.is_poisoned() {
            let conn = self.pipes.swap_remove(idx);
            debug!("[DEALER] Dropping connection {:?} after failed write", conn.key);
            self.connection_lost();
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
                trace!("[DEALER] Connection up: {:?}", identity);
                self.redialing = false;
                self.pipes.push(Connected {
                    key: identity,
                    epoch,
                    pipe,
                });
            }
            PipeEvent::Down { identity, epoch } => {
                let before = self.pipes.len();
                self.pipes
                    .retain(|c| !(c.key == identity && c.epoch == epoch));
                if self.pipes.len() < before {
                    trace!("[DEALER] Connection down: {:?}", identity);
                    self.connection_lost();
                }
            }
            // Dealers do not route by identity, so nothing is refused.
            PipeEvent::Refused { .. } => {}
        }
    }

    /// Start redialing when a connected dealer lost its only connection.
    fn connection_lost(&mut self) {
        let Mode::Connected { remote } = self.mode else {
            return;
        };
        if self.redialing || !self.pipes.is_empty() {
            return;
        }
        self.redialing = true;
        self.epoch += 1;

        let ctx = self.ctx.clone();
        let stop = self.stop_rx.clone();
        let epoch = self.epoch;
        warn!("[DEALER] Lost connection to {}, redialing", remote);

        compio::runtime::spawn(async move {
            let mut backoff = Backoff::new(&ctx.options);
            loop {
                let delay = backoff.next_delay();
                select! {
                    _ = compio::time::sleep(delay).fuse() => {}
                    _ = stop.recv_async().fuse() => return,
                }

                let dialed = select! {
                    res = dial(remote, &ctx).fuse() => res,
                    _ = stop.recv_async().fuse() => return,
                };
                match dialed {
                    Ok((stream, _)) => {
                        info!("[DEALER] Reconnected to {} after {} attempts", remote, backoff.attempt());
                        let key = Bytes::from_static(SERVER_PIPE);
                        let pipe = start_pipe(stream, key.clone(), epoch, &ctx, None);
                        let _ = ctx.events.send(PipeEvent::Up {
                            identity: key,
                            epoch,
                            pipe,
                        });
                        return;
                    }
                    Err(e) => debug!("[DEALER] Redial attempt {} failed: {}", backoff.attempt(), e),
                }
            }
        })
        .detach();
    }
}

impl Drop for DealerSocket {
    fn drop(&mut self) {
        // Queued `Up` events own live pipes; readers hold the sending side.
        while self.events.try_recv().is_ok() {}
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "dealer socket closed")
}
