//! One handshaken connection: a write half owned by the socket and a reader
//! task delivering complete multipart messages.
//!
//! Readers and acceptors report to their socket over two channels: pipe
//! lifecycle (`PipeEvent`) and inbound messages. The socket is the only
//! owner of write halves, so writes never race.

use crate::codec::{encode_multipart, MultipartBuffer, ZmtpDecoder, ZmtpError};
use crate::command::SocketType;
use crate::handshake::{perform_handshake, perform_handshake_with};
use bytes::{Bytes, BytesMut};
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWriteExt};
use compio::net::{OwnedReadHalf, OwnedWriteHalf, TcpListener, TcpStream};
use futures::{select, FutureExt};
use hashbrown::HashSet;
use lettuce_core::options::EndpointOptions;
use lettuce_core::poison::PoisonGuard;
use lettuce_core::tcp::enable_tcp_nodelay;
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Frames per message a reader accepts before dropping the connection.
pub(crate) const MAX_FRAMES: usize = 32;

/// Hard protocol cap on one frame. A larger frame drops the connection;
/// message size limits are applied per message above this layer.
pub(crate) const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Write half of a connection.
pub(crate) struct Pipe {
    writer: OwnedWriteHalf<TcpStream>,
    write_buf: Vec<u8>,
    poisoned: bool,
    // Dropping this stops the reader task.
    _stop_reader: flume::Sender<()>,
}

impl Pipe {
    /// Write one multipart message. A write that fails or is cut short
    /// poisons the pipe for good.
    pub(crate) async fn send(&mut self, frames: &[Bytes]) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection poisoned by an interrupted write",
            ));
        }

        let mut buf = std::mem::take(&mut self.write_buf);
        buf.clear();
        encode_multipart(frames, &mut buf);

        let guard = PoisonGuard::new(&mut self.poisoned);
        let BufResult(res, buf) = self.writer.write_all(buf).await;
        self.write_buf = buf;
        res?;
        guard.disarm();
        Ok(())
    }

    #[inline]
    pub(crate) const fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

/// Lifecycle notifications from acceptors and readers.
pub(crate) enum PipeEvent {
    Up {
        identity: Bytes,
        epoch: u64,
        pipe: Pipe,
    },
    Down {
        identity: Bytes,
        epoch: u64,
    },
    /// A connection announced an identity that is already live and was
    /// turned away during its handshake.
    Refused { identity: Bytes },
}

/// Channels and settings shared by every connection of one socket.
#[derive(Clone)]
pub(crate) struct PipeContext {
    pub local: SocketType,
    pub identity: Option<Bytes>,
    pub options: EndpointOptions,
    pub events: flume::Sender<PipeEvent>,
    pub inbound: flume::Sender<Vec<Bytes>>,
}

impl PipeContext {
    /// Identity-prefixed delivery is what makes a socket a router.
    fn prefixes_identity(&self) -> bool {
        self.local == SocketType::Router
    }
}

/// Live identities of a router, shared between its connection tasks.
pub(crate) type LiveSet = Rc<RefCell<HashSet<Bytes>>>;

/// Removes an identity from the live set when its reader ends, cancelled
/// or not.
struct LiveGuard {
    live: LiveSet,
    identity: Bytes,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live.borrow_mut().remove(&self.identity);
    }
}

/// Connect and handshake within the handshake timeout.
pub(crate) async fn dial(
    addr: std::net::SocketAddr,
    ctx: &PipeContext,
) -> io::Result<(TcpStream, Option<Bytes>)> {
    let timeout = Some(ctx.options.handshake_timeout);
    let mut stream = lettuce_core::timeout::io_with_timeout(
        timeout,
        "connect",
        TcpStream::connect(addr),
    )
    .await?;
    if ctx.options.tcp_nodelay {
        enable_tcp_nodelay(&stream)?;
    }
    let peer = perform_handshake(
        &mut stream,
        ctx.local,
        ctx.identity.as_deref(),
        false,
        timeout,
    )
    .await?;
    Ok((stream, peer.identity))
}

/// Split a handshaken stream into a `Pipe` and a detached reader task.
///
/// The reader sends `Down` when the connection ends on its own; a reader
/// stopped by dropping its pipe sends nothing.
pub(crate) fn start_pipe(
    stream: TcpStream,
    identity: Bytes,
    epoch: u64,
    ctx: &PipeContext,
    live: Option<LiveSet>,
) -> Pipe {
    let (stop_tx, stop_rx) = flume::bounded::<()>(1);
    let (reader, writer) = stream.into_split();
    let ctx = ctx.clone();
    let guard = live.map(|live| LiveGuard {
        live,
        identity: identity.clone(),
    });

    compio::runtime::spawn(async move {
        let _guard = guard;
        let prefix = ctx.prefixes_identity().then(|| identity.clone());
        let reading = read_loop(reader, prefix, &ctx).fuse();
        let stopped = stop_rx.recv_async().fuse();
        futures::pin_mut!(reading, stopped);

        select! {
            res = reading => {
                match res {
                    Ok(()) => debug!("[PIPE] {:?} closed by peer", identity),
                    Err(e) => debug!("[PIPE] {:?} reader ended: {}", identity, e),
                }
                let _ = ctx.events.send(PipeEvent::Down { identity, epoch });
            }
            _ = stopped => trace!("[PIPE] {:?} reader stopped", identity),
        }
    })
    .detach();

    Pipe {
        writer,
        write_buf: Vec::with_capacity(256),
        poisoned: false,
        _stop_reader: stop_tx,
    }
}

/// Read until EOF, a protocol error, or the socket going away.
async fn read_loop(
    mut stream: OwnedReadHalf<TcpStream>,
    prefix: Option<Bytes>,
    ctx: &PipeContext,
) -> io::Result<()> {
    let decoder = ZmtpDecoder::new(MAX_FRAME_SIZE);
    let mut parts = MultipartBuffer::new(MAX_FRAMES);
    let mut acc = BytesMut::with_capacity(ctx.options.read_buffer_size);
    let mut chunk = Vec::with_capacity(ctx.options.read_buffer_size);

    loop {
        chunk.clear();
        let BufResult(res, buf) = AsyncRead::read(&mut stream, chunk).await;
        chunk = buf;
        if res? == 0 {
            return Ok(());
        }
        acc.extend_from_slice(&chunk);

        while let Some(frame) = decoder.decode(&mut acc)? {
            if frame.is_command() {
                // PING and friends; nothing to answer on the NULL mechanism.
                trace!("[PIPE] Ignoring command frame ({} bytes)", frame.payload.len());
                continue;
            }
            if let Some(frames) = parts.push(frame)? {
                let msg = match &prefix {
                    Some(id) => {
                        let mut msg = Vec::with_capacity(frames.len() + 1);
                        msg.push(id.clone());
                        msg.extend(frames);
                        msg
                    }
                    None => frames,
                };
                if ctx.inbound.send(msg).is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Accept connections forever, handshaking each on its own task.
///
/// Routers give anonymous peers a generated identity and refuse a second
/// live connection announcing an identity already in use.
pub(crate) async fn accept_loop(listener: TcpListener, ctx: PipeContext, stop: flume::Receiver<()>) {
    let live: LiveSet = Rc::default();
    let mut epoch = 0u64;
    let mut anonymous = 0u64;

    loop {
        let accepted = select! {
            res = listener.accept().fuse() => res,
            _ = stop.recv_async().fuse() => return,
        };
        let (stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("[ACCEPT] accept failed: {}", e);
                compio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };

        epoch += 1;
        let conn_epoch = epoch;
        let ctx = ctx.clone();
        let live = live.clone();
        let fallback = if ctx.prefixes_identity() {
            anonymous += 1;
            Bytes::from(format!("\0peer-{anonymous}"))
        } else {
            Bytes::from(format!("pipe-{conn_epoch}"))
        };

        compio::runtime::spawn(async move {
            if let Err(e) = admit(stream, conn_epoch, fallback, &ctx, live).await {
                debug!("[ACCEPT] connection from {} refused: {}", addr, e);
            }
        })
        .detach();
    }
}

async fn admit(
    mut stream: TcpStream,
    epoch: u64,
    fallback: Bytes,
    ctx: &PipeContext,
    live: LiveSet,
) -> io::Result<()> {
    if ctx.options.tcp_nodelay {
        enable_tcp_nodelay(&stream)?;
    }
    let routed = ctx.prefixes_identity();
    // An announced identity is claimed before READY goes out, so two
    // connections racing for it cannot both complete.
    let mut claimed = None;
    let handshake = perform_handshake_with(
        &mut stream,
        ctx.local,
        ctx.identity.as_deref(),
        true,
        Some(ctx.options.handshake_timeout),
        |peer| match &peer.identity {
            Some(id) if routed => {
                if !live.borrow_mut().insert(id.clone()) {
                    return Err(ZmtpError::IdentityInUse(id.clone()));
                }
                claimed = Some(id.clone());
                Ok(())
            }
            _ => Ok(()),
        },
    )
    .await;

    let peer = match handshake {
        Ok(peer) => peer,
        Err(e) => {
            if let Some(id) = claimed {
                live.borrow_mut().remove(&id);
            }
            if let Some(ZmtpError::IdentityInUse(identity)) = ZmtpError::from_io(&e) {
                refuse(ctx, identity.clone());
            }
            return Err(e);
        }
    };

    let identity = if routed {
        peer.identity.unwrap_or(fallback)
    } else {
        fallback
    };

    let live = if routed {
        // Generated identities are unique; announced ones are already in.
        live.borrow_mut().insert(identity.clone());
        Some(live)
    } else {
        None
    };

    let pipe = start_pipe(stream, identity.clone(), epoch, ctx, live);
    ctx.events
        .send(PipeEvent::Up {
            identity,
            epoch,
            pipe,
        })
        .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "socket closed"))
}

fn refuse(ctx: &PipeContext, identity: Bytes) {
    warn!("[ACCEPT] Refused second connection for identity {:?}", identity);
    let _ = ctx.events.send(PipeEvent::Refused { identity });
}
