//! ZMTP handshake, completed before any background task touches the stream.
//!
//! The connecting side sends its READY first. The accepting side reads the
//! peer's READY before answering, so it can refuse the peer (incompatible
//! socket type, identity already connected) with an ERROR command instead
//! of a READY. Every read is exact, so application frames the peer sends
//! right after its READY stay in the socket for the connection reader.

use crate::codec::{encode_frame, ZmtpError, FLAG_COMMAND, FLAG_LONG};
use crate::command::{build_error, build_ready, parse_command, parse_ready, PeerReady, SocketType};
use crate::greeting::{build_greeting, ZmtpGreeting, GREETING_SIZE};
use compio::buf::BufResult;
use compio::io::{AsyncReadExt, AsyncWriteExt};
use compio::net::TcpStream;
use lettuce_core::timeout::io_with_timeout;
use std::io;
use std::time::Duration;
use tracing::debug;

/// Upper bound on a READY body; real ones are well under 100 bytes.
const MAX_READY_SIZE: usize = 1024;

/// Perform the full handshake within `timeout`.
///
/// Returns the peer's socket type and announced identity. Incompatible
/// peers get an ERROR command before the error is returned.
pub async fn perform_handshake(
    stream: &mut TcpStream,
    local: SocketType,
    identity: Option<&[u8]>,
    as_server: bool,
    timeout: Option<Duration>,
) -> io::Result<PeerReady> {
    perform_handshake_with(stream, local, identity, as_server, timeout, |_| Ok(())).await
}

/// Like [`perform_handshake`], with an extra admission check the accepting
/// side runs on the peer's READY before answering.
///
/// A rejected peer receives an ERROR command and its handshake fails. The
/// connecting side ignores `admit`.
pub async fn perform_handshake_with<F>(
    stream: &mut TcpStream,
    local: SocketType,
    identity: Option<&[u8]>,
    as_server: bool,
    timeout: Option<Duration>,
    admit: F,
) -> io::Result<PeerReady>
where
    F: FnOnce(&PeerReady) -> Result<(), ZmtpError>,
{
    io_with_timeout(
        timeout,
        "handshake",
        handshake(stream, local, identity, as_server, admit),
    )
    .await
}

async fn handshake<F>(
    stream: &mut TcpStream,
    local: SocketType,
    identity: Option<&[u8]>,
    as_server: bool,
    admit: F,
) -> io::Result<PeerReady>
where
    F: FnOnce(&PeerReady) -> Result<(), ZmtpError>,
{
    debug!("[HANDSHAKE] Starting as {}", local.as_str());

    write_all(stream, build_greeting(as_server).to_vec()).await?;

    let BufResult(res, greeting) = stream.read_exact([0u8; GREETING_SIZE]).await;
    res?;
    let greeting = ZmtpGreeting::parse(&greeting)?;
    debug!(
        "[HANDSHAKE] Peer greeting ZMTP {}.{}",
        greeting.major, greeting.minor
    );

    let mut ready = Vec::with_capacity(64);
    encode_frame(&mut ready, FLAG_COMMAND, &build_ready(local, identity));

    let peer = if as_server {
        let peer = read_peer_ready(stream).await?;
        let verdict = if local.accepts(peer.socket_type) {
            admit(&peer)
        } else {
            Err(ZmtpError::IncompatibleSocketType {
                local: local.as_str(),
                peer: peer.socket_type.as_str(),
            })
        };
        if let Err(e) = verdict {
            reject(stream, &e).await;
            return Err(e.into());
        }
        write_all(stream, ready).await?;
        peer
    } else {
        write_all(stream, ready).await?;
        let peer = read_peer_ready(stream).await?;
        if !local.accepts(peer.socket_type) {
            let e = ZmtpError::IncompatibleSocketType {
                local: local.as_str(),
                peer: peer.socket_type.as_str(),
            };
            reject(stream, &e).await;
            return Err(e.into());
        }
        peer
    };

    debug!(
        "[HANDSHAKE] Complete, peer is {} (identity: {})",
        peer.socket_type.as_str(),
        peer.identity
            .as_deref()
            .map_or_else(|| "<none>".into(), String::from_utf8_lossy)
    );
    Ok(peer)
}

/// Read the peer's READY; an ERROR from the peer fails the handshake.
async fn read_peer_ready(stream: &mut TcpStream) -> io::Result<PeerReady> {
    let body = read_command(stream).await?;
    let cmd = parse_command(&body)?;
    if cmd.is_error() {
        return Err(ZmtpError::InvalidCommand("peer rejected handshake").into());
    }
    Ok(parse_ready(&body)?)
}

/// Best effort: the connection is dropped either way.
async fn reject(stream: &mut TcpStream, reason: &ZmtpError) {
    let mut frame = Vec::with_capacity(64);
    let reason = match reason {
        ZmtpError::IdentityInUse(_) => "identity already connected",
        _ => "incompatible socket type",
    };
    encode_frame(&mut frame, FLAG_COMMAND, &build_error(reason));
    let _ = write_all(stream, frame).await;
}

async fn write_all(stream: &mut TcpStream, buf: Vec<u8>) -> io::Result<()> {
    let BufResult(res, _) = stream.write_all(buf).await;
    res
}

/// Read exactly one command frame and return its body.
async fn read_command(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let BufResult(res, header) = stream.read_exact([0u8; 2]).await;
    res?;

    let flags = header[0];
    if (flags & FLAG_COMMAND) == 0 {
        return Err(ZmtpError::UnexpectedData.into());
    }

    let body_len = if (flags & FLAG_LONG) != 0 {
        // header[1] is the first byte of the 8-byte size
        let BufResult(res, rest) = stream.read_exact([0u8; 7]).await;
        res?;
        let mut size = [0u8; 8];
        size[0] = header[1];
        size[1..].copy_from_slice(&rest);
        u64::from_be_bytes(size) as usize
    } else {
        header[1] as usize
    };

    if body_len > MAX_READY_SIZE {
        return Err(ZmtpError::FrameTooLarge {
            size: body_len as u64,
            max: MAX_READY_SIZE,
        }
        .into());
    }

    let BufResult(res, body) = stream.read_exact(vec![0u8; body_len]).await;
    res?;
    Ok(body)
}
