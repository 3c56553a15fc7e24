//! ZMTP commands used by the NULL mechanism: READY (and ERROR on rejection).

use crate::codec::ZmtpError;
use bytes::{BufMut, Bytes, BytesMut};

const READY: &[u8] = b"READY";
const ERROR: &[u8] = b"ERROR";
const PROP_SOCKET_TYPE: &[u8] = b"Socket-Type";
const PROP_IDENTITY: &[u8] = b"Identity";

/// Socket roles spoken on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Dealer,
    Router,
}

impl SocketType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dealer => "DEALER",
            Self::Router => "ROUTER",
        }
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        match raw {
            b"DEALER" => Some(Self::Dealer),
            b"ROUTER" => Some(Self::Router),
            _ => None,
        }
    }

    /// DEALER talks to ROUTER and DEALER; ROUTER talks to DEALER only here.
    pub const fn accepts(self, peer: Self) -> bool {
        !matches!((self, peer), (Self::Router, Self::Router))
    }
}

/// Parsed command with borrowed property views.
#[derive(Debug, Clone)]
pub struct ZmtpCommand<'a> {
    pub name: &'a [u8],
    props: Vec<(&'a [u8], &'a [u8])>,
}

impl<'a> ZmtpCommand<'a> {
    /// Property lookup is case-insensitive, as in the ZMTP metadata grammar.
    pub fn get(&self, prop: &[u8]) -> Option<&'a [u8]> {
        self.props
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(prop))
            .map(|(_, value)| *value)
    }

    pub fn is_ready(&self) -> bool {
        self.name == READY
    }

    pub fn is_error(&self) -> bool {
        self.name == ERROR
    }
}

/// Parse a command frame body into name + properties.
///
/// ERROR carries a single reason string instead of properties; it is
/// returned with no properties.
pub fn parse_command(body: &[u8]) -> crate::codec::Result<ZmtpCommand<'_>> {
    let (&name_len, rest) = body
        .split_first()
        .ok_or(ZmtpError::InvalidCommand("empty command"))?;
    let name_len = name_len as usize;
    if rest.len() < name_len {
        return Err(ZmtpError::InvalidCommand("truncated name"));
    }
    let (name, mut rest) = rest.split_at(name_len);

    let mut props = Vec::new();
    if name == ERROR {
        return Ok(ZmtpCommand { name, props });
    }

    while let Some((&key_len, tail)) = rest.split_first() {
        let key_len = key_len as usize;
        if tail.len() < key_len + 4 {
            return Err(ZmtpError::InvalidCommand("truncated property"));
        }
        let (key, tail) = tail.split_at(key_len);
        let (len, tail) = tail.split_at(4);
        let value_len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        if tail.len() < value_len {
            return Err(ZmtpError::InvalidCommand("truncated property value"));
        }
        let (value, tail) = tail.split_at(value_len);
        props.push((key, value));
        rest = tail;
    }

    Ok(ZmtpCommand { name, props })
}

fn put_property(dst: &mut BytesMut, name: &[u8], value: &[u8]) {
    dst.put_u8(name.len() as u8);
    dst.put_slice(name);
    dst.put_u32(value.len() as u32);
    dst.put_slice(value);
}

/// Build a READY command body.
///
/// The Identity property is only sent when an identity is set.
pub fn build_ready(socket_type: SocketType, identity: Option<&[u8]>) -> Bytes {
    let mut out = BytesMut::with_capacity(64);
    out.put_u8(READY.len() as u8);
    out.put_slice(READY);
    put_property(&mut out, PROP_SOCKET_TYPE, socket_type.as_str().as_bytes());
    if let Some(id) = identity.filter(|id| !id.is_empty()) {
        put_property(&mut out, PROP_IDENTITY, id);
    }
    out.freeze()
}

/// Build an ERROR command body (reason truncated to 255 bytes).
pub fn build_error(reason: &str) -> Bytes {
    let reason = &reason.as_bytes()[..reason.len().min(255)];
    let mut out = BytesMut::with_capacity(ERROR.len() + reason.len() + 2);
    out.put_u8(ERROR.len() as u8);
    out.put_slice(ERROR);
    out.put_u8(reason.len() as u8);
    out.put_slice(reason);
    out.freeze()
}

/// Peer metadata announced in READY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerReady {
    pub socket_type: SocketType,
    pub identity: Option<Bytes>,
}

/// Parse a READY body into the peer's socket type and optional identity.
pub fn parse_ready(body: &[u8]) -> crate::codec::Result<PeerReady> {
    let cmd = parse_command(body)?;
    if !cmd.is_ready() {
        return Err(ZmtpError::InvalidCommand("expected READY"));
    }

    let socket_type = cmd
        .get(PROP_SOCKET_TYPE)
        .and_then(SocketType::from_bytes)
        .ok_or(ZmtpError::InvalidCommand("missing or unknown Socket-Type"))?;
    let identity = cmd
        .get(PROP_IDENTITY)
        .filter(|id| !id.is_empty())
        .map(Bytes::copy_from_slice);

    Ok(PeerReady {
        socket_type,
        identity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_carries_type_and_identity() {
        let body = build_ready(SocketType::Dealer, Some(b"client-1"));
        let ready = parse_ready(&body).unwrap();
        assert_eq!(ready.socket_type, SocketType::Dealer);
        assert_eq!(ready.identity.as_deref(), Some(&b"client-1"[..]));
    }

    #[test]
    fn empty_identity_is_omitted() {
        let body = build_ready(SocketType::Router, Some(b""));
        let ready = parse_ready(&body).unwrap();
        assert_eq!(ready.socket_type, SocketType::Router);
        assert_eq!(ready.identity, None);
    }

    #[test]
    fn property_names_are_case_insensitive() {
        let mut body = BytesMut::new();
        body.put_u8(5);
        body.put_slice(b"READY");
        put_property(&mut body, b"socket-type", b"DEALER");
        assert_eq!(parse_ready(&body).unwrap().socket_type, SocketType::Dealer);
    }

    #[test]
    fn truncated_and_foreign_commands_rejected() {
        let body = build_ready(SocketType::Dealer, Some(b"abc"));
        assert!(parse_ready(&body[..body.len() - 1]).is_err());
        assert!(parse_ready(&build_error("go away")).is_err());
        assert!(parse_command(&build_error("go away")).unwrap().is_error());
    }

    #[test]
    fn router_rejects_router_peers() {
        assert!(SocketType::Router.accepts(SocketType::Dealer));
        assert!(SocketType::Dealer.accepts(SocketType::Dealer));
        assert!(SocketType::Dealer.accepts(SocketType::Router));
        assert!(!SocketType::Router.accepts(SocketType::Router));
    }
}
