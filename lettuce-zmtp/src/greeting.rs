use crate::codec::ZmtpError;
use bytes::{BufMut, BytesMut};

/// ZMTP Greeting is always exactly 64 bytes
pub const GREETING_SIZE: usize = 64;

const SIGNATURE_HEAD: u8 = 0xFF;
const SIGNATURE_TAIL: u8 = 0x7F;
const MECHANISM_NULL: &[u8] = b"NULL";

/// Parsed greeting information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZmtpGreeting {
    pub major: u8,
    pub minor: u8,
    pub as_server: bool,
}

/// Build a ZMTP 3.0 NULL-mechanism greeting.
///
/// Layout:
/// ```text
/// [0]      0xFF
/// [1..9]   Padding
/// [9]      0x7F
/// [10]     Major version (3)
/// [11]     Minor version (0)
/// [12..32] Mechanism (ASCII, null-padded)
/// [32]     As-Server flag
/// [33..64] Padding
/// ```
pub fn build_greeting(as_server: bool) -> [u8; GREETING_SIZE] {
    let mut out = BytesMut::with_capacity(GREETING_SIZE);
    out.put_u8(SIGNATURE_HEAD);
    out.put_bytes(0, 8);
    out.put_u8(SIGNATURE_TAIL);
    out.put_u8(3);
    out.put_u8(0);
    out.put_slice(MECHANISM_NULL);
    out.put_bytes(0, 20 - MECHANISM_NULL.len());
    out.put_u8(u8::from(as_server));
    out.put_bytes(0, 31);

    let mut greeting = [0u8; GREETING_SIZE];
    greeting.copy_from_slice(&out);
    greeting
}

impl ZmtpGreeting {
    /// Parse a peer greeting. Any 3.x version with the NULL mechanism is
    /// accepted.
    pub fn parse(src: &[u8]) -> crate::codec::Result<Self> {
        if src.len() < GREETING_SIZE {
            return Err(ZmtpError::InvalidGreeting("short greeting"));
        }

        if src[0] != SIGNATURE_HEAD || src[9] != SIGNATURE_TAIL {
            return Err(ZmtpError::InvalidGreeting("bad signature"));
        }

        let major = src[10];
        if major < 3 {
            return Err(ZmtpError::InvalidGreeting("ZMTP 3.x required"));
        }

        let mechanism = src[12..32]
            .split(|b| *b == 0)
            .next()
            .unwrap_or_default();
        if mechanism != MECHANISM_NULL {
            return Err(ZmtpError::InvalidGreeting("only the NULL mechanism is supported"));
        }

        Ok(Self {
            major,
            minor: src[11],
            as_server: (src[32] & 0x01) != 0,
        })
    }
}
