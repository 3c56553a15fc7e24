//! ZMTP 3.x frame codec.
//!
//! Frame layout:
//!
//! ```text
//! [flags:1][size:1]  body      short frame (size <= 255)
//! [flags:1][size:8]  body      long frame, size big-endian
//!
//! flags: 0x01 MORE, 0x02 LONG, 0x04 COMMAND, bits 3-7 reserved (zero)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const FLAG_MORE: u8 = 0x01;
pub const FLAG_LONG: u8 = 0x02;
pub const FLAG_COMMAND: u8 = 0x04;
const RESERVED_BITS: u8 = 0xF8;

/// ZMTP protocol errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ZmtpError {
    #[error("Protocol violation: reserved bits set in flags {0:#04x}")]
    ReservedBits(u8),

    #[error("Protocol violation: frame of {size} bytes exceeds limit {max}")]
    FrameTooLarge { size: u64, max: usize },

    #[error("Protocol violation: message has more than {0} frames")]
    TooManyFrames(usize),

    #[error("Invalid greeting: {0}")]
    InvalidGreeting(&'static str),

    #[error("Invalid command: {0}")]
    InvalidCommand(&'static str),

    #[error("Incompatible peer socket type {peer} for local {local}")]
    IncompatibleSocketType {
        local: &'static str,
        peer: &'static str,
    },

    #[error("Unexpected data frame during handshake")]
    UnexpectedData,

    #[error("Identity {0:?} is already connected")]
    IdentityInUse(Bytes),
}

impl From<ZmtpError> for std::io::Error {
    fn from(err: ZmtpError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    }
}

impl ZmtpError {
    /// The protocol error carried by an I/O error, if any.
    pub fn from_io(err: &std::io::Error) -> Option<&Self> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<Self>())
    }
}

/// Result type alias for ZMTP operations
pub type Result<T> = std::result::Result<T, ZmtpError>;

/// A decoded ZMTP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZmtpFrame {
    pub flags: u8,
    pub payload: Bytes,
}

impl ZmtpFrame {
    #[inline]
    pub const fn more(&self) -> bool {
        (self.flags & FLAG_MORE) != 0
    }

    #[inline]
    pub const fn is_command(&self) -> bool {
        (self.flags & FLAG_COMMAND) != 0
    }
}

/// Incremental frame decoder over an accumulating read buffer.
///
/// Bytes that do not yet form a whole frame stay in the buffer until the next
/// read appends the rest.
#[derive(Debug)]
pub struct ZmtpDecoder {
    max_frame_size: usize,
}

impl ZmtpDecoder {
    pub const fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns:
    /// - Ok(Some(frame)) → frame decoded and consumed from `src`
    /// - Ok(None) → need more data
    /// - Err → protocol violation, the connection must be dropped
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<ZmtpFrame>> {
        if src.len() < 2 {
            return Ok(None);
        }

        let flags = src[0];
        if (flags & RESERVED_BITS) != 0 {
            return Err(ZmtpError::ReservedBits(flags));
        }

        let is_long = (flags & FLAG_LONG) != 0;
        let header_len = if is_long { 9 } else { 2 };
        if src.len() < header_len {
            return Ok(None);
        }

        let body_len = if is_long {
            let mut size = &src[1..9];
            size.get_u64()
        } else {
            u64::from(src[1])
        };

        if body_len > self.max_frame_size as u64 {
            return Err(ZmtpError::FrameTooLarge {
                size: body_len,
                max: self.max_frame_size,
            });
        }

        let body_len = body_len as usize;
        if src.len() < header_len + body_len {
            src.reserve(header_len + body_len - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let payload = src.split_to(body_len).freeze();
        Ok(Some(ZmtpFrame {
            flags: flags & (FLAG_MORE | FLAG_COMMAND),
            payload,
        }))
    }
}

/// Write a frame header for a body of `len` bytes.
#[inline]
pub fn put_frame_header(dst: &mut impl BufMut, flags: u8, len: usize) {
    if len <= 255 {
        dst.put_u8(flags & !FLAG_LONG);
        dst.put_u8(len as u8);
    } else {
        dst.put_u8(flags | FLAG_LONG);
        dst.put_u64(len as u64);
    }
}

/// Encode a single frame (header + body).
pub fn encode_frame(dst: &mut impl BufMut, flags: u8, body: &[u8]) {
    put_frame_header(dst, flags, body.len());
    dst.put_slice(body);
}

/// Encode a multipart message: every frame but the last carries MORE.
pub fn encode_multipart(frames: &[Bytes], dst: &mut impl BufMut) {
    let last = frames.len().saturating_sub(1);
    for (i, frame) in frames.iter().enumerate() {
        let flags = if i < last { FLAG_MORE } else { 0 };
        encode_frame(dst, flags, frame);
    }
}

/// Collects frames until a complete multipart message is formed.
///
/// Owned by a single connection reader, not thread-safe.
#[derive(Debug)]
pub struct MultipartBuffer {
    frames: Vec<Bytes>,
    max_frames: usize,
}

impl MultipartBuffer {
    pub fn new(max_frames: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_frames,
        }
    }

    /// Returns the whole message once the last frame (MORE unset) arrives.
    pub fn push(&mut self, frame: ZmtpFrame) -> Result<Option<Vec<Bytes>>> {
        if self.frames.len() >= self.max_frames {
            self.frames.clear();
            return Err(ZmtpError::TooManyFrames(self.max_frames));
        }

        let more = frame.more();
        self.frames.push(frame.payload);
        if more {
            Ok(None)
        } else {
            Ok(Some(std::mem::take(&mut self.frames)))
        }
    }
}
