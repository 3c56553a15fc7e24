/// Lettuce Error Types
///
/// The error taxonomy shared by the codec, the hubs and every endpoint.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure to turn a payload frame back into a typed message.
///
/// Always scoped to a single inbound message; the I/O loop logs it and moves on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload shorter than the 4-byte type identifier header
    #[error("payload truncated: {0} bytes, need at least 4")]
    Truncated(usize),

    /// No decoder registered for the type identifier
    #[error("unknown message type identifier {0}")]
    UnknownType(u32),

    /// Body did not deserialize into the registered type
    #[error("malformed body for message type {type_id}: {reason}")]
    Malformed { type_id: u32, reason: String },

    /// Payload exceeded the configured maximum
    #[error("payload too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    /// Wrong number of frames for the topology
    #[error("expected {expected} frames, got {got}")]
    FrameCount { expected: usize, got: usize },

    /// Delimiter frame was not empty
    #[error("missing empty delimiter frame")]
    MissingDelimiter,

    /// Routing identity frame was not UTF-8
    #[error("identity frame is not valid UTF-8")]
    InvalidIdentity,
}

/// Collisions detected while building the message registry at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("module {module} range {start}..={end} overlaps module {other}")]
    RangeOverlap {
        module: String,
        other: String,
        start: u32,
        end: u32,
    },

    #[error("module {0} is already registered")]
    DuplicateModule(String),

    #[error("type identifier {type_id} ({type_name}) is already bound to {existing}")]
    DuplicateTypeId {
        type_id: u32,
        type_name: &'static str,
        existing: &'static str,
    },

    #[error("type identifier {type_id} ({type_name}) is outside module {module} range {start}..={end}")]
    OutOfRange {
        type_id: u32,
        type_name: &'static str,
        module: String,
        start: u32,
        end: u32,
    },
}

/// Main error type for Lettuce operations
#[derive(Error, Debug)]
pub enum LettuceError {
    /// Invalid constructor arguments, raised before any resource exists
    #[error("construction error: {0}")]
    Construction(String),

    /// Inbound payload could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Outbound message could not be serialized
    #[error("encode error for message type {type_id}: {reason}")]
    Encode { type_id: u32, reason: String },

    /// Message registry collision
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Identity already has a registered session
    #[error("client {0} is already registered")]
    DuplicateRegistration(String),

    /// Send target has no registered session
    #[error("cannot send to {0}, it is not registered")]
    UnknownRecipient(String),

    /// De-registration of an identity without a session
    #[error("cannot deregister {0}, it is not registered")]
    UnknownSenderDeregistration(String),

    /// Traffic from an identity without a session (strict policy only)
    #[error("rejected message type {type_id} from unregistered sender {identity}")]
    UnknownSender { identity: String, type_id: u32 },

    /// Pending outbound item could not be dequeued in time
    #[error("failed to dequeue pending outbound message within {0:?}")]
    QueueTimeout(Duration),

    /// Socket did not accept the message in time
    #[error("send to {target} timed out after {after:?}")]
    SendTimeout { target: String, after: Duration },

    /// IO error from the socket layer
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Endpoint loop has stopped
    #[error("endpoint closed")]
    Closed,
}

/// Result type alias for Lettuce operations
pub type Result<T> = std::result::Result<T, LettuceError>;

impl LettuceError {
    /// Create a construction error with a message
    pub fn construction(msg: impl Into<String>) -> Self {
        Self::Construction(msg.into())
    }

    /// Whether the I/O loop keeps running after reporting this error under
    /// the recoverable policy.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Decode(_)
            | Self::Encode { .. }
            | Self::UnknownRecipient(_)
            | Self::UnknownSender { .. }
            | Self::QueueTimeout(_)
            | Self::SendTimeout { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::NotFound
            ),
            _ => false,
        }
    }

    /// Errors raised by registry invariants.
    #[must_use]
    pub const fn is_registry_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateRegistration(_)
                | Self::UnknownRecipient(_)
                | Self::UnknownSenderDeregistration(_)
        )
    }
}
