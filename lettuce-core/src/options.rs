//! Endpoint configuration options
//!
//! Timeouts, failure policy and registration policy shared by every endpoint
//! topology, plus the identity rules applied to peer names and send targets.

use std::time::Duration;

/// How the I/O loop treats failures it can survive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Report the failure (log + event) and keep serving.
    ///
    /// Unregistered senders are published to the server's own hub.
    #[default]
    Recoverable,

    /// Treat dequeue/send timeouts and unknown recipients as fatal to the
    /// loop, and reject traffic from unregistered senders.
    Strict,
}

impl FailurePolicy {
    #[inline]
    pub const fn is_strict(self) -> bool {
        matches!(self, Self::Strict)
    }
}

/// Endpoint configuration options.
///
/// # Examples
///
/// ```
/// use lettuce_core::options::{EndpointOptions, FailurePolicy};
/// use std::time::Duration;
///
/// let opts = EndpointOptions::default()
///     .with_send_timeout(Duration::from_secs(2))
///     .with_failure_policy(FailurePolicy::Strict);
/// assert_eq!(opts.dequeue_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Bounded wait for taking a pending item off the outbound queue.
    ///
    /// Also the longest the loop sleeps before re-checking for shutdown.
    /// - Default: 5 seconds
    pub dequeue_timeout: Duration,

    /// Bounded wait for the socket to accept one outbound message.
    /// - Default: 7 seconds
    pub send_timeout: Duration,

    /// Maximum time to complete the connection handshake.
    /// - Default: 30 seconds
    pub handshake_timeout: Duration,

    /// Recoverable (default) or strict failure handling.
    pub failure_policy: FailurePolicy,

    /// Report every dequeue timeout that expires with nothing to send as
    /// `QueueTimeout`. Fatal under the strict policy, so a strict endpoint
    /// with this set stops after `dequeue_timeout` of outbound silence.
    /// - Default: false (expiry is an idle tick)
    pub report_queue_timeouts: bool,

    /// Server only: create a session for a `RegisterClient` even when the
    /// request does not ask for pre-registration.
    /// - Default: false
    pub pre_register_unknown_clients: bool,

    /// Maximum size of a decoded message payload in bytes. Larger payloads
    /// are reported as `DecodeError::TooLarge` and dropped; the connection
    /// stays up.
    /// - `None`: No limit (default)
    pub max_message_size: Option<usize>,

    /// Size of each socket read.
    /// - Default: 8192 (8KB)
    pub read_buffer_size: usize,

    /// Disable Nagle's algorithm on every TCP connection.
    /// - Default: true
    pub tcp_nodelay: bool,

    /// First delay before a connected dealer redials a lost server.
    /// - Default: 100ms
    pub reconnect_ivl: Duration,

    /// Upper bound for the doubling redial delay.
    /// - Default: 5 seconds
    pub reconnect_ivl_max: Duration,

    /// Messages a dealer holds while it has no connection.
    /// - Default: 1000
    pub pending_limit: usize,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            dequeue_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(7),
            handshake_timeout: Duration::from_secs(30),
            failure_policy: FailurePolicy::Recoverable,
            report_queue_timeouts: false,
            pre_register_unknown_clients: false,
            max_message_size: None,
            read_buffer_size: 8192,
            tcp_nodelay: true,
            reconnect_ivl: Duration::from_millis(100),
            reconnect_ivl_max: Duration::from_secs(5),
            pending_limit: 1000,
        }
    }
}

impl EndpointOptions {
    /// Create new options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Shorthand for `with_failure_policy(FailurePolicy::Strict)`.
    pub fn strict(self) -> Self {
        self.with_failure_policy(FailurePolicy::Strict)
    }

    pub fn with_queue_timeout_reports(mut self, enabled: bool) -> Self {
        self.report_queue_timeouts = enabled;
        self
    }

    pub fn with_pre_register_unknown_clients(mut self, enabled: bool) -> Self {
        self.pre_register_unknown_clients = enabled;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    pub fn with_reconnect_ivl(mut self, interval: Duration) -> Self {
        self.reconnect_ivl = interval;
        self
    }

    pub fn with_reconnect_ivl_max(mut self, interval: Duration) -> Self {
        self.reconnect_ivl_max = interval;
        self
    }

    pub fn with_pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = limit;
        self
    }

    /// Validate a client identity (peer name or send target).
    ///
    /// Identities must:
    /// - Be 1-255 bytes long
    /// - Not start with a null byte (reserved for generated identities)
    pub fn validate_identity(id: &str) -> std::io::Result<()> {
        let bytes = id.as_bytes();
        if bytes.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "identity cannot be empty",
            ));
        }

        if bytes.len() > 255 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("identity cannot exceed 255 bytes (got {})", bytes.len()),
            ));
        }

        if bytes[0] == 0x00 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "identity cannot start with null byte",
            ));
        }

        Ok(())
    }
}
