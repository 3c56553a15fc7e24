//! Timeout utilities for I/O operations
//!
//! Wraps futures in compio's timer so every wait in the I/O loop is bounded.

use compio::time::timeout;
use std::future::Future;
use std::io;
use std::time::Duration;

/// Run an I/O future with an upper bound.
///
/// # Arguments
///
/// * `duration` - Maximum time to wait
///    - `None`: Block indefinitely (no timeout)
///    - `Some(duration)`: Wait up to duration
///
/// # Returns
///
/// * The future's own result if it completed within the timeout
/// * `Err(io::ErrorKind::TimedOut)` if the timeout elapsed
pub async fn io_with_timeout<F, T>(duration: Option<Duration>, what: &str, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match duration {
        None => fut.await,
        Some(d) => match timeout(d, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{what} timed out after {d:?}"),
            )),
        },
    }
}

/// Whether an I/O error came from an elapsed timeout.
#[inline]
pub fn is_timeout(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
}
