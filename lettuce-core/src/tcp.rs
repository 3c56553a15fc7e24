//! TCP socket tuning.
//!
//! # Safety
//!
//! Borrows the raw descriptor of a compio stream to set options through
//! `socket2`. The borrowed socket is never closed.

#![allow(unsafe_code)]

use std::io;
#[cfg(any(unix, windows))]
use std::mem::ManuallyDrop;

/// Enable TCP_NODELAY on a compio TcpStream.
///
/// Registration acks and small application messages are latency bound, so
/// Nagle's algorithm only adds delay.
#[inline]
pub fn enable_tcp_nodelay(stream: &compio::net::TcpStream) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let fd = stream.as_raw_fd();
        let sock = ManuallyDrop::new(unsafe { socket2::Socket::from_raw_fd(fd) });
        sock.set_nodelay(true)
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let raw = stream.as_raw_socket();
        let sock = ManuallyDrop::new(unsafe { socket2::Socket::from_raw_socket(raw) });
        sock.set_nodelay(true)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = stream;
        Ok(())
    }
}
