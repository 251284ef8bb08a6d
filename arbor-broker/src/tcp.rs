//! TCP socket configuration.
//!
//! # Safety
//!
//! Setting TCP_NODELAY needs the raw file descriptor. The temporary
//! `socket2::Socket` is forgotten so the descriptor is not closed twice.

#![allow(unsafe_code)]

use std::io;

/// Enable TCP_NODELAY on a compio stream.
///
/// Request-reply turnarounds on overlay edges are latency-bound; Nagle
/// buffering works against them.
///
/// # Errors
///
/// Returns an error if the socket option cannot be set.
#[inline]
pub fn enable_tcp_nodelay(stream: &compio::net::TcpStream) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let fd = stream.as_raw_fd();
        let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
        sock.set_nodelay(true)?;
        std::mem::forget(sock); // Don't close the fd
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = stream;
        Ok(())
    }
}
