//! Bounded TCP connects.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

/// Connect to the first address that accepts within one shared `timeout`.
///
/// Addresses are tried in order and each gets only what is left of the
/// budget, so a host with several unreachable addresses still fails within
/// `timeout`. Returns the last error when no address accepted.
pub fn connect_within<I>(addrs: I, timeout: Duration) -> io::Result<TcpStream>
where
    I: IntoIterator<Item = SocketAddr>,
{
    let deadline = Instant::now() + timeout;
    let mut last_error = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");

    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect budget of {:?} spent before trying {}", timeout, addr),
            ));
        }
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = io::Error::new(e.kind(), format!("{}: {}", addr, e)),
        }
    }
    Err(last_error)
}
