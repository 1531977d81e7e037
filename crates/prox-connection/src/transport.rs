//! Byte transport under a connection lifecycle.

use crate::frame::{self, ConnectionFrame, PROTOCOL_HEADER};
use crate::lifecycle::DEFAULT_FRAME_MAX;
use prox_common::{connect_within, HarnessError, HarnessResult};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::trace;

const READ_CHUNK: usize = 16 * 1024;

/// Type (1), channel (2) and payload size (4).
const FRAME_HEADER_LEN: usize = 7;
/// Header plus the frame-end octet.
const FRAME_OVERHEAD: u64 = FRAME_HEADER_LEN as u64 + 1;

/// Frame-level transport.
///
/// `receive` returns `Ok(None)` when the idle timeout passes without a full
/// frame arriving; the lifecycle uses these ticks to drive heartbeats.
pub trait Transport: Send {
    fn send(&mut self, frame: &ConnectionFrame) -> HarnessResult<()>;

    fn receive(&mut self) -> HarnessResult<Option<ConnectionFrame>>;

    fn set_idle_timeout(&mut self, timeout: Duration) -> HarnessResult<()>;

    /// Largest frame, header and frame-end included, the peer may send.
    fn set_frame_max(&mut self, _frame_max: u32) {}

    /// Release the underlying connection. Further calls may fail.
    fn shutdown(&mut self);
}

/// Blocking TCP transport.
pub struct TcpTransport {
    target: String,
    stream: TcpStream,
    buffer: Vec<u8>,
    frame_max: u32,
}

impl TcpTransport {
    /// Connect to `host:port`; resolution and every resolved address share `timeout`.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> HarnessResult<Self> {
        let target = format!("{}:{}", host, port);
        let started = Instant::now();
        let addrs: Vec<_> = (host, port)
            .to_socket_addrs()
            .map_err(|e| HarnessError::transport(&target, format!("resolve failed: {}", e)))?
            .collect();

        let remaining = timeout
            .saturating_sub(started.elapsed())
            .max(Duration::from_millis(1));
        let stream = connect_within(addrs, remaining).map_err(|e| HarnessError::from_io(&target, &e))?;
        let _ = stream.set_nodelay(true);
        trace!("Connected to {:?}", stream.peer_addr());
        Ok(Self::from_stream(target, stream))
    }

    pub fn from_stream(target: impl Into<String>, stream: TcpStream) -> Self {
        Self {
            target: target.into(),
            stream,
            buffer: Vec::with_capacity(READ_CHUNK),
            frame_max: DEFAULT_FRAME_MAX,
        }
    }

    /// Reject a frame as soon as its header declares more than `frame_max`.
    fn check_declared_size(&self) -> HarnessResult<()> {
        if self.buffer.len() < FRAME_HEADER_LEN || self.buffer.starts_with(&PROTOCOL_HEADER[..4]) {
            return Ok(());
        }
        let size = u32::from_be_bytes([self.buffer[3], self.buffer[4], self.buffer[5], self.buffer[6]]);
        let total = u64::from(size) + FRAME_OVERHEAD;
        if total > u64::from(self.frame_max) {
            return Err(HarnessError::protocol(
                &self.target,
                format!("peer declared a {}-byte frame, frame_max is {}", total, self.frame_max),
            ));
        }
        Ok(())
    }

    fn take_buffered_frame(&mut self) -> HarnessResult<Option<ConnectionFrame>> {
        self.check_declared_size()?;
        match frame::decode(&self.buffer) {
            Ok(Some((frame, used))) => {
                self.buffer.drain(..used);
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(reason) => Err(HarnessError::protocol(&self.target, reason)),
        }
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, frame: &ConnectionFrame) -> HarnessResult<()> {
        let bytes = frame::encode(frame).map_err(|reason| HarnessError::protocol(&self.target, reason))?;
        self.stream
            .write_all(&bytes)
            .and_then(|_| self.stream.flush())
            .map_err(|e| HarnessError::from_io(&self.target, &e))?;
        trace!("Sent {} to {}", frame.name(), self.target);
        Ok(())
    }

    fn receive(&mut self) -> HarnessResult<Option<ConnectionFrame>> {
        loop {
            if let Some(frame) = self.take_buffered_frame()? {
                trace!("Received {} from {}", frame.name(), self.target);
                return Ok(Some(frame));
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(HarnessError::transport(&self.target, "connection closed by peer"));
                }
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(HarnessError::from_io(&self.target, &e)),
            }
        }
    }

    fn set_idle_timeout(&mut self, timeout: Duration) -> HarnessResult<()> {
        // A zero read timeout is an error at the socket layer
        let timeout = timeout.max(Duration::from_millis(1));
        self.stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| HarnessError::from_io(&self.target, &e))
    }

    fn set_frame_max(&mut self, frame_max: u32) {
        self.frame_max = frame_max;
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
