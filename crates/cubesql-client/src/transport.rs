//! Framed transport over a blocking byte stream
//!
//! Frames are length-prefixed: a big-endian `u32` payload length followed by
//! that many payload bytes. The transport reads and writes whole frames and
//! enforces the frame-size ceiling; it knows nothing about message contents.
//!
//! The transport is generic over `Read + Write` so unit tests can run
//! against in-memory streams; `connect` produces the `TcpStream`-backed
//! instance used by real sessions.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use cubesql_common::protocol::MAX_MESSAGE_SIZE;
use cubesql_common::{CubeError, Result};
use tracing::{debug, trace};

#[derive(Debug)]
pub struct FramedTransport<S> {
    stream: S,
}

impl FramedTransport<TcpStream> {
    /// Resolve `host:port` and open a connected transport.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let mut last_err = None;
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| CubeError::Io(format!("failed to resolve {host}:{port}: {e}")))?;

        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(%addr, "connected");
                    return Ok(Self::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(match last_err {
            Some(e) => CubeError::Io(format!("failed to connect to {host}:{port}: {e}")),
            None => CubeError::Io(format!("no addresses resolved for {host}:{port}")),
        })
    }
}

impl<S: Read + Write> FramedTransport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Write one complete frame. `frame` must already begin with its 4-byte
    /// length prefix.
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.stream
            .write_all(frame)
            .map_err(|e| map_io("socket write error", e))?;
        self.stream
            .flush()
            .map_err(|e| map_io("socket write error", e))?;
        trace!(len = frame.len(), "frame written");
        Ok(())
    }

    /// Read one complete frame, returning the length prefix together with
    /// the payload so callers can address the payload at offset 4.
    pub fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut length_buf = [0u8; 4];
        self.stream
            .read_exact(&mut length_buf)
            .map_err(|e| map_io("socket read error", e))?;

        let length = u32::from_be_bytes(length_buf) as usize;
        if length == 0 || length > MAX_MESSAGE_SIZE {
            return Err(CubeError::InvalidData(format!(
                "invalid message length: {length}"
            )));
        }

        let mut frame = vec![0u8; 4 + length];
        frame[..4].copy_from_slice(&length_buf);
        self.stream
            .read_exact(&mut frame[4..])
            .map_err(|e| map_io("socket read error", e))?;

        trace!(len = frame.len(), "frame read");
        Ok(frame)
    }
}

fn map_io(context: &str, err: std::io::Error) -> CubeError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        CubeError::Io("connection closed by server".into())
    } else {
        CubeError::Io(format!("{context}: {err}"))
    }
}
