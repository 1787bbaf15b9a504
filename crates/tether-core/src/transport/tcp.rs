//! TCP-based OTA transport implementation.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument};

use super::traits::{OtaListener, OtaTransport, TransportError};

/// Listening socket for OTA peers.
pub struct TcpOtaListener {
    listener: Option<TcpListener>,
    port: u16,
}

impl TcpOtaListener {
    /// Bind on all interfaces.
    #[instrument(level = "info")]
    pub fn bind(port: u16) -> Result<Self, TransportError> {
        Self::bind_addr(SocketAddr::from(([0, 0, 0, 0], port)))
    }

    /// Bind on a specific address. Port 0 picks a free port.
    pub fn bind_addr(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).map_err(|e| TransportError::BindFailed {
            port: addr.port(),
            message: e.to_string(),
        })?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        info!(port = port, "OTA listener bound");
        Ok(Self {
            listener: Some(listener),
            port,
        })
    }
}

impl OtaListener for TcpOtaListener {
    type Stream = TcpTransport;

    fn accept(&mut self) -> Result<Option<TcpTransport>, TransportError> {
        let Some(listener) = &self.listener else {
            return Ok(None);
        };
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Accepted OTA peer");
                Ok(Some(TcpTransport::new(stream)?))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(TransportError::AcceptFailed(e.to_string())),
        }
    }

    fn close(&mut self) {
        if self.listener.take().is_some() {
            info!(port = self.port, "OTA listener closed");
        }
    }

    fn port(&self) -> u16 {
        self.port
    }
}

/// Blocking TCP stream with per-read deadlines.
pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
    connected: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nonblocking(false)?;
        // Response bytes are tiny; don't let Nagle hold them back.
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Ok(Self {
            stream,
            peer,
            connected: true,
        })
    }

    /// Connect to a device (uploader side).
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, TransportError> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Self::new(stream)
    }

    fn read_once(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timeout_error(timeout));
        }
        self.stream.set_read_timeout(Some(remaining))?;
        match self.stream.read(buf) {
            Ok(0) => {
                self.connected = false;
                Err(TransportError::Disconnected)
            }
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(timeout_error(timeout))
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                self.connected = false;
                Err(TransportError::ReadFailed(e.to_string()))
            }
        }
    }
}

fn timeout_error(timeout: Duration) -> TransportError {
    TransportError::Timeout {
        timeout_ms: timeout.as_millis() as u64,
    }
}

impl OtaTransport for TcpTransport {
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_once(&mut buf[filled..], deadline, timeout) {
                Ok(n) => filled += n,
                Err(TransportError::Timeout { .. }) if filled > 0 => {
                    return Err(TransportError::ShortRead {
                        expected: buf.len(),
                        actual: filled,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let n = self.read_once(buf, deadline, timeout)?;
            if n > 0 {
                return Ok(n);
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(data).map_err(|e| {
            self.connected = false;
            TransportError::WriteFailed(e.to_string())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) {
        let _ = self.stream.flush();
        let _ = self.stream.shutdown(Shutdown::Both);
        self.connected = false;
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
