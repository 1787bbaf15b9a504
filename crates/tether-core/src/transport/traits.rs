//! OTA transport layer abstraction.
//!
//! Defines the `OtaTransport` trait for a single accepted peer connection
//! and `OtaListener` for accepting peers, allowing TCP and mock backends.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to bind port {port}: {message}")]
    BindFailed { port: u16, message: String },

    #[error("Accept failed: {0}")]
    AcceptFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connected OTA peer.
///
/// Reads block the calling thread for at most `timeout`; this is the only
/// place the cooperative loop is allowed to block.
pub trait OtaTransport {
    /// Fill `buf` completely or fail.
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), TransportError>;

    /// Read whatever is available (at least one byte), bounded by `buf`.
    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Write all bytes.
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Write a single response byte.
    fn write_byte(&mut self, byte: u8) -> Result<(), TransportError> {
        self.write_all(&[byte])
    }

    /// Check if the peer is still connected.
    fn is_connected(&self) -> bool;

    /// Flush and close the connection.
    fn close(&mut self);

    /// Peer address for logging.
    fn peer(&self) -> String;
}

/// Source of OTA peer connections.
pub trait OtaListener {
    type Stream: OtaTransport;

    /// Accept a pending peer without blocking.
    fn accept(&mut self) -> Result<Option<Self::Stream>, TransportError>;

    /// Stop listening.
    fn close(&mut self);

    /// Bound port.
    fn port(&self) -> u16;
}
