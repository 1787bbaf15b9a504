//! Mock OTA transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{OtaListener, OtaTransport, TransportError};

#[derive(Default)]
struct MockInner {
    /// Bytes the peer has "sent".
    inbound: VecDeque<u8>,
    /// Captured writes.
    written: Vec<u8>,
    /// Whether the peer is "connected".
    disconnected: bool,
    /// Return `Disconnected` instead of `Timeout` once inbound is drained.
    hang_up_when_drained: bool,
    closed: bool,
}

/// Scripted in-memory peer.
///
/// Clones share state, so a test can keep a handle to inspect writes after
/// the session has taken ownership of the stream.
#[derive(Clone, Default)]
pub struct MockStream {
    inner: Arc<Mutex<MockInner>>,
}

impl MockStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes to be returned by subsequent reads.
    pub fn push_inbound(&self, data: &[u8]) {
        self.inner.lock().unwrap().inbound.extend(data.iter().copied());
    }

    /// Drop the connection once the queued bytes are consumed.
    pub fn hang_up_when_drained(&self) {
        self.inner.lock().unwrap().hang_up_when_drained = true;
    }

    /// All bytes written so far.
    pub fn written(&self) -> Vec<u8> {
        self.inner.lock().unwrap().written.clone()
    }

    /// Number of queued bytes not read yet.
    pub fn pending_inbound(&self) -> usize {
        self.inner.lock().unwrap().inbound.len()
    }

    /// Simulate the peer going away.
    pub fn disconnect(&self) {
        self.inner.lock().unwrap().disconnected = true;
    }

    /// Whether `close()` was called by the session.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    fn drained_error(inner: &mut MockInner, timeout: Duration) -> TransportError {
        if inner.hang_up_when_drained {
            inner.disconnected = true;
            TransportError::Disconnected
        } else {
            TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }
        }
    }
}

impl OtaTransport for MockStream {
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.disconnected {
            return Err(TransportError::Disconnected);
        }
        if inner.inbound.len() < buf.len() {
            let actual = inner.inbound.len();
            inner.inbound.clear();
            if actual == 0 || inner.hang_up_when_drained {
                return Err(Self::drained_error(&mut inner, timeout));
            }
            return Err(TransportError::ShortRead {
                expected: buf.len(),
                actual,
            });
        }
        for slot in buf.iter_mut() {
            *slot = inner.inbound.pop_front().unwrap_or_default();
        }
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.disconnected {
            return Err(TransportError::Disconnected);
        }
        if inner.inbound.is_empty() {
            return Err(Self::drained_error(&mut inner, timeout));
        }
        let n = buf.len().min(inner.inbound.len());
        for slot in buf[..n].iter_mut() {
            *slot = inner.inbound.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.disconnected || inner.closed {
            return Err(TransportError::Disconnected);
        }
        inner.written.extend_from_slice(data);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.disconnected && !inner.closed
    }

    fn close(&mut self) {
        self.inner.lock().unwrap().closed = true;
    }

    fn peer(&self) -> String {
        "mock-peer".to_string()
    }
}

/// Listener handing out pre-arranged [`MockStream`]s. Clones share state.
#[derive(Clone, Default)]
pub struct MockListener {
    inner: Arc<Mutex<ListenerInner>>,
}

#[derive(Default)]
struct ListenerInner {
    pending: VecDeque<MockStream>,
    closed: bool,
}

impl MockListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `stream` available to the next `accept()`.
    pub fn push_peer(&self, stream: MockStream) {
        self.inner.lock().unwrap().pending.push_back(stream);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

impl OtaListener for MockListener {
    type Stream = MockStream;

    fn accept(&mut self) -> Result<Option<MockStream>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Ok(None);
        }
        Ok(inner.pending.pop_front())
    }

    fn close(&mut self) {
        self.inner.lock().unwrap().closed = true;
    }

    fn port(&self) -> u16 {
        crate::protocol::DEFAULT_OTA_PORT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(10);

    #[test]
    fn test_mock_inbound_queue() {
        let mut mock = MockStream::new();
        mock.push_inbound(b"abcdef");

        let mut buf = [0u8; 4];
        mock.read_exact(&mut buf, T).unwrap();
        assert_eq!(&buf, b"abcd");

        let mut big = [0u8; 16];
        assert_eq!(mock.read_some(&mut big, T).unwrap(), 2);
        assert_eq!(&big[..2], b"ef");

        // Queue is empty now
        assert!(matches!(
            mock.read_some(&mut big, T),
            Err(TransportError::Timeout { timeout_ms: 10 })
        ));
    }

    #[test]
    fn test_mock_short_read() {
        let mut mock = MockStream::new();
        mock.push_inbound(b"ab");
        let mut buf = [0u8; 4];
        assert!(matches!(
            mock.read_exact(&mut buf, T),
            Err(TransportError::ShortRead { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_mock_write_capture_shared() {
        let handle = MockStream::new();
        let mut stream = handle.clone();
        stream.write_all(b"Hello").unwrap();
        stream.write_byte(0x42).unwrap();
        assert_eq!(handle.written(), b"Hello\x42");

        stream.close();
        assert!(handle.is_closed());
        assert!(!handle.is_connected());
        assert!(stream.write_byte(0).is_err());
    }

    #[test]
    fn test_mock_hang_up() {
        let mut mock = MockStream::new();
        mock.hang_up_when_drained();
        let mut buf = [0u8; 1];
        assert!(matches!(
            mock.read_some(&mut buf, T),
            Err(TransportError::Disconnected)
        ));
        assert!(!mock.is_connected());
    }

    #[test]
    fn test_mock_listener() {
        let mut listener = MockListener::new();
        assert!(listener.accept().unwrap().is_none());
        listener.push_peer(MockStream::new());
        assert!(listener.accept().unwrap().is_some());
        listener.close();
        assert!(listener.is_closed());
    }
}
