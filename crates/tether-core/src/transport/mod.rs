//! Transport layer for OTA peer connections.

pub mod mock;
pub mod tcp;
pub mod traits;

pub use mock::{MockListener, MockStream};
pub use tcp::{TcpOtaListener, TcpTransport};
pub use traits::{OtaListener, OtaTransport, TransportError};
