//! Broker session abstraction.
//!
//! The session owns wire encoding and socket I/O. The client owns retry
//! and timeout policy and only ever calls the session from the poll thread.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

use super::message::{MessageTemplate, QoS};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Not connected")]
    NotConnected,

    #[error("Request queue full")]
    QueueFull,

    #[error("Session rejected request: {0}")]
    Rejected(String),

    #[error("Invalid connect options: {0}")]
    InvalidOptions(String),
}

/// Why the broker session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    TcpDisconnected,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    MalformedCredentials,
    NotAuthorized,
    NotEnoughSpace,
    TlsBadFingerprint,
    Unknown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::TcpDisconnected => "TCP disconnected",
            DisconnectReason::UnacceptableProtocolVersion => "Unacceptable Protocol Version",
            DisconnectReason::IdentifierRejected => "Identifier Rejected",
            DisconnectReason::ServerUnavailable => "Server Unavailable",
            DisconnectReason::MalformedCredentials => "Malformed Credentials",
            DisconnectReason::NotAuthorized => "Not Authorized",
            DisconnectReason::NotEnoughSpace => "Not Enough Space",
            DisconnectReason::TlsBadFingerprint => "TLS Bad Fingerprint",
            DisconnectReason::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Events delivered by the session, drained on the poll thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Message { topic: String, payload: String },
    Disconnected(DisconnectReason),
}

/// Everything needed to open a session.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub ip: IpAddr,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub last_will: Option<MessageTemplate>,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("keep_alive", &self.keep_alive)
            .field("last_will", &self.last_will)
            .finish()
    }
}

/// Broker session collaborator.
pub trait BrokerSession {
    /// Start connecting. Completion is observed through [`connected`].
    ///
    /// [`connected`]: BrokerSession::connected
    fn connect(&mut self, options: &ConnectOptions) -> Result<(), SessionError>;

    /// Tear the session down. `force` skips the graceful DISCONNECT.
    fn disconnect(&mut self, force: bool);

    /// Whether the session is currently established.
    fn connected(&self) -> bool;

    /// Hand a publish to the session. An error means it was not accepted.
    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), SessionError>;

    /// Hand a subscribe request to the session.
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError>;

    /// Next pending event, if any. Never blocks.
    fn poll_event(&mut self) -> Option<SessionEvent>;
}
