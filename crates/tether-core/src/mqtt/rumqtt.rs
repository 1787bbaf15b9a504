//! [`BrokerSession`] backed by `rumqttc`.
//!
//! `rumqttc`'s sync [`Connection`] is driven on a reader thread. The thread
//! never dispatches; it pushes [`SessionEvent`]s into a bounded queue that
//! the client drains on its poll. Reconnection is owned by the client, so
//! the reader stops on the first connection error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, LastWill, MqttOptions, Packet,
};
use tracing::{debug, trace, warn};

use super::inbound::{self, InboundReceiver, InboundSender};
use super::message::QoS;
use super::session::{BrokerSession, ConnectOptions, DisconnectReason, SessionError, SessionEvent};

/// Smallest keep-alive `rumqttc` accepts.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;

pub struct RumqttSession {
    client: Option<Client>,
    connected: Arc<AtomicBool>,
    /// Bumped on every connect/disconnect so stale readers go quiet.
    generation: Arc<AtomicU64>,
    events_tx: InboundSender<SessionEvent>,
    events_rx: InboundReceiver<SessionEvent>,
}

impl Default for RumqttSession {
    fn default() -> Self {
        Self::new()
    }
}

impl RumqttSession {
    pub fn new() -> Self {
        let (events_tx, events_rx) = inbound::channel(EVENT_CAPACITY);
        Self {
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            events_tx,
            events_rx,
        }
    }

    /// Inbound events dropped because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.events_rx.dropped()
    }

    fn client(&self) -> Result<&Client, SessionError> {
        match &self.client {
            Some(client) if self.connected() => Ok(client),
            _ => Err(SessionError::NotConnected),
        }
    }
}

fn build_options(options: &ConnectOptions) -> MqttOptions {
    let mut mqtt = MqttOptions::new(&options.client_id, options.ip.to_string(), options.port);
    mqtt.set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE));
    mqtt.set_clean_session(true);
    if let Some(username) = &options.username {
        mqtt.set_credentials(username, options.password.as_deref().unwrap_or_default());
    }
    if let Some(will) = &options.last_will {
        mqtt.set_last_will(LastWill::new(
            &will.topic,
            will.payload.as_bytes().to_vec(),
            will.qos.into(),
            will.retain,
        ));
    }
    mqtt
}

fn reason_for_code(code: ConnectReturnCode) -> DisconnectReason {
    match code {
        ConnectReturnCode::RefusedProtocolVersion => DisconnectReason::UnacceptableProtocolVersion,
        ConnectReturnCode::BadClientId => DisconnectReason::IdentifierRejected,
        ConnectReturnCode::ServiceUnavailable => DisconnectReason::ServerUnavailable,
        ConnectReturnCode::BadUserNamePassword => DisconnectReason::MalformedCredentials,
        ConnectReturnCode::NotAuthorized => DisconnectReason::NotAuthorized,
        ConnectReturnCode::Success => DisconnectReason::Unknown,
    }
}

fn reason_for_error(error: &ConnectionError) -> DisconnectReason {
    match error {
        ConnectionError::ConnectionRefused(code) => reason_for_code(*code),
        ConnectionError::Io(_) | ConnectionError::NetworkTimeout => {
            DisconnectReason::TcpDisconnected
        }
        _ => DisconnectReason::Unknown,
    }
}

/// Decode a payload for dispatch. Invalid UTF-8 is replaced and logged.
fn payload_text(topic: &str, payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(e) => {
            warn!(
                topic = %topic,
                len = payload.len(),
                valid_up_to = e.valid_up_to(),
                "Payload is not valid UTF-8, invalid bytes replaced"
            );
            String::from_utf8_lossy(payload).into_owned()
        }
    }
}

fn run_reader(
    mut connection: Connection,
    generation: u64,
    current: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
    events: InboundSender<SessionEvent>,
) {
    let is_current = || current.load(Ordering::Acquire) == generation;

    for notification in connection.iter() {
        if !is_current() {
            break;
        }
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    debug!("Broker accepted session");
                    connected.store(true, Ordering::Release);
                } else {
                    connected.store(false, Ordering::Release);
                    events.push(SessionEvent::Disconnected(reason_for_code(ack.code)));
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = payload_text(&publish.topic, &publish.payload);
                if !events.push(SessionEvent::Message {
                    topic: publish.topic,
                    payload,
                }) {
                    warn!("Inbound queue full, message dropped");
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                connected.store(false, Ordering::Release);
                events.push(SessionEvent::Disconnected(DisconnectReason::TcpDisconnected));
                break;
            }
            Ok(other) => trace!(event = ?other, "MQTT event"),
            Err(e) => {
                if is_current() {
                    connected.store(false, Ordering::Release);
                    events.push(SessionEvent::Disconnected(reason_for_error(&e)));
                }
                break;
            }
        }
    }
    trace!(generation = generation, "MQTT reader stopped");
}

impl BrokerSession for RumqttSession {
    fn connect(&mut self, options: &ConnectOptions) -> Result<(), SessionError> {
        self.disconnect(true);

        let (client, connection) = Client::new(build_options(options), REQUEST_CAPACITY);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let current = self.generation.clone();
        let connected = self.connected.clone();
        let events = self.events_tx.clone();

        thread::Builder::new()
            .name("mqtt-net".into())
            .spawn(move || run_reader(connection, generation, current, connected, events))
            .map_err(|e| SessionError::Rejected(e.to_string()))?;

        self.client = Some(client);
        Ok(())
    }

    fn disconnect(&mut self, force: bool) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.connected.store(false, Ordering::Release);
        if let Some(client) = self.client.take() {
            // The DISCONNECT request also ends the reader's event loop.
            if let Err(e) = client.try_disconnect() {
                if !force {
                    debug!(error = %e, "Graceful disconnect failed");
                }
            }
        }
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), SessionError> {
        self.client()?
            .try_publish(topic, qos.into(), retain, payload.to_vec())
            .map_err(|e| SessionError::Rejected(e.to_string()))
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError> {
        self.client()?
            .try_subscribe(topic, qos.into())
            .map_err(|e| SessionError::Rejected(e.to_string()))
    }

    fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.try_next()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::mqtt::message::MessageTemplate;

    #[test]
    fn test_payload_text() {
        assert_eq!(payload_text("dev/cmd", b"ON"), "ON");
        assert_eq!(payload_text("dev/cmd", &[b'O', 0xFF, b'N']), "O\u{FFFD}N");
    }

    fn options() -> ConnectOptions {
        ConnectOptions {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 1883,
            client_id: "dev".into(),
            username: Some("user".into()),
            password: None,
            keep_alive: Duration::from_secs(1),
            last_will: Some(MessageTemplate::new("dev/status", "offline", QoS::AtMostOnce, true)),
        }
    }

    #[test]
    fn test_build_options_clamps_keep_alive() {
        let mqtt = build_options(&options());
        assert_eq!(mqtt.keep_alive(), MIN_KEEP_ALIVE);
        assert_eq!(mqtt.client_id(), "dev");
        assert!(mqtt.last_will().is_some());
    }

    #[test]
    fn test_refusal_codes_map_to_reasons() {
        assert_eq!(
            reason_for_code(ConnectReturnCode::NotAuthorized),
            DisconnectReason::NotAuthorized
        );
        assert_eq!(
            reason_for_code(ConnectReturnCode::BadClientId),
            DisconnectReason::IdentifierRejected
        );
    }

    #[test]
    fn test_requests_fail_before_connect() {
        let mut session = RumqttSession::new();
        assert!(!session.connected());
        assert_eq!(
            session.publish("t", b"x", QoS::AtMostOnce, false),
            Err(SessionError::NotConnected)
        );
        assert_eq!(
            session.subscribe("t", QoS::AtMostOnce),
            Err(SessionError::NotConnected)
        );
        assert_eq!(session.poll_event(), None);
    }
}
