//! Broker connection manager.
//!
//! [`MqttClient`] owns the connection state machine, the subscription
//! registry and the publisher. It is driven by [`MqttClient::poll`] from the
//! device's run loop and never blocks, apart from the short delay before a
//! publish retry.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{Level, debug, error, info, trace, warn};

use super::inbound::InboundReceiver;
use super::link::Link;
use super::log_layer::LogLine;
use super::message::{
    Availability, Credentials, DiscoveryInfo, MessageTemplate, QoS, derive_client_id,
};
use super::registry::SubscriptionRegistry;
use super::resolver::{ResolveError, Resolver};
use super::session::{BrokerSession, ConnectOptions, DisconnectReason, SessionError, SessionEvent};
use crate::events::{DeviceEvent, RebootReason, StatusObserver};

/// Idle time in DISCONNECTED before a new resolution attempt.
pub const RECONNECT_IDLE: Duration = Duration::from_secs(5);
/// Upper bound on address resolution.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(20);
/// Upper bound on session establishment.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Delay before the single publish retry.
pub const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);
pub const DEFAULT_REBOOT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const STATUS_SOURCE: &str = "mqtt";
const MOMENTARY_WARNING: Duration = Duration::from_secs(1);

/// Connection state of the broker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Resolving,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Resolving => write!(f, "RESOLVING"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Publish to '{topic}' failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: SessionError,
    },

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A component that re-publishes its state after every reconnect.
pub trait StateResender {
    fn schedule_resend_state(&self);
}

/// Shared "resend requested" flag. The client sets it on reconnect; the
/// owning component takes it on its next loop.
#[derive(Debug, Clone, Default)]
pub struct ResendFlag(Arc<AtomicBool>);

impl ResendFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl StateResender for ResendFlag {
    fn schedule_resend_state(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Broker client driven from a cooperative run loop.
pub struct MqttClient<S: BrokerSession, R: Resolver, L: Link> {
    credentials: Credentials,
    topic_prefix: String,
    birth_message: MessageTemplate,
    last_will: MessageTemplate,
    log_message: MessageTemplate,
    shutdown_message: MessageTemplate,
    availability: Availability,
    discovery: DiscoveryInfo,
    keep_alive: Duration,
    reboot_timeout: Duration,
    log_level: Level,

    state: ConnectionState,
    connect_begin: Instant,
    last_connected: Instant,
    now: Instant,
    resolved: Option<IpAddr>,
    resolve_error: Option<ResolveError>,
    disconnect_reason: Option<DisconnectReason>,
    warning: bool,

    registry: SubscriptionRegistry,
    resenders: Vec<Box<dyn StateResender>>,
    log_lines: Option<InboundReceiver<LogLine>>,

    session: S,
    resolver: R,
    link: L,
    observer: Arc<dyn StatusObserver>,
}

impl<S: BrokerSession, R: Resolver, L: Link> MqttClient<S, R, L> {
    pub fn new(
        credentials: Credentials,
        topic_prefix: &str,
        session: S,
        resolver: R,
        link: L,
        observer: Arc<dyn StatusObserver>,
    ) -> Self {
        let now = Instant::now();
        let mut client = Self {
            credentials,
            topic_prefix: String::new(),
            birth_message: MessageTemplate::default(),
            last_will: MessageTemplate::default(),
            log_message: MessageTemplate::default(),
            shutdown_message: MessageTemplate::default(),
            availability: Availability::default(),
            discovery: DiscoveryInfo::default(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            reboot_timeout: DEFAULT_REBOOT_TIMEOUT,
            log_level: Level::DEBUG,
            state: ConnectionState::Disconnected,
            connect_begin: now,
            last_connected: now,
            now,
            resolved: None,
            resolve_error: None,
            disconnect_reason: None,
            warning: false,
            registry: SubscriptionRegistry::new(),
            resenders: Vec::new(),
            log_lines: None,
            session,
            resolver,
            link,
            observer,
        };
        client.set_topic_prefix(topic_prefix);
        client
    }

    /// Fill in a default client id and start the first resolution.
    pub fn setup(&mut self, device_name: &str) {
        self.setup_at(Instant::now(), device_name);
    }

    pub fn setup_at(&mut self, now: Instant, device_name: &str) {
        info!("Setting up MQTT...");
        if self.credentials.client_id.is_empty() {
            self.credentials.client_id = derive_client_id(device_name);
        }
        self.now = now;
        self.last_connected = now;
        self.start_dnslookup(now);
    }

    /// Log the effective configuration. The password is never logged.
    pub fn dump_config(&self) {
        info!("MQTT:");
        info!(
            address = %self.credentials.address,
            port = self.credentials.port,
            ip = ?self.resolved,
            "  Server Address"
        );
        info!(username = %self.credentials.username, "  Username");
        info!(client_id = %self.credentials.client_id, "  Client ID");
        if self.is_discovery_enabled() {
            info!(prefix = %self.discovery.prefix, "  Discovery prefix");
            info!(retain = self.discovery.retain, "  Discovery retain");
        }
        info!(prefix = %self.topic_prefix, "  Topic Prefix");
        if self.log_message.is_enabled() {
            info!(topic = %self.log_message.topic, "  Log Topic");
        }
        if self.availability.is_enabled() {
            info!(topic = %self.availability.topic, "  Availability");
        }
    }

    /// Advance the state machine. Returns a reboot request when the broker
    /// has been unreachable for longer than the reboot timeout.
    pub fn poll(&mut self) -> Option<RebootReason> {
        self.poll_at(Instant::now())
    }

    pub fn poll_at(&mut self, now: Instant) -> Option<RebootReason> {
        self.now = now;
        self.drain_session_events();
        self.log_disconnect_reason();

        match self.state {
            ConnectionState::Disconnected => {
                if now.saturating_duration_since(self.connect_begin) > RECONNECT_IDLE {
                    self.start_dnslookup(now);
                }
            }
            ConnectionState::Resolving => self.check_dnslookup(now),
            ConnectionState::Connecting => self.check_connected(now),
            ConnectionState::Connected => {
                if !self.session.connected() || !self.link.is_connected() {
                    warn!("Lost MQTT Client connection!");
                    self.set_state(ConnectionState::Disconnected);
                    self.start_dnslookup(now);
                } else {
                    self.last_connected = now;
                    self.resubscribe_all(now);
                }
            }
        }

        self.forward_log_lines();

        if !self.reboot_timeout.is_zero()
            && now.saturating_duration_since(self.last_connected) > self.reboot_timeout
        {
            error!(
                timeout_secs = self.reboot_timeout.as_secs(),
                "Can't connect to MQTT... Restarting..."
            );
            return Some(RebootReason::Mqtt);
        }
        None
    }

    fn drain_session_events(&mut self) {
        while let Some(event) = self.session.poll_event() {
            match event {
                SessionEvent::Message { topic, payload } => {
                    let hits = self.registry.dispatch(&topic, &payload);
                    trace!(topic = %topic, hits = hits, "Message dispatched");
                }
                SessionEvent::Disconnected(reason) => {
                    self.disconnect_reason = Some(reason);
                    self.set_state(ConnectionState::Disconnected);
                }
            }
        }
    }

    fn log_disconnect_reason(&mut self) {
        if let Some(reason) = self.disconnect_reason.take() {
            if self.link.is_connected() {
                warn!(reason = %reason, "MQTT Disconnected");
            } else {
                warn!(reason = "Link disconnected", "MQTT Disconnected");
            }
        }
    }

    fn start_dnslookup(&mut self, now: Instant) {
        self.registry.reset();
        self.set_warning();
        self.resolved = None;
        self.resolve_error = None;
        self.connect_begin = now;

        if !self.link.is_connected() {
            debug!("Link down, postponing broker resolution");
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        self.set_state(ConnectionState::Resolving);
        self.resolver.start(&self.credentials.address);
        match self.resolver.poll() {
            Some(Ok(ip)) => {
                self.resolved = Some(ip);
                self.start_connect(now, ip);
            }
            Some(Err(e)) => {
                warn!(error = %e, "Error resolving MQTT broker IP address");
                self.resolve_error = Some(e);
            }
            None => debug!("Resolving MQTT broker IP address..."),
        }
    }

    fn check_dnslookup(&mut self, now: Instant) {
        if self.resolved.is_none() && self.resolve_error.is_none() {
            match self.resolver.poll() {
                Some(Ok(ip)) => self.resolved = Some(ip),
                Some(Err(e)) => self.resolve_error = Some(e),
                None => {}
            }
        }

        let elapsed = now.saturating_duration_since(self.connect_begin);
        if self.resolved.is_none() && self.resolve_error.is_none() && elapsed > RESOLVE_TIMEOUT {
            self.resolve_error = Some(ResolveError::TimedOut);
        }

        if let Some(e) = &self.resolve_error {
            warn!(
                host = %self.credentials.address,
                error = %e,
                "Couldn't resolve IP address"
            );
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let Some(ip) = self.resolved else {
            return;
        };

        if !self.link.is_connected() {
            if elapsed > RESOLVE_TIMEOUT {
                warn!("Link down, abandoning connection attempt");
                self.set_state(ConnectionState::Disconnected);
            }
            return;
        }

        debug!(ip = %ip, "Resolved broker IP address");
        self.start_connect(now, ip);
    }

    fn start_connect(&mut self, now: Instant, ip: IpAddr) {
        if !self.link.is_connected() {
            return;
        }

        info!(
            address = %self.credentials.address,
            port = self.credentials.port,
            "Connecting to MQTT..."
        );
        self.session.disconnect(true);

        let options = ConnectOptions {
            ip,
            port: self.credentials.port,
            client_id: self.credentials.client_id.clone(),
            username: Some(self.credentials.username.clone()).filter(|u| !u.is_empty()),
            password: Some(self.credentials.password.clone()).filter(|p| !p.is_empty()),
            keep_alive: self.keep_alive,
            last_will: Some(self.last_will.clone()).filter(MessageTemplate::is_enabled),
        };

        self.connect_begin = now;
        match self.session.connect(&options) {
            Ok(()) => self.set_state(ConnectionState::Connecting),
            Err(e) => {
                warn!(error = %e, "Starting MQTT session failed");
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    fn check_connected(&mut self, now: Instant) {
        if !self.session.connected() || !self.link.is_connected() {
            if now.saturating_duration_since(self.connect_begin) > CONNECT_TIMEOUT {
                warn!("Timed out connecting to MQTT broker");
                self.set_state(ConnectionState::Disconnected);
                self.start_dnslookup(now);
            }
            return;
        }

        self.set_state(ConnectionState::Connected);
        self.clear_warning();
        info!("MQTT Connected!");
        self.last_connected = now;

        if self.birth_message.is_enabled() {
            let birth = self.birth_message.clone();
            let _ = self.publish_message(&birth);
        }

        self.resubscribe_all(now);

        for resender in &self.resenders {
            resender.schedule_resend_state();
        }
    }

    fn resubscribe_all(&mut self, now: Instant) {
        let session = &mut self.session;
        let observer = self.observer.as_ref();
        self.registry
            .resubscribe(now, |pattern, qos| try_subscribe(session, observer, pattern, qos));
    }

    fn set_state(&mut self, to: ConnectionState) {
        if self.state == to {
            return;
        }
        info!(from = %self.state, to = %to, "MQTT state transition");
        self.observer.on_event(&DeviceEvent::ConnectionChanged {
            from: self.state,
            to,
        });
        self.state = to;
    }

    fn set_warning(&mut self) {
        if !self.warning {
            self.warning = true;
            self.observer.on_event(&DeviceEvent::WarningSet {
                source: STATUS_SOURCE,
            });
        }
    }

    fn clear_warning(&mut self) {
        if self.warning {
            self.warning = false;
            self.observer.on_event(&DeviceEvent::WarningCleared {
                source: STATUS_SOURCE,
            });
        }
    }

    fn forward_log_lines(&mut self) {
        let lines = match &self.log_lines {
            Some(rx) => rx.drain(),
            None => return,
        };
        // Lines produced while offline are dropped.
        if lines.is_empty() || !self.log_message.is_enabled() || !self.is_connected() {
            return;
        }
        let template = self.log_message.clone();
        let max_level = self.log_level;
        for line in lines.into_iter().filter(|l| l.level <= max_level) {
            let _ = self.publish(
                &template.topic,
                line.text.as_bytes(),
                template.qos,
                template.retain,
            );
        }
    }

    // --- Subscribe / publish ---

    /// Register `callback` for every message matching `pattern`. Subscribes
    /// right away when connected; otherwise the next connect does it.
    pub fn subscribe(
        &mut self,
        pattern: &str,
        qos: QoS,
        callback: impl FnMut(&str, &str) + 'static,
    ) {
        let index = self.registry.add(pattern, qos, Box::new(callback));
        if !self.is_connected() {
            return;
        }
        let session = &mut self.session;
        let observer = self.observer.as_ref();
        self.registry.resubscribe_one(index, self.now, |pattern, qos| {
            try_subscribe(session, observer, pattern, qos)
        });
    }

    /// Like [`subscribe`](Self::subscribe), decoding each payload as JSON.
    /// Payloads that fail to parse are logged and skipped.
    pub fn subscribe_json<T: DeserializeOwned>(
        &mut self,
        pattern: &str,
        qos: QoS,
        mut callback: impl FnMut(&str, T) + 'static,
    ) {
        self.subscribe(pattern, qos, move |topic, payload| {
            match serde_json::from_str::<T>(payload) {
                Ok(value) => callback(topic, value),
                Err(e) => warn!(topic = %topic, error = %e, "Parsing JSON failed"),
            }
        });
    }

    /// Best-effort publish with a single retry. Failures are not queued.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        // Failures on the log topic must not produce more log lines.
        let logging_topic = self.log_message.is_enabled() && topic == self.log_message.topic;

        let mut result = self.session.publish(topic, payload, qos, retain);
        if result.is_err() && !logging_topic && self.is_connected() {
            thread::sleep(PUBLISH_RETRY_DELAY);
            result = self.session.publish(topic, payload, qos, retain);
        }

        match result {
            Ok(()) => {
                if !logging_topic {
                    trace!(topic = %topic, retain = retain, "Publish");
                }
                Ok(())
            }
            Err(source) => {
                if !logging_topic {
                    warn!(topic = %topic, error = %source, "Publish failed, will retry later");
                    self.observer.on_event(&DeviceEvent::MomentaryWarning {
                        source: "publish",
                        duration: MOMENTARY_WARNING,
                    });
                }
                Err(ClientError::Publish {
                    topic: topic.to_string(),
                    source,
                })
            }
        }
    }

    pub fn publish_str(
        &mut self,
        topic: &str,
        payload: &str,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        self.publish(topic, payload.as_bytes(), qos, retain)
    }

    pub fn publish_message(&mut self, message: &MessageTemplate) -> Result<(), ClientError> {
        self.publish(
            &message.topic,
            message.payload.as_bytes(),
            message.qos,
            message.retain,
        )
    }

    pub fn publish_json<T: Serialize>(
        &mut self,
        topic: &str,
        value: &T,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, &payload, qos, retain)
    }

    /// Publish the shutdown message, if any, and drop the session.
    pub fn shutdown(&mut self) {
        if self.shutdown_message.is_enabled() {
            let message = self.shutdown_message.clone();
            let _ = self.publish_message(&message);
        }
        self.session.disconnect(true);
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn register_resender(&mut self, resender: Box<dyn StateResender>) {
        self.resenders.push(resender);
    }

    /// Forward diagnostic log lines from `lines` to the log topic.
    pub fn set_log_forwarder(&mut self, lines: InboundReceiver<LogLine>) {
        self.log_lines = Some(lines);
    }

    // --- Configuration ---

    /// Derive birth, last-will and log templates from `prefix`.
    pub fn set_topic_prefix(&mut self, prefix: &str) {
        self.topic_prefix = prefix.to_string();
        self.set_birth_message(MessageTemplate::new(
            format!("{prefix}/status"),
            "online",
            QoS::AtMostOnce,
            true,
        ));
        self.set_last_will(MessageTemplate::new(
            format!("{prefix}/status"),
            "offline",
            QoS::AtMostOnce,
            true,
        ));
        self.set_log_message_template(MessageTemplate::new(
            format!("{prefix}/debug"),
            "",
            QoS::AtMostOnce,
            false,
        ));
    }

    pub fn set_birth_message(&mut self, message: MessageTemplate) {
        self.birth_message = message;
        self.recalculate_availability();
    }

    pub fn set_last_will(&mut self, message: MessageTemplate) {
        self.last_will = message;
        self.recalculate_availability();
    }

    pub fn set_shutdown_message(&mut self, message: MessageTemplate) {
        self.shutdown_message = message;
    }

    pub fn set_log_message_template(&mut self, message: MessageTemplate) {
        self.log_message = message;
    }

    pub fn disable_birth_message(&mut self) {
        self.birth_message.topic.clear();
        self.recalculate_availability();
    }

    pub fn disable_last_will(&mut self) {
        self.last_will.topic.clear();
        self.recalculate_availability();
    }

    pub fn disable_shutdown_message(&mut self) {
        self.shutdown_message.topic.clear();
    }

    pub fn disable_log_message(&mut self) {
        self.log_message.topic.clear();
    }

    pub fn set_discovery_info(&mut self, prefix: impl Into<String>, retain: bool) {
        self.discovery = DiscoveryInfo {
            prefix: prefix.into(),
            retain,
        };
    }

    pub fn disable_discovery(&mut self) {
        self.discovery = DiscoveryInfo::default();
    }

    pub fn set_client_id(&mut self, client_id: impl Into<String>) {
        self.credentials.client_id = client_id.into();
    }

    pub fn set_keep_alive(&mut self, keep_alive: Duration) {
        self.keep_alive = keep_alive;
    }

    /// Zero disables the watchdog.
    pub fn set_reboot_timeout(&mut self, timeout: Duration) {
        self.reboot_timeout = timeout;
    }

    /// Most verbose level forwarded to the log topic.
    pub fn set_log_level(&mut self, level: Level) {
        self.log_level = level;
    }

    fn recalculate_availability(&mut self) {
        self.availability = Availability::derive(&self.birth_message, &self.last_will);
    }

    // --- Accessors ---

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Connected according to both the state machine and the session.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.session.connected()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    pub fn availability(&self) -> &Availability {
        &self.availability
    }

    pub fn discovery_info(&self) -> &DiscoveryInfo {
        &self.discovery
    }

    pub fn is_discovery_enabled(&self) -> bool {
        !self.discovery.prefix.is_empty()
    }

    pub fn birth_message(&self) -> &MessageTemplate {
        &self.birth_message
    }

    pub fn last_will(&self) -> &MessageTemplate {
        &self.last_will
    }

    pub fn log_message(&self) -> &MessageTemplate {
        &self.log_message
    }

    pub fn is_log_message_enabled(&self) -> bool {
        self.log_message.is_enabled()
    }

    pub fn shutdown_message(&self) -> &MessageTemplate {
        &self.shutdown_message
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn last_connected(&self) -> Instant {
        self.last_connected
    }
}

fn try_subscribe<S: BrokerSession>(
    session: &mut S,
    observer: &dyn StatusObserver,
    pattern: &str,
    qos: QoS,
) -> bool {
    match session.subscribe(pattern, qos) {
        Ok(()) => {
            trace!(topic = %pattern, "subscribe");
            true
        }
        Err(e) => {
            debug!(topic = %pattern, error = %e, "Subscribe failed, will retry later");
            observer.on_event(&DeviceEvent::MomentaryWarning {
                source: "subscribe",
                duration: MOMENTARY_WARNING,
            });
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::events::RecordingObserver;
    use crate::mqtt::inbound;
    use crate::mqtt::link::ManualLink;
    use crate::mqtt::mock::{MockBroker, MockResolver};

    type TestClient = MqttClient<MockBroker, MockResolver, ManualLink>;

    struct Rig {
        client: TestClient,
        broker: MockBroker,
        resolver: MockResolver,
        link: ManualLink,
        observer: Arc<RecordingObserver>,
        t0: Instant,
    }

    impl Rig {
        fn new() -> Self {
            let broker = MockBroker::new();
            let resolver = MockResolver::new();
            let link = ManualLink::new(true);
            let observer = Arc::new(RecordingObserver::new());
            let credentials = Credentials {
                address: "broker.local".into(),
                port: 1883,
                ..Default::default()
            };
            let client = MqttClient::new(
                credentials,
                "node",
                broker.clone(),
                resolver.clone(),
                link.clone(),
                observer.clone(),
            );
            Self {
                client,
                broker,
                resolver,
                link,
                observer,
                t0: Instant::now(),
            }
        }

        fn at(&self, secs: f64) -> Instant {
            self.t0 + Duration::from_secs_f64(secs)
        }

        fn setup(&mut self) {
            let t = self.t0;
            self.client.setup_at(t, "Test Node");
        }

        fn poll(&mut self, secs: f64) -> Option<RebootReason> {
            let t = self.at(secs);
            self.client.poll_at(t)
        }
    }

    #[test]
    fn test_happy_path_connects_and_publishes_birth() {
        let mut rig = Rig::new();
        rig.setup();
        assert_eq!(rig.client.state(), ConnectionState::Connecting);
        assert_eq!(rig.client.credentials().client_id, "test_node");

        rig.poll(0.1);
        assert_eq!(rig.client.state(), ConnectionState::Connected);
        assert!(rig.client.is_connected());

        let published = rig.broker.published();
        assert_eq!(published[0].topic, "node/status");
        assert_eq!(published[0].payload, "online");
        assert!(published[0].retain);

        let opts = &rig.broker.connects()[0];
        assert_eq!(opts.client_id, "test_node");
        assert_eq!(opts.username, None);
        assert_eq!(opts.last_will.as_ref().map(|w| w.payload.as_str()), Some("offline"));
        assert!(rig.observer.any(|e| matches!(e, DeviceEvent::WarningCleared { .. })));
    }

    #[test]
    fn test_transitions_pass_through_resolving() {
        let mut rig = Rig::new();
        rig.resolver.deferred();
        rig.setup();
        assert_eq!(rig.client.state(), ConnectionState::Resolving);

        rig.poll(1.0);
        assert_eq!(rig.client.state(), ConnectionState::Resolving);
        assert!(rig.broker.connects().is_empty());

        rig.resolver.complete();
        rig.poll(2.0);
        assert_eq!(rig.client.state(), ConnectionState::Connecting);
        rig.poll(2.1);
        assert_eq!(rig.client.state(), ConnectionState::Connected);

        let states: Vec<ConnectionState> = rig
            .observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                DeviceEvent::ConnectionChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Resolving,
                ConnectionState::Connecting,
                ConnectionState::Connected
            ]
        );
    }

    #[test]
    fn test_resolve_timeout_then_idle_retry() {
        let mut rig = Rig::new();
        rig.resolver.deferred();
        rig.setup();

        rig.poll(19.0);
        assert_eq!(rig.client.state(), ConnectionState::Resolving);
        rig.poll(20.5);
        assert_eq!(rig.client.state(), ConnectionState::Disconnected);

        // connect_begin is the resolution start, so the idle wait is over.
        rig.poll(21.0);
        assert_eq!(rig.client.state(), ConnectionState::Resolving);
        assert_eq!(rig.resolver.starts().len(), 2);
    }

    #[test]
    fn test_resolve_error_waits_idle_period() {
        let mut rig = Rig::new();
        rig.resolver
            .answer_with(Err(ResolveError::NotFound("broker.local".into())));
        rig.setup();
        assert_eq!(rig.client.state(), ConnectionState::Resolving);

        rig.poll(0.1);
        assert_eq!(rig.client.state(), ConnectionState::Disconnected);
        rig.poll(4.0);
        assert_eq!(rig.client.state(), ConnectionState::Disconnected);
        rig.poll(5.5);
        assert_eq!(rig.resolver.starts().len(), 2);
    }

    #[test]
    fn test_connect_timeout_restarts_resolution() {
        let mut rig = Rig::new();
        rig.broker.manual_connect();
        rig.setup();
        assert_eq!(rig.client.state(), ConnectionState::Connecting);

        rig.poll(14.0);
        assert_eq!(rig.client.state(), ConnectionState::Connecting);
        rig.poll(15.5);
        // Immediate resolver: straight back into a fresh attempt.
        assert_eq!(rig.client.state(), ConnectionState::Connecting);
        assert_eq!(rig.broker.connects().len(), 2);
    }

    #[test]
    fn test_never_connected_without_resolution() {
        let mut rig = Rig::new();
        rig.resolver.deferred();
        rig.setup();
        // A session that claims to be up does not bypass resolution.
        rig.broker.establish();
        for i in 1..10 {
            rig.poll(i as f64);
            assert_ne!(rig.client.state(), ConnectionState::Connected);
        }
    }

    #[test]
    fn test_disconnect_event_logs_and_recovers() {
        let mut rig = Rig::new();
        rig.setup();
        rig.poll(0.1);
        assert!(rig.client.is_connected());

        rig.broker.drop_connection(DisconnectReason::ServerUnavailable);
        rig.poll(1.0);
        assert_eq!(rig.client.state(), ConnectionState::Disconnected);

        // Idle time counts from the last connect attempt (t=0).
        rig.poll(5.5);
        assert_eq!(rig.client.state(), ConnectionState::Connecting);
        rig.poll(5.6);
        assert_eq!(rig.client.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_silent_session_loss_restarts_immediately() {
        let mut rig = Rig::new();
        rig.setup();
        rig.poll(0.1);
        rig.broker.go_silent();
        rig.poll(0.2);
        // Resolution restarted right away and the immediate resolver
        // moved on to connecting.
        assert_eq!(rig.client.state(), ConnectionState::Connecting);
        assert_eq!(rig.resolver.starts().len(), 2);
    }

    #[test]
    fn test_link_down_forces_disconnected_from_every_state() {
        for start in [
            ConnectionState::Resolving,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ] {
            let mut rig = Rig::new();
            match start {
                ConnectionState::Resolving => rig.resolver.deferred(),
                ConnectionState::Connecting => rig.broker.manual_connect(),
                _ => {}
            }
            rig.setup();
            if start == ConnectionState::Connected {
                rig.poll(0.1);
            }
            assert_eq!(rig.client.state(), start);

            rig.link.set(false);
            let mut secs = 1.0;
            while rig.client.state() != ConnectionState::Disconnected && secs < 60.0 {
                rig.poll(secs);
                secs += 1.0;
            }
            assert_eq!(rig.client.state(), ConnectionState::Disconnected, "from {start}");

            // Stays down while the link is down, without resolving.
            let starts = rig.resolver.starts().len();
            rig.poll(secs + 30.0);
            assert_eq!(rig.client.state(), ConnectionState::Disconnected);
            assert_eq!(rig.resolver.starts().len(), starts);
        }
    }

    #[test]
    fn test_idle_always_triggers_resolution() {
        let mut rig = Rig::new();
        rig.resolver
            .answer_with(Err(ResolveError::NotFound("x".into())));
        rig.setup();
        rig.poll(0.1);
        assert_eq!(rig.client.state(), ConnectionState::Disconnected);
        rig.poll(5.2);
        assert_eq!(rig.client.state(), ConnectionState::Resolving);
    }

    #[test]
    fn test_resubscribes_after_connect() {
        let mut rig = Rig::new();
        rig.resolver.deferred();
        rig.setup();
        for topic in ["a/1", "a/2", "a/3"] {
            rig.client.subscribe(topic, QoS::AtLeastOnce, |_, _| {});
        }
        assert!(rig.broker.subscribe_attempts().is_empty());

        rig.resolver.complete();
        rig.poll(2.0);
        rig.poll(3.0);
        assert_eq!(rig.client.state(), ConnectionState::Connected);
        // Entries registered while offline go out with the connect.
        assert_eq!(rig.client.registry().pending(), 0);
        assert_eq!(rig.broker.subscriptions().len(), 3);
    }

    #[test]
    fn test_rejected_subscribe_retries_after_floor() {
        let mut rig = Rig::new();
        rig.setup();
        rig.poll(0.1);
        rig.broker.set_accept_subscribe(false);
        rig.client.subscribe("cmd/#", QoS::AtMostOnce, |_, _| {});
        assert_eq!(rig.client.registry().pending(), 1);

        rig.broker.set_accept_subscribe(true);
        rig.poll(0.5);
        assert_eq!(rig.client.registry().pending(), 1);
        rig.poll(1.2);
        assert_eq!(rig.client.registry().pending(), 0);
        assert!(rig
            .observer
            .any(|e| matches!(e, DeviceEvent::MomentaryWarning { source: "subscribe", .. })));
    }

    #[test]
    fn test_reconnect_resets_subscriptions() {
        let mut rig = Rig::new();
        rig.setup();
        rig.poll(0.1);
        rig.client.subscribe("x", QoS::AtMostOnce, |_, _| {});
        assert_eq!(rig.client.registry().pending(), 0);

        rig.broker.go_silent();
        rig.resolver.deferred();
        rig.poll(1.0);
        assert_eq!(rig.client.state(), ConnectionState::Resolving);
        assert_eq!(rig.client.registry().pending(), 1);
    }

    #[test]
    fn test_dispatch_to_matching_callbacks() {
        let mut rig = Rig::new();
        rig.setup();
        rig.poll(0.1);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        rig.client.subscribe("node/+/set", QoS::AtMostOnce, move |t, p| {
            sink.borrow_mut().push((t.to_string(), p.to_string()));
        });

        rig.broker.deliver("node/light/set", "ON");
        rig.broker.deliver("other/light/set", "OFF");
        rig.poll(0.2);
        assert_eq!(
            *seen.borrow(),
            vec![("node/light/set".to_string(), "ON".to_string())]
        );
    }

    #[test]
    fn test_subscribe_json_skips_bad_payloads() {
        #[derive(serde::Deserialize)]
        struct Cmd {
            level: u8,
        }

        let mut rig = Rig::new();
        rig.setup();
        rig.poll(0.1);
        let levels = Rc::new(RefCell::new(Vec::new()));
        let sink = levels.clone();
        rig.client
            .subscribe_json("cmd", QoS::AtMostOnce, move |_, cmd: Cmd| {
                sink.borrow_mut().push(cmd.level);
            });
        rig.broker.deliver("cmd", r#"{"level": 7}"#);
        rig.broker.deliver("cmd", "not json");
        rig.poll(0.2);
        assert_eq!(*levels.borrow(), vec![7]);
    }

    #[test]
    fn test_publish_requires_connection() {
        let mut rig = Rig::new();
        assert!(matches!(
            rig.client.publish_str("a", "b", QoS::AtMostOnce, false),
            Err(ClientError::NotConnected)
        ));
        assert_eq!(rig.broker.publish_attempts(), 0);
    }

    #[test]
    fn test_publish_retries_once() {
        let mut rig = Rig::new();
        rig.setup();
        rig.poll(0.1);
        let before = rig.broker.publish_attempts();

        rig.broker.reject_publishes(1);
        assert!(rig.client.publish_str("t", "1", QoS::AtMostOnce, false).is_ok());
        assert_eq!(rig.broker.publish_attempts(), before + 2);

        rig.broker.reject_publishes(2);
        assert!(rig.client.publish_str("t", "2", QoS::AtMostOnce, false).is_err());
        assert_eq!(rig.broker.publish_attempts(), before + 4);
        assert!(rig
            .observer
            .any(|e| matches!(e, DeviceEvent::MomentaryWarning { source: "publish", .. })));
    }

    #[test]
    fn test_log_topic_is_not_retried() {
        let mut rig = Rig::new();
        rig.setup();
        rig.poll(0.1);
        let before = rig.broker.publish_attempts();

        rig.broker.reject_publishes(1);
        assert!(rig.client.publish_str("node/debug", "x", QoS::AtMostOnce, false).is_err());
        assert_eq!(rig.broker.publish_attempts(), before + 1);
    }

    #[test]
    fn test_publish_json() {
        let mut rig = Rig::new();
        rig.setup();
        rig.poll(0.1);
        rig.client
            .publish_json("j", &serde_json::json!({"on": true}), QoS::AtMostOnce, false)
            .unwrap();
        assert_eq!(rig.broker.published().last().unwrap().payload, r#"{"on":true}"#);
    }

    #[test]
    fn test_watchdog_requests_reboot() {
        let mut rig = Rig::new();
        rig.client.set_reboot_timeout(Duration::from_secs(60));
        rig.resolver.deferred();
        rig.setup();
        assert_eq!(rig.poll(59.0), None);
        assert_eq!(rig.poll(61.0), Some(RebootReason::Mqtt));
    }

    #[test]
    fn test_watchdog_disabled_with_zero() {
        let mut rig = Rig::new();
        rig.client.set_reboot_timeout(Duration::ZERO);
        rig.link.set(false);
        rig.setup();
        assert_eq!(rig.poll(10_000.0), None);
    }

    #[test]
    fn test_watchdog_fed_while_connected() {
        let mut rig = Rig::new();
        rig.client.set_reboot_timeout(Duration::from_secs(60));
        rig.setup();
        for i in 1..200 {
            assert_eq!(rig.poll(i as f64), None);
        }
    }

    #[test]
    fn test_resend_scheduled_on_connect() {
        let mut rig = Rig::new();
        let flag = ResendFlag::new();
        rig.client.register_resender(Box::new(flag.clone()));
        rig.setup();
        assert!(!flag.is_set());
        rig.poll(0.1);
        assert!(flag.take());
        assert!(!flag.is_set());
    }

    #[test]
    fn test_topic_prefix_templates_and_availability() {
        let mut rig = Rig::new();
        assert_eq!(rig.client.birth_message().topic, "node/status");
        assert_eq!(rig.client.last_will().payload, "offline");
        assert_eq!(rig.client.log_message().topic, "node/debug");
        assert!(!rig.client.shutdown_message().is_enabled());
        assert!(rig.client.availability().is_enabled());

        rig.client.disable_last_will();
        assert!(!rig.client.availability().is_enabled());

        rig.client.set_last_will(MessageTemplate::new(
            "node/status",
            "gone",
            QoS::AtMostOnce,
            true,
        ));
        assert!(rig.client.availability().is_enabled());
        assert_eq!(rig.client.availability().payload_not_available, "gone");
    }

    #[test]
    fn test_credentials_passed_only_when_set() {
        let mut rig = Rig::new();
        rig.client.set_client_id("fixed");
        rig.client.disable_last_will();
        rig.setup();
        let opts = &rig.broker.connects()[0];
        assert_eq!(opts.client_id, "fixed");
        assert_eq!(opts.password, None);
        assert!(opts.last_will.is_none());
    }

    #[test]
    fn test_shutdown_publishes_and_disconnects() {
        let mut rig = Rig::new();
        rig.client.set_shutdown_message(MessageTemplate::new(
            "node/status",
            "shutdown",
            QoS::AtMostOnce,
            true,
        ));
        rig.setup();
        rig.poll(0.1);
        rig.client.shutdown();

        assert_eq!(rig.broker.published().last().unwrap().payload, "shutdown");
        assert_eq!(rig.broker.disconnects().last(), Some(&true));
        assert_eq!(rig.client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_log_lines_forwarded_while_connected() {
        let mut rig = Rig::new();
        let (tx, rx) = inbound::channel(8);
        rig.client.set_log_forwarder(rx);
        rig.client.set_log_level(Level::INFO);
        rig.resolver.deferred();
        rig.setup();
        tx.push(LogLine {
            level: Level::INFO,
            text: "dropped while offline".into(),
        });
        rig.poll(0.05);
        rig.resolver.complete();
        rig.poll(0.1);
        rig.poll(0.15);
        assert!(rig.client.is_connected());

        tx.push(LogLine {
            level: Level::WARN,
            text: "warn line".into(),
        });
        tx.push(LogLine {
            level: Level::DEBUG,
            text: "too verbose".into(),
        });
        rig.poll(0.2);

        let logs: Vec<String> = rig
            .broker
            .published()
            .into_iter()
            .filter(|p| p.topic == "node/debug")
            .map(|p| p.payload)
            .collect();
        assert_eq!(logs, vec!["warn line"]);
    }
}
