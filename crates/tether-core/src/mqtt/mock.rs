//! Mock broker session and resolver for testing.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use super::message::QoS;
use super::resolver::{ResolveError, Resolver};
use super::session::{BrokerSession, ConnectOptions, DisconnectReason, SessionError, SessionEvent};

/// A publish captured by [`MockBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

struct BrokerInner {
    connected: bool,
    /// `connect()` establishes the session immediately.
    auto_connect: bool,
    accept_subscribe: bool,
    /// Number of upcoming publishes to reject.
    reject_publishes: usize,
    publish_attempts: usize,
    published: Vec<Published>,
    subscribe_attempts: Vec<String>,
    subscriptions: Vec<(String, QoS)>,
    connects: Vec<ConnectOptions>,
    disconnects: Vec<bool>,
    events: VecDeque<SessionEvent>,
}

/// Scripted broker session. Clones share state.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner {
                connected: false,
                auto_connect: true,
                accept_subscribe: true,
                reject_publishes: 0,
                publish_attempts: 0,
                published: Vec::new(),
                subscribe_attempts: Vec::new(),
                subscriptions: Vec::new(),
                connects: Vec::new(),
                disconnects: Vec::new(),
                events: VecDeque::new(),
            })),
        }
    }

    /// Leave sessions hanging after `connect()` until [`establish`] is called.
    ///
    /// [`establish`]: MockBroker::establish
    pub fn manual_connect(&self) {
        self.inner.lock().unwrap().auto_connect = false;
    }

    pub fn establish(&self) {
        self.inner.lock().unwrap().connected = true;
    }

    /// Simulate the broker dropping the session.
    pub fn drop_connection(&self, reason: DisconnectReason) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        inner.events.push_back(SessionEvent::Disconnected(reason));
    }

    /// Lose the session without a disconnect event.
    pub fn go_silent(&self) {
        self.inner.lock().unwrap().connected = false;
    }

    /// Queue an inbound message.
    pub fn deliver(&self, topic: &str, payload: &str) {
        self.inner.lock().unwrap().events.push_back(SessionEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
    }

    pub fn reject_publishes(&self, count: usize) {
        self.inner.lock().unwrap().reject_publishes = count;
    }

    pub fn set_accept_subscribe(&self, accept: bool) {
        self.inner.lock().unwrap().accept_subscribe = accept;
    }

    pub fn published(&self) -> Vec<Published> {
        self.inner.lock().unwrap().published.clone()
    }

    pub fn publish_attempts(&self) -> usize {
        self.inner.lock().unwrap().publish_attempts
    }

    /// Topics passed to `subscribe()`, accepted or not.
    pub fn subscribe_attempts(&self) -> Vec<String> {
        self.inner.lock().unwrap().subscribe_attempts.clone()
    }

    /// Accepted subscriptions.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.inner.lock().unwrap().subscriptions.clone()
    }

    pub fn connects(&self) -> Vec<ConnectOptions> {
        self.inner.lock().unwrap().connects.clone()
    }

    /// `force` flag of every `disconnect()` call.
    pub fn disconnects(&self) -> Vec<bool> {
        self.inner.lock().unwrap().disconnects.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }
}

impl BrokerSession for MockBroker {
    fn connect(&mut self, options: &ConnectOptions) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connects.push(options.clone());
        if inner.auto_connect {
            inner.connected = true;
        }
        Ok(())
    }

    fn disconnect(&mut self, force: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.disconnects.push(force);
        inner.connected = false;
    }

    fn connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap();
        inner.publish_attempts += 1;
        if !inner.connected {
            return Err(SessionError::NotConnected);
        }
        if inner.reject_publishes > 0 {
            inner.reject_publishes -= 1;
            return Err(SessionError::QueueFull);
        }
        inner.published.push(Published {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            qos,
            retain,
        });
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribe_attempts.push(topic.to_string());
        if !inner.connected {
            return Err(SessionError::NotConnected);
        }
        if !inner.accept_subscribe {
            return Err(SessionError::QueueFull);
        }
        inner.subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    fn poll_event(&mut self) -> Option<SessionEvent> {
        self.inner.lock().unwrap().events.pop_front()
    }
}

struct ResolverInner {
    answer: Result<IpAddr, ResolveError>,
    /// Answer on `start()`; otherwise wait for `complete()`.
    immediate: bool,
    in_flight: bool,
    ready: Option<Result<IpAddr, ResolveError>>,
    starts: Vec<String>,
}

/// Scripted resolver. Clones share state.
#[derive(Clone)]
pub struct MockResolver {
    inner: Arc<Mutex<ResolverInner>>,
}

impl Default for MockResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockResolver {
    /// Resolves every host to 127.0.0.1 immediately.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ResolverInner {
                answer: Ok(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                immediate: true,
                in_flight: false,
                ready: None,
                starts: Vec::new(),
            })),
        }
    }

    /// Hold lookups until [`complete`] is called.
    ///
    /// [`complete`]: MockResolver::complete
    pub fn deferred(&self) {
        self.inner.lock().unwrap().immediate = false;
    }

    pub fn answer_with(&self, answer: Result<IpAddr, ResolveError>) {
        self.inner.lock().unwrap().answer = answer;
    }

    /// Finish the lookup in flight.
    pub fn complete(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_flight {
            inner.in_flight = false;
            inner.ready = Some(inner.answer.clone());
        }
    }

    /// Hosts passed to `start()`.
    pub fn starts(&self) -> Vec<String> {
        self.inner.lock().unwrap().starts.clone()
    }
}

impl Resolver for MockResolver {
    fn start(&mut self, host: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.starts.push(host.to_string());
        inner.ready = None;
        if inner.immediate {
            inner.in_flight = false;
            inner.ready = Some(inner.answer.clone());
        } else {
            inner.in_flight = true;
        }
    }

    fn poll(&mut self) -> Option<Result<IpAddr, ResolveError>> {
        self.inner.lock().unwrap().ready.take()
    }
}
