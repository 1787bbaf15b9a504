//! Message triggers: bind a callback to one topic through the client.

use serde::de::DeserializeOwned;

use super::client::MqttClient;
use super::link::Link;
use super::message::QoS;
use super::resolver::Resolver;
use super::session::BrokerSession;

/// Fires with the payload of every message on `topic`, optionally only for
/// one exact payload.
#[derive(Debug, Clone)]
pub struct MessageTrigger {
    topic: String,
    qos: QoS,
    payload: Option<String>,
}

impl MessageTrigger {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            qos: QoS::AtMostOnce,
            payload: None,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Only fire when the payload equals `payload`.
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Register with `client`. The trigger lives as long as the client.
    pub fn attach<S, R, L>(
        self,
        client: &mut MqttClient<S, R, L>,
        mut callback: impl FnMut(&str) + 'static,
    ) where
        S: BrokerSession,
        R: Resolver,
        L: Link,
    {
        let filter = self.payload;
        client.subscribe(&self.topic, self.qos, move |_topic, payload| {
            if filter.as_deref().is_none_or(|p| p == payload) {
                callback(payload);
            }
        });
    }
}

/// Fires with the decoded JSON payload of every message on `topic`.
#[derive(Debug, Clone)]
pub struct JsonMessageTrigger {
    topic: String,
    qos: QoS,
}

impl JsonMessageTrigger {
    pub fn new(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }

    pub fn attach<T, S, R, L>(
        self,
        client: &mut MqttClient<S, R, L>,
        mut callback: impl FnMut(T) + 'static,
    ) where
        T: DeserializeOwned,
        S: BrokerSession,
        R: Resolver,
        L: Link,
    {
        client.subscribe_json(&self.topic, self.qos, move |_topic, value: T| callback(value));
    }
}
