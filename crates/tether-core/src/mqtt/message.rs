//! Broker credentials, message templates and derived views.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Delivery guarantee requested for a publish or subscribe. Passed through
/// to the broker session unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once delivery (acknowledged delivery).
    AtLeastOnce = 1,
    /// Exactly once delivery (assured delivery).
    ExactlyOnce = 2,
}

impl From<u8> for QoS {
    fn from(v: u8) -> Self {
        match v {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Broker connection parameters.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub address: String,
    pub port: u16,
    /// Empty means derive from the device name at setup.
    pub client_id: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

/// A message the client publishes on its own behalf. An empty topic
/// disables it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageTemplate {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

impl MessageTemplate {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<String>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.topic.is_empty()
    }

    /// Same message with the topic cleared.
    pub fn disabled(mut self) -> Self {
        self.topic.clear();
        self
    }
}

/// Availability reporting, derived from the birth and last-will templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Availability {
    /// Empty when availability reporting is off.
    pub topic: String,
    pub payload_available: String,
    pub payload_not_available: String,
}

impl Availability {
    /// Enabled only when both templates share the same non-empty topic.
    pub fn derive(birth: &MessageTemplate, last_will: &MessageTemplate) -> Self {
        if birth.topic.is_empty() || birth.topic != last_will.topic {
            return Self::default();
        }
        Self {
            topic: birth.topic.clone(),
            payload_available: birth.payload.clone(),
            payload_not_available: last_will.payload.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.topic.is_empty()
    }
}

/// Settings for announcing entities to a discovery-capable consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryInfo {
    pub prefix: String,
    pub retain: bool,
}

/// Deterministic client identifier for a device name: lowercase, spaces
/// become underscores, anything outside `[a-z0-9_-]` is dropped.
pub fn derive_client_id(device_name: &str) -> String {
    device_name
        .chars()
        .map(|c| match c {
            ' ' => '_',
            c => c.to_ascii_lowercase(),
        })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect()
}
