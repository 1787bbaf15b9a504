//! Tether-Core: network control plane for connected devices.
//!
//! This crate keeps a device reachable over MQTT and lets it accept
//! firmware updates over the network without risking a boot loop.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **MQTT**: Connection state machine, topic matching, subscriptions, publishing
//! - **Protocol**: OTA wire constants, response codes, digests
//! - **Transport**: OTA socket abstraction (TCP, mock)
//! - **Staging**: Staged firmware writes (file, memory)
//! - **OTA**: Per-peer session handler, listener loop, uploader
//! - **Boot Guard**: Persisted boot-loop counter and safe mode decision
//! - **Events**: Observer pattern for status indicators
//! - **Node**: Cooperative run loop tying everything together
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether_core::events::TracingObserver;
//! use tether_core::mqtt::{AlwaysUp, Credentials, MqttClient, RumqttSession, ThreadResolver};
//!
//! let credentials = Credentials {
//!     address: "broker.local".to_string(),
//!     port: 1883,
//!     ..Default::default()
//! };
//! let mut client = MqttClient::new(
//!     credentials,
//!     "living-room",
//!     RumqttSession::new(),
//!     ThreadResolver::new(),
//!     AlwaysUp,
//!     Arc::new(TracingObserver),
//! );
//! client.setup("Living Room");
//! loop {
//!     if client.poll().is_some() {
//!         break;
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(16));
//! }
//! ```

pub mod boot_guard;
pub mod config;
pub mod events;
pub mod mqtt;
pub mod node;
pub mod ota;
pub mod prefs;
pub mod protocol;
pub mod staging;
pub mod switch;
pub mod transport;

// Re-exports for convenience
pub use boot_guard::{BOOT_COUNTER_KEY, BootDecision, BootGuard};
pub use config::{ConfigError, NodeConfig};
pub use events::{
    DeviceEvent, NullObserver, OtaPhase, RebootReason, StatusObserver, TracingObserver,
};
pub use mqtt::{ConnectionState, MqttClient, QoS};
pub use node::{Component, Node};
pub use ota::{OtaError, OtaHandler, OtaServer, OtaUploader};
pub use prefs::{FilePreferences, MemoryPreferences, PreferenceError, PreferenceStore};
pub use protocol::OtaResponse;
pub use staging::{FileTarget, MemoryTarget, UpdateTarget};
pub use transport::{OtaListener, OtaTransport, TcpOtaListener, TcpTransport, TransportError};
