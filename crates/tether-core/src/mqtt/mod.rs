//! Broker connection, subscriptions and publishing.

pub mod client;
pub mod inbound;
pub mod link;
pub mod log_layer;
pub mod message;
pub mod mock;
pub mod registry;
pub mod resolver;
pub mod rumqtt;
pub mod session;
pub mod topic;
pub mod trigger;

pub use client::{ClientError, ConnectionState, MqttClient, ResendFlag, StateResender};
pub use link::{AlwaysUp, Link, ManualLink};
pub use log_layer::{LogLine, MqttLogLayer};
pub use message::{Availability, Credentials, DiscoveryInfo, MessageTemplate, QoS, derive_client_id};
pub use mock::{MockBroker, MockResolver, Published};
pub use registry::{SubscriptionEntry, SubscriptionRegistry};
pub use resolver::{ResolveError, Resolver, ThreadResolver};
pub use rumqtt::RumqttSession;
pub use session::{BrokerSession, ConnectOptions, DisconnectReason, SessionError, SessionEvent};
pub use topic::matches;
pub use trigger::{JsonMessageTrigger, MessageTrigger};
