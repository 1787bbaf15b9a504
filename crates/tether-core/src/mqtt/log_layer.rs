//! Forwarding of `tracing` events to the diagnostic-log topic.
//!
//! [`MqttLogLayer`] formats events into a bounded queue; the client drains
//! it on its own poll and publishes each line while connected. The layer
//! never touches the session itself, so it is safe to install on any thread.

use std::fmt::{self, Write as _};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::inbound::{self, InboundReceiver, InboundSender};

/// Targets whose events are caused by publishing itself.
const SESSION_TARGETS: [&str; 2] = ["rumqttc", "tether_core::mqtt::rumqtt"];

/// One formatted log line waiting to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: Level,
    pub text: String,
}

pub struct MqttLogLayer {
    max_level: Level,
    tx: InboundSender<LogLine>,
}

impl MqttLogLayer {
    /// Create the layer and the receiver to hand to
    /// [`MqttClient::set_log_forwarder`](super::MqttClient::set_log_forwarder).
    pub fn new(max_level: Level, capacity: usize) -> (Self, InboundReceiver<LogLine>) {
        let (tx, rx) = inbound::channel(capacity);
        (Self { max_level, tx }, rx)
    }
}

fn level_letter(level: &Level) -> char {
    match *level {
        Level::ERROR => 'E',
        Level::WARN => 'W',
        Level::INFO => 'I',
        Level::DEBUG => 'D',
        _ => 'V',
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for MqttLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > self.max_level
            || SESSION_TARGETS.iter().any(|t| meta.target().starts_with(t))
        {
            return;
        }
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let text = format!(
            "[{}][{}]: {}{}",
            level_letter(meta.level()),
            meta.target(),
            visitor.message,
            visitor.fields
        );
        // A full queue drops the line; the receiver counts it.
        self.tx.push(LogLine {
            level: *meta.level(),
            text,
        });
    }
}
