//! Event system for status signaling.
//!
//! Subsystems report what an operator-visible indicator (status LED, UI,
//! log) should show through a [`StatusObserver`], without depending on how
//! that indicator is driven.

use std::fmt;
use std::time::Duration;

use crate::mqtt::ConnectionState;

/// OTA session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaPhase {
    /// Waiting for a peer to connect.
    Idle,
    /// Magic, version and feature exchange.
    Handshake,
    /// Challenge-response authentication.
    Authenticate,
    /// Size negotiation and staged write preparation.
    Prepare,
    /// Binary transfer in progress.
    Transfer,
    /// Finalizing the staged write.
    Finalize,
    /// Update committed.
    Complete,
    /// Session aborted.
    Error,
}

impl fmt::Display for OtaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaPhase::Idle => write!(f, "Idle"),
            OtaPhase::Handshake => write!(f, "Handshake"),
            OtaPhase::Authenticate => write!(f, "Authenticate"),
            OtaPhase::Prepare => write!(f, "Prepare"),
            OtaPhase::Transfer => write!(f, "Transfer"),
            OtaPhase::Finalize => write!(f, "Finalize"),
            OtaPhase::Complete => write!(f, "Complete"),
            OtaPhase::Error => write!(f, "Error"),
        }
    }
}

/// Why a subsystem asked for the device to restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootReason {
    /// No broker connection for longer than the reboot timeout.
    Mqtt,
    /// A firmware update was committed.
    Ota,
    /// The update-only window elapsed without an update.
    OtaSafeMode,
}

impl RebootReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebootReason::Mqtt => "mqtt",
            RebootReason::Ota => "ota",
            RebootReason::OtaSafeMode => "ota-safe-mode",
        }
    }
}

impl fmt::Display for RebootReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the device subsystems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A retryable failure is ongoing (e.g. broker unreachable).
    WarningSet { source: &'static str },
    /// The persistent warning was cleared after recovery.
    WarningCleared { source: &'static str },
    /// Short-lived warning, e.g. a failed publish.
    MomentaryWarning {
        source: &'static str,
        duration: Duration,
    },
    /// Short-lived error, e.g. an aborted OTA session.
    MomentaryError {
        source: &'static str,
        duration: Duration,
    },
    /// Broker connection state changed.
    ConnectionChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// OTA phase changed.
    OtaPhaseChanged { from: OtaPhase, to: OtaPhase },
    /// Progress of the current firmware transfer.
    OtaProgress { written: u64, total: u64 },
    /// Boot-loop guard escalated into update-only mode.
    SafeModeEntered { attempts: u8 },
}

/// Observer trait for receiving device events.
///
/// Implement this in the layer that drives the status indicator.
pub trait StatusObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DeviceEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl StatusObserver for NullObserver {
    fn on_event(&self, _event: &DeviceEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl StatusObserver for TracingObserver {
    fn on_event(&self, event: &DeviceEvent) {
        match event {
            DeviceEvent::WarningSet { source } => {
                tracing::debug!(source = source, "Status warning set");
            }
            DeviceEvent::WarningCleared { source } => {
                tracing::debug!(source = source, "Status warning cleared");
            }
            DeviceEvent::MomentaryWarning { source, duration } => {
                tracing::debug!(
                    source = source,
                    ms = duration.as_millis() as u64,
                    "Momentary warning"
                );
            }
            DeviceEvent::MomentaryError { source, duration } => {
                tracing::warn!(
                    source = source,
                    ms = duration.as_millis() as u64,
                    "Momentary error"
                );
            }
            DeviceEvent::ConnectionChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "MQTT state changed");
            }
            DeviceEvent::OtaPhaseChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "OTA phase changed");
            }
            DeviceEvent::OtaProgress { written, total } => {
                let pct = if *total > 0 {
                    (*written as f64 * 100.0) / *total as f64
                } else {
                    0.0
                };
                tracing::debug!(progress = %format!("{:.1}%", pct), "OTA in progress");
            }
            DeviceEvent::SafeModeEntered { attempts } => {
                tracing::error!(attempts = attempts, "Boot loop detected, entering safe mode");
            }
        }
    }
}

/// Observer that keeps every event, for assertions in tests.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<DeviceEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events recorded so far.
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Whether any recorded event satisfies `pred`.
    pub fn any(&self, pred: impl Fn(&DeviceEvent) -> bool) -> bool {
        self.events().iter().any(pred)
    }
}

impl StatusObserver for RecordingObserver {
    fn on_event(&self, event: &DeviceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
