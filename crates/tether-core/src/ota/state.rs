//! Per-connection OTA session state.

use std::time::Instant;

use crate::events::{DeviceEvent, OtaPhase, StatusObserver};
use crate::protocol::HexDigest;

/// Transient state of one accepted peer. Created on accept and dropped when
/// the session ends.
#[derive(Debug)]
pub struct OtaSessionState {
    pub phase: OtaPhase,
    /// Feature flags announced by the peer.
    pub features: u8,
    /// Declared total payload size.
    pub size: u32,
    /// Bytes accepted by the staging target.
    pub written: u64,
    pub expected_md5: Option<HexDigest>,
    /// A staged write has begun and must be discarded on failure.
    pub update_started: bool,
    pub started_at: Instant,
    pub last_progress: Instant,
}

impl OtaSessionState {
    pub fn new(now: Instant) -> Self {
        Self {
            phase: OtaPhase::Idle,
            features: 0,
            size: 0,
            written: 0,
            expected_md5: None,
            update_started: false,
            started_at: now,
            last_progress: now,
        }
    }

    /// Transition to a new phase.
    pub fn goto_phase(&mut self, to: OtaPhase, observer: &dyn StatusObserver) {
        if self.phase == to {
            return;
        }
        tracing::debug!(from = %self.phase, to = %to, "OTA phase transition");
        observer.on_event(&DeviceEvent::OtaPhaseChanged {
            from: self.phase,
            to,
        });
        self.phase = to;
    }

    /// Percentage of the declared size received so far.
    pub fn percent(&self) -> f32 {
        if self.size == 0 {
            return 0.0;
        }
        (self.written as f32 * 100.0) / self.size as f32
    }
}
