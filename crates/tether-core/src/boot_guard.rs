//! Boot-loop detection.
//!
//! A persisted counter is bumped on every guarded boot and cleared once
//! the device has run long enough to count as stable. A boot that finds
//! the counter at the attempt threshold escalates to update-only mode.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, instrument, warn};

use crate::events::{DeviceEvent, StatusObserver};
use crate::prefs::{PreferenceError, PreferenceStore};

/// Preference key of the boot counter.
pub const BOOT_COUNTER_KEY: u32 = 669_657_188;

pub const DEFAULT_NUM_ATTEMPTS: u8 = 10;
pub const DEFAULT_ENABLE_TIME: Duration = Duration::from_secs(60);

/// What the device should do after [`BootGuard::enter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDecision {
    /// Continue with normal startup.
    Normal,
    /// Only accept firmware updates.
    SafeMode,
}

pub struct BootGuard {
    store: Box<dyn PreferenceStore>,
    num_attempts: u8,
    enable_time: Duration,
    boot_count: u8,
    started: Instant,
    stable: bool,
    observer: Arc<dyn StatusObserver>,
}

impl BootGuard {
    pub fn new(
        store: Box<dyn PreferenceStore>,
        num_attempts: u8,
        enable_time: Duration,
        observer: Arc<dyn StatusObserver>,
    ) -> Self {
        Self {
            store,
            num_attempts,
            enable_time,
            boot_count: 0,
            started: Instant::now(),
            stable: false,
            observer,
        }
    }

    pub fn enter(&mut self) -> Result<BootDecision, PreferenceError> {
        self.enter_at(Instant::now())
    }

    /// Read and bump the counter. The write is durable before this returns.
    #[instrument(skip_all, fields(num_attempts = self.num_attempts))]
    pub fn enter_at(&mut self, now: Instant) -> Result<BootDecision, PreferenceError> {
        self.started = now;
        self.stable = false;
        self.boot_count = self.store.load(BOOT_COUNTER_KEY)?.unwrap_or(0);

        if self.boot_count >= self.num_attempts {
            self.store.save(BOOT_COUNTER_KEY, 0)?;
            error!(boot_count = self.boot_count, "Boot loop detected. Proceeding to safe mode.");
            self.observer.on_event(&DeviceEvent::SafeModeEntered {
                attempts: self.boot_count,
            });
            return Ok(BootDecision::SafeMode);
        }

        let next = self.boot_count.saturating_add(1);
        self.store.save(BOOT_COUNTER_KEY, next)?;
        if self.boot_count > 0 {
            warn!(
                boot_count = self.boot_count,
                remaining = self.num_attempts - self.boot_count,
                "Last boot was unclean"
            );
        }
        Ok(BootDecision::Normal)
    }

    pub fn poll(&mut self) {
        self.poll_at(Instant::now());
    }

    /// Clear the counter once, after `enable_time` of uninterrupted running.
    pub fn poll_at(&mut self, now: Instant) {
        if self.stable || now.saturating_duration_since(self.started) < self.enable_time {
            return;
        }
        self.stable = true;
        match self.clean() {
            Ok(()) => info!("Boot seems successful, resetting boot loop counter."),
            Err(e) => warn!(error = %e, "Resetting boot loop counter failed"),
        }
    }

    /// Reset the persisted counter to zero.
    pub fn clean(&mut self) -> Result<(), PreferenceError> {
        self.store.save(BOOT_COUNTER_KEY, 0)
    }

    /// Counter value read at the last [`enter`](Self::enter).
    pub fn boot_count(&self) -> u8 {
        self.boot_count
    }

    pub fn num_attempts(&self) -> u8 {
        self.num_attempts
    }

    pub fn enable_time(&self) -> Duration {
        self.enable_time
    }

    pub fn is_stable(&self) -> bool {
        self.stable
    }
}
