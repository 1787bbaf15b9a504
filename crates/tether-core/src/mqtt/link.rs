//! Link-layer readiness.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Reports whether the network link (WiFi, Ethernet) is up.
pub trait Link {
    fn is_connected(&self) -> bool;
}

/// A link that is always up, e.g. a wired host.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysUp;

impl Link for AlwaysUp {
    fn is_connected(&self) -> bool {
        true
    }
}

/// Link state toggled from outside. Clones share the flag.
#[derive(Debug, Clone)]
pub struct ManualLink {
    up: Arc<AtomicBool>,
}

impl ManualLink {
    pub fn new(up: bool) -> Self {
        Self {
            up: Arc::new(AtomicBool::new(up)),
        }
    }

    pub fn set(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

impl Default for ManualLink {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Link for ManualLink {
    fn is_connected(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}
