//! OTA listener loop.

use tracing::{info, warn};

use super::session::{OtaError, OtaHandler, OtaOutcome};
use crate::boot_guard::BootGuard;
use crate::staging::UpdateTarget;
use crate::transport::{OtaListener, OtaTransport};

/// What a call to [`OtaServer::poll`] did.
#[derive(Debug)]
pub enum OtaPoll {
    /// No peer was waiting.
    Idle,
    /// A session ran and was aborted; the listener stays open.
    Failed(OtaError),
    /// An update was committed; the device should reboot into it.
    Completed(OtaOutcome),
}

/// Accepts OTA peers and services them one at a time.
pub struct OtaServer<L: OtaListener, T: UpdateTarget> {
    listener: L,
    target: T,
    handler: OtaHandler,
}

impl<L: OtaListener, T: UpdateTarget> OtaServer<L, T> {
    pub fn new(listener: L, target: T, handler: OtaHandler) -> Self {
        Self {
            listener,
            target,
            handler,
        }
    }

    /// Accept a waiting peer, if any, and run its session to the end.
    ///
    /// Blocks for the duration of the session; the next peer is only
    /// accepted after this one's socket is closed.
    pub fn poll(&mut self) -> OtaPoll {
        let mut stream = match self.listener.accept() {
            Ok(Some(stream)) => stream,
            Ok(None) => return OtaPoll::Idle,
            Err(e) => {
                warn!(error = %e, "Accepting OTA peer failed");
                return OtaPoll::Idle;
            }
        };

        info!(peer = %stream.peer(), "Starting OTA Update");
        match self.handler.handle(&mut stream, &mut self.target) {
            Ok(outcome) => OtaPoll::Completed(outcome),
            Err(e) => OtaPoll::Failed(e),
        }
    }

    pub fn port(&self) -> u16 {
        self.listener.port()
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Stop accepting peers.
    pub fn shutdown(&mut self) {
        self.listener.close();
    }

    /// Log the effective OTA configuration.
    pub fn dump_config(&self, guard: Option<&BootGuard>) {
        info!("Over-The-Air Updates:");
        info!(port = self.listener.port(), "  Listening");
        if self.handler.has_password() {
            info!("  Using Password.");
        }
        if let Some(guard) = guard {
            let count = guard.boot_count();
            if count > 1 {
                warn!(
                    restarts = guard.num_attempts().saturating_sub(count),
                    "Last boot was an unhandled reset, will proceed to safe mode"
                );
            }
        }
    }
}
