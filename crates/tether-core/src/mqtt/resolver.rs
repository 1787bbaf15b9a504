//! Broker address resolution.

use std::net::{IpAddr, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("No address found for '{0}'")]
    NotFound(String),

    #[error("Lookup failed: {0}")]
    Lookup(String),

    #[error("Resolver worker went away")]
    WorkerLost,

    #[error("Timed out")]
    TimedOut,
}

/// Asynchronous hostname lookup. The caller owns the timeout policy.
pub trait Resolver {
    /// Begin resolving `host`, discarding any lookup still in flight.
    fn start(&mut self, host: &str);

    /// Result of the current lookup, once available. Each result is
    /// returned once.
    fn poll(&mut self) -> Option<Result<IpAddr, ResolveError>>;
}

/// Resolver running `ToSocketAddrs` on a worker thread per lookup.
#[derive(Default)]
pub struct ThreadResolver {
    pending: Option<Receiver<Result<IpAddr, ResolveError>>>,
    ready: Option<Result<IpAddr, ResolveError>>,
}

impl ThreadResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lookup(host: &str) -> Result<IpAddr, ResolveError> {
    let addrs: Vec<IpAddr> = (host, 0)
        .to_socket_addrs()
        .map_err(|e| ResolveError::Lookup(e.to_string()))?
        .map(|a| a.ip())
        .collect();
    // Prefer IPv4 like most embedded stacks do.
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ResolveError::NotFound(host.to_string()))
}

impl Resolver for ThreadResolver {
    fn start(&mut self, host: &str) {
        self.pending = None;
        self.ready = None;

        // Literal addresses resolve immediately.
        if let Ok(ip) = host.parse::<IpAddr>() {
            self.ready = Some(Ok(ip));
            return;
        }

        let (tx, rx) = mpsc::channel();
        let host = host.to_string();
        let spawned = thread::Builder::new()
            .name("dns".into())
            .spawn(move || {
                let result = lookup(&host);
                trace!(host = %host, ?result, "Lookup finished");
                // The client may have started a newer lookup already.
                let _ = tx.send(result);
            });
        match spawned {
            Ok(_) => self.pending = Some(rx),
            Err(e) => self.ready = Some(Err(ResolveError::Lookup(e.to_string()))),
        }
    }

    fn poll(&mut self) -> Option<Result<IpAddr, ResolveError>> {
        if let Some(ready) = self.ready.take() {
            return Some(ready);
        }
        let rx = self.pending.as_ref()?;
        match rx.try_recv() {
            Ok(result) => {
                self.pending = None;
                Some(result)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.pending = None;
                Some(Err(ResolveError::WorkerLost))
            }
        }
    }
}
