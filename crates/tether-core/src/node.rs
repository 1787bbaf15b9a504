//! Device runtime: one cooperative loop driving every subsystem.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{error, info, instrument, warn};

use crate::boot_guard::{BootDecision, BootGuard};
use crate::events::{RebootReason, StatusObserver};
use crate::mqtt::{BrokerSession, Link, MqttClient, Resolver};
use crate::ota::{OtaPoll, OtaServer};
use crate::staging::UpdateTarget;
use crate::transport::OtaListener;

pub const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_millis(16);
pub const DEFAULT_SAFE_MODE_WINDOW: Duration = Duration::from_secs(300);

/// Application logic run on the node's loop, with access to the client.
pub trait Component<S: BrokerSession, R: Resolver, L: Link> {
    fn name(&self) -> &str;

    /// Called once after the client is set up.
    fn setup(&mut self, client: &mut MqttClient<S, R, L>);

    /// Called on every loop iteration. Must not block.
    fn poll(&mut self, client: &mut MqttClient<S, R, L>);

    fn dump_config(&self) {}
}

type Hook = Box<dyn FnMut(RebootReason)>;

pub struct Node<S, R, L, Lis, T>
where
    S: BrokerSession,
    R: Resolver,
    L: Link,
    Lis: OtaListener,
    T: UpdateTarget,
{
    device_name: String,
    client: MqttClient<S, R, L>,
    ota: OtaServer<Lis, T>,
    guard: Option<BootGuard>,
    safe_mode_window: Duration,
    loop_interval: Duration,
    components: Vec<Box<dyn Component<S, R, L>>>,
    shutdown_hooks: Vec<Hook>,
    safe_shutdown_hooks: Vec<Hook>,
    observer: Arc<dyn StatusObserver>,
}

impl<S, R, L, Lis, T> Node<S, R, L, Lis, T>
where
    S: BrokerSession,
    R: Resolver,
    L: Link,
    Lis: OtaListener,
    T: UpdateTarget,
{
    pub fn new(
        device_name: impl Into<String>,
        client: MqttClient<S, R, L>,
        ota: OtaServer<Lis, T>,
        observer: Arc<dyn StatusObserver>,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            client,
            ota,
            guard: None,
            safe_mode_window: DEFAULT_SAFE_MODE_WINDOW,
            loop_interval: DEFAULT_LOOP_INTERVAL,
            components: Vec::new(),
            shutdown_hooks: Vec::new(),
            safe_shutdown_hooks: Vec::new(),
            observer,
        }
    }

    /// Consult `guard` at boot; escalate into update-only mode for `window`.
    pub fn with_boot_guard(mut self, guard: BootGuard, window: Duration) -> Self {
        self.guard = Some(guard);
        self.safe_mode_window = window;
        self
    }

    pub fn with_loop_interval(mut self, interval: Duration) -> Self {
        self.loop_interval = interval;
        self
    }

    pub fn add_component(&mut self, component: Box<dyn Component<S, R, L>>) {
        self.components.push(component);
    }

    /// Run before every reboot.
    pub fn add_shutdown_hook(&mut self, hook: impl FnMut(RebootReason) + 'static) {
        self.shutdown_hooks.push(Box::new(hook));
    }

    /// Run before a reboot into freshly written firmware, ahead of the
    /// regular shutdown hooks.
    pub fn add_safe_shutdown_hook(&mut self, hook: impl FnMut(RebootReason) + 'static) {
        self.safe_shutdown_hooks.push(Box::new(hook));
    }

    pub fn client(&self) -> &MqttClient<S, R, L> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut MqttClient<S, R, L> {
        &mut self.client
    }

    pub fn ota(&self) -> &OtaServer<Lis, T> {
        &self.ota
    }

    pub fn observer(&self) -> &Arc<dyn StatusObserver> {
        &self.observer
    }

    /// Boot the node and loop until something asks for a reboot. Shutdown
    /// hooks have run by the time this returns.
    #[instrument(skip_all, fields(device = %self.device_name))]
    pub fn run(&mut self) -> Result<RebootReason> {
        if self.boot() == BootDecision::SafeMode {
            return Ok(self.run_safe_mode());
        }

        self.setup();
        loop {
            if let Some(reason) = self.step_at(Instant::now()) {
                self.shutdown(reason);
                return Ok(reason);
            }
            thread::sleep(self.loop_interval);
        }
    }

    /// Run the boot guard. A broken preference store never blocks startup.
    pub fn boot(&mut self) -> BootDecision {
        let Some(guard) = self.guard.as_mut() else {
            return BootDecision::Normal;
        };
        match guard.enter() {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "Boot loop guard unavailable");
                BootDecision::Normal
            }
        }
    }

    /// Start the client and every component, then log the configuration.
    pub fn setup(&mut self) {
        info!("Running through setup()...");
        self.client.setup(&self.device_name);
        for component in &mut self.components {
            component.setup(&mut self.client);
        }
        self.dump_config();
    }

    pub fn dump_config(&self) {
        self.client.dump_config();
        self.ota.dump_config(self.guard.as_ref());
        for component in &self.components {
            component.dump_config();
        }
    }

    /// One loop iteration.
    pub fn step_at(&mut self, now: Instant) -> Option<RebootReason> {
        if let Some(reason) = self.client.poll_at(now) {
            return Some(reason);
        }

        for component in &mut self.components {
            component.poll(&mut self.client);
        }

        match self.ota.poll() {
            OtaPoll::Completed(outcome) => {
                info!(size = outcome.size, "OTA successful");
                return Some(RebootReason::Ota);
            }
            OtaPoll::Failed(e) => warn!(error = %e, "OTA session failed"),
            OtaPoll::Idle => {}
        }

        if let Some(guard) = self.guard.as_mut() {
            guard.poll_at(now);
        }
        None
    }

    /// Update-only mode: service OTA peers until one completes or the
    /// window elapses.
    #[instrument(skip_all, fields(window_secs = self.safe_mode_window.as_secs()))]
    pub fn run_safe_mode(&mut self) -> RebootReason {
        error!("SAFE MODE IS ACTIVE");
        self.ota.dump_config(self.guard.as_ref());

        let started = Instant::now();
        let reason = loop {
            match self.ota.poll() {
                OtaPoll::Completed(_) => break RebootReason::Ota,
                OtaPoll::Failed(e) => warn!(error = %e, "OTA session failed"),
                OtaPoll::Idle => {}
            }
            if started.elapsed() >= self.safe_mode_window {
                error!("No OTA attempt made, restarting.");
                break RebootReason::OtaSafeMode;
            }
            thread::sleep(self.loop_interval);
        };
        self.shutdown(reason);
        reason
    }

    /// Run the shutdown hooks for `reason`.
    pub fn shutdown(&mut self, reason: RebootReason) {
        info!(reason = %reason, "Preparing for reboot");

        if reason == RebootReason::Ota {
            if let Some(guard) = self.guard.as_mut() {
                if let Err(e) = guard.clean() {
                    warn!(error = %e, "Resetting boot loop counter failed");
                }
            }
            for hook in &mut self.safe_shutdown_hooks {
                hook(reason);
            }
        }

        self.client.shutdown();
        self.ota.shutdown();
        for hook in &mut self.shutdown_hooks {
            hook(reason);
        }
    }
}
