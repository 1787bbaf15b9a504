//! A switch exposed over MQTT.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{info, warn};

use super::{Switch, SwitchAction, SwitchHardware};
use crate::mqtt::{BrokerSession, Link, MqttClient, QoS, ResendFlag, Resolver};
use crate::node::Component;

/// Listens for `ON` / `OFF` / `TOGGLE` on `<prefix>/switch/<id>/command`
/// and keeps the retained `<prefix>/switch/<id>/state` current.
pub struct MqttSwitch<H: SwitchHardware> {
    switch: Rc<RefCell<Switch<H>>>,
    command_topic: String,
    state_topic: String,
    resend: ResendFlag,
    last_published: Option<bool>,
}

impl<H: SwitchHardware + 'static> MqttSwitch<H> {
    pub fn new(prefix: &str, id: &str, switch: Switch<H>) -> Self {
        Self {
            switch: Rc::new(RefCell::new(switch)),
            command_topic: format!("{prefix}/switch/{id}/command"),
            state_topic: format!("{prefix}/switch/{id}/state"),
            resend: ResendFlag::new(),
            last_published: None,
        }
    }

    /// Shared handle for local control of the switch.
    pub fn handle(&self) -> Rc<RefCell<Switch<H>>> {
        self.switch.clone()
    }

    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    pub fn state_topic(&self) -> &str {
        &self.state_topic
    }
}

fn state_payload(state: bool) -> &'static str {
    if state { "ON" } else { "OFF" }
}

impl<H, S, R, L> Component<S, R, L> for MqttSwitch<H>
where
    H: SwitchHardware + 'static,
    S: BrokerSession,
    R: Resolver,
    L: Link,
{
    fn name(&self) -> &str {
        "mqtt.switch"
    }

    fn setup(&mut self, client: &mut MqttClient<S, R, L>) {
        let switch = self.switch.clone();
        client.subscribe(&self.command_topic, QoS::AtMostOnce, move |topic, payload| {
            match SwitchAction::from_payload(payload) {
                Some(action) => action.apply(&mut switch.borrow_mut()),
                None => warn!(topic = %topic, payload = %payload, "Unknown switch command"),
            }
        });
        client.register_resender(Box::new(self.resend.clone()));
    }

    fn poll(&mut self, client: &mut MqttClient<S, R, L>) {
        let resend = self.resend.take();
        let state = self.switch.borrow().state();
        if !resend && self.last_published == Some(state) {
            return;
        }
        if !client.is_connected() {
            // Published on the next connect through the resend flag.
            self.last_published = None;
            return;
        }
        match client.publish_str(&self.state_topic, state_payload(state), QoS::AtMostOnce, true) {
            Ok(()) => self.last_published = Some(state),
            Err(_) => self.last_published = None,
        }
    }

    fn dump_config(&self) {
        let switch = self.switch.borrow();
        info!(
            name = %switch.name(),
            command_topic = %self.command_topic,
            state_topic = %self.state_topic,
            inverted = switch.is_inverted(),
            "MQTT Switch"
        );
    }
}
