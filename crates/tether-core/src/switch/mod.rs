//! Binary outputs (relays, LEDs) behind a single hardware capability.
//!
//! Hardware only implements [`SwitchHardware::write_state`]. Actions and
//! conditions are small enums evaluated against any [`Switch`].

pub mod mqtt;
pub mod output;

use std::fmt;

use tracing::debug;

pub use mqtt::MqttSwitch;
pub use output::{FileOutput, VirtualOutput};

/// Applies a logical on/off state to real hardware.
pub trait SwitchHardware {
    fn write_state(&mut self, state: bool);
}

type StateCallback = Box<dyn FnMut(bool)>;

pub struct Switch<H: SwitchHardware> {
    name: String,
    hardware: H,
    state: bool,
    inverted: bool,
    icon: Option<String>,
    callbacks: Vec<StateCallback>,
}

impl<H: SwitchHardware> fmt::Debug for Switch<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Switch")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("inverted", &self.inverted)
            .finish()
    }
}

impl<H: SwitchHardware> Switch<H> {
    pub fn new(name: impl Into<String>, hardware: H) -> Self {
        Self {
            name: name.into(),
            hardware,
            state: false,
            inverted: false,
            icon: None,
            callbacks: Vec::new(),
        }
    }

    /// Drive the hardware with the opposite level.
    pub fn inverted(mut self, inverted: bool) -> Self {
        self.inverted = inverted;
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn turn_on(&mut self) {
        self.set(true);
    }

    pub fn turn_off(&mut self) {
        self.set(false);
    }

    pub fn toggle(&mut self) {
        self.set(!self.state);
    }

    fn set(&mut self, state: bool) {
        debug!(switch = %self.name, state = state, "Switch command");
        self.hardware.write_state(state != self.inverted);
        self.publish_state(state);
    }

    /// Report a state change that originated in the hardware.
    pub fn publish_state(&mut self, state: bool) {
        self.state = state;
        for callback in &mut self.callbacks {
            callback(state);
        }
    }

    pub fn add_on_state_callback(&mut self, callback: impl FnMut(bool) + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn state(&self) -> bool {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn icon(&self) -> Option<&str> {
        self.icon.as_deref()
    }

    pub fn is_inverted(&self) -> bool {
        self.inverted
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchAction {
    TurnOn,
    TurnOff,
    Toggle,
}

impl SwitchAction {
    pub fn apply<H: SwitchHardware>(self, switch: &mut Switch<H>) {
        match self {
            SwitchAction::TurnOn => switch.turn_on(),
            SwitchAction::TurnOff => switch.turn_off(),
            SwitchAction::Toggle => switch.toggle(),
        }
    }

    /// Parse an `ON` / `OFF` / `TOGGLE` command payload.
    pub fn from_payload(payload: &str) -> Option<Self> {
        match payload.trim().to_ascii_uppercase().as_str() {
            "ON" => Some(SwitchAction::TurnOn),
            "OFF" => Some(SwitchAction::TurnOff),
            "TOGGLE" => Some(SwitchAction::Toggle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchCondition {
    IsOn,
    IsOff,
}

impl SwitchCondition {
    pub fn check<H: SwitchHardware>(self, switch: &Switch<H>) -> bool {
        match self {
            SwitchCondition::IsOn => switch.state(),
            SwitchCondition::IsOff => !switch.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn test_actions_drive_hardware() {
        let out = VirtualOutput::new();
        let mut sw = Switch::new("relay", out.clone());
        SwitchAction::TurnOn.apply(&mut sw);
        assert!(sw.state());
        assert!(out.level());

        SwitchAction::Toggle.apply(&mut sw);
        assert!(SwitchCondition::IsOff.check(&sw));
        assert!(!out.level());
    }

    #[test]
    fn test_inverted_output() {
        let out = VirtualOutput::new();
        let mut sw = Switch::new("led", out.clone()).inverted(true);
        sw.turn_on();
        assert!(sw.state());
        assert!(!out.level());
        assert_eq!(out.writes(), 1);
    }

    #[test]
    fn test_callbacks_see_every_state() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut sw = Switch::new("s", VirtualOutput::new());
        sw.add_on_state_callback(move |s| sink.borrow_mut().push(s));
        sw.turn_on();
        sw.publish_state(false);
        assert_eq!(*seen.borrow(), vec![true, false]);
    }

    #[test]
    fn test_command_payloads() {
        assert_eq!(SwitchAction::from_payload("on"), Some(SwitchAction::TurnOn));
        assert_eq!(SwitchAction::from_payload(" TOGGLE\n"), Some(SwitchAction::Toggle));
        assert_eq!(SwitchAction::from_payload("maybe"), None);
    }
}
