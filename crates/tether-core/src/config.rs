//! Node configuration file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

use crate::boot_guard::{DEFAULT_ENABLE_TIME, DEFAULT_NUM_ATTEMPTS};
use crate::mqtt::client::{DEFAULT_KEEP_ALIVE, DEFAULT_REBOOT_TIMEOUT};
use crate::mqtt::{Credentials, MessageTemplate};
use crate::protocol::DEFAULT_OTA_PORT;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Encoding config failed: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("Invalid value for '{field}': {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub name: String,
    /// Boot counter and other persisted state.
    pub state_dir: PathBuf,
    pub loop_interval_ms: u64,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            name: "tether-node".to_string(),
            state_dir: PathBuf::from("state"),
            loop_interval_ms: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub broker: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Empty derives one from the device name.
    pub client_id: String,
    /// Empty means the device name.
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
    /// Zero disables the reboot watchdog.
    pub reboot_timeout_secs: u64,
    pub log_topic_enabled: bool,
    pub log_level: String,
    pub birth_message: Option<MessageTemplate>,
    pub will_message: Option<MessageTemplate>,
    pub shutdown_message: Option<MessageTemplate>,
    pub discovery_prefix: String,
    pub discovery_retain: bool,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: String::new(),
            topic_prefix: String::new(),
            keep_alive_secs: DEFAULT_KEEP_ALIVE.as_secs(),
            reboot_timeout_secs: DEFAULT_REBOOT_TIMEOUT.as_secs(),
            log_topic_enabled: true,
            log_level: "debug".to_string(),
            birth_message: None,
            will_message: None,
            shutdown_message: None,
            discovery_prefix: String::new(),
            discovery_retain: true,
        }
    }
}

impl MqttSection {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            address: self.broker.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reboot_timeout(&self) -> Duration {
        Duration::from_secs(self.reboot_timeout_secs)
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        Level::from_str(&self.log_level).map_err(|e| ConfigError::Invalid {
            field: "mqtt.log_level",
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaSection {
    pub port: u16,
    pub password: Option<String>,
    pub staging_dir: PathBuf,
    pub max_size: u64,
}

impl Default for OtaSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_OTA_PORT,
            password: None,
            staging_dir: PathBuf::from("staging"),
            max_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeModeSection {
    pub enabled: bool,
    pub num_attempts: u8,
    /// Uninterrupted run time after which a boot counts as stable.
    pub enable_time_secs: u64,
    /// How long update-only mode waits for an update.
    pub window_secs: u64,
}

impl Default for SafeModeSection {
    fn default() -> Self {
        Self {
            enabled: true,
            num_attempts: DEFAULT_NUM_ATTEMPTS,
            enable_time_secs: DEFAULT_ENABLE_TIME.as_secs(),
            window_secs: 300,
        }
    }
}

impl SafeModeSection {
    pub fn enable_time(&self) -> Duration {
        Duration::from_secs(self.enable_time_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// One `[[switches]]` entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchSection {
    /// Topic segment, `<prefix>/switch/<id>/...`.
    pub id: String,
    pub name: String,
    /// File receiving `1`/`0`. Without one the switch is virtual.
    pub output: Option<PathBuf>,
    pub inverted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub device: DeviceSection,
    pub mqtt: MqttSection,
    pub ota: OtaSection,
    pub safe_mode: SafeModeSection,
    pub switches: Vec<SwitchSection>,
}

impl NodeConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "device.name",
                message: "must not be empty".into(),
            });
        }
        if self.mqtt.broker.is_empty() {
            return Err(ConfigError::Invalid {
                field: "mqtt.broker",
                message: "must not be empty".into(),
            });
        }
        self.mqtt.log_level()?;
        if let Some(switch) = self.switches.iter().find(|s| s.id.is_empty() || s.id.contains('/')) {
            return Err(ConfigError::Invalid {
                field: "switches.id",
                message: format!("'{}' is not a valid topic segment", switch.id),
            });
        }
        Ok(())
    }

    /// Topic prefix, falling back to the device name.
    pub fn topic_prefix(&self) -> &str {
        if self.mqtt.topic_prefix.is_empty() {
            &self.device.name
        } else {
            &self.mqtt.topic_prefix
        }
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.device.loop_interval_ms)
    }

    pub fn preferences_path(&self) -> PathBuf {
        self.device.state_dir.join("preferences.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::QoS;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            [device]
            name = "porch"

            [mqtt]
            broker = "10.0.0.2"
            reboot_timeout_secs = 0

            [mqtt.shutdown_message]
            topic = "porch/status"
            payload = "bye"
            retain = true
            "#,
        )
        .unwrap();

        assert_eq!(config.device.name, "porch");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.reboot_timeout(), Duration::ZERO);
        assert_eq!(config.topic_prefix(), "porch");
        assert_eq!(config.ota.port, DEFAULT_OTA_PORT);
        assert_eq!(config.safe_mode.num_attempts, 10);
        let shutdown = config.mqtt.shutdown_message.unwrap();
        assert_eq!(shutdown.payload, "bye");
        assert_eq!(shutdown.qos, QoS::AtMostOnce);
        assert!(config.switches.is_empty());
    }

    #[test]
    fn test_switch_entries() {
        let config: NodeConfig = toml::from_str(
            r#"
            [[switches]]
            id = "relay"
            name = "Relay"
            output = "/sys/class/gpio/gpio17/value"

            [[switches]]
            id = "bad/id"
            "#,
        )
        .unwrap();
        assert_eq!(config.switches.len(), 2);
        assert!(config.switches[0].output.is_some());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "switches.id", .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let mut config = NodeConfig::default();
        config.ota.password = Some("hunter2".into());
        config.mqtt.log_level = "warn".into();
        config.save_to_file(&path).unwrap();

        let loaded = NodeConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.mqtt.log_level().unwrap(), Level::WARN);
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = NodeConfig::default();
        config.mqtt.log_level = "loud".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "mqtt.log_level", .. })
        ));
    }
}
