//! TOML config file loading and validation: device identity, relay wiring,
//! MQTT and web endpoints, remote service settings, and loop intervals.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::ids::RELAY_COUNT;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub device: DeviceSection,
    #[serde(default)]
    pub hardware: HardwareSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub web: WebSection,
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub intervals: IntervalsSection,
    #[serde(default)]
    pub relays: Vec<RelayEntry>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceSection {
    pub device_id: String,
    #[serde(default)]
    pub site_id: String,
    #[serde(default)]
    pub room_id: String,
    /// Local clock offset from UTC, in minutes. Schedules evaluate in
    /// local wall time.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_db_url")]
    pub db_url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct HardwareSection {
    /// Relay modules that energise on a low pin level.
    #[serde(default)]
    pub active_low: bool,
}

#[derive(Debug, Deserialize)]
pub struct MqttSection {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

#[derive(Debug, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_web_port")]
    pub port: u16,
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoteSection {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub switch_sync: bool,
    #[serde(default)]
    pub rule_sync: bool,
    #[serde(default)]
    pub telemetry: bool,
}

#[derive(Debug, Deserialize)]
pub struct IntervalsSection {
    #[serde(default = "default_sample_secs")]
    pub sample_secs: u64,
    #[serde(default = "default_evaluate_secs")]
    pub evaluate_secs: u64,
    #[serde(default = "default_switch_poll_secs")]
    pub switch_poll_secs: u64,
    #[serde(default = "default_rule_sync_secs")]
    pub rule_sync_secs: u64,
    #[serde(default = "default_telemetry_secs")]
    pub telemetry_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct RelayEntry {
    pub name: String,
    pub gpio_pin: i64,
}

fn default_db_url() -> String {
    "sqlite:controller.db".into()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "relay-controller".into()
}
fn default_topic_prefix() -> String {
    "relays".into()
}
fn default_web_port() -> u16 {
    8080
}
fn default_sample_secs() -> u64 {
    5
}
fn default_evaluate_secs() -> u64 {
    2
}
fn default_switch_poll_secs() -> u64 {
    10
}
fn default_rule_sync_secs() -> u64 {
    60
}
fn default_telemetry_secs() -> u64 {
    300
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            port: default_web_port(),
        }
    }
}

impl Default for IntervalsSection {
    fn default() -> Self {
        Self {
            sample_secs: default_sample_secs(),
            evaluate_secs: default_evaluate_secs(),
            switch_poll_secs: default_switch_poll_secs(),
            rule_sync_secs: default_rule_sync_secs(),
            telemetry_secs: default_telemetry_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_device(&mut errors);
        self.validate_mqtt(&mut errors);
        self.validate_remote(&mut errors);
        self.validate_intervals(&mut errors);
        self.validate_relays(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        if self.device.device_id.trim().is_empty() {
            errors.push("device: device_id is empty".into());
        }
        // UTC-14 to UTC+14 covers every civil offset in use.
        if !(-840..=840).contains(&self.device.utc_offset_minutes) {
            errors.push(format!(
                "device: utc_offset_minutes {} out of range [-840, 840]",
                self.device.utc_offset_minutes
            ));
        }
        if self.device.db_url.trim().is_empty() {
            errors.push("device: db_url is empty".into());
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt: host is empty".into());
        }
        if self.mqtt.port == 0 {
            errors.push("mqtt: port must be non-zero".into());
        }
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".into());
        }
        if self.mqtt.topic_prefix.trim().is_empty()
            || self.mqtt.topic_prefix.contains(['#', '+', '/'])
        {
            errors.push(format!(
                "mqtt: topic_prefix {:?} must be a non-empty literal topic segment",
                self.mqtt.topic_prefix
            ));
        }
    }

    fn validate_remote(&self, errors: &mut Vec<String>) {
        let r = &self.remote;
        let any_enabled = r.switch_sync || r.rule_sync || r.telemetry;
        if !any_enabled {
            return;
        }

        if !(r.base_url.starts_with("http://") || r.base_url.starts_with("https://")) {
            errors.push(format!(
                "remote: base_url {:?} must start with http:// or https://",
                r.base_url
            ));
        }
        if r.api_key.trim().is_empty() {
            errors.push("remote: api_key is required when any remote feature is enabled".into());
        }
        if r.rule_sync && r.user_id.trim().is_empty() {
            errors.push("remote: user_id is required when rule_sync is enabled".into());
        }
    }

    fn validate_intervals(&self, errors: &mut Vec<String>) {
        let iv = &self.intervals;
        for (name, value) in [
            ("sample_secs", iv.sample_secs),
            ("evaluate_secs", iv.evaluate_secs),
            ("switch_poll_secs", iv.switch_poll_secs),
            ("rule_sync_secs", iv.rule_sync_secs),
            ("telemetry_secs", iv.telemetry_secs),
        ] {
            if value == 0 {
                errors.push(format!("intervals: {name} must be positive"));
            }
        }
    }

    fn validate_relays(&self, errors: &mut Vec<String>) {
        if self.relays.len() != RELAY_COUNT {
            errors.push(format!(
                "relays: expected exactly {RELAY_COUNT} entries, got {}",
                self.relays.len()
            ));
        }

        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, relay) in self.relays.iter().enumerate() {
            let ctx = || {
                if relay.name.is_empty() {
                    format!("relays[{i}]")
                } else {
                    format!("relay '{}'", relay.name)
                }
            };

            if relay.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&relay.name) {
                errors.push(format!("{}: duplicate name", ctx()));
            }

            if !VALID_GPIO_PINS.contains(&relay.gpio_pin) {
                errors.push(format!(
                    "{}: gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    ctx(),
                    relay.gpio_pin
                ));
            } else if !seen_pins.insert(relay.gpio_pin) {
                errors.push(format!(
                    "{}: gpio_pin {} is already used by another relay",
                    ctx(),
                    relay.gpio_pin
                ));
            }
        }
    }

    /// GPIO pins in relay order, for the board constructor.
    pub fn gpio_pins(&self) -> Vec<u8> {
        self.relays.iter().map(|r| r.gpio_pin as u8).collect()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
