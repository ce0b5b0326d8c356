// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! # Configuration Management
//!
//! This module implements configuration handling for the heating-control
//! daemon. The configuration is a YAML file with one section per concern:
//!
//! - `modbus`: the Modbus TCP slave (port, bind address, idle timeout)
//! - `brokers`: named MQTT brokers the telemetry bus connects to
//! - `settings_store`: the durable per-device settings store
//! - `devices`: the static device table
//!
//! ## Usage
//!
//! ```no_run
//! use heatbridge::config::Config;
//! use std::path::Path;
//!
//! let mut config = Config::from_file(Path::new("config.yaml")).unwrap();
//! config.apply_args(Some(true), Some("0.0.0.0".to_string()), Some(8503));
//! println!("Modbus port: {}", config.modbus.port);
//! ```

pub mod devices;
pub mod modbus;
pub mod settings;
pub mod telemetry;

pub use devices::{DeviceConfig, DeviceTopics, RegulatorGains, SafetyLimits};
pub use modbus::ModbusConfig;
pub use settings::SettingsStoreConfig;
pub use telemetry::BrokerConfig;

use anyhow::{bail, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Maximum number of devices addressable through the register plane.
pub const MAX_DEVICES: usize = 30;

/// Root configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Modbus TCP slave settings.
    #[serde(default)]
    pub modbus: ModbusConfig,

    /// Telemetry brokers, keyed by the name devices reference.
    #[serde(default)]
    pub brokers: HashMap<String, BrokerConfig>,

    /// Durable settings store.
    #[serde(default)]
    pub settings_store: SettingsStoreConfig,

    /// Static device table. Devices cannot be added or removed at runtime.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            modbus: ModbusConfig::default(),
            brokers: HashMap::new(),
            settings_store: SettingsStoreConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// The file is deserialized with serde and then checked against the
    /// cross-field rules in [`Config::validate`].
    ///
    /// ### Errors
    ///
    /// Fails if the file cannot be read, is not valid YAML for the expected
    /// structure, or violates a validation rule.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse configuration file {}", path.display()))?;

        config.validate()?;
        debug!(
            "Loaded configuration: {} devices, {} brokers",
            config.devices.len(),
            config.brokers.len()
        );
        Ok(config)
    }

    /// Apply command line overrides on top of the loaded configuration.
    pub fn apply_args(
        &mut self,
        modbus_enabled: Option<bool>,
        modbus_address: Option<String>,
        modbus_port: Option<u16>,
    ) {
        if let Some(enabled) = modbus_enabled {
            self.modbus.enabled = enabled;
        }
        if let Some(address) = modbus_address {
            self.modbus.address = address;
        }
        if let Some(port) = modbus_port {
            self.modbus.port = port;
        }
    }

    /// Validate cross-field rules that serde cannot express.
    ///
    /// This function validates:
    /// - device count fits the register plane (≤ 30)
    /// - device ids and unit ids are unique
    /// - unit ids are within the Modbus slave range 1..=247
    /// - every device references a configured broker
    /// - device names fit the 10-character ASCII export window
    /// - regulator output limits and safety bands are ordered
    pub fn validate(&self) -> Result<()> {
        if self.devices.len() > MAX_DEVICES {
            bail!(
                "{} devices configured, the register plane addresses at most {}",
                self.devices.len(),
                MAX_DEVICES
            );
        }

        let mut seen_ids = HashSet::new();
        let mut seen_units = HashSet::new();

        for device in &self.devices {
            if device.device_id.is_empty() {
                bail!("a device has an empty device_id");
            }
            if !seen_ids.insert(device.device_id.as_str()) {
                bail!("duplicate device_id '{}'", device.device_id);
            }
            if device.unit_id == 0 || device.unit_id > 247 {
                bail!(
                    "device '{}': unit_id {} outside the Modbus slave range 1..=247",
                    device.device_id,
                    device.unit_id
                );
            }
            if !seen_units.insert(device.unit_id) {
                bail!(
                    "device '{}': unit_id {} already taken",
                    device.device_id,
                    device.unit_id
                );
            }
            if !self.brokers.contains_key(&device.broker) {
                bail!(
                    "device '{}': broker '{}' is not configured",
                    device.device_id,
                    device.broker
                );
            }
            if device.name.len() > 10 || !device.name.is_ascii() {
                bail!(
                    "device '{}': name must be at most 10 ASCII characters",
                    device.device_id
                );
            }
            if device.gains.out_min >= device.gains.out_max {
                bail!(
                    "device '{}': out_min {} must be below out_max {}",
                    device.device_id,
                    device.gains.out_min,
                    device.gains.out_max
                );
            }
            if device.safety.freeze_limit >= device.safety.overheat_limit {
                bail!(
                    "device '{}': freeze_limit {} must be below overheat_limit {}",
                    device.device_id,
                    device.safety.freeze_limit,
                    device.safety.overheat_limit
                );
            }
            if !(0.0..=1.0).contains(&device.gains.integral_decay) {
                bail!(
                    "device '{}': integral_decay {} outside 0.0..=1.0",
                    device.device_id,
                    device.gains.integral_decay
                );
            }
        }

        Ok(())
    }
}
