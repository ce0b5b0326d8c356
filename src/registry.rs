// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Device registry
//!
//! The registry is the immutable device table built from configuration at
//! startup. It is indexed both by `device_id` (telemetry, commands) and by
//! `unit_id` (the Modbus register plane).

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Config, DeviceConfig};

/// Immutable table of configured devices.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: Vec<Arc<DeviceConfig>>,
    by_id: HashMap<String, usize>,
    by_unit: HashMap<u8, usize>,
}

impl DeviceRegistry {
    /// Build the registry from a validated configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let devices: Vec<Arc<DeviceConfig>> =
            config.devices.iter().cloned().map(Arc::new).collect();

        let mut by_id = HashMap::new();
        let mut by_unit = HashMap::new();
        for (index, device) in devices.iter().enumerate() {
            by_id.insert(device.device_id.clone(), index);
            by_unit.insert(device.unit_id, index);
        }

        Ok(Self {
            devices,
            by_id,
            by_unit,
        })
    }

    /// Look up a device by its identifier.
    pub fn get(&self, device_id: &str) -> Option<&Arc<DeviceConfig>> {
        self.by_id.get(device_id).map(|&i| &self.devices[i])
    }

    /// Look up a device by its Modbus unit id.
    pub fn get_by_unit(&self, unit_id: u8) -> Option<&Arc<DeviceConfig>> {
        self.by_unit.get(&unit_id).map(|&i| &self.devices[i])
    }

    /// Iterate over all devices in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DeviceConfig>> {
        self.devices.iter()
    }

    /// Number of configured devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Highest configured unit id, which sizes the register plane.
    pub fn max_unit_id(&self) -> u8 {
        self.devices.iter().map(|d| d.unit_id).max().unwrap_or(0)
    }
}
