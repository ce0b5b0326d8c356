// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Per-device configuration
//!
//! This module provides the configuration structures for the heating
//! controllers managed by the daemon: telemetry topics, regulator gains,
//! safety limits, and the Modbus unit id that anchors the device's slice of
//! the register plane.

use serde::{Deserialize, Serialize};

/// Lowest accepted setpoint temperature in degrees Celsius.
pub const SETPOINT_MIN: f32 = 5.0;

/// Highest accepted setpoint temperature in degrees Celsius.
pub const SETPOINT_MAX: f32 = 35.0;

/// Configuration for a single heating controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique identifier for this device.
    pub device_id: String,

    /// Human-readable name, exported through the Modbus register map
    /// (10 ASCII characters, space-padded).
    #[serde(default)]
    pub name: String,

    /// Modbus unit id (1..247, unique across the fleet).
    ///
    /// The device's slice of the flat register space starts at
    /// `(unit_id - 1) * stride` in every Modbus area.
    pub unit_id: u8,

    /// Name of the telemetry broker this device is reached through
    /// (reference to a key of the top-level `brokers` table).
    pub broker: String,

    /// Telemetry topic names.
    pub topics: DeviceTopics,

    /// Regulator gains and output limits.
    #[serde(default)]
    pub gains: RegulatorGains,

    /// Safety limits and protections.
    #[serde(default)]
    pub safety: SafetyLimits,
}

/// Telemetry topics for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTopics {
    /// Topic carrying temperature readings (decimal text payloads).
    pub temperature_in: String,

    /// Topic the valve relay command is published on ("1" open, "0" closed).
    pub valve_relay_out: String,

    /// Topic the fan/pump dimmer command is published on (integer 0..100).
    pub fan_dimmer_out: String,

    /// Optional topic carrying an external alarm contact ("1"/"0").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_in: Option<String>,
}

/// PID regulator gains and output limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegulatorGains {
    /// Proportional gain.
    #[serde(default = "default_kp")]
    pub kp: f32,

    /// Integral gain.
    #[serde(default = "default_ki")]
    pub ki: f32,

    /// Derivative gain.
    #[serde(default = "default_kd")]
    pub kd: f32,

    /// Lower saturation bound for the regulator output, in percent.
    #[serde(default)]
    pub out_min: f32,

    /// Upper saturation bound for the regulator output, in percent.
    #[serde(default = "default_out_max")]
    pub out_max: f32,

    /// Decay factor applied to the integral term while the error is
    /// negative (over-temperature). The integral is bled down instead of
    /// clamped so accumulated heat demand cannot hold the fan on.
    #[serde(default = "default_integral_decay")]
    pub integral_decay: f32,
}

fn default_kp() -> f32 {
    8.0
}

fn default_ki() -> f32 {
    0.2
}

fn default_kd() -> f32 {
    1.0
}

fn default_out_max() -> f32 {
    100.0
}

fn default_integral_decay() -> f32 {
    0.95
}

impl Default for RegulatorGains {
    fn default() -> Self {
        Self {
            kp: default_kp(),
            ki: default_ki(),
            kd: default_kd(),
            out_min: 0.0,
            out_max: default_out_max(),
            integral_decay: default_integral_decay(),
        }
    }
}

/// Safety limits for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Below this temperature the fan is forced to maximum and the valve
    /// opened, regardless of the regulator state.
    #[serde(default = "default_freeze_limit")]
    pub freeze_limit: f32,

    /// Above this temperature the device trips into emergency stop.
    #[serde(default = "default_overheat_limit")]
    pub overheat_limit: f32,

    /// Half-width of the dead band around the setpoint inside which the
    /// actuator is not switched off, in degrees Celsius.
    #[serde(default = "default_hysteresis")]
    pub hysteresis: f32,

    /// Regulator outputs below this percentage are forced to zero. Below
    /// roughly 15 % the dimmer hardware misbehaves, so this is a physical
    /// actuator constraint rather than a tuning parameter.
    #[serde(default = "default_min_output_threshold")]
    pub min_output_threshold: f32,

    /// Seconds without a temperature reading before the sensor is
    /// considered failed and the device marked offline.
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,
}

fn default_freeze_limit() -> f32 {
    3.0
}

fn default_overheat_limit() -> f32 {
    35.0
}

fn default_hysteresis() -> f32 {
    0.5
}

fn default_min_output_threshold() -> f32 {
    15.0
}

fn default_stale_threshold() -> u64 {
    30
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            freeze_limit: default_freeze_limit(),
            overheat_limit: default_overheat_limit(),
            hysteresis: default_hysteresis(),
            min_output_threshold: default_min_output_threshold(),
            stale_threshold_secs: default_stale_threshold(),
        }
    }
}
