// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Shared device state
//!
//! This module provides the single source of truth for per-device runtime
//! state. Every surface of the daemon (telemetry ingress, the regulator, the
//! command pipeline, the Modbus reflector) observes and mutates state only
//! through [`StateStore`], which guards each device with its own lock and
//! publishes a typed event for every observable change.
//!
//! Mutations are short and never suspend; no I/O happens while a device lock
//! is held.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::registry::DeviceRegistry;

/// Capacity of the state-change broadcast channel. Subscribers that fall
/// further behind than this observe a lag error and must resynchronize from
/// a snapshot.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Default setpoint applied until the settings store says otherwise.
pub const DEFAULT_SETPOINT: f32 = 20.0;

/// Position of the heating-circuit valve relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValveState {
    /// Relay released, circuit closed off.
    Closed,
    /// Relay energized, circuit open.
    Open,
}

impl ValveState {
    /// Wire encoding used on the telemetry bus and in the register plane.
    pub fn as_u16(self) -> u16 {
        match self {
            ValveState::Closed => 0,
            ValveState::Open => 1,
        }
    }
}

/// Runtime state of a single heating controller.
///
/// One record exists per configured device; it is created at startup and
/// destroyed only on shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    /// Last measured temperature in degrees Celsius.
    pub current_temperature: f32,
    /// Active setpoint in degrees Celsius.
    pub setpoint_temperature: f32,
    /// Fan/pump output actually commanded, percent 0..100.
    pub fan_output: f32,
    /// Raw regulator output before the minimum-output cutoff.
    pub pid_output: f32,
    /// Valve relay shadow.
    pub valve_state: ValveState,
    /// Whether the closed-loop regulator is enabled.
    pub auto_enabled: bool,
    /// Emergency stop latch.
    pub emergency_stop: bool,
    /// Whether the fan is currently running (`fan_output > 0`).
    pub is_working: bool,
    /// Whether telemetry from the device is current.
    pub is_online: bool,
    /// External alarm contact state.
    pub alarm: bool,
    /// Temperature sensor considered failed (stale telemetry).
    pub sensor_fault: bool,
    /// Freeze protection currently forcing the actuators.
    pub freeze_protection: bool,
    /// Overheat protection tripped the emergency stop.
    pub overheat_protection: bool,
    /// Regulator integral accumulator.
    pub integral: f32,
    /// Regulator error of the previous tick.
    pub prev_error: f32,
    /// Timestamp of the last regulator tick, Unix milliseconds.
    pub last_tick_ms: i64,
    /// Timestamp of the last accepted temperature reading, Unix
    /// milliseconds. Zero until the first reading arrives.
    pub last_temperature_update_ms: i64,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            current_temperature: 0.0,
            setpoint_temperature: DEFAULT_SETPOINT,
            fan_output: 0.0,
            pid_output: 0.0,
            valve_state: ValveState::Closed,
            auto_enabled: false,
            emergency_stop: false,
            is_working: false,
            is_online: false,
            alarm: false,
            sensor_fault: false,
            freeze_protection: false,
            overheat_protection: false,
            integral: 0.0,
            prev_error: 0.0,
            last_tick_ms: 0,
            last_temperature_update_ms: 0,
        }
    }
}

/// Kind of an observable state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// A temperature reading was accepted.
    TempUpdated,
    /// The setpoint changed.
    SetpointChanged,
    /// The valve shadow changed.
    ValveChanged,
    /// The fan output changed.
    FanChanged,
    /// Closed-loop regulation was enabled.
    AutoEnabled,
    /// Closed-loop regulation was disabled.
    AutoDisabled,
    /// The emergency stop latched.
    Emergency,
    /// The emergency stop was released.
    EmergencyReset,
    /// A regulator tick completed.
    PidTick,
}

/// A state-change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Device the change belongs to.
    pub device_id: String,
    /// What changed.
    pub kind: EventKind,
}

/// Result of one regulator tick, applied as a single atomic mutation.
#[derive(Debug, Clone, Copy)]
pub struct TickOutcome {
    pub fan_output: f32,
    pub pid_output: f32,
    pub valve_state: ValveState,
    pub integral: f32,
    pub prev_error: f32,
    pub last_tick_ms: i64,
    pub freeze_protection: bool,
}

/// Owner of all [`DeviceState`] records.
///
/// Indexed by `device_id` and by Modbus `unit_id`. Each record sits behind
/// its own mutex; cross-device operations take no global lock.
pub struct StateStore {
    devices: HashMap<String, Mutex<DeviceState>>,
    unit_index: HashMap<u8, String>,
    events: broadcast::Sender<Event>,
}

impl StateStore {
    /// Create one state record per registered device.
    pub fn new(registry: &DeviceRegistry) -> Self {
        let mut devices = HashMap::new();
        let mut unit_index = HashMap::new();
        for config in registry.iter() {
            devices.insert(config.device_id.clone(), Mutex::new(DeviceState::default()));
            unit_index.insert(config.unit_id, config.device_id.clone());
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            devices,
            unit_index,
            events,
        }
    }

    /// Subscribe to state-change events.
    ///
    /// Per device, events arrive in mutation order. Across devices there is
    /// no ordering guarantee.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Consistent snapshot of one device.
    pub fn read(&self, device_id: &str) -> Option<DeviceState> {
        self.devices
            .get(device_id)
            .map(|m| m.lock().expect("device state lock poisoned").clone())
    }

    /// Consistent snapshot looked up by Modbus unit id.
    pub fn read_by_unit(&self, unit_id: u8) -> Option<DeviceState> {
        self.unit_index.get(&unit_id).and_then(|id| self.read(id))
    }

    /// Device id behind a unit id.
    pub fn device_for_unit(&self, unit_id: u8) -> Option<&str> {
        self.unit_index.get(&unit_id).map(String::as_str)
    }

    fn emit(&self, device_id: &str, kind: EventKind) {
        // A send error only means nobody is subscribed right now.
        let _ = self.events.send(Event {
            device_id: device_id.to_string(),
            kind,
        });
    }

    fn mutate<T>(&self, device_id: &str, f: impl FnOnce(&mut DeviceState) -> T) -> Option<T> {
        match self.devices.get(device_id) {
            Some(slot) => {
                let mut state = slot.lock().expect("device state lock poisoned");
                Some(f(&mut state))
            }
            None => {
                warn!("state mutation for unknown device '{device_id}'");
                None
            }
        }
    }

    /// Record an accepted temperature reading.
    pub fn record_temperature(&self, device_id: &str, value: f32, now_ms: i64) {
        let applied = self.mutate(device_id, |state| {
            state.current_temperature = value;
            state.last_temperature_update_ms = now_ms;
            state.is_online = true;
            state.sensor_fault = false;
        });
        if applied.is_some() {
            self.emit(device_id, EventKind::TempUpdated);
        }
    }

    /// Record the external alarm contact state.
    pub fn set_alarm(&self, device_id: &str, alarm: bool) {
        self.mutate(device_id, |state| state.alarm = alarm);
    }

    /// Mark the temperature sensor stale: the device is no longer online
    /// and the sensor-fault status bit raises.
    pub fn mark_sensor_stale(&self, device_id: &str) {
        self.mutate(device_id, |state| {
            state.is_online = false;
            state.sensor_fault = true;
        });
    }

    /// Mark every device of a broker offline (transport lost).
    pub fn mark_offline(&self, device_id: &str) {
        self.mutate(device_id, |state| state.is_online = false);
    }

    /// Enable closed-loop regulation. Clears the emergency latch and resets
    /// the regulator internals. Idempotent.
    pub fn enable_auto(&self, device_id: &str) {
        let applied = self.mutate(device_id, |state| {
            state.auto_enabled = true;
            state.emergency_stop = false;
            state.integral = 0.0;
            state.prev_error = 0.0;
        });
        if applied.is_some() {
            self.emit(device_id, EventKind::AutoEnabled);
        }
    }

    /// Disable closed-loop regulation and zero the actuator shadows.
    pub fn disable_auto(&self, device_id: &str) {
        let applied = self.mutate(device_id, |state| {
            state.auto_enabled = false;
            state.is_working = false;
            state.fan_output = 0.0;
            state.pid_output = 0.0;
            state.valve_state = ValveState::Closed;
        });
        if applied.is_some() {
            self.emit(device_id, EventKind::AutoDisabled);
        }
    }

    /// Update the setpoint. The caller is responsible for range validation.
    pub fn set_setpoint(&self, device_id: &str, setpoint: f32) {
        let applied = self.mutate(device_id, |state| {
            state.setpoint_temperature = setpoint;
        });
        if applied.is_some() {
            self.emit(device_id, EventKind::SetpointChanged);
        }
    }

    /// Apply a manual fan override. Updates both the fan shadow and the
    /// regulator output shadow so the seasonal valve policy sees it.
    pub fn set_fan_override(&self, device_id: &str, percent: f32) {
        let applied = self.mutate(device_id, |state| {
            state.fan_output = percent;
            state.pid_output = percent;
            state.is_working = percent > 0.0;
        });
        if applied.is_some() {
            self.emit(device_id, EventKind::FanChanged);
        }
    }

    /// Latch the emergency stop: regulation off, fan off, valve closed.
    pub fn emergency_stop(&self, device_id: &str, overheat: bool) {
        let applied = self.mutate(device_id, |state| {
            state.emergency_stop = true;
            state.auto_enabled = false;
            state.is_working = false;
            state.fan_output = 0.0;
            state.pid_output = 0.0;
            state.valve_state = ValveState::Closed;
            if overheat {
                state.overheat_protection = true;
            }
        });
        if applied.is_some() {
            self.emit(device_id, EventKind::Emergency);
        }
    }

    /// Release the emergency latch. Regulation stays off until an explicit
    /// `EnableAuto`.
    pub fn reset_emergency(&self, device_id: &str) {
        let applied = self.mutate(device_id, |state| {
            state.emergency_stop = false;
            state.overheat_protection = false;
        });
        if applied.is_some() {
            self.emit(device_id, EventKind::EmergencyReset);
        }
    }

    /// Apply the outcome of one regulator tick atomically.
    ///
    /// Emits `PidTick` plus `FanChanged`/`ValveChanged` for the shadows that
    /// actually moved.
    pub fn apply_tick(&self, device_id: &str, outcome: TickOutcome) {
        let changes = self.mutate(device_id, |state| {
            let fan_changed = state.fan_output != outcome.fan_output;
            let valve_changed = state.valve_state != outcome.valve_state;
            state.fan_output = outcome.fan_output;
            state.pid_output = outcome.pid_output;
            state.valve_state = outcome.valve_state;
            state.is_working = outcome.fan_output > 0.0;
            state.integral = outcome.integral;
            state.prev_error = outcome.prev_error;
            state.last_tick_ms = outcome.last_tick_ms;
            state.freeze_protection = outcome.freeze_protection;
            (fan_changed, valve_changed)
        });
        if let Some((fan_changed, valve_changed)) = changes {
            if fan_changed {
                self.emit(device_id, EventKind::FanChanged);
            }
            if valve_changed {
                self.emit(device_id, EventKind::ValveChanged);
            }
            self.emit(device_id, EventKind::PidTick);
        }
    }

    /// Set the valve shadow outside a regulator tick (startup policy sweep).
    pub fn set_valve(&self, device_id: &str, valve: ValveState) {
        let changed = self.mutate(device_id, |state| {
            let changed = state.valve_state != valve;
            state.valve_state = valve;
            changed
        });
        if changed == Some(true) {
            self.emit(device_id, EventKind::ValveChanged);
        }
    }

    /// All device ids known to the store.
    pub fn device_ids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }
}
