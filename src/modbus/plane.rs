// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Modbus register plane
//!
//! The daemon's in-memory mirror of the Modbus-visible state. Every device
//! occupies a fixed-stride slice of four flat areas, so a SCADA client can
//! read many devices in one request without varying the unit id:
//!
//! | Area | Stride | Unit resolution |
//! |------|--------|-----------------|
//! | Holding registers | 30 | `unit = addr / 30 + 1` |
//! | Input registers | 20 | `unit = addr / 20 + 1` |
//! | Coils | 16 bits | `unit = addr / 16 + 1` |
//! | Discrete inputs | 16 bits | `unit = addr / 16 + 1` |
//!
//! ## Per-device input registers (read only)
//!
//! | Relative | Description | Scaling |
//! |----------|-------------|---------|
//! | 0 | Current temperature | INT16 × 10 |
//! | 1 | Current fan speed | UINT16, percent |
//! | 2 | Valve state | 0 = closed, 1 = open |
//! | 3 | Regulator output | INT16 × 10 |
//! | 4 | Status word | bit-packed, see below |
//! | 5..19 | Reserved | read zero |
//!
//! ## Per-device holding registers (read/write)
//!
//! | Relative | Description | Scaling |
//! |----------|-------------|---------|
//! | 0 | Setpoint temperature | INT16 × 10, raw range 50..=350 |
//! | 1 | Hysteresis (advisory) | UINT16 × 10 |
//! | 2..5 | Setpoint low/high, freeze/overheat limits (advisory) | INT16 × 10 |
//! | 10 | Command word | bit 1 enable auto, bit 2 disable auto |
//! | 20..24 | Device name | 10 ASCII bytes, space padded |
//! | others | Reserved | store and read back |
//!
//! ## Status word / discrete input bits
//!
//! `0 IS_ONLINE, 1 IS_WORKING, 2 IS_EMERGENCY_STOP, 3 TEMP_SENSOR_ERROR,
//! 4 PID_ACTIVE, 5 FREEZE_PROTECTION, 6 OVERHEAT_PROTECTION, 7 VALVE_OPEN`.
//!
//! Temperatures travel as INT16 two's complement with one decimal of
//! resolution: engineering °C = raw / 10.

use std::sync::RwLock;

use super::frame::ExceptionCode;
use crate::config::devices::{SETPOINT_MAX, SETPOINT_MIN};
use crate::registry::DeviceRegistry;
use crate::state::{DeviceState, DEFAULT_SETPOINT};

/// Holding register stride per device.
pub const HOLDING_STRIDE: u16 = 30;

/// Input register stride per device.
pub const INPUT_STRIDE: u16 = 20;

/// Coil and discrete-input stride per device, in bits.
pub const BIT_STRIDE: u16 = 16;

/// Holding: setpoint temperature (INT16 ×10, writable).
pub const HR_SETPOINT: u16 = 0;
/// Holding: hysteresis readback.
pub const HR_HYSTERESIS: u16 = 1;
/// Holding: lowest accepted setpoint readback.
pub const HR_TEMP_LOW: u16 = 2;
/// Holding: highest accepted setpoint readback.
pub const HR_TEMP_HIGH: u16 = 3;
/// Holding: freeze protection limit readback.
pub const HR_FREEZE_LIMIT: u16 = 4;
/// Holding: overheat trip limit readback.
pub const HR_OVERHEAT_LIMIT: u16 = 5;
/// Holding: command word.
pub const HR_COMMAND: u16 = 10;
/// Holding: first of five device-name registers.
pub const HR_NAME_BASE: u16 = 20;
/// Number of device-name registers.
pub const HR_NAME_LEN: u16 = 5;

/// Input: current temperature.
pub const IR_CURRENT_TEMP: u16 = 0;
/// Input: commanded fan speed.
pub const IR_FAN_SPEED: u16 = 1;
/// Input: valve state.
pub const IR_VALVE_STATE: u16 = 2;
/// Input: raw regulator output.
pub const IR_PID_OUTPUT: u16 = 3;
/// Input: status word.
pub const IR_STATUS_WORD: u16 = 4;

/// Coil: auto regulation enable.
pub const COIL_AUTO_ENABLED: u16 = 0;
/// Coil: manual override (reserved).
pub const COIL_MANUAL_OVERRIDE: u16 = 1;

/// Command word bit: enable auto regulation.
pub const COMMAND_ENABLE_AUTO: u16 = 0x0002;
/// Command word bit: disable auto regulation. Wins when both bits are set.
pub const COMMAND_DISABLE_AUTO: u16 = 0x0004;

/// Status word bit masks.
pub const STATUS_IS_ONLINE: u16 = 1 << 0;
pub const STATUS_IS_WORKING: u16 = 1 << 1;
pub const STATUS_IS_EMERGENCY_STOP: u16 = 1 << 2;
pub const STATUS_TEMP_SENSOR_ERROR: u16 = 1 << 3;
pub const STATUS_PID_ACTIVE: u16 = 1 << 4;
pub const STATUS_FREEZE_PROTECTION: u16 = 1 << 5;
pub const STATUS_OVERHEAT_PROTECTION: u16 = 1 << 6;
pub const STATUS_VALVE_OPEN: u16 = 1 << 7;

/// Register areas holding 16-bit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterArea {
    Holding,
    Input,
}

/// Register areas holding single bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitArea {
    Coils,
    Discrete,
}

/// Encode an engineering value as INT16 two's complement, ×10.
pub fn encode_scaled(value: f32) -> u16 {
    let scaled = (value * 10.0)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32);
    (scaled as i16) as u16
}

/// Decode an INT16 ×10 register into an engineering value.
pub fn decode_scaled(raw: u16) -> f32 {
    (raw as i16) as f32 / 10.0
}

/// Build the status word for a device snapshot.
pub fn status_word(state: &DeviceState) -> u16 {
    let mut word = 0;
    if state.is_online {
        word |= STATUS_IS_ONLINE;
    }
    if state.is_working {
        word |= STATUS_IS_WORKING;
    }
    if state.emergency_stop {
        word |= STATUS_IS_EMERGENCY_STOP;
    }
    if state.sensor_fault {
        word |= STATUS_TEMP_SENSOR_ERROR;
    }
    if state.auto_enabled {
        word |= STATUS_PID_ACTIVE;
    }
    if state.freeze_protection {
        word |= STATUS_FREEZE_PROTECTION;
    }
    if state.overheat_protection {
        word |= STATUS_OVERHEAT_PROTECTION;
    }
    if state.valve_state == crate::state::ValveState::Open {
        word |= STATUS_VALVE_OPEN;
    }
    word
}

/// One device's slice of all four areas.
#[derive(Debug)]
struct DeviceImage {
    discrete: u16,
    coils: u16,
    input: [u16; INPUT_STRIDE as usize],
    holding: [u16; HOLDING_STRIDE as usize],
}

impl DeviceImage {
    fn seeded(device: &crate::config::DeviceConfig) -> Self {
        let mut holding = [0u16; HOLDING_STRIDE as usize];
        holding[HR_SETPOINT as usize] = encode_scaled(DEFAULT_SETPOINT);
        holding[HR_HYSTERESIS as usize] = encode_scaled(device.safety.hysteresis);
        holding[HR_TEMP_LOW as usize] = encode_scaled(SETPOINT_MIN);
        holding[HR_TEMP_HIGH as usize] = encode_scaled(SETPOINT_MAX);
        holding[HR_FREEZE_LIMIT as usize] = encode_scaled(device.safety.freeze_limit);
        holding[HR_OVERHEAT_LIMIT as usize] = encode_scaled(device.safety.overheat_limit);

        // Name: 10 ASCII bytes, space padded, packed big-endian two per
        // register.
        let mut name = [b' '; 10];
        for (slot, byte) in name.iter_mut().zip(device.name.bytes()) {
            *slot = byte;
        }
        for i in 0..HR_NAME_LEN as usize {
            holding[HR_NAME_BASE as usize + i] =
                u16::from_be_bytes([name[i * 2], name[i * 2 + 1]]);
        }

        Self {
            discrete: 0,
            coils: 0,
            input: [0u16; INPUT_STRIDE as usize],
            holding,
        }
    }
}

/// The packed register image for every device, striped per device.
///
/// Slices are indexed by unit id; gaps in the configured unit ids stay
/// unmapped and answer with exception 02.
pub struct RegisterPlane {
    // Index 0 holds unit 1.
    slices: Vec<Option<RwLock<DeviceImage>>>,
}

impl RegisterPlane {
    /// Build and seed the plane from the device registry.
    pub fn new(registry: &DeviceRegistry) -> Self {
        let mut slices: Vec<Option<RwLock<DeviceImage>>> = Vec::new();
        slices.resize_with(registry.max_unit_id() as usize, || None);
        for device in registry.iter() {
            slices[device.unit_id as usize - 1] = Some(RwLock::new(DeviceImage::seeded(device)));
        }
        Self { slices }
    }

    fn stride(area: RegisterArea) -> u16 {
        match area {
            RegisterArea::Holding => HOLDING_STRIDE,
            RegisterArea::Input => INPUT_STRIDE,
        }
    }

    fn slice_at(&self, unit_index: usize) -> Result<&RwLock<DeviceImage>, ExceptionCode> {
        self.slices
            .get(unit_index)
            .and_then(Option::as_ref)
            .ok_or(ExceptionCode::IllegalDataAddress)
    }

    /// Resolve a flat register address to `(unit_id, relative)`.
    pub fn resolve_register(
        &self,
        area: RegisterArea,
        addr: u16,
    ) -> Result<(u8, u16), ExceptionCode> {
        let stride = Self::stride(area);
        let unit_index = (addr / stride) as usize;
        self.slice_at(unit_index)?;
        Ok((unit_index as u8 + 1, addr % stride))
    }

    /// Resolve a flat bit address to `(unit_id, bit)`.
    pub fn resolve_bit(&self, addr: u16) -> Result<(u8, u16), ExceptionCode> {
        let unit_index = (addr / BIT_STRIDE) as usize;
        self.slice_at(unit_index)?;
        Ok((unit_index as u8 + 1, addr % BIT_STRIDE))
    }

    /// Check that a register span stays inside mapped slices.
    pub fn check_register_span(
        &self,
        area: RegisterArea,
        addr: u16,
        quantity: u16,
    ) -> Result<(), ExceptionCode> {
        let end = addr
            .checked_add(quantity - 1)
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        let stride = Self::stride(area);
        for unit_index in (addr / stride)..=(end / stride) {
            self.slice_at(unit_index as usize)?;
        }
        Ok(())
    }

    /// Check that a bit span stays inside mapped slices.
    pub fn check_bit_span(&self, addr: u16, quantity: u16) -> Result<(), ExceptionCode> {
        let end = addr
            .checked_add(quantity - 1)
            .ok_or(ExceptionCode::IllegalDataAddress)?;
        for unit_index in (addr / BIT_STRIDE)..=(end / BIT_STRIDE) {
            self.slice_at(unit_index as usize)?;
        }
        Ok(())
    }

    /// Snapshot a span of registers.
    pub fn read_registers(
        &self,
        area: RegisterArea,
        addr: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, ExceptionCode> {
        self.check_register_span(area, addr, quantity)?;
        let stride = Self::stride(area);
        let mut values = Vec::with_capacity(quantity as usize);
        for offset in 0..quantity {
            let flat = addr + offset;
            let unit_index = (flat / stride) as usize;
            let rel = (flat % stride) as usize;
            let image = self
                .slice_at(unit_index)?
                .read()
                .expect("register plane lock poisoned");
            values.push(match area {
                RegisterArea::Holding => image.holding[rel],
                RegisterArea::Input => image.input[rel],
            });
        }
        Ok(values)
    }

    /// Snapshot a span of bits.
    pub fn read_bits(
        &self,
        area: BitArea,
        addr: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, ExceptionCode> {
        self.check_bit_span(addr, quantity)?;
        let mut bits = Vec::with_capacity(quantity as usize);
        for offset in 0..quantity {
            let flat = addr + offset;
            let unit_index = (flat / BIT_STRIDE) as usize;
            let bit = flat % BIT_STRIDE;
            let image = self
                .slice_at(unit_index)?
                .read()
                .expect("register plane lock poisoned");
            let word = match area {
                BitArea::Coils => image.coils,
                BitArea::Discrete => image.discrete,
            };
            bits.push(word & (1 << bit) != 0);
        }
        Ok(bits)
    }

    /// Store one holding register.
    pub fn set_holding(&self, unit_id: u8, rel: u16, value: u16) {
        if let Ok(slot) = self.slice_at(unit_id as usize - 1) {
            let mut image = slot.write().expect("register plane lock poisoned");
            image.holding[rel as usize] = value;
        }
    }

    /// Read one holding register of a device.
    pub fn get_holding(&self, unit_id: u8, rel: u16) -> Option<u16> {
        self.slice_at(unit_id as usize - 1)
            .ok()
            .map(|slot| {
                slot.read().expect("register plane lock poisoned").holding[rel as usize]
            })
    }

    /// Store one coil bit.
    pub fn set_coil(&self, unit_id: u8, bit: u16, value: bool) {
        if let Ok(slot) = self.slice_at(unit_id as usize - 1) {
            let mut image = slot.write().expect("register plane lock poisoned");
            if value {
                image.coils |= 1 << bit;
            } else {
                image.coils &= !(1 << bit);
            }
        }
    }

    /// Rewrite one device's live slices from a state snapshot.
    ///
    /// Touches the input registers, the status-backed discrete inputs, the
    /// auto coil, and the setpoint holding register; reserved holding
    /// registers keep whatever a client stored there.
    pub fn apply_snapshot(&self, unit_id: u8, state: &DeviceState) {
        let Ok(slot) = self.slice_at(unit_id as usize - 1) else {
            return;
        };
        let mut image = slot.write().expect("register plane lock poisoned");

        image.input[IR_CURRENT_TEMP as usize] = encode_scaled(state.current_temperature);
        image.input[IR_FAN_SPEED as usize] = state.fan_output.round().clamp(0.0, 100.0) as u16;
        image.input[IR_VALVE_STATE as usize] = state.valve_state.as_u16();
        image.input[IR_PID_OUTPUT as usize] = encode_scaled(state.pid_output);

        let word = status_word(state);
        image.input[IR_STATUS_WORD as usize] = word;
        // Discrete inputs mirror the low status byte; bits 8..15 reserved.
        image.discrete = word & 0x00FF;

        if state.auto_enabled {
            image.coils |= 1 << COIL_AUTO_ENABLED;
        } else {
            image.coils &= !(1 << COIL_AUTO_ENABLED);
        }

        image.holding[HR_SETPOINT as usize] = encode_scaled(state.setpoint_temperature);
    }
}
