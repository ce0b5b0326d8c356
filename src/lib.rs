// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! # heatbridge
//!
//! Industrial heating-control daemon. Couples a fleet of physical heating
//! controllers, reached over an MQTT telemetry bus, to a supervisory SCADA
//! client reached over Modbus TCP.
//!
//! Per device the daemon runs a 1 Hz PID regulator with hysteresis,
//! anti-windup, a minimum-output dead-zone and a seasonal valve policy,
//! enforces freeze/overheat safety limits, persists setpoints, and mirrors
//! live state into a contiguously strided Modbus register plane.
//!
//! The library surface exists for the WebSocket/HTTP façade and the test
//! suite: both drive the same command pipeline and event stream the Modbus
//! slave uses.

pub mod clock;
pub mod command;
pub mod config;
pub mod daemon;
pub mod modbus;
pub mod persistence;
pub mod registry;
pub mod regulator;
pub mod state;
pub mod telemetry;
