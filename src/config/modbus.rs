// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Modbus TCP slave configuration
//!
//! This module defines the structures for configuring the Modbus TCP server
//! component of the heating-control daemon.

use serde::{Deserialize, Serialize};

/// Configuration for the Modbus TCP slave.
///
/// The slave exposes every configured device as a strided slice of a flat
/// register space, so a SCADA client can read the whole plant in a handful
/// of requests. See the register map documentation in `modbus::plane`.
///
/// # Example
///
/// ```
/// use heatbridge::config::ModbusConfig;
///
/// let modbus_config = ModbusConfig {
///     enabled: true,
///     port: 8503,
///     address: "0.0.0.0".to_string(),
///     ..ModbusConfig::default()
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Flag to enable or disable the Modbus slave.
    ///
    /// When disabled, no listener is started and no resources are used.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// The TCP port the slave will listen on.
    ///
    /// Default is 8503. The standard Modbus port 502 requires elevated
    /// privileges on most systems, so an unprivileged port is the default.
    #[serde(default = "default_port")]
    pub port: u16,

    /// The network address the slave will bind to.
    ///
    /// Default is "0.0.0.0" (all IPv4 interfaces); the Modbus protocol has
    /// no authentication and the network is assumed trusted.
    #[serde(default = "default_address")]
    pub address: String,

    /// Idle timeout for client sockets, in seconds.
    ///
    /// A connection that stays silent for longer than this is closed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_port() -> u16 {
    8503
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_idle_timeout() -> u64 {
    60
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            port: default_port(),
            address: default_address(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}
