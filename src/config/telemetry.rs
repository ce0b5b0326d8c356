// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Telemetry broker configuration
//!
//! Devices reach their physical controllers over one or more MQTT brokers.
//! Each broker gets its own connection and ingress dispatcher; devices
//! reference a broker by name.

use serde::{Deserialize, Serialize};

/// Connection settings for a single MQTT broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker hostname or IP address.
    pub host: String,

    /// Broker TCP port.
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client identifier presented to the broker.
    ///
    /// Brokers disconnect the older session when two clients share an id,
    /// so this must be unique per daemon instance.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// MQTT keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Optional username for broker authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Optional password for broker authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "heatbridge".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive(),
            username: None,
            password: None,
        }
    }
}
