// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Telemetry bus
//!
//! The physical controllers are reached over a pub/sub telemetry transport.
//! This module defines the transport abstraction ([`TelemetryBus`]), the
//! per-broker hub the rest of the daemon publishes through, and the ingress
//! router that turns incoming payloads into state mutations.
//!
//! Transport failures never abort the process: parse errors drop the single
//! message, publish errors are logged and healed by the regulator's
//! once-a-second shadow reassertion.

pub mod memory;
pub mod mqtt;

use anyhow::Result;
use async_trait::async_trait;
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::DeviceConfig;
use crate::registry::DeviceRegistry;
use crate::state::{StateStore, ValveState};

/// Pub/sub transport to the physical controllers.
///
/// Payloads are byte strings; QoS and durability are the transport's
/// concern.
#[async_trait]
pub trait TelemetryBus: Send + Sync {
    /// Subscribe to a topic. Safe to call again after a reconnect.
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Publish a payload on a topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Named collection of broker connections.
///
/// Devices reference a broker by name; the hub resolves the name to the
/// right transport and formats actuator payloads the way the controllers
/// expect (plain ASCII integers).
pub struct TelemetryHub {
    buses: HashMap<String, Arc<dyn TelemetryBus>>,
}

impl TelemetryHub {
    /// Build a hub from named transports.
    pub fn new(buses: HashMap<String, Arc<dyn TelemetryBus>>) -> Self {
        Self { buses }
    }

    /// Transport for a broker name.
    pub fn bus_for(&self, broker: &str) -> Option<&Arc<dyn TelemetryBus>> {
        self.buses.get(broker)
    }

    /// Publish a fan/pump command, rounded to an integer percent.
    pub async fn publish_fan(&self, device: &DeviceConfig, percent: f32) -> Result<()> {
        let payload = format!("{}", percent.round() as i64).into_bytes();
        self.publish_raw(device, &device.topics.fan_dimmer_out, payload)
            .await
    }

    /// Publish a valve relay command (`"1"` open, `"0"` closed).
    pub async fn publish_valve(&self, device: &DeviceConfig, valve: ValveState) -> Result<()> {
        let payload = format!("{}", valve.as_u16()).into_bytes();
        self.publish_raw(device, &device.topics.valve_relay_out, payload)
            .await
    }

    async fn publish_raw(
        &self,
        device: &DeviceConfig,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        match self.bus_for(&device.broker) {
            Some(bus) => bus.publish(topic, payload).await,
            None => {
                anyhow::bail!(
                    "device '{}' references unknown broker '{}'",
                    device.device_id,
                    device.broker
                )
            }
        }
    }
}

/// What an inbound topic carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// Temperature readings, decimal text.
    Temperature,
    /// External alarm contact, "1"/"0".
    Alarm,
}

/// Inbound topic to device lookup table, built once at startup.
pub struct TopicIndex {
    map: HashMap<String, (String, TopicKind)>,
}

impl TopicIndex {
    /// Index every subscribable topic of every registered device.
    pub fn from_registry(registry: &DeviceRegistry) -> Self {
        let mut map = HashMap::new();
        for device in registry.iter() {
            map.insert(
                device.topics.temperature_in.clone(),
                (device.device_id.clone(), TopicKind::Temperature),
            );
            if let Some(alarm) = &device.topics.alarm_in {
                map.insert(
                    alarm.clone(),
                    (device.device_id.clone(), TopicKind::Alarm),
                );
            }
        }
        Self { map }
    }

    /// Resolve a topic to the owning device.
    pub fn resolve(&self, topic: &str) -> Option<(&str, TopicKind)> {
        self.map
            .get(topic)
            .map(|(device_id, kind)| (device_id.as_str(), *kind))
    }

    /// All indexed topics (the subscription list).
    pub fn topics(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }
}

/// Parse a decimal temperature payload.
pub fn parse_temperature(payload: &[u8]) -> Option<f32> {
    let text = std::str::from_utf8(payload).ok()?;
    let value: f32 = text.trim().parse().ok()?;
    value.is_finite().then_some(value)
}

/// Parse a boolean contact payload ("1"/"0"/"true"/"false").
pub fn parse_flag(payload: &[u8]) -> Option<bool> {
    match std::str::from_utf8(payload).ok()?.trim() {
        "1" | "true" | "ON" | "on" => Some(true),
        "0" | "false" | "OFF" | "off" => Some(false),
        _ => None,
    }
}

/// Routes inbound telemetry payloads into the state store.
pub struct IngressRouter {
    index: TopicIndex,
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
}

impl IngressRouter {
    pub fn new(index: TopicIndex, store: Arc<StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            index,
            store,
            clock,
        }
    }

    /// Topics this router wants subscribed.
    pub fn topics(&self) -> Vec<String> {
        self.index.topics()
    }

    /// Handle one inbound message. Unparseable payloads are dropped with a
    /// warning and do not affect subscriptions.
    pub fn route(&self, topic: &str, payload: &[u8]) {
        let Some((device_id, kind)) = self.index.resolve(topic) else {
            warn!("telemetry on unhandled topic '{topic}'");
            return;
        };

        match kind {
            TopicKind::Temperature => match parse_temperature(payload) {
                Some(value) => {
                    self.store
                        .record_temperature(device_id, value, self.clock.now_ms());
                }
                None => {
                    warn!(
                        "device '{device_id}': unparseable temperature payload {:?}",
                        String::from_utf8_lossy(payload)
                    );
                }
            },
            TopicKind::Alarm => match parse_flag(payload) {
                Some(alarm) => self.store.set_alarm(device_id, alarm),
                None => {
                    warn!(
                        "device '{device_id}': unparseable alarm payload {:?}",
                        String::from_utf8_lossy(payload)
                    );
                }
            },
        }
    }
}
