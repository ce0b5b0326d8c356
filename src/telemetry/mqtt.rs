// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! MQTT telemetry transport
//!
//! One [`MqttBus`] per configured broker. The bus wraps a `rumqttc` async
//! client; a companion dispatcher task drives the event loop, routes inbound
//! publishes into the state store, and re-issues every subscription on each
//! `ConnAck` — brokers can lose session state across reconnects even with a
//! persistent session requested.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

use super::{IngressRouter, TelemetryBus};
use crate::config::BrokerConfig;
use crate::state::StateStore;

/// Backoff between reconnect attempts after an event-loop error.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// MQTT-backed telemetry transport for one broker.
pub struct MqttBus {
    name: String,
    client: AsyncClient,
}

impl MqttBus {
    /// Create the client for a broker. The returned event loop must be
    /// handed to [`MqttBus::spawn_dispatcher`].
    pub fn connect(name: &str, config: &BrokerConfig) -> (Arc<Self>, EventLoop) {
        let client_id = format!("{}-{}", config.client_id, name);
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
            info!("broker '{name}': using password authentication");
        }

        let (client, eventloop) = AsyncClient::new(options, 32);
        (
            Arc::new(Self {
                name: name.to_string(),
                client,
            }),
            eventloop,
        )
    }

    /// Spawn the dispatcher task for this broker.
    ///
    /// The task polls the event loop until the running flag drops, routing
    /// inbound publishes through `router` and marking `device_ids` offline
    /// while the connection is down. Event-loop errors are backed off and
    /// retried; they never abort the daemon.
    pub fn spawn_dispatcher(
        bus: Arc<Self>,
        mut eventloop: EventLoop,
        router: Arc<IngressRouter>,
        store: Arc<StateStore>,
        device_ids: Vec<String>,
        topics: Vec<String>,
        running: Arc<AtomicBool>,
    ) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            info!("telemetry dispatcher for broker '{}' started", bus.name);

            while running.load(Ordering::Relaxed) {
                tokio::select! {
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            router.route(&publish.topic, &publish.payload);
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("broker '{}' connected, replaying {} subscriptions",
                                bus.name, topics.len());
                            for topic in &topics {
                                if let Err(e) = bus.subscribe(topic).await {
                                    error!("broker '{}': re-subscribe '{}' failed: {e}",
                                        bus.name, topic);
                                }
                            }
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            warn!("broker '{}' disconnected", bus.name);
                            for device_id in &device_ids {
                                store.mark_offline(device_id);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("broker '{}' event loop error: {e}", bus.name);
                            for device_id in &device_ids {
                                store.mark_offline(device_id);
                            }
                            time::sleep(RECONNECT_BACKOFF).await;
                        }
                    },
                    _ = time::sleep(Duration::from_secs(1)) => {
                        // Wake up to observe the running flag.
                    }
                }
            }

            debug!("telemetry dispatcher for broker '{}' stopping", bus.name);
            Ok(())
        })
    }
}

#[async_trait]
impl TelemetryBus for MqttBus {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .with_context(|| format!("broker '{}': subscribe '{topic}' failed", self.name))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .with_context(|| format!("broker '{}': publish '{topic}' failed", self.name))
    }
}
