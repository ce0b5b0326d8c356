// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! In-process telemetry bus
//!
//! Records every publish and subscription instead of talking to a broker.
//! Used by the test suite the way the hardware mock driver is used in
//! bench setups: same trait, no transport underneath.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

use super::TelemetryBus;

/// Telemetry bus that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryBus {
    subscriptions: Mutex<HashSet<String>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topics subscribed so far.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .expect("memory bus lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Every payload published on a topic, oldest first, as UTF-8.
    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .expect("memory bus lock poisoned")
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| String::from_utf8_lossy(p).into_owned())
            .collect()
    }

    /// The most recent payload published on a topic, as UTF-8.
    pub fn last_published(&self, topic: &str) -> Option<String> {
        self.published_on(topic).pop()
    }

    /// Drop the publish history.
    pub fn clear_published(&self) {
        self.published
            .lock()
            .expect("memory bus lock poisoned")
            .clear();
    }
}

#[async_trait]
impl TelemetryBus for MemoryBus {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.subscriptions
            .lock()
            .expect("memory bus lock poisoned")
            .insert(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.published
            .lock()
            .expect("memory bus lock poisoned")
            .push((topic.to_string(), payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_publishes_in_order() {
        let bus = MemoryBus::new();
        bus.publish("a/fan", b"40".to_vec()).await.unwrap();
        bus.publish("a/fan", b"0".to_vec()).await.unwrap();
        bus.publish("a/valve", b"1".to_vec()).await.unwrap();

        assert_eq!(bus.published_on("a/fan"), vec!["40", "0"]);
        assert_eq!(bus.last_published("a/valve").as_deref(), Some("1"));
        assert!(bus.published_on("a/other").is_empty());
    }
}
