// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Durable per-device settings
//!
//! A minimal key/value contract over `(device_id, key) → String`, backed by
//! SQLite. The core persists exactly one key: the temperature setpoint, so a
//! restart does not reset the plant to defaults. Persistence failures are
//! logged and never revert in-memory state.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::devices::{SETPOINT_MAX, SETPOINT_MIN};
use crate::registry::DeviceRegistry;
use crate::state::StateStore;

/// Settings key under which the setpoint is stored.
pub const SETPOINT_KEY: &str = "setpoint_temperature";

/// Durable key/value store over `(device_id, key)`.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Read a setting, `None` if it was never written.
    async fn get(&self, device_id: &str, key: &str) -> Result<Option<String>>;

    /// Write a setting, overwriting any previous value.
    async fn set(&self, device_id: &str, key: &str, value: &str) -> Result<()>;
}

/// SQLite-backed settings store.
pub struct SqliteSettingsStore {
    pool: SqlitePool,
}

impl SqliteSettingsStore {
    /// Open (and if necessary create) the database, then run the schema
    /// migration.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid settings store url '{url}'"))?
            .create_if_missing(true);

        // A single pooled connection: the write rate is one setpoint per
        // operator action, and `sqlite::memory:` databases are per
        // connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open settings store '{url}'"))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS device_settings (
                device_id TEXT NOT NULL,
                key       TEXT NOT NULL,
                value     TEXT NOT NULL,
                PRIMARY KEY (device_id, key)
            )",
        )
        .execute(&self.pool)
        .await
        .context("settings store migration failed")?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for SqliteSettingsStore {
    async fn get(&self, device_id: &str, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT value FROM device_settings WHERE device_id = ?1 AND key = ?2",
        )
        .bind(device_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("settings read failed for '{device_id}'/'{key}'"))?;
        Ok(value)
    }

    async fn set(&self, device_id: &str, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO device_settings (device_id, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (device_id, key) DO UPDATE SET value = excluded.value",
        )
        .bind(device_id)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("settings write failed for '{device_id}'/'{key}'"))?;
        Ok(())
    }
}

/// Volatile settings store for tests.
#[derive(Default)]
pub struct MemorySettingsStore {
    map: std::sync::Mutex<std::collections::HashMap<(String, String), String>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self, device_id: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .map
            .lock()
            .expect("settings lock poisoned")
            .get(&(device_id.to_string(), key.to_string()))
            .cloned())
    }

    async fn set(&self, device_id: &str, key: &str, value: &str) -> Result<()> {
        self.map
            .lock()
            .expect("settings lock poisoned")
            .insert((device_id.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}

/// Restore persisted setpoints into the state store at startup.
///
/// Values outside the accepted range (or unparseable) are ignored and the
/// default stands; a dead store is logged and the daemon continues with
/// defaults.
pub async fn restore_setpoints(
    settings: &Arc<dyn SettingsStore>,
    registry: &DeviceRegistry,
    store: &StateStore,
) {
    for device in registry.iter() {
        match settings.get(&device.device_id, SETPOINT_KEY).await {
            Ok(Some(raw)) => match raw.parse::<f32>() {
                Ok(value) if (SETPOINT_MIN..=SETPOINT_MAX).contains(&value) => {
                    info!(
                        "device '{}': restored setpoint {value} °C",
                        device.device_id
                    );
                    store.set_setpoint(&device.device_id, value);
                }
                _ => {
                    warn!(
                        "device '{}': ignoring persisted setpoint '{raw}'",
                        device.device_id
                    );
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(
                    "device '{}': settings store read failed: {e:#}",
                    device.device_id
                );
            }
        }
    }
}
