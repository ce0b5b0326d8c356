// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Settings store configuration

use serde::{Deserialize, Serialize};

/// Configuration for the durable settings store.
///
/// The store keeps per-device settings (currently only the temperature
/// setpoint) across daemon restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsStoreConfig {
    /// SQLite connection URL.
    ///
    /// `mode=rwc` creates the database file if it does not exist. Use
    /// `sqlite::memory:` for a volatile store.
    #[serde(default = "default_url")]
    pub url: String,
}

fn default_url() -> String {
    "sqlite:heatbridge.db?mode=rwc".to_string()
}

impl Default for SettingsStoreConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
        }
    }
}
