// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Daemon task manager
//!
//! Coordinates the background services of the heating-control daemon: the
//! telemetry dispatchers, one regulator task per device, the command
//! dispatcher, and the Modbus slave with its reflector and sweep tasks.
//!
//! All tasks share a single atomic running flag; [`Daemon::shutdown`] drops
//! it and every task winds down within roughly one period of its loop.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

use crate::clock::{Clock, SystemClock};
use crate::command::{self, command_channel, CommandContext, CommandSender};
use crate::config::Config;
use crate::modbus::server::{spawn_plane_sweep, spawn_reflector, sweep_all};
use crate::modbus::{ModbusHandler, ModbusServer, RegisterPlane};
use crate::persistence::{restore_setpoints, SettingsStore, SqliteSettingsStore};
use crate::registry::DeviceRegistry;
use crate::regulator::{startup_valve_sweep, Regulator};
use crate::state::StateStore;
use crate::telemetry::mqtt::MqttBus;
use crate::telemetry::{IngressRouter, TelemetryBus, TelemetryHub, TopicIndex};

/// Coordinates the daemon's background services.
///
/// The `running` flag is shared with every spawned task; tasks poll it and
/// terminate gracefully once it drops. `join` waits for them with a
/// timeout so one hung task cannot block shutdown forever.
pub struct Daemon {
    tasks: Vec<JoinHandle<Result<()>>>,
    running: Arc<AtomicBool>,
    ctx: Option<Arc<CommandContext>>,
    commands: Option<CommandSender>,
    plane: Option<Arc<RegisterPlane>>,
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Daemon {
    /// Create a daemon with no services started.
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
            ctx: None,
            commands: None,
            plane: None,
        }
    }

    /// Launch all services described by the configuration.
    ///
    /// Startup order matters: settings restore before the register plane is
    /// first swept, the valve sweep before the regulators start ticking.
    ///
    /// ### Errors
    ///
    /// Fails fatally if the device table is invalid, the settings store
    /// cannot be opened, or the Modbus listener cannot bind its port.
    pub async fn launch(&mut self, config: Config) -> Result<()> {
        let registry = Arc::new(DeviceRegistry::from_config(&config)?);
        if registry.is_empty() {
            warn!("no devices configured, nothing to regulate");
        }
        let store = Arc::new(StateStore::new(&registry));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        // Durable settings: restore persisted setpoints before anything
        // mirrors the state.
        let settings: Arc<dyn SettingsStore> = Arc::new(
            SqliteSettingsStore::connect(&config.settings_store.url)
                .await
                .context("settings store startup failed")?,
        );
        restore_setpoints(&settings, &registry, &store).await;

        // Telemetry: one broker connection plus ingress dispatcher each.
        let router = Arc::new(IngressRouter::new(
            TopicIndex::from_registry(&registry),
            Arc::clone(&store),
            Arc::clone(&clock),
        ));
        let mut buses: HashMap<String, Arc<dyn TelemetryBus>> = HashMap::new();
        for (name, broker_config) in &config.brokers {
            let (bus, eventloop) = MqttBus::connect(name, broker_config);
            let broker_devices: Vec<_> = registry
                .iter()
                .filter(|d| &d.broker == name)
                .collect();
            let device_ids = broker_devices
                .iter()
                .map(|d| d.device_id.clone())
                .collect();
            let mut topics: Vec<String> = broker_devices
                .iter()
                .map(|d| d.topics.temperature_in.clone())
                .collect();
            topics.extend(
                broker_devices
                    .iter()
                    .filter_map(|d| d.topics.alarm_in.clone()),
            );

            // Subscriptions are issued (and re-issued) on every ConnAck
            // inside the dispatcher.
            let task = MqttBus::spawn_dispatcher(
                Arc::clone(&bus),
                eventloop,
                Arc::clone(&router),
                Arc::clone(&store),
                device_ids,
                topics,
                self.running.clone(),
            );
            self.tasks.push(task);
            buses.insert(name.clone(), bus);
        }
        let hub = Arc::new(TelemetryHub::new(buses));

        let ctx = Arc::new(CommandContext {
            store: Arc::clone(&store),
            registry: Arc::clone(&registry),
            hub,
            settings,
        });
        self.ctx = Some(Arc::clone(&ctx));

        // The seasonal valve policy is asserted once for every device,
        // independent of the regulator schedule.
        startup_valve_sweep(&ctx, &clock).await;

        // Command pipeline.
        let (commands, command_rx) = command_channel();
        self.commands = Some(commands.clone());
        self.tasks.push(command::spawn_dispatcher(
            Arc::clone(&ctx),
            command_rx,
            self.running.clone(),
        ));

        // One regulator task per device.
        for device in registry.iter() {
            let regulator = Regulator::new(
                Arc::clone(device),
                Arc::clone(&ctx),
                Arc::clone(&clock),
            );
            self.tasks.push(regulator.spawn(self.running.clone()));
        }

        // Modbus slave.
        if config.modbus.enabled {
            self.start_modbus_server(&config, &registry, &store, commands)
                .await?;
        }

        self.start_heartbeat();
        info!(
            "daemon launched: {} devices, {} brokers, modbus {}",
            registry.len(),
            config.brokers.len(),
            if config.modbus.enabled { "on" } else { "off" }
        );
        Ok(())
    }

    /// Bind and start the Modbus slave, reflector, and sweep tasks.
    async fn start_modbus_server(
        &mut self,
        config: &Config,
        registry: &Arc<DeviceRegistry>,
        store: &Arc<StateStore>,
        commands: CommandSender,
    ) -> Result<()> {
        info!(
            "starting Modbus slave on {}:{}",
            config.modbus.address, config.modbus.port
        );

        let plane = Arc::new(RegisterPlane::new(registry));
        // Load the restored state into the plane before the first client
        // connects.
        sweep_all(&plane, store, registry);
        self.plane = Some(Arc::clone(&plane));

        let handler = Arc::new(ModbusHandler::new(
            Arc::clone(&plane),
            Arc::clone(registry),
            commands,
        ));

        // A bind failure is fatal: without the SCADA surface the daemon is
        // not doing its job.
        let listener = ModbusServer::bind(&config.modbus.address, config.modbus.port).await?;
        let server = ModbusServer::new(
            handler,
            Duration::from_secs(config.modbus.idle_timeout_secs),
        );
        let running = self.running.clone();
        self.tasks
            .push(tokio::spawn(async move { server.serve(listener, running).await }));

        self.tasks.push(spawn_reflector(
            Arc::clone(&plane),
            Arc::clone(store),
            Arc::clone(registry),
            self.running.clone(),
        ));
        self.tasks.push(spawn_plane_sweep(
            plane,
            Arc::clone(store),
            Arc::clone(registry),
            self.running.clone(),
        ));
        Ok(())
    }

    /// Periodic heartbeat log for external liveness monitoring.
    fn start_heartbeat(&mut self) {
        let running = self.running.clone();
        let task = tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                debug!("daemon heartbeat: running");
                time::sleep(Duration::from_secs(60)).await;
            }
            Ok(())
        });
        self.tasks.push(task);
    }

    /// Handle for the WebSocket/HTTP façade to enqueue commands.
    pub fn command_sender(&self) -> Option<CommandSender> {
        self.commands.clone()
    }

    /// Shared state store, for snapshot reads and event subscriptions.
    pub fn state_store(&self) -> Option<Arc<StateStore>> {
        self.ctx.as_ref().map(|ctx| Arc::clone(&ctx.store))
    }

    /// The Modbus register plane, if the slave is running.
    pub fn register_plane(&self) -> Option<Arc<RegisterPlane>> {
        self.plane.clone()
    }

    /// Signal every task to stop. Does not wait; call [`Daemon::join`].
    pub fn shutdown(&self) {
        info!("shutting down daemon tasks");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait for all tasks to finish, with a per-task timeout.
    pub async fn join(self) -> Result<()> {
        for task in self.tasks {
            match time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => error!("task ended with error: {e:#}"),
                Ok(Err(e)) => error!("task panicked: {e}"),
                Err(_) => warn!("task did not stop within timeout, may be hung"),
            }
        }
        Ok(())
    }
}
