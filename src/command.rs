// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Command pipeline
//!
//! Commands from every surface (Modbus writes, the WebSocket/HTTP façade,
//! internal safety trips) are funneled through a single MPSC queue and
//! applied serially by the dispatcher task, so per-device mutations never
//! race. Validation happens before a command is accepted; actuation errors
//! after a successful mutation are logged and healed by the regulator's
//! shadow reassertion on the next tick.

use log::{error, info, warn};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::devices::{SETPOINT_MAX, SETPOINT_MIN};
use crate::persistence::{SettingsStore, SETPOINT_KEY};
use crate::registry::DeviceRegistry;
use crate::state::{StateStore, ValveState};
use crate::telemetry::TelemetryHub;

/// A control request addressed to one device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Enable closed-loop regulation (clears an emergency latch).
    EnableAuto,
    /// Disable closed-loop regulation and stop the actuators.
    DisableAuto,
    /// Change the temperature setpoint (°C).
    SetTemperature(f32),
    /// Drive the fan directly (percent), without touching the auto flag.
    SetFanSpeed(f32),
    /// Latch the emergency stop.
    EmergencyStop,
    /// Release the emergency latch.
    ResetEmergency,
}

/// Where a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Modbus,
    WebSocket,
    Http,
    Internal,
}

/// A command plus its addressing and provenance.
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    pub device_id: String,
    pub command: Command,
    pub source: CommandSource,
}

/// Why a command was rejected.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Command {
    /// Range-check the command's argument. Pure, so every surface can
    /// reject bad input before it enters the queue.
    pub fn validate(&self) -> Result<(), CommandError> {
        match *self {
            Command::SetTemperature(t) => {
                if !t.is_finite() || !(SETPOINT_MIN..=SETPOINT_MAX).contains(&t) {
                    return Err(CommandError::InvalidArgument(format!(
                        "setpoint {t} °C outside {SETPOINT_MIN}..={SETPOINT_MAX}"
                    )));
                }
            }
            Command::SetFanSpeed(s) => {
                if !s.is_finite() || !(0.0..=100.0).contains(&s) {
                    return Err(CommandError::InvalidArgument(format!(
                        "fan speed {s} % outside 0..=100"
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Cloneable handle for enqueueing commands.
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<CommandEnvelope>,
}

impl CommandSender {
    /// Enqueue a command. A closed queue means the daemon is shutting
    /// down; the command is dropped with a warning.
    pub fn send(&self, envelope: CommandEnvelope) {
        if self.tx.send(envelope).is_err() {
            warn!("command queue closed, command dropped");
        }
    }
}

/// Create the command queue.
pub fn command_channel() -> (CommandSender, mpsc::UnboundedReceiver<CommandEnvelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandSender { tx }, rx)
}

/// Everything command execution needs.
pub struct CommandContext {
    pub store: Arc<StateStore>,
    pub registry: Arc<DeviceRegistry>,
    pub hub: Arc<TelemetryHub>,
    pub settings: Arc<dyn SettingsStore>,
}

/// Apply one command: validate, mutate state, then actuate and persist.
///
/// State mutations happen before any I/O; publish and persistence failures
/// are logged, never unwound — the regulator reasserts actuator shadows
/// every second and the in-memory setpoint wins over a dead settings store.
pub async fn execute(ctx: &CommandContext, envelope: CommandEnvelope) -> Result<(), CommandError> {
    let device = ctx
        .registry
        .get(&envelope.device_id)
        .ok_or_else(|| CommandError::UnknownDevice(envelope.device_id.clone()))?
        .clone();
    envelope.command.validate()?;

    let device_id = device.device_id.as_str();
    match envelope.command {
        Command::EnableAuto => {
            ctx.store.enable_auto(device_id);
            info!("device '{device_id}': auto regulation enabled ({:?})", envelope.source);
        }
        Command::DisableAuto => {
            ctx.store.disable_auto(device_id);
            info!("device '{device_id}': auto regulation disabled ({:?})", envelope.source);
            if let Err(e) = ctx.hub.publish_fan(&device, 0.0).await {
                error!("device '{device_id}': fan stop publish failed: {e:#}");
            }
            if let Err(e) = ctx.hub.publish_valve(&device, ValveState::Closed).await {
                error!("device '{device_id}': valve close publish failed: {e:#}");
            }
        }
        Command::SetTemperature(setpoint) => {
            ctx.store.set_setpoint(device_id, setpoint);
            info!("device '{device_id}': setpoint {setpoint} °C ({:?})", envelope.source);
            if let Err(e) = ctx
                .settings
                .set(device_id, SETPOINT_KEY, &format!("{setpoint}"))
                .await
            {
                warn!("device '{device_id}': setpoint persistence failed: {e:#}");
            }
        }
        Command::SetFanSpeed(percent) => {
            ctx.store.set_fan_override(device_id, percent);
            info!("device '{device_id}': fan override {percent} % ({:?})", envelope.source);
            if let Err(e) = ctx.hub.publish_fan(&device, percent).await {
                error!("device '{device_id}': fan publish failed: {e:#}");
            }
        }
        Command::EmergencyStop => {
            execute_emergency(ctx, device_id, false).await;
        }
        Command::ResetEmergency => {
            ctx.store.reset_emergency(device_id);
            info!("device '{device_id}': emergency reset ({:?})", envelope.source);
        }
    }

    Ok(())
}

/// Latch the emergency stop and drive the actuators to their safe state.
///
/// Shared between the command pipeline and the regulator's overheat trip
/// (which sets `overheat`), so both enter the same mutation path.
pub async fn execute_emergency(ctx: &CommandContext, device_id: &str, overheat: bool) {
    let Some(device) = ctx.registry.get(device_id).cloned() else {
        warn!("emergency stop for unknown device '{device_id}'");
        return;
    };

    ctx.store.emergency_stop(device_id, overheat);
    warn!(
        "device '{device_id}': EMERGENCY STOP{}",
        if overheat { " (overheat)" } else { "" }
    );

    if let Err(e) = ctx.hub.publish_fan(&device, 0.0).await {
        error!("device '{device_id}': emergency fan stop publish failed: {e:#}");
    }
    if let Err(e) = ctx.hub.publish_valve(&device, ValveState::Closed).await {
        error!("device '{device_id}': emergency valve close publish failed: {e:#}");
    }
}

/// Spawn the dispatcher task draining the command queue.
pub fn spawn_dispatcher(
    ctx: Arc<CommandContext>,
    mut rx: mpsc::UnboundedReceiver<CommandEnvelope>,
    running: Arc<AtomicBool>,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move {
        info!("command dispatcher started");
        loop {
            tokio::select! {
                envelope = rx.recv() => match envelope {
                    Some(envelope) => {
                        let device_id = envelope.device_id.clone();
                        if let Err(e) = execute(&ctx, envelope).await {
                            warn!("device '{device_id}': command rejected: {e}");
                        }
                    }
                    None => break,
                },
                _ = time::sleep(Duration::from_secs(1)) => {
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
        }
        info!("command dispatcher stopped");
        Ok(())
    })
}
