// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! Per-device regulator
//!
//! One regulator task per device, ticking at 1 Hz. Every tick evaluates
//! telemetry staleness and the safety trips; the PID control law itself only
//! runs while auto regulation is enabled and the emergency latch is clear.
//! Actuator shadows are republished on each tick, so a lost telemetry
//! publish heals within one second.

pub mod pid;
pub mod valve;

use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

use crate::clock::Clock;
use crate::command::{self, CommandContext};
use crate::config::DeviceConfig;
use crate::state::{TickOutcome, ValveState};
use pid::PidController;
use valve::valve_target;

/// Regulator period. The PID gains assume this step; see [`pid`].
const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Closed-loop regulator for one device.
pub struct Regulator {
    device: Arc<DeviceConfig>,
    ctx: Arc<CommandContext>,
    clock: Arc<dyn Clock>,
    pid: PidController,
    was_auto: bool,
}

impl Regulator {
    pub fn new(device: Arc<DeviceConfig>, ctx: Arc<CommandContext>, clock: Arc<dyn Clock>) -> Self {
        let pid = PidController::new(&device.gains);
        Self {
            device,
            ctx,
            clock,
            pid,
            was_auto: false,
        }
    }

    /// Spawn the 1 Hz regulator task. The task completes its current tick
    /// and exits within one period after the running flag drops.
    pub fn spawn(mut self, running: Arc<AtomicBool>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            info!("regulator for device '{}' started", self.device.device_id);
            let mut interval = time::interval(TICK_PERIOD);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            while running.load(Ordering::Relaxed) {
                interval.tick().await;
                self.tick().await;
            }

            debug!("regulator for device '{}' stopping", self.device.device_id);
            Ok(())
        })
    }

    /// Run one regulation cycle.
    ///
    /// Public so the test suite can drive ticks deterministically with a
    /// pinned clock instead of waiting on the interval.
    pub async fn tick(&mut self) {
        let device_id = self.device.device_id.as_str();
        let Some(snapshot) = self.ctx.store.read(device_id) else {
            return;
        };
        let now = self.clock.now_ms();
        let safety = &self.device.safety;
        let has_reading = snapshot.last_temperature_update_ms > 0;

        // Telemetry health: a reading older than the stale threshold marks
        // the sensor failed and the device offline.
        if has_reading && !snapshot.sensor_fault {
            let age_ms = now.saturating_sub(snapshot.last_temperature_update_ms);
            if age_ms > safety.stale_threshold_secs as i64 * 1000 {
                warn!(
                    "device '{device_id}': temperature stale for {age_ms} ms, marking offline"
                );
                self.ctx.store.mark_sensor_stale(device_id);
            }
        }

        // Overheat trip, evaluated regardless of the regulator enable.
        if has_reading
            && !snapshot.emergency_stop
            && snapshot.current_temperature > safety.overheat_limit
        {
            warn!(
                "device '{device_id}': {} °C above overheat limit {} °C",
                snapshot.current_temperature, safety.overheat_limit
            );
            command::execute_emergency(&self.ctx, device_id, true).await;
            return;
        }

        if snapshot.emergency_stop {
            self.was_auto = false;
            return;
        }

        let freeze = has_reading && snapshot.current_temperature < safety.freeze_limit;
        let auto = snapshot.auto_enabled;
        if auto && !self.was_auto {
            self.pid.reset();
        }
        self.was_auto = auto;

        if !auto && !freeze {
            return;
        }
        if auto && !has_reading {
            // Nothing to regulate against until the first reading arrives.
            return;
        }

        let mut pid_output = snapshot.pid_output;
        let mut fan_output = snapshot.fan_output;

        if auto {
            let mut error = snapshot.setpoint_temperature - snapshot.current_temperature;
            // Inside the dead band while the fan runs: hold, don't chatter.
            if snapshot.is_working && error < 0.0 && error.abs() <= safety.hysteresis {
                error = 0.0;
            }
            let output = self.pid.update(error);
            pid_output = output;
            fan_output = if output < safety.min_output_threshold {
                0.0
            } else {
                output
            };
        }

        let mut valve = valve_target(self.clock.month(), pid_output);
        if freeze {
            // Freeze protection overrides the regulator but never trips the
            // emergency latch.
            fan_output = self.device.gains.out_max;
            valve = ValveState::Open;
        }

        if let Err(e) = self.ctx.hub.publish_fan(&self.device, fan_output).await {
            error!("device '{device_id}': fan publish failed: {e:#}");
        }
        if valve != snapshot.valve_state {
            if let Err(e) = self.ctx.hub.publish_valve(&self.device, valve).await {
                error!("device '{device_id}': valve publish failed: {e:#}");
            }
        }

        self.ctx.store.apply_tick(
            device_id,
            TickOutcome {
                fan_output,
                pid_output,
                valve_state: valve,
                integral: self.pid.integral(),
                prev_error: self.pid.previous_error(),
                last_tick_ms: now,
                freeze_protection: freeze,
            },
        );
    }
}

/// Apply the seasonal valve policy to every device once, unconditionally.
///
/// Runs at startup, independent of the regulator schedule, so the physical
/// valves match the season before the first tick.
pub async fn startup_valve_sweep(ctx: &CommandContext, clock: &Arc<dyn Clock>) {
    let month = clock.month();
    for device in ctx.registry.iter() {
        let snapshot = match ctx.store.read(&device.device_id) {
            Some(snapshot) => snapshot,
            None => continue,
        };
        let target = valve_target(month, snapshot.pid_output);
        if let Err(e) = ctx.hub.publish_valve(device, target).await {
            error!(
                "device '{}': startup valve publish failed: {e:#}",
                device.device_id
            );
        }
        ctx.store.set_valve(&device.device_id, target);
        info!(
            "device '{}': startup valve position {:?} (month {month})",
            device.device_id, target
        );
    }
}
