// Copyright (c) 2025 heatbridge contributors
// This file is part of the heatbridge project and is licensed under the
// MIT license (see LICENSE.md for details).

//! PID controller for the heating regulator
//!
//! Fixed-step controller: the regulator calls [`PidController::update`]
//! exactly once per second, so the gains absorb the time step and no `dt`
//! appears in the law. Anti-windup is a soft reset: while the error is
//! negative (room above setpoint) the integral is bled down by a decay
//! factor each step, so accumulated heat demand cannot hold the fan on.

use crate::config::RegulatorGains;

/// PID controller state for one device.
#[derive(Debug, Clone)]
pub struct PidController {
    kp: f32,
    ki: f32,
    kd: f32,
    output_min: f32,
    output_max: f32,
    integral_decay: f32,
    integral: f32,
    previous_error: f32,
}

impl PidController {
    /// Create a controller from the device's configured gains.
    pub fn new(gains: &RegulatorGains) -> Self {
        Self {
            kp: gains.kp,
            ki: gains.ki,
            kd: gains.kd,
            output_min: gains.out_min,
            output_max: gains.out_max,
            integral_decay: gains.integral_decay,
            integral: 0.0,
            previous_error: 0.0,
        }
    }

    /// Advance the controller by one step and return the saturated output.
    ///
    /// `error` is the effective error after the caller's hysteresis
    /// dead-zone has been applied.
    pub fn update(&mut self, error: f32) -> f32 {
        self.integral += error;
        if error < 0.0 {
            // Over temperature: bleed the integral down instead of clamping
            // so the stored heat demand decays smoothly to zero.
            self.integral = (self.integral * self.integral_decay).max(0.0);
        }

        let derivative = error - self.previous_error;
        self.previous_error = error;

        let output = self.kp * error + self.ki * self.integral + self.kd * derivative;
        output.clamp(self.output_min, self.output_max)
    }

    /// Reset the accumulator and derivative history (auto re-enable).
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.previous_error = 0.0;
    }

    /// Current integral accumulator.
    pub fn integral(&self) -> f32 {
        self.integral
    }

    /// Error seen by the previous step.
    pub fn previous_error(&self) -> f32 {
        self.previous_error
    }
}
