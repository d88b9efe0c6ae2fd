//! PID control with setpoint 0.
//!
//! The input is already an error (target offset from the aim point), so each
//! axis computes `kp*e + ki*∫e dt + kd*de/dt` directly. `dt` always comes from
//! the caller.

use super::Controller;
use crate::config::{ControllerKind, PidParams};
use crate::types::Vec2;

/// One PID axis
#[derive(Debug, Clone, PartialEq)]
pub struct PidAxis {
    params: PidParams,
    integral: f64,
    last_error: Option<f64>,
}

impl PidAxis {
    pub fn new(params: PidParams) -> Self {
        Self {
            params,
            integral: 0.0,
            last_error: None,
        }
    }

    pub fn compute(&mut self, error: f64, dt: f64) -> f64 {
        let p = &self.params;
        let mut output = p.kp * error;

        // Without a usable time step only the proportional term is defined
        if dt > 0.0 && dt.is_finite() {
            self.integral = (self.integral + error * dt).clamp(-p.integral_limit, p.integral_limit);
            let derivative = match self.last_error {
                Some(last) => (error - last) / dt,
                None => 0.0,
            };
            output += p.ki * self.integral + p.kd * derivative;
        }
        self.last_error = Some(error);

        output.clamp(-p.v_limit, p.v_limit)
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn last_error(&self) -> Option<f64> {
        self.last_error
    }
}

/// PID on both axes with shared gains
#[derive(Debug, Clone, PartialEq)]
pub struct PidController {
    x: PidAxis,
    y: PidAxis,
}

impl PidController {
    pub fn new(params: PidParams) -> Self {
        Self {
            x: PidAxis::new(params),
            y: PidAxis::new(params),
        }
    }

    /// Pure proportional controller with default limits
    pub fn proportional(kp: f64) -> Self {
        Self::new(PidParams {
            kp,
            ki: 0.0,
            kd: 0.0,
            ..PidParams::default()
        })
    }

    pub fn axes(&self) -> (&PidAxis, &PidAxis) {
        (&self.x, &self.y)
    }
}

impl Controller for PidController {
    fn compute(&mut self, error: Vec2, dt: f64) -> Vec2 {
        Vec2::new(self.x.compute(error.x, dt), self.y.compute(error.y, dt))
    }

    fn reset(&mut self) {
        self.x.reset();
        self.y.reset();
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Pid
    }
}
