//! Linear active disturbance rejection control (LADRC).
//!
//! Each axis runs an extended state observer (ESO) that estimates the plant
//! output, its derivatives, and a lumped "total disturbance" term, then cancels
//! the disturbance in the control law. Gains follow bandwidth parameterization:
//! the controller uses `w_cl`, the observer `w_o = k_eso * w_cl`.
//!
//! The plant output is the pointer position relative to the target, i.e. the
//! negated error, with setpoint 0. The observer is discretised (forward Euler)
//! with `sample_time`; the `dt` passed to `compute` does not change it, so a
//! call cadence that differs from `sample_time` silently degrades tracking.

use super::Controller;
use crate::config::{AdrcParams, ControllerKind};
use crate::types::Vec2;

/// One LADRC axis
#[derive(Debug, Clone, PartialEq)]
pub struct AdrcAxis {
    params: AdrcParams,
    /// Observer state: z[0] output estimate, then derivatives, last is disturbance
    z: [f64; 3],
    /// Last applied (limited) control
    u_prev: f64,
}

impl AdrcAxis {
    pub fn new(params: AdrcParams) -> Self {
        Self {
            params,
            z: [0.0; 3],
            u_prev: 0.0,
        }
    }

    fn observer_bandwidth(&self) -> f64 {
        self.params.k_eso * self.params.w_cl
    }

    fn update_observer(&mut self, y: f64) {
        let h = self.params.sample_time;
        let b0 = self.params.b0;
        let wo = self.observer_bandwidth();
        let e = y - self.z[0];

        if self.params.order >= 2 {
            let (l1, l2, l3) = (3.0 * wo, 3.0 * wo * wo, wo * wo * wo);
            let [z1, z2, z3] = self.z;
            self.z = [
                z1 + h * (z2 + l1 * e),
                z2 + h * (z3 + b0 * self.u_prev + l2 * e),
                z3 + h * (l3 * e),
            ];
        } else {
            let (l1, l2) = (2.0 * wo, wo * wo);
            let [z1, z2, _] = self.z;
            self.z = [
                z1 + h * (z2 + b0 * self.u_prev + l1 * e),
                z2 + h * (l2 * e),
                0.0,
            ];
        }
    }

    fn control_law(&self) -> f64 {
        let p = &self.params;
        let [z1, z2, z3] = self.z;
        if p.order >= 2 {
            let kp = p.w_cl * p.w_cl;
            let kd = 2.0 * p.w_cl;
            (kp * (0.0 - z1) - kd * z2 - z3) / p.b0
        } else {
            (p.w_cl * (0.0 - z1) - z2) / p.b0
        }
    }

    fn limit(&self, u: f64) -> f64 {
        let mut u = u;
        if let Some(rate) = self.params.rate_limit {
            let max_step = rate * self.params.sample_time;
            u = self.u_prev + (u - self.u_prev).clamp(-max_step, max_step);
        }
        if let Some(limit) = self.params.output_limit {
            u = u.clamp(-limit, limit);
        }
        u
    }

    pub fn compute(&mut self, error: f64) -> f64 {
        self.update_observer(-error);
        let u = self.limit(self.control_law());
        self.u_prev = u;
        u
    }

    pub fn reset(&mut self) {
        self.z = [0.0; 3];
        self.u_prev = 0.0;
    }

    /// Estimated lumped disturbance
    pub fn disturbance(&self) -> f64 {
        if self.params.order >= 2 {
            self.z[2]
        } else {
            self.z[1]
        }
    }
}

/// LADRC on both axes with shared parameters
#[derive(Debug, Clone, PartialEq)]
pub struct AdrcController {
    x: AdrcAxis,
    y: AdrcAxis,
}

impl AdrcController {
    pub fn new(params: AdrcParams) -> Self {
        Self {
            x: AdrcAxis::new(params),
            y: AdrcAxis::new(params),
        }
    }

    pub fn axes(&self) -> (&AdrcAxis, &AdrcAxis) {
        (&self.x, &self.y)
    }
}

impl Controller for AdrcController {
    fn compute(&mut self, error: Vec2, _dt: f64) -> Vec2 {
        Vec2::new(self.x.compute(error.x), self.y.compute(error.y))
    }

    fn reset(&mut self) {
        self.x.reset();
        self.y.reset();
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Adrc
    }
}
