//! Control laws turning a 2D error into a 2D command.
//!
//! Two interchangeable strategies implement [`Controller`]:
//!
//! - [`pid::PidController`]: proportional/integral/derivative per axis
//! - [`adrc::AdrcController`]: linear active disturbance rejection per axis
//!
//! Both treat X and Y as independent axes sharing one parameter set, and both
//! are pure functions of their internal state and the `(error, dt)` they are
//! given. Neither reads a clock.

pub mod adrc;
pub mod pid;

pub use adrc::{AdrcAxis, AdrcController};
pub use pid::{PidAxis, PidController};

use crate::config::{ControllerConfig, ControllerKind};
use crate::types::Vec2;

/// Error-to-command strategy
pub trait Controller: Send {
    /// Compute the command for `error` after `dt` seconds since the last call
    fn compute(&mut self, error: Vec2, dt: f64) -> Vec2;

    /// Clear integrators and observer state
    fn reset(&mut self);

    fn kind(&self) -> ControllerKind;
}

/// Build the controller selected by `config.kind`
pub fn build_controller(config: &ControllerConfig) -> Box<dyn Controller> {
    match config.kind {
        ControllerKind::Pid => Box::new(PidController::new(config.pid)),
        ControllerKind::Adrc => Box::new(AdrcController::new(config.adrc)),
    }
}
