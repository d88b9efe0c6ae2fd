//! Pointer actuators.
//!
//! The driver loop hands each non-zero integer step to an [`Actuator`]. Moves
//! are fire-and-forget: a device error is logged and the loop carries on.

use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

/// Sink for relative pointer motion
pub trait Actuator: Send {
    fn move_relative(&mut self, dx: i32, dy: i32);

    fn name(&self) -> &str {
        "actuator"
    }
}

/// Dry-run actuator that only logs moves
#[derive(Debug, Default)]
pub struct LogActuator {
    moves: u64,
    total: (i64, i64),
}

impl LogActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn moves(&self) -> u64 {
        self.moves
    }

    /// Sum of every move so far
    pub fn total(&self) -> (i64, i64) {
        self.total
    }
}

impl Actuator for LogActuator {
    fn move_relative(&mut self, dx: i32, dy: i32) {
        self.moves += 1;
        self.total.0 += dx as i64;
        self.total.1 += dy as i64;
        trace!("move_relative({}, {}) -> total {:?}", dx, dy, self.total);
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Actuator recording every move; clones share the same log
#[derive(Debug, Clone, Default)]
pub struct RecordingActuator {
    events: Arc<Mutex<Vec<(i32, i32)>>>,
}

impl RecordingActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(i32, i32)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total(&self) -> (i64, i64) {
        self.events()
            .iter()
            .fold((0, 0), |(x, y), (dx, dy)| (x + *dx as i64, y + *dy as i64))
    }
}

impl Actuator for RecordingActuator {
    fn move_relative(&mut self, dx: i32, dy: i32) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((dx, dy));
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[cfg(target_os = "linux")]
mod uinput {
    use super::*;
    use crate::types::ActuatorError;
    use evdev::{uinput::VirtualDevice, AttributeSet, EventType, InputEvent, KeyCode, RelativeAxisCode};
    use tracing::warn;

    /// Relative pointer device created through uinput
    pub struct VirtualMouse {
        device: VirtualDevice,
    }

    impl VirtualMouse {
        pub fn create(name: &str) -> Result<Self, ActuatorError> {
            let mut axes = AttributeSet::<RelativeAxisCode>::new();
            axes.insert(RelativeAxisCode::REL_X);
            axes.insert(RelativeAxisCode::REL_Y);

            // Buttons so the device is classified as a mouse
            let mut keys = AttributeSet::<KeyCode>::new();
            keys.insert(KeyCode::BTN_LEFT);
            keys.insert(KeyCode::BTN_RIGHT);

            let device = VirtualDevice::builder()?
                .name(name)
                .with_keys(&keys)?
                .with_relative_axes(&axes)?
                .build()?;

            debug!("Created virtual mouse {:?}", name);
            Ok(Self { device })
        }
    }

    impl Actuator for VirtualMouse {
        fn move_relative(&mut self, dx: i32, dy: i32) {
            let events = [
                InputEvent::new(EventType::RELATIVE.0, RelativeAxisCode::REL_X.0, dx),
                InputEvent::new(EventType::RELATIVE.0, RelativeAxisCode::REL_Y.0, dy),
            ];
            if let Err(e) = self.device.emit(&events) {
                warn!("uinput emit failed: {}", e);
            }
        }

        fn name(&self) -> &str {
            "uinput"
        }
    }
}

#[cfg(target_os = "linux")]
pub use uinput::VirtualMouse;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_actuator_totals() {
        let mut actuator = LogActuator::new();
        actuator.move_relative(3, -1);
        actuator.move_relative(2, 4);
        assert_eq!(actuator.moves(), 2);
        assert_eq!(actuator.total(), (5, 3));
    }

    #[test]
    fn test_recording_actuator_shares_log() {
        let recorder = RecordingActuator::new();
        let mut handle: Box<dyn Actuator> = Box::new(recorder.clone());

        handle.move_relative(1, 2);
        handle.move_relative(-4, 0);

        assert_eq!(recorder.events(), vec![(1, 2), (-4, 0)]);
        assert_eq!(recorder.total(), (-3, 2));
        assert_eq!(handle.name(), "recording");
    }
}
