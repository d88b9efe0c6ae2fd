//! State aggregates shared between pipeline stages.
//!
//! Each aggregate is a plain struct whose fields are [`ValueCell`]s, declared
//! through [`state_aggregate!`] so the set of observable fields is fixed at
//! compile time. The [`StateStore`] owns one instance of every aggregate and is
//! constructed explicitly by the composition root, then shared by `Arc`.

use crate::cell::ValueCell;
use crate::config::Config;
use crate::driver::DriverPhase;
use crate::monitor::CapturedFrame;
use crate::types::{
    BBox, CaptureRegion, ClassId, DetectionBatch, DriveCommand, SelectedTarget, Vec2,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Declare a struct of [`ValueCell`] fields with their initial values.
///
/// ```ignore
/// state_aggregate! {
///     pub struct Example {
///         pub count: u32 = 0,
///     }
/// }
/// ```
///
/// expands to a struct with `pub count: ValueCell<u32>`, a `new()` that names
/// each cell `Example.count`, a `FIELDS` list, and a `Default` impl.
macro_rules! state_aggregate {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $field:ident : $ty:ty = $default:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[$fmeta])*
                $fvis $field: ValueCell<$ty>,
            )*
        }

        impl $name {
            /// Names of every observable field, in declaration order
            pub const FIELDS: &'static [&'static str] = &[$(stringify!($field)),*];

            pub fn new() -> Self {
                Self {
                    $(
                        $field: ValueCell::new(
                            concat!(stringify!($name), ".", stringify!($field)),
                            $default,
                        ),
                    )*
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

state_aggregate! {
    /// Output of the capture monitor
    #[derive(Debug)]
    pub struct CaptureState {
        /// Latest captured frame
        pub frame: Option<CapturedFrame> = None,
        /// Region the capture monitor is currently grabbing
        pub region: CaptureRegion = CaptureRegion::default(),
        pub failures: u64 = 0,
    }
}

state_aggregate! {
    /// Output of the detection stage
    #[derive(Debug)]
    pub struct DetectionState {
        pub batch: Option<DetectionBatch> = None,
        /// Class taxonomy, published after every model (re)load
        pub class_names: BTreeMap<ClassId, String> = BTreeMap::new(),
    }
}

state_aggregate! {
    /// Output of the target selector.
    ///
    /// `selected` is the authoritative record; the per-field cells mirror it for
    /// observers that only care about one attribute.
    #[derive(Debug)]
    pub struct TargetState {
        pub selected: Option<SelectedTarget> = None,
        pub vector: Option<Vec2> = None,
        pub bbox: Option<BBox> = None,
        pub confidence: Option<f64> = None,
        pub class_id: Option<ClassId> = None,
        pub generation: u64 = 0,
    }
}

state_aggregate! {
    /// Output of the controller stage
    #[derive(Debug)]
    pub struct ControlState {
        /// Latest velocity command
        pub command: DriveCommand = DriveCommand::default(),
        /// Error the last command was computed from
        pub error: Option<Vec2> = None,
    }
}

state_aggregate! {
    /// Telemetry published by the actuation driver loop
    #[derive(Debug)]
    pub struct DriverState {
        pub velocity: Vec2 = Vec2::ZERO,
        pub phase: DriverPhase = DriverPhase::Idle,
    }
}

state_aggregate! {
    /// Output of the input monitor
    #[derive(Debug)]
    pub struct InputState {
        pub activation_held: bool = false,
        pub cursor: Option<(i32, i32)> = None,
    }
}

impl TargetState {
    /// Publish a newly selected target into every cell
    pub fn publish(&self, target: SelectedTarget) {
        self.generation.set(target.generation);
        self.vector.set(Some(target.vector));
        self.bbox.set(Some(target.bbox));
        self.confidence.set(Some(target.confidence));
        self.class_id.set(Some(target.class_id));
        self.selected.set(Some(target));
    }

    /// Clear the selection
    pub fn clear(&self) {
        self.vector.set(None);
        self.bbox.set(None);
        self.confidence.set(None);
        self.class_id.set(None);
        self.selected.set(None);
    }
}

/// Every state aggregate of one pipeline instance
#[derive(Debug)]
pub struct StateStore {
    /// Live configuration; publishing a new value reconfigures the stages
    pub config: ValueCell<Config>,
    pub capture: CaptureState,
    pub detection: DetectionState,
    pub target: TargetState,
    pub control: ControlState,
    pub driver: DriverState,
    pub input: InputState,
}

impl StateStore {
    pub fn new(config: Config) -> Self {
        Self {
            config: ValueCell::new("StateStore.config", config),
            capture: CaptureState::new(),
            detection: DetectionState::new(),
            target: TargetState::new(),
            control: ControlState::new(),
            driver: DriverState::new(),
            input: InputState::new(),
        }
    }

    pub fn shared(config: Config) -> Arc<Self> {
        Arc::new(Self::new(config))
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BBox;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn target(generation: u64) -> SelectedTarget {
        SelectedTarget {
            vector: Vec2::new(10.0, -5.0),
            bbox: BBox::new(320.0, 225.0, 340.0, 245.0),
            confidence: 0.7,
            class_id: 2,
            generation,
            frame_seq: 7,
        }
    }

    #[test]
    fn test_aggregate_fields_and_cell_names() {
        assert_eq!(
            TargetState::FIELDS,
            &["selected", "vector", "bbox", "confidence", "class_id", "generation"]
        );
        let state = TargetState::new();
        assert_eq!(state.vector.name(), "TargetState.vector");
        assert_eq!(state.generation.get(), 0);
    }

    #[test]
    fn test_independent_store_instances() {
        let a = StateStore::default();
        let b = StateStore::default();

        a.control.command.set(DriveCommand {
            vector: Vec2::new(1.0, 2.0),
            seq: 1,
        });

        assert_eq!(a.control.command.get().vector, Vec2::new(1.0, 2.0));
        assert_eq!(b.control.command.get(), DriveCommand::default());
    }

    #[test]
    fn test_target_publish_and_clear() {
        let state = TargetState::new();
        state.publish(target(1));

        assert_eq!(state.vector.get(), Some(Vec2::new(10.0, -5.0)));
        assert_eq!(state.class_id.get(), Some(2));
        assert_eq!(state.selected.get().map(|t| t.generation), Some(1));

        state.clear();
        assert!(state.selected.get().is_none());
        assert!(state.vector.get().is_none());
        // Generation survives a clear so the next acquisition is distinguishable
        assert_eq!(state.generation.get(), 1);
    }

    #[test]
    fn test_republishing_same_target_is_deduplicated() {
        let state = TargetState::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        state.selected.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        state.publish(target(1));
        state.publish(target(1));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
