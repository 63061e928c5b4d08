//! Core library of the Haptickle haptic trigger engine.
//!
//! Parameter updates from the host bus are matched against configured
//! triggers; active triggers run one cancellable pulse loop per device, either
//! on a local tracker through [`HapticDevice`] or on a network device through
//! single-integer OSC datagrams.

pub mod broadcast;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod osc;
pub mod parameter;
pub mod pattern;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod trigger;
pub mod validity;

pub use broadcast::ExternalBroadcaster;
pub use config::{EngineSettings, HaptickleConfig};
pub use device::{DeviceSlot, HapticDevice, TracingDevice};
pub use engine::{EngineState, EngineStatus, HapticEngine};
pub use error::{HaptickleError, Result};
pub use evaluator::{BoundTrigger, TriggerEvaluator};
pub use parameter::{
    Comparison, ParameterType, ParameterUpdate, ParameterValue, ParameterWatch, QueryResult,
};
pub use pattern::{PatternConfig, PatternKind};
pub use registry::{CancelToken, LoopRegistry};
pub use scheduler::{LoopSignal, PulseScheduler};
pub use state::{KeyState, StateStore};
pub use trigger::{DeviceMapping, DeviceTarget, HapticTrigger, TriggerMode};
pub use validity::evaluate_validity;
