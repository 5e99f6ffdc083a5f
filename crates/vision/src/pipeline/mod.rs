//! Line-monitor pipeline.
//!
//! - `config`: machines file and CLI options.
//! - `events`: bounded event bus towards the operator surface.
//! - `geometry`: point-in-polygon membership.
//! - `boundaries`: per-machine slot polygons and their JSON files.
//! - `classifier`: per-machine OK/FAULT logic and fault statistics.
//! - `relay`: relay board actuation with retries and reacquire.
//! - `inference`: shared single-worker inference queue.
//! - `watchdog`: heartbeat timeouts.
//! - `supervisor`: builds, starts and stops the whole system.
//! - `telemetry`: tracing subscribers, metrics recorder and thread helpers.

pub use boundaries::{BoundaryError, BoundarySet, SlotKey};
pub use classifier::{CycleOutcome, FaultRecord, MachineClassifier, MachineStats, PairStatus};
pub use config::{
    ConfidenceThresholds, ConfigError, MachineConfig, MonitorCliArgs, MonitorConfig, RunOptions,
    TelemetryOptions,
};
pub use events::{EventBus, SystemEvent};
pub use geometry::point_in_polygon;
#[cfg(feature = "usb-relay")]
pub use hid_relay::HidRelayOpener;
pub use inference::{
    INFERENCE_QUEUE_CAPACITY, InferenceJob, InferenceMultiplexer, InferenceResult, ModelLoader,
    SubmitOutcome,
};
pub use relay::{RELAY_CHANNELS, RelayActuator, RelayBoard, RelayBoardOpener, RelayError};
pub use supervisor::{Backends, MonitorSystem, default_backends, run, test_relays};
pub use watchdog::{Watchdog, WatchdogSource};

pub mod boundaries;
pub mod classifier;
pub mod config;
pub mod events;
pub mod geometry;
#[cfg(feature = "usb-relay")]
mod hid_relay;
pub mod inference;
pub mod relay;
#[cfg(feature = "with-tch")]
mod runtime;
mod supervisor;
mod telemetry;
pub mod watchdog;
