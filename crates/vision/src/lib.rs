//! Assembly-line monitor: per-machine zone classification over camera
//! detections, relay actuation and supervision.

pub mod pipeline;

pub use pipeline::{
    Backends, MonitorCliArgs, MonitorConfig, MonitorSystem, RunOptions, SystemEvent, run,
    test_relays,
};
