//! Camera ingest for the line monitor.
//!
//! - `types`: machine ids, frames, capture errors.
//! - `buffer`: bounded drop-oldest frame buffer.
//! - `source`: the video source seam and descriptor parsing.
//! - `acquisition`: per-machine reconnecting capture thread.
//! - `camera`: OpenCV backend (feature `opencv`).

mod acquisition;
mod backoff;
mod buffer;
#[cfg(feature = "opencv")]
mod camera;
mod source;
mod types;

pub use acquisition::{
    AcquisitionObserver, CameraConfig, CameraHandle, CameraState, CameraTiming, spawn_camera_unit,
};
pub use backoff::{backoff_delay, sleep_while_running};
pub use buffer::{DEFAULT_FRAME_BUFFER_CAPACITY, FrameBuffer};
#[cfg(feature = "opencv")]
pub use camera::OpenCvOpener;
pub use source::{CaptureSettings, SourceDescriptor, VideoSource, VideoSourceOpener};
pub use types::{CaptureError, Frame, MachineId};
