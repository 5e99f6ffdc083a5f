use std::fmt;

use anyhow::Error;
use chrono::Utc;
use thiserror::Error;

/// Stable identifier of a monitored machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachineId(pub u32);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{}", self.0)
    }
}

/// Raw interleaved frame captured from a video source.
///
/// Frames are immutable once captured and are shared behind an `Arc` when
/// more than one consumer needs them.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub channels: u8,
    pub timestamp_ms: i64,
}

impl Frame {
    /// Wrap a BGR8 buffer captured now.
    pub fn bgr(data: Vec<u8>, width: i32, height: i32) -> Self {
        Self {
            data,
            width,
            height,
            channels: 3,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    /// True when the frame is a non-empty 3-channel image whose buffer
    /// matches its declared dimensions.
    pub fn is_three_channel(&self) -> bool {
        if self.channels != 3 || self.width <= 0 || self.height <= 0 {
            return false;
        }
        let expected = (self.width as usize) * (self.height as usize) * 3;
        self.data.len() == expected
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("video source {uri:?} opened but produced no frame")]
    NoFrame { uri: String },
    #[error("invalid frame {width}x{height} with {channels} channel(s)")]
    InvalidFrame {
        width: i32,
        height: i32,
        channels: u8,
    },
    #[error(transparent)]
    Other(#[from] Error),
}
