//! Bounded event bus between the pipeline and whatever consumes its events
//! (the binary's log loop, an operator console, tests).

use std::{sync::Arc, time::Duration};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use ml_core::Detection;
use video_ingest::{CameraState, Frame, MachineId};

use crate::pipeline::{
    classifier::{MachineStats, PairStatus},
    watchdog::WatchdogSource,
};

/// Default capacity of the collaborator-facing event channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub enum SystemEvent {
    FrameReady {
        machine_id: MachineId,
        frame: Arc<Frame>,
    },
    Heartbeat {
        machine_id: MachineId,
    },
    CameraStatus {
        machine_id: MachineId,
        state: CameraState,
        message: String,
    },
    CameraError {
        machine_id: MachineId,
        message: String,
    },
    DetectionsReady {
        machine_id: MachineId,
        detections: Vec<Detection>,
        fps: f32,
    },
    PairStatusChanged {
        machine_id: MachineId,
        statuses: [PairStatus; 3],
    },
    StatsUpdated {
        machine_id: MachineId,
        stats: MachineStats,
    },
    WatchdogTimeout {
        source: WatchdogSource,
        elapsed: Duration,
    },
    InferenceError {
        message: String,
    },
    InferenceUnavailable {
        message: String,
    },
}

impl SystemEvent {
    /// Events emitted once per frame or per cycle.
    pub fn is_high_rate(&self) -> bool {
        matches!(
            self,
            SystemEvent::FrameReady { .. }
                | SystemEvent::Heartbeat { .. }
                | SystemEvent::DetectionsReady { .. }
                | SystemEvent::StatsUpdated { .. }
        )
    }
}

/// Cloneable publishing side of the event channel. Publishing never blocks:
/// a full channel drops the new event and counts it.
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<SystemEvent>,
    stream_high_rate: bool,
}

impl EventBus {
    pub fn new(capacity: usize, stream_high_rate: bool) -> (Self, Receiver<SystemEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        (
            Self {
                tx,
                stream_high_rate,
            },
            rx,
        )
    }

    pub fn streams_high_rate(&self) -> bool {
        self.stream_high_rate
    }

    pub fn publish(&self, event: SystemEvent) {
        if event.is_high_rate() && !self.stream_high_rate {
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::counter!("monitor_events_dropped_total").increment(1);
            }
            // Nobody is listening; events are informational.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
