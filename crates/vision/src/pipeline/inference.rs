//! Shared inference worker.
//!
//! One thread owns the only detection model. Every machine submits frames
//! into one bounded queue; a full queue sheds the new frame instead of
//! blocking the camera thread.

use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use ml_core::{Detection, DetectionModel};
use tracing::{debug, error, info, warn};
use video_ingest::{Frame, MachineId};

use crate::pipeline::{
    boundaries::BoundarySet,
    events::{EventBus, SystemEvent},
    telemetry::{self, WorkerHandle},
};

/// Pending frames across all machines.
pub const INFERENCE_QUEUE_CAPACITY: usize = 30;

const POP_TIMEOUT: Duration = Duration::from_millis(100);
const ERROR_PAUSE: Duration = Duration::from_millis(100);
const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Builds the model on the worker thread.
pub type ModelLoader = Box<dyn FnOnce() -> anyhow::Result<Box<dyn DetectionModel>> + Send>;
/// Receives every successful inference on the worker thread.
pub type ResultSink = Box<dyn FnMut(InferenceResult) + Send>;

pub struct InferenceJob {
    pub machine_id: MachineId,
    pub frame: Arc<Frame>,
    /// Boundary snapshot current when the frame was submitted.
    pub boundaries: Arc<BoundarySet>,
}

#[derive(Clone, Debug)]
pub struct InferenceResult {
    pub machine_id: MachineId,
    pub detections: Vec<Detection>,
    pub fps: f32,
    pub boundaries: Arc<BoundarySet>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    Dropped,
}

#[derive(Default)]
struct Counters {
    running: AtomicBool,
    available: AtomicBool,
    dropped: AtomicU64,
    processed: AtomicU64,
    fps_bits: AtomicU32,
}

pub struct InferenceMultiplexer {
    tx: Sender<InferenceJob>,
    rx: Receiver<InferenceJob>,
    counters: Arc<Counters>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl InferenceMultiplexer {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            counters: Arc::new(Counters::default()),
            worker: Mutex::new(None),
        }
    }

    /// Non-blocking enqueue. Frames are accepted before the worker starts
    /// and while the model is unavailable; they are simply never consumed.
    pub fn submit(
        &self,
        machine_id: MachineId,
        frame: Arc<Frame>,
        boundaries: Arc<BoundarySet>,
    ) -> SubmitOutcome {
        let job = InferenceJob {
            machine_id,
            frame,
            boundaries,
        };
        let outcome = match self.tx.try_send(job) {
            Ok(()) => SubmitOutcome::Queued,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("monitor_inference_dropped_total").increment(1);
                SubmitOutcome::Dropped
            }
        };
        metrics::gauge!("monitor_inference_queue_depth").set(self.tx.len() as f64);
        outcome
    }

    pub fn queue_len(&self) -> usize {
        self.tx.len()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(INFERENCE_QUEUE_CAPACITY)
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.counters.processed.load(Ordering::Relaxed)
    }

    pub fn fps(&self) -> f32 {
        f32::from_bits(self.counters.fps_bits.load(Ordering::Relaxed))
    }

    /// True once the model has loaded and until the worker exits.
    pub fn is_available(&self) -> bool {
        self.counters.available.load(Ordering::Acquire)
    }

    /// Spawn the worker. The model is loaded on the worker thread; a load
    /// failure is published once and the worker exits.
    pub fn start(&self, loader: ModelLoader, sink: ResultSink, bus: EventBus) -> io::Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            warn!("inference worker already started");
            return Ok(());
        }

        self.counters.running.store(true, Ordering::SeqCst);
        let state = WorkerState {
            rx: self.rx.clone(),
            counters: self.counters.clone(),
            sink,
            bus,
        };
        *worker = Some(telemetry::spawn_worker("inference-worker", move || {
            state.run(loader)
        })?);
        Ok(())
    }

    /// Signal the worker, discard pending frames and wait up to `timeout`.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.counters.running.store(false, Ordering::SeqCst);
        let discarded = self.rx.try_iter().count();
        if discarded > 0 {
            debug!("discarded {discarded} pending inference job(s)");
        }
        metrics::gauge!("monitor_inference_queue_depth").set(0.0);

        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        match worker.as_mut() {
            Some(handle) => handle.join_timeout(timeout),
            None => true,
        }
    }
}

struct WorkerState {
    rx: Receiver<InferenceJob>,
    counters: Arc<Counters>,
    sink: ResultSink,
    bus: EventBus,
}

impl WorkerState {
    fn run(mut self, loader: ModelLoader) {
        let mut model = match panic::catch_unwind(AssertUnwindSafe(loader)) {
            Ok(Ok(model)) => model,
            Ok(Err(err)) => return self.unavailable(format!("{err:#}")),
            Err(payload) => return self.unavailable(panic_message(&*payload)),
        };
        self.counters.available.store(true, Ordering::Release);
        info!("inference worker ready");

        let mut window_start = Instant::now();
        let mut window_frames: u32 = 0;

        while self.counters.running.load(Ordering::Relaxed) {
            let job = match self.rx.recv_timeout(POP_TIMEOUT) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            metrics::gauge!("monitor_inference_queue_depth").set(self.rx.len() as f64);

            let frame = &job.frame;
            if !frame.is_three_channel() {
                warn!(
                    "{}: skipping invalid frame {}x{}x{}",
                    job.machine_id, frame.width, frame.height, frame.channels
                );
                continue;
            }

            let span = tracing::debug_span!("inference", machine = %job.machine_id);
            let _guard = span.enter();
            let detected = panic::catch_unwind(AssertUnwindSafe(|| {
                model.detect(&frame.data, frame.width, frame.height)
            }));
            let detections = match detected {
                Ok(Ok(detections)) => detections,
                Ok(Err(err)) => {
                    self.failed(job.machine_id, format!("{err:#}"));
                    continue;
                }
                Err(payload) => {
                    self.failed(job.machine_id, panic_message(&*payload));
                    continue;
                }
            };

            window_frames += 1;
            let elapsed = window_start.elapsed();
            if elapsed >= FPS_WINDOW {
                let fps = window_frames as f32 / elapsed.as_secs_f32();
                self.counters.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
                metrics::gauge!("monitor_inference_fps").set(fps as f64);
                window_frames = 0;
                window_start = Instant::now();
            }
            self.counters.processed.fetch_add(1, Ordering::Relaxed);

            let fps = f32::from_bits(self.counters.fps_bits.load(Ordering::Relaxed));
            self.bus.publish(SystemEvent::DetectionsReady {
                machine_id: job.machine_id,
                detections: detections.clone(),
                fps,
            });
            let result = InferenceResult {
                machine_id: job.machine_id,
                detections,
                fps,
                boundaries: job.boundaries,
            };
            let sink = &mut self.sink;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink(result))) {
                error!(
                    "{}: result handler panicked: {}",
                    job.machine_id,
                    panic_message(&*payload)
                );
            }
        }

        self.counters.available.store(false, Ordering::Release);
        info!("inference worker stopped");
    }

    fn unavailable(&self, message: String) {
        error!("failed to load detection model: {message}");
        self.bus
            .publish(SystemEvent::InferenceUnavailable { message });
    }

    fn failed(&self, machine_id: MachineId, message: String) {
        error!("{machine_id}: inference failed: {message}");
        self.bus.publish(SystemEvent::InferenceError { message });
        thread::sleep(ERROR_PAUSE);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic".to_string()
    }
}
