//! Camera acquisition unit: one thread per machine owning its video source.
//!
//! The unit walks `DISCONNECTED → CONNECTING → STREAMING → RECONNECTING →
//! CONNECTING → … → STOPPED`. Connection attempts are spaced by a fixed
//! interval; exhausting the attempt budget only raises an error event, the
//! unit keeps retrying with backoff until it is stopped. Stop is cooperative:
//! an in-flight `read` is never interrupted, so callers wait with
//! [`CameraHandle::join_timeout`].

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, error, info, warn};

use crate::{
    backoff::{backoff_delay, sleep_while_running},
    buffer::{DEFAULT_FRAME_BUFFER_CAPACITY, FrameBuffer},
    source::{CaptureSettings, SourceDescriptor, VideoSource, VideoSourceOpener},
    types::{Frame, MachineId},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CameraState {
    Disconnected = 0,
    Connecting = 1,
    Streaming = 2,
    Reconnecting = 3,
    Stopped = 4,
}

impl CameraState {
    pub fn label(self) -> &'static str {
        match self {
            CameraState::Disconnected => "disconnected",
            CameraState::Connecting => "connecting",
            CameraState::Streaming => "streaming",
            CameraState::Reconnecting => "reconnecting",
            CameraState::Stopped => "stopped",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CameraState::Connecting,
            2 => CameraState::Streaming,
            3 => CameraState::Reconnecting,
            4 => CameraState::Stopped,
            _ => CameraState::Disconnected,
        }
    }
}

/// Retry, backoff, and buffering knobs for one camera.
#[derive(Clone, Debug)]
pub struct CameraTiming {
    /// Connection attempts per CONNECTING phase before an error is raised.
    pub max_reconnect_attempts: u32,
    /// Fixed spacing between connection attempts.
    pub connect_retry_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Window over which the rolling capture FPS is sampled.
    pub fps_window: Duration,
    pub buffer_capacity: usize,
}

impl Default for CameraTiming {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 10,
            connect_retry_interval: Duration::from_secs(2),
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            fps_window: Duration::from_secs(5),
            buffer_capacity: DEFAULT_FRAME_BUFFER_CAPACITY,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CameraConfig {
    pub machine_id: MachineId,
    pub source: SourceDescriptor,
    pub settings: CaptureSettings,
    pub timing: CameraTiming,
}

/// Receiver of camera events. Callbacks run on the camera's own thread and
/// must not block.
pub trait AcquisitionObserver: Send + Sync {
    fn on_frame(&self, _machine_id: MachineId, _frame: &Arc<Frame>) {}
    fn on_heartbeat(&self, _machine_id: MachineId) {}
    fn on_status(&self, _machine_id: MachineId, _state: CameraState, _message: &str) {}
    fn on_error(&self, _machine_id: MachineId, _message: &str) {}
}

struct SharedCamera {
    running: AtomicBool,
    state: AtomicU8,
    fps_bits: AtomicU32,
    buffer: FrameBuffer<Arc<Frame>>,
}

/// Owner-side handle of a running acquisition unit.
pub struct CameraHandle {
    machine_id: MachineId,
    shared: Arc<SharedCamera>,
    thread: Option<thread::JoinHandle<()>>,
    exited: Receiver<()>,
}

impl CameraHandle {
    pub fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    pub fn state(&self) -> CameraState {
        CameraState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == CameraState::Streaming
    }

    /// Rolling capture rate, refreshed once per FPS window.
    pub fn fps(&self) -> f32 {
        f32::from_bits(self.shared.fps_bits.load(Ordering::Relaxed))
    }

    /// Pop the oldest buffered frame, waiting up to `timeout`.
    pub fn next_frame(&self, timeout: Duration) -> Option<Arc<Frame>> {
        self.shared.buffer.get(timeout)
    }

    /// Newest buffered frame, left in place.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.shared.buffer.peek_latest()
    }

    pub fn buffer(&self) -> &FrameBuffer<Arc<Frame>> {
        &self.shared.buffer
    }

    /// Request a cooperative stop; returns immediately.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        info!("{}: camera stop requested", self.machine_id);
    }

    /// Wait up to `timeout` for the thread to exit. Returns `false` when the
    /// unit is still busy (for example blocked inside a device read).
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        if self.thread.is_none() {
            return true;
        }
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.thread.take() {
                    if handle.join().is_err() {
                        error!("{}: camera thread panicked", self.machine_id);
                    }
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{}: camera thread did not stop within {:?}",
                    self.machine_id, timeout
                );
                false
            }
        }
    }
}

/// Spawn the acquisition thread for one machine.
pub fn spawn_camera_unit(
    config: CameraConfig,
    opener: Arc<dyn VideoSourceOpener>,
    observer: Arc<dyn AcquisitionObserver>,
) -> io::Result<CameraHandle> {
    let shared = Arc::new(SharedCamera {
        running: AtomicBool::new(true),
        state: AtomicU8::new(CameraState::Disconnected as u8),
        fps_bits: AtomicU32::new(0f32.to_bits()),
        buffer: FrameBuffer::new(config.timing.buffer_capacity),
    });
    let machine_id = config.machine_id;
    let (exit_tx, exited) = bounded::<()>(1);

    let unit = CameraUnit {
        config,
        opener,
        observer,
        shared: shared.clone(),
        source: None,
        reconnect_attempts: 0,
        window_frames: 0,
        window_start: Instant::now(),
    };

    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    let thread = thread::Builder::new()
        .name(format!("camera-{}", machine_id.0))
        .spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || unit.run(exit_tx));
        })?;

    Ok(CameraHandle {
        machine_id,
        shared,
        thread: Some(thread),
        exited,
    })
}

struct CameraUnit {
    config: CameraConfig,
    opener: Arc<dyn VideoSourceOpener>,
    observer: Arc<dyn AcquisitionObserver>,
    shared: Arc<SharedCamera>,
    source: Option<Box<dyn VideoSource>>,
    reconnect_attempts: u32,
    window_frames: u32,
    window_start: Instant,
}

impl CameraUnit {
    fn run(mut self, exit_tx: Sender<()>) {
        let machine_id = self.config.machine_id;
        info!(
            "{machine_id}: camera thread started ({})",
            self.config.source.label()
        );

        while self.running() {
            match self.state() {
                CameraState::Disconnected | CameraState::Connecting => self.connect(),
                CameraState::Streaming => self.stream_once(),
                CameraState::Reconnecting => self.reconnect(),
                CameraState::Stopped => break,
            }
        }

        self.cleanup();
        info!("{machine_id}: camera thread stopped");
        let _ = exit_tx.send(());
    }

    fn running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    fn state(&self) -> CameraState {
        CameraState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    fn transition(&self, state: CameraState, message: &str) {
        self.shared.state.store(state as u8, Ordering::Release);
        self.observer
            .on_status(self.config.machine_id, state, message);
    }

    /// CONNECTING: up to `max_reconnect_attempts` tries with fixed spacing.
    fn connect(&mut self) {
        let machine_id = self.config.machine_id;
        let label = self.config.source.label();
        let max_attempts = self.config.timing.max_reconnect_attempts.max(1);
        self.transition(CameraState::Connecting, &format!("connecting ({label})"));

        for attempt in 1..=max_attempts {
            if !self.running() {
                return;
            }
            info!("{machine_id}: connecting to {label}, attempt {attempt}");

            match self.open_and_probe() {
                Ok((source, frame)) => {
                    info!(
                        "{machine_id}: camera connected - frame size {}x{}x{}",
                        frame.width, frame.height, frame.channels
                    );
                    self.source = Some(source);
                    self.reconnect_attempts = 0;
                    self.window_frames = 0;
                    self.window_start = Instant::now();
                    self.transition(
                        CameraState::Streaming,
                        &format!("camera connected ({label})"),
                    );
                    self.publish(frame);
                    return;
                }
                Err(message) => warn!("{machine_id}: {message}"),
            }

            if !sleep_while_running(
                &self.shared.running,
                self.config.timing.connect_retry_interval,
            ) {
                return;
            }
        }

        let message = format!("failed to connect after {max_attempts} attempts");
        error!("{machine_id}: {message}");
        self.observer.on_error(machine_id, &message);
        self.transition(CameraState::Reconnecting, &message);
    }

    fn open_and_probe(&self) -> Result<(Box<dyn VideoSource>, Frame), String> {
        let mut source = self
            .opener
            .open(&self.config.source, &self.config.settings)
            .map_err(|err| format!("camera failed to open: {err}"))?;
        match source.read() {
            Ok(Some(frame)) if frame.is_three_channel() => Ok((source, frame)),
            Ok(Some(frame)) => Err(format!(
                "camera opened but produced invalid frame {}x{}x{}",
                frame.width, frame.height, frame.channels
            )),
            Ok(None) => Err("camera opened but cannot read".to_string()),
            Err(err) => Err(format!("camera opened but read failed: {err}")),
        }
    }

    /// STREAMING: read one frame; any failure moves to RECONNECTING.
    fn stream_once(&mut self) {
        let machine_id = self.config.machine_id;
        let Some(source) = self.source.as_mut() else {
            self.transition(CameraState::Reconnecting, "camera handle missing");
            return;
        };

        match source.read() {
            Ok(Some(frame)) if frame.is_three_channel() => self.publish(frame),
            Ok(Some(frame)) => {
                warn!(
                    "{machine_id}: invalid frame dimensions {}x{}x{}, reconnecting",
                    frame.width, frame.height, frame.channels
                );
                self.transition(CameraState::Reconnecting, "invalid frame");
            }
            Ok(None) => {
                warn!("{machine_id}: failed to read frame, reconnecting");
                self.transition(CameraState::Reconnecting, "frame read failed");
            }
            Err(err) => {
                error!("{machine_id}: camera error: {err}");
                self.observer.on_error(machine_id, &err.to_string());
                self.transition(CameraState::Reconnecting, "camera error");
            }
        }
    }

    fn publish(&mut self, frame: Frame) {
        let machine_id = self.config.machine_id;
        let frame = Arc::new(frame);
        self.shared.buffer.put(frame.clone());
        self.observer.on_frame(machine_id, &frame);
        self.observer.on_heartbeat(machine_id);
        self.reconnect_attempts = 0;

        self.window_frames = self.window_frames.saturating_add(1);
        let elapsed = self.window_start.elapsed();
        if elapsed >= self.config.timing.fps_window {
            let fps = self.window_frames as f32 / elapsed.as_secs_f32();
            self.shared.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
            debug!("{machine_id}: camera FPS: {fps:.1}");
            self.window_frames = 0;
            self.window_start = Instant::now();
        }
    }

    /// RECONNECTING: release the handle, back off, then try again.
    fn reconnect(&mut self) {
        let machine_id = self.config.machine_id;
        self.source = None;
        self.shared.buffer.clear();
        self.shared.fps_bits.store(0f32.to_bits(), Ordering::Relaxed);
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);

        let timing = &self.config.timing;
        let delay = backoff_delay(timing.backoff_base, timing.backoff_cap, self.reconnect_attempts);
        info!(
            "{machine_id}: reconnecting in {:.1}s (attempt {})",
            delay.as_secs_f32(),
            self.reconnect_attempts
        );
        if sleep_while_running(&self.shared.running, delay) {
            self.shared
                .state
                .store(CameraState::Connecting as u8, Ordering::Release);
        }
    }

    fn cleanup(&mut self) {
        info!("{}: cleaning up camera", self.config.machine_id);
        self.source = None;
        self.shared.buffer.clear();
        self.transition(CameraState::Stopped, "camera stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use super::*;
    use crate::types::CaptureError;

    fn fast_timing(max_attempts: u32) -> CameraTiming {
        CameraTiming {
            max_reconnect_attempts: max_attempts,
            connect_retry_interval: Duration::from_millis(5),
            backoff_base: Duration::from_millis(5),
            backoff_cap: Duration::from_millis(20),
            fps_window: Duration::from_millis(50),
            buffer_capacity: 5,
        }
    }

    fn config(max_attempts: u32) -> CameraConfig {
        CameraConfig {
            machine_id: MachineId(1),
            source: SourceDescriptor::Device(0),
            settings: CaptureSettings::default(),
            timing: fast_timing(max_attempts),
        }
    }

    #[derive(Default)]
    struct Recorder {
        frames: AtomicUsize,
        heartbeats: AtomicUsize,
        errors: Mutex<Vec<String>>,
        states: Mutex<Vec<CameraState>>,
    }

    impl AcquisitionObserver for Recorder {
        fn on_frame(&self, _machine_id: MachineId, _frame: &Arc<Frame>) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }
        fn on_heartbeat(&self, _machine_id: MachineId) {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
        }
        fn on_status(&self, _machine_id: MachineId, state: CameraState, _message: &str) {
            self.states.lock().unwrap().push(state);
        }
        fn on_error(&self, _machine_id: MachineId, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }
    }

    #[derive(Default)]
    struct NeverOpens {
        attempts: AtomicUsize,
    }

    impl VideoSourceOpener for NeverOpens {
        fn open(
            &self,
            source: &SourceDescriptor,
            _settings: &CaptureSettings,
        ) -> Result<Box<dyn VideoSource>, CaptureError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(CaptureError::Open {
                uri: source.label(),
            })
        }
    }

    /// Source yielding `frames_per_session` good frames before failing.
    struct Flaky {
        frames_per_session: usize,
        opens: AtomicUsize,
    }

    struct FlakySource {
        remaining: usize,
    }

    impl VideoSource for FlakySource {
        fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            thread::sleep(Duration::from_millis(1));
            Ok(Some(Frame::bgr(vec![0; 4 * 4 * 3], 4, 4)))
        }
    }

    impl VideoSourceOpener for Flaky {
        fn open(
            &self,
            _source: &SourceDescriptor,
            _settings: &CaptureSettings,
        ) -> Result<Box<dyn VideoSource>, CaptureError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlakySource {
                remaining: self.frames_per_session,
            }))
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn exhausted_attempts_raise_error_and_keep_looping() {
        let opener = Arc::new(NeverOpens::default());
        let observer = Arc::new(Recorder::default());
        let mut handle = spawn_camera_unit(config(3), opener.clone(), observer.clone()).unwrap();

        assert!(wait_for(|| !observer.errors.lock().unwrap().is_empty()));
        assert!(opener.attempts.load(Ordering::SeqCst) >= 3);
        assert_eq!(
            observer.errors.lock().unwrap()[0],
            "failed to connect after 3 attempts"
        );

        assert!(wait_for(|| opener.attempts.load(Ordering::SeqCst) > 3));
        assert_ne!(handle.state(), CameraState::Stopped);

        handle.stop();
        assert!(handle.join_timeout(Duration::from_secs(2)));
        assert_eq!(handle.state(), CameraState::Stopped);
        assert_eq!(observer.frames.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn read_failure_triggers_reconnect_and_frames_resume() {
        let opener = Arc::new(Flaky {
            frames_per_session: 3,
            opens: AtomicUsize::new(0),
        });
        let observer = Arc::new(Recorder::default());
        let mut handle = spawn_camera_unit(config(2), opener.clone(), observer.clone()).unwrap();

        assert!(wait_for(|| opener.opens.load(Ordering::SeqCst) >= 3));
        handle.stop();
        assert!(handle.join_timeout(Duration::from_secs(2)));

        let frames = observer.frames.load(Ordering::SeqCst);
        assert!(frames >= 6);
        assert_eq!(frames, observer.heartbeats.load(Ordering::SeqCst));
        let states = observer.states.lock().unwrap();
        assert!(states.contains(&CameraState::Reconnecting));
        assert_eq!(states.last(), Some(&CameraState::Stopped));
        assert!(observer.errors.lock().unwrap().is_empty());
        assert!(handle.buffer().is_empty());
    }

    #[test]
    fn invalid_frames_are_never_published() {
        struct Gray;
        struct GraySource;
        impl VideoSource for GraySource {
            fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
                Ok(Some(Frame {
                    data: vec![0; 16],
                    width: 4,
                    height: 4,
                    channels: 1,
                    timestamp_ms: 0,
                }))
            }
        }
        impl VideoSourceOpener for Gray {
            fn open(
                &self,
                _source: &SourceDescriptor,
                _settings: &CaptureSettings,
            ) -> Result<Box<dyn VideoSource>, CaptureError> {
                Ok(Box::new(GraySource))
            }
        }

        let observer = Arc::new(Recorder::default());
        let mut handle = spawn_camera_unit(config(2), Arc::new(Gray), observer.clone()).unwrap();
        assert!(wait_for(|| !observer.errors.lock().unwrap().is_empty()));
        handle.stop();
        assert!(handle.join_timeout(Duration::from_secs(2)));
        assert_eq!(observer.frames.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn next_frame_is_oldest_and_latest_frame_is_newest() {
        struct Counting {
            release: Arc<AtomicBool>,
        }
        struct CountingSource {
            sent: u8,
            release: Arc<AtomicBool>,
        }
        impl VideoSource for CountingSource {
            fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
                if self.sent < 4 {
                    self.sent += 1;
                    return Ok(Some(Frame::bgr(vec![self.sent; 4 * 4 * 3], 4, 4)));
                }
                while !self.release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(None)
            }
        }
        impl VideoSourceOpener for Counting {
            fn open(
                &self,
                _source: &SourceDescriptor,
                _settings: &CaptureSettings,
            ) -> Result<Box<dyn VideoSource>, CaptureError> {
                Ok(Box::new(CountingSource {
                    sent: 0,
                    release: self.release.clone(),
                }))
            }
        }

        let release = Arc::new(AtomicBool::new(false));
        let observer = Arc::new(Recorder::default());
        let opener = Arc::new(Counting {
            release: release.clone(),
        });
        let mut handle = spawn_camera_unit(config(2), opener, observer.clone()).unwrap();
        assert!(wait_for(|| observer.frames.load(Ordering::SeqCst) == 4));

        assert_eq!(handle.latest_frame().unwrap().data[0], 4);
        assert_eq!(handle.next_frame(Duration::from_millis(100)).unwrap().data[0], 1);
        assert_eq!(handle.latest_frame().unwrap().data[0], 4);
        assert_eq!(handle.buffer().len(), 3);

        handle.stop();
        release.store(true, Ordering::SeqCst);
        assert!(handle.join_timeout(Duration::from_secs(2)));
    }
}
