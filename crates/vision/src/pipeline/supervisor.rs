//! System supervisor.
//!
//! Builds one slot per enabled machine (classifier, watchdog, camera unit),
//! shares a single relay actuator and inference worker between them, and
//! tears everything down in order: watchdogs, cameras, inference, relays.

use std::{
    path::PathBuf,
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, error, info, trace, warn};
use video_ingest::{
    AcquisitionObserver, CameraConfig, CameraHandle, CameraState, CaptureError, CaptureSettings,
    Frame, MachineId, SourceDescriptor, VideoSource, VideoSourceOpener, spawn_camera_unit,
};

use crate::pipeline::{
    boundaries::BoundarySet,
    classifier::MachineClassifier,
    config::{MonitorConfig, RunOptions, boundary_file},
    events::{EVENT_BUS_CAPACITY, EventBus, SystemEvent},
    inference::{InferenceMultiplexer, InferenceResult, ModelLoader},
    relay::{RelayActuator, RelayBoardOpener},
    telemetry::{self, WorkerHandle},
    watchdog::{WATCHDOG_POLL_INTERVAL, Watchdog, WatchdogSource, spawn_watchdog},
};

const WATCHDOG_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const CAMERA_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const INFERENCE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const EVENT_POLL: Duration = Duration::from_millis(200);
const METRICS_INTERVAL: Duration = Duration::from_secs(1);

/// Hardware and model backends the system is built on.
pub struct Backends {
    pub cameras: Arc<dyn VideoSourceOpener>,
    pub relays: Arc<dyn RelayBoardOpener>,
    pub model: ModelLoader,
}

/// Backends selected by the enabled cargo features.
pub fn default_backends(config: &MonitorConfig, verbose: bool) -> Backends {
    #[cfg(feature = "opencv")]
    let cameras: Arc<dyn VideoSourceOpener> = Arc::new(video_ingest::OpenCvOpener);
    #[cfg(not(feature = "opencv"))]
    let cameras: Arc<dyn VideoSourceOpener> = Arc::new(NoCameraBackend);

    #[cfg(feature = "with-tch")]
    let model = crate::pipeline::runtime::torch_model_loader(config, verbose);
    #[cfg(not(feature = "with-tch"))]
    let model: ModelLoader = {
        let _ = (config, verbose);
        Box::new(|| -> Result<Box<dyn ml_core::DetectionModel>> {
            bail!("built without the `with-tch` feature; no detection backend")
        })
    };

    Backends {
        cameras,
        relays: default_relay_opener(),
        model,
    }
}

fn default_relay_opener() -> Arc<dyn RelayBoardOpener> {
    #[cfg(feature = "usb-relay")]
    {
        Arc::new(crate::pipeline::hid_relay::HidRelayOpener::new())
    }
    #[cfg(not(feature = "usb-relay"))]
    {
        Arc::new(crate::pipeline::relay::NoRelayBoard)
    }
}

/// Camera opener used when no capture backend is compiled in.
#[cfg_attr(feature = "opencv", allow(dead_code))]
struct NoCameraBackend;

impl VideoSourceOpener for NoCameraBackend {
    fn open(
        &self,
        source: &SourceDescriptor,
        _settings: &CaptureSettings,
    ) -> Result<Box<dyn VideoSource>, CaptureError> {
        Err(CaptureError::Other(anyhow!(
            "cannot open {source}: built without the `opencv` feature"
        )))
    }
}

/// Routes one camera's callbacks into the watchdog, the event bus and the
/// inference queue.
struct MachineLink {
    classifier: Arc<MachineClassifier>,
    watchdog: Arc<Watchdog>,
    inference: Arc<InferenceMultiplexer>,
    bus: EventBus,
}

impl AcquisitionObserver for MachineLink {
    fn on_frame(&self, machine_id: MachineId, frame: &Arc<Frame>) {
        self.bus.publish(SystemEvent::FrameReady {
            machine_id,
            frame: frame.clone(),
        });
        self.inference
            .submit(machine_id, frame.clone(), self.classifier.boundaries());
    }

    fn on_heartbeat(&self, machine_id: MachineId) {
        self.watchdog.heartbeat();
        self.bus.publish(SystemEvent::Heartbeat { machine_id });
    }

    fn on_status(&self, machine_id: MachineId, state: CameraState, message: &str) {
        if state == CameraState::Reconnecting {
            metrics::counter!("monitor_camera_reconnects_total", "machine" => machine_id.to_string())
                .increment(1);
        }
        self.bus.publish(SystemEvent::CameraStatus {
            machine_id,
            state,
            message: message.to_string(),
        });
    }

    fn on_error(&self, machine_id: MachineId, message: &str) {
        self.bus.publish(SystemEvent::CameraError {
            machine_id,
            message: message.to_string(),
        });
    }
}

struct MachineSlot {
    machine_id: MachineId,
    classifier: Arc<MachineClassifier>,
    watchdog: Arc<Watchdog>,
    camera_config: CameraConfig,
    camera: Option<CameraHandle>,
    watchdog_worker: Option<WorkerHandle>,
}

/// The running line monitor.
pub struct MonitorSystem {
    config_dir: PathBuf,
    slots: Vec<MachineSlot>,
    relays: Arc<RelayActuator>,
    inference: Arc<InferenceMultiplexer>,
    cameras: Arc<dyn VideoSourceOpener>,
    model: Option<ModelLoader>,
    bus: EventBus,
    started: bool,
    relays_released: bool,
}

impl MonitorSystem {
    /// Validate the config and build every component without starting any
    /// thread. A machine whose relay block or boundary file is unusable is
    /// still built, with relays disabled or empty boundaries.
    pub fn build(
        config: MonitorConfig,
        config_dir: impl Into<PathBuf>,
        backends: Backends,
        bus: EventBus,
    ) -> Result<Self> {
        config.validate().context("invalid machines config")?;
        let config_dir = config_dir.into();

        let relays = Arc::new(RelayActuator::new(
            backends.relays,
            config.relay_config.settings(),
        ));
        relays.initialize();
        let inference = Arc::new(InferenceMultiplexer::new(config.inference.queue_capacity));

        let mut slots = Vec::new();
        for machine in config.enabled_machines() {
            let machine_id = machine.id();
            let relays_for_machine =
                match relays.configure_machine(machine_id, machine.relay_start_channel) {
                    Ok(_) => Some(relays.clone()),
                    Err(err) => {
                        error!("{machine_id}: relay outputs disabled: {err}");
                        None
                    }
                };

            let classifier = Arc::new(MachineClassifier::new(
                machine_id,
                machine.name.clone(),
                config.thresholds_for(machine),
                relays_for_machine,
                bus.clone(),
            ));
            let boundaries_path = boundary_file(&config_dir, machine_id);
            if let Err(err) = classifier.load_boundaries(&boundaries_path) {
                warn!("{machine_id}: {err}; starting with empty boundaries");
            }

            let camera = config.camera_for(machine);
            let camera_config = CameraConfig {
                machine_id,
                source: SourceDescriptor::parse(&machine.camera_source),
                settings: camera.capture_settings(),
                timing: camera.timing(),
            };
            let watchdog = Arc::new(Watchdog::new(
                WatchdogSource {
                    machine_id,
                    component: "camera",
                },
                config.watchdog_timeout_for(machine),
            ));

            slots.push(MachineSlot {
                machine_id,
                classifier,
                watchdog,
                camera_config,
                camera: None,
                watchdog_worker: None,
            });
        }
        slots.sort_by_key(|slot| slot.machine_id);

        if slots.is_empty() {
            warn!("no enabled machines in config");
        }

        Ok(Self {
            config_dir,
            slots,
            relays,
            inference,
            cameras: backends.cameras,
            model: Some(backends.model),
            bus,
            started: false,
            relays_released: false,
        })
    }

    /// Spawn the inference worker, then a watchdog and a camera unit per
    /// machine. A model that fails to load does not stop the rest.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let Some(model) = self.model.take() else {
            bail!("monitor system cannot be restarted");
        };
        self.started = true;

        let classifiers: Vec<Arc<MachineClassifier>> =
            self.slots.iter().map(|s| s.classifier.clone()).collect();
        self.inference
            .start(
                model,
                Box::new(move |result: InferenceResult| {
                    match classifiers
                        .iter()
                        .find(|c| c.machine_id() == result.machine_id)
                    {
                        Some(classifier) => {
                            classifier.process_with(&result.detections, &result.boundaries);
                        }
                        None => debug!("{}: result for unknown machine", result.machine_id),
                    }
                }),
                self.bus.clone(),
            )
            .context("failed to spawn inference worker")?;

        for slot in &mut self.slots {
            let machine_id = slot.machine_id;
            slot.watchdog_worker = Some(
                spawn_watchdog(slot.watchdog.clone(), WATCHDOG_POLL_INTERVAL, self.bus.clone())
                    .with_context(|| format!("{machine_id}: failed to spawn watchdog"))?,
            );

            let link = Arc::new(MachineLink {
                classifier: slot.classifier.clone(),
                watchdog: slot.watchdog.clone(),
                inference: self.inference.clone(),
                bus: self.bus.clone(),
            });
            slot.camera = Some(
                spawn_camera_unit(slot.camera_config.clone(), self.cameras.clone(), link)
                    .with_context(|| format!("{machine_id}: failed to spawn camera unit"))?,
            );
            info!(
                "{machine_id}: started ({}, source {})",
                slot.classifier.name(),
                slot.camera_config.source
            );
        }
        Ok(())
    }

    /// Stop everything and drive all relays OFF. Idempotent.
    pub fn stop(&mut self) {
        if self.started {
            info!("stopping monitor system");
            for slot in &self.slots {
                slot.watchdog.stop();
            }
            for slot in &mut self.slots {
                if let Some(mut worker) = slot.watchdog_worker.take() {
                    worker.join_timeout(WATCHDOG_JOIN_TIMEOUT);
                }
            }

            for slot in &self.slots {
                if let Some(camera) = slot.camera.as_ref() {
                    camera.stop();
                }
            }
            for slot in &mut self.slots {
                if let Some(mut camera) = slot.camera.take() {
                    camera.join_timeout(CAMERA_JOIN_TIMEOUT);
                }
            }

            self.inference.stop(INFERENCE_JOIN_TIMEOUT);
            self.started = false;
        }

        if !self.relays_released {
            self.relays.shutdown();
            self.relays_released = true;
        }
    }

    pub fn is_running(&self) -> bool {
        self.started
    }

    pub fn machine_ids(&self) -> Vec<MachineId> {
        self.slots.iter().map(|slot| slot.machine_id).collect()
    }

    pub fn classifier(&self, machine_id: MachineId) -> Option<&Arc<MachineClassifier>> {
        self.slot(machine_id).map(|slot| &slot.classifier)
    }

    pub fn camera(&self, machine_id: MachineId) -> Option<&CameraHandle> {
        self.slot(machine_id).and_then(|slot| slot.camera.as_ref())
    }

    pub fn watchdog(&self, machine_id: MachineId) -> Option<&Arc<Watchdog>> {
        self.slot(machine_id).map(|slot| &slot.watchdog)
    }

    pub fn relays(&self) -> &Arc<RelayActuator> {
        &self.relays
    }

    pub fn inference(&self) -> &Arc<InferenceMultiplexer> {
        &self.inference
    }

    pub fn boundary_path(&self, machine_id: MachineId) -> PathBuf {
        boundary_file(&self.config_dir, machine_id)
    }

    /// Re-read the machine's boundary file and swap the snapshot in.
    pub fn reload_boundaries(&self, machine_id: MachineId) -> Result<()> {
        let classifier = self
            .classifier(machine_id)
            .ok_or_else(|| anyhow!("{machine_id}: not monitored"))?;
        classifier.load_boundaries(&self.boundary_path(machine_id))?;
        Ok(())
    }

    /// Persist `boundaries` to the machine's file and apply them.
    pub fn set_boundaries(&self, machine_id: MachineId, boundaries: BoundarySet) -> Result<()> {
        let classifier = self
            .classifier(machine_id)
            .ok_or_else(|| anyhow!("{machine_id}: not monitored"))?;
        let path = self.boundary_path(machine_id);
        boundaries.save(&path)?;
        classifier.set_boundaries(boundaries);
        Ok(())
    }

    /// Refresh per-camera gauges.
    pub fn record_metrics(&self) {
        for slot in &self.slots {
            if let Some(camera) = slot.camera.as_ref() {
                metrics::gauge!("monitor_camera_fps", "machine" => slot.machine_id.to_string())
                    .set(camera.fps() as f64);
            }
        }
    }

    fn slot(&self, machine_id: MachineId) -> Option<&MachineSlot> {
        self.slots
            .binary_search_by_key(&machine_id, |slot| slot.machine_id)
            .ok()
            .map(|index| &self.slots[index])
    }
}

impl Drop for MonitorSystem {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the monitor until Ctrl+C, logging every published event.
pub fn run(options: RunOptions) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("failed to install Ctrl+C handler: {err}");
        }
    });

    let _telemetry_guard = telemetry::enter_runtime(&options.telemetry);
    let _ = telemetry::init_metrics_recorder();

    let config = load_config(&options);
    let monitor_span = tracing::info_span!(
        "monitor",
        machines = config.enabled_machines().count(),
        model = %config.model_path.display(),
        stream_events = options.stream_events
    );
    let _monitor_guard = monitor_span.enter();

    let (bus, events) = EventBus::new(EVENT_BUS_CAPACITY, options.stream_events);
    let backends = default_backends(&config, options.telemetry.verbose);
    let mut system = MonitorSystem::build(config, &options.config_dir, backends, bus)?;
    system.start()?;
    info!(
        "monitoring {} machine(s); press Ctrl+C to stop",
        system.machine_ids().len()
    );

    let mut last_metrics = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        match events.recv_timeout(EVENT_POLL) {
            Ok(event) => log_event(&event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if last_metrics.elapsed() >= METRICS_INTERVAL {
            system.record_metrics();
            last_metrics = Instant::now();
        }
    }

    system.stop();
    if let Some(handle) = telemetry::prometheus_handle() {
        debug!("final metrics:\n{}", handle.render());
    }
    info!("monitor stopped");
    Ok(())
}

/// Pulse every configured machine's relays once (ON 1 s, OFF).
pub fn test_relays(options: RunOptions) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&options.telemetry);
    let config = load_config(&options);

    let relays = RelayActuator::new(default_relay_opener(), config.relay_config.settings());
    if !relays.initialize() {
        bail!("relay board not found");
    }

    let mut failed = Vec::new();
    for machine in config.enabled_machines() {
        let machine_id = machine.id();
        let outcome = relays
            .configure_machine(machine_id, machine.relay_start_channel)
            .and_then(|_| relays.test_machine_relays(machine_id));
        match outcome {
            Ok(()) => info!("{machine_id}: relays OK"),
            Err(err) => {
                error!("{machine_id}: relay test failed: {err}");
                failed.push(machine_id);
            }
        }
    }
    relays.shutdown();

    if failed.is_empty() {
        Ok(())
    } else {
        bail!("relay test failed for {failed:?}")
    }
}

fn load_config(options: &RunOptions) -> MonitorConfig {
    let mut config = MonitorConfig::load_or_create(&options.config_path);
    if let Some(model) = options.model_override.as_ref() {
        config.model_path = model.clone();
    }
    config
}

fn log_event(event: &SystemEvent) {
    match event {
        SystemEvent::CameraStatus {
            machine_id,
            state,
            message,
        } => info!("{machine_id}: camera {}: {message}", state.label()),
        SystemEvent::CameraError {
            machine_id,
            message,
        } => warn!("{machine_id}: camera error: {message}"),
        SystemEvent::PairStatusChanged {
            machine_id,
            statuses,
        } => info!(
            "{machine_id}: pair1 {} | pair2 {} | pair3 {}",
            statuses[0].label(),
            statuses[1].label(),
            statuses[2].label()
        ),
        SystemEvent::WatchdogTimeout { source, elapsed } => {
            warn!("watchdog {source} silent for {:.1}s", elapsed.as_secs_f32())
        }
        SystemEvent::InferenceError { message } => warn!("inference error: {message}"),
        SystemEvent::InferenceUnavailable { message } => {
            error!("inference unavailable: {message}")
        }
        SystemEvent::DetectionsReady {
            machine_id,
            detections,
            fps,
        } => debug!(
            "{machine_id}: {} detection(s) at {fps:.1} fps",
            detections.len()
        ),
        SystemEvent::StatsUpdated { machine_id, stats } => debug!(
            "{machine_id}: cycle {} faults {} first-fault {:?}",
            stats.total_cycles,
            stats.fault_count,
            stats.fault_time_labels()
        ),
        SystemEvent::FrameReady { machine_id, frame } => {
            trace!("{machine_id}: frame {}x{}", frame.width, frame.height)
        }
        SystemEvent::Heartbeat { machine_id } => trace!("{machine_id}: heartbeat"),
    }
}
