//! Configuration for the line monitor.
//!
//! The machines file (`config/machines_config.json`) is deserialized into a
//! [`MonitorConfig`]; CLI flags parsed into [`MonitorCliArgs`] override the
//! file where they overlap.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Args;
use ml_core::ItemClass;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use video_ingest::{CameraTiming, CaptureSettings, DEFAULT_FRAME_BUFFER_CAPACITY, MachineId};

use crate::pipeline::{inference::INFERENCE_QUEUE_CAPACITY, relay::RelaySettings};

pub const MACHINES_CONFIG_FILE: &str = "machines_config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceThresholds {
    #[serde(default = "default_oil_can_threshold")]
    pub oil_can: f32,
    #[serde(default = "default_bunk_hole_threshold")]
    pub bunk_hole: f32,
}

impl ConfidenceThresholds {
    pub fn for_class(&self, class: ItemClass) -> f32 {
        match class {
            ItemClass::OilCan => self.oil_can,
            ItemClass::BunkHole => self.bunk_hole,
        }
    }
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            oil_can: default_oil_can_threshold(),
            bunk_hole: default_bunk_hole_threshold(),
        }
    }
}

fn default_oil_can_threshold() -> f32 {
    0.40
}

fn default_bunk_hole_threshold() -> f32 {
    0.35
}

/// Camera capture and reconnect settings. Durations are in seconds unless
/// the field name says otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSection {
    pub rtsp_timeout_ms: i32,
    pub buffer_size: i32,
    pub default_fps: f64,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_base: f64,
    pub reconnect_backoff_max: f64,
    pub connect_retry_interval: f64,
    pub frame_buffer_size: usize,
}

impl Default for CameraSection {
    fn default() -> Self {
        Self {
            rtsp_timeout_ms: 5_000,
            buffer_size: 1,
            default_fps: 30.0,
            max_reconnect_attempts: 10,
            reconnect_backoff_base: 2.0,
            reconnect_backoff_max: 60.0,
            connect_retry_interval: 2.0,
            frame_buffer_size: DEFAULT_FRAME_BUFFER_CAPACITY,
        }
    }
}

impl CameraSection {
    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            buffer_size: self.buffer_size,
            fps: self.default_fps,
            stream_timeout_ms: self.rtsp_timeout_ms,
        }
    }

    pub fn timing(&self) -> CameraTiming {
        CameraTiming {
            max_reconnect_attempts: self.max_reconnect_attempts,
            connect_retry_interval: secs(self.connect_retry_interval),
            backoff_base: secs(self.reconnect_backoff_base),
            backoff_cap: secs(self.reconnect_backoff_max),
            buffer_capacity: frame_buffer_size_or_default(self.frame_buffer_size),
            ..CameraTiming::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub max_retries: u32,
    /// Seconds slept between attempts on one channel.
    pub retry_delay: f64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: 0.5,
        }
    }
}

impl RelaySection {
    pub fn settings(&self) -> RelaySettings {
        RelaySettings {
            max_retries: self.max_retries,
            retry_delay: secs(self.retry_delay),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSection {
    /// Square detector input edge in pixels.
    pub input_size: i64,
    pub queue_capacity: usize,
    pub iou_threshold: f32,
    pub use_cpu: bool,
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            input_size: 640,
            queue_capacity: INFERENCE_QUEUE_CAPACITY,
            iou_threshold: 0.45,
            use_cpu: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub machine_id: u32,
    pub name: String,
    pub camera_source: String,
    pub relay_start_channel: u8,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_thresholds: Option<ConfidenceThresholds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_config: Option<CameraSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_timeout: Option<f64>,
}

fn default_enabled() -> bool {
    true
}

impl MachineConfig {
    pub fn id(&self) -> MachineId {
        MachineId(self.machine_id)
    }
}

/// Canonical configuration shared by every component.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub model_path: PathBuf,
    #[serde(default)]
    pub confidence_thresholds: ConfidenceThresholds,
    #[serde(default)]
    pub camera_config: CameraSection,
    #[serde(default)]
    pub relay_config: RelaySection,
    #[serde(default)]
    pub inference: InferenceSection,
    /// Seconds without a camera heartbeat before the watchdog fires.
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout: f64,
    pub machines: Vec<MachineConfig>,
}

fn default_watchdog_timeout() -> f64 {
    15.0
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let machines = [(1, "192.168.1.64", 6), (2, "192.168.1.65", 9), (3, "192.168.1.66", 12)]
            .into_iter()
            .map(|(id, host, relay)| MachineConfig {
                machine_id: id,
                name: format!("Machine {id}"),
                camera_source: format!("rtsp://{host}:554/Streaming/Channels/101"),
                relay_start_channel: relay,
                enabled: true,
                confidence_thresholds: None,
                camera_config: None,
                watchdog_timeout: None,
            })
            .collect();

        Self {
            model_path: PathBuf::from("best.pt"),
            confidence_thresholds: ConfidenceThresholds::default(),
            camera_config: CameraSection::default(),
            relay_config: RelaySection::default(),
            inference: InferenceSection::default(),
            watchdog_timeout: default_watchdog_timeout(),
            machines,
        }
    }
}

impl MonitorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path`, writing and returning defaults when the file is missing.
    /// Unreadable or malformed files fall back to defaults without
    /// overwriting them.
    pub fn load_or_create(path: &Path) -> Self {
        if !path.exists() {
            warn!(
                "machines config {} not found, creating default",
                path.display()
            );
            let config = Self::default();
            if let Err(err) = config.save(path) {
                warn!("failed to write default machines config: {err}");
            }
            return config;
        }

        match Self::load(path) {
            Ok(config) => {
                info!("loaded machines config: {} machine(s)", config.machines.len());
                config
            }
            Err(err) => {
                warn!("{err}; using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json + "\n").map_err(io_err)
    }

    /// Structural checks that make the whole file unusable. Per-machine relay
    /// ranges are checked when the relay block is configured so a bad entry
    /// only degrades that machine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.machines.is_empty() {
            return Err(ConfigError::Invalid("no machines configured".into()));
        }

        let mut seen = HashSet::new();
        for machine in &self.machines {
            if !seen.insert(machine.machine_id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate machine_id {}",
                    machine.machine_id
                )));
            }
            if machine.camera_source.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{} has an empty camera_source",
                    machine.id()
                )));
            }
            let thresholds = self.thresholds_for(machine);
            for class in ItemClass::ALL {
                let value = thresholds.for_class(class);
                if !(0.0..=1.0).contains(&value) {
                    return Err(ConfigError::Invalid(format!(
                        "{} threshold for {} must be within [0, 1], got {value}",
                        machine.id(),
                        class.key()
                    )));
                }
            }
            if self.watchdog_timeout_for(machine).is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{} watchdog timeout must be positive",
                    machine.id()
                )));
            }
        }

        if self.inference.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "inference queue capacity must be at least 1".into(),
            ));
        }
        if self.inference.input_size <= 0 {
            return Err(ConfigError::Invalid(
                "inference input size must be positive".into(),
            ));
        }

        Ok(())
    }

    pub fn enabled_machines(&self) -> impl Iterator<Item = &MachineConfig> {
        self.machines.iter().filter(|m| m.enabled)
    }

    pub fn thresholds_for(&self, machine: &MachineConfig) -> ConfidenceThresholds {
        machine
            .confidence_thresholds
            .unwrap_or(self.confidence_thresholds)
    }

    pub fn camera_for<'a>(&'a self, machine: &'a MachineConfig) -> &'a CameraSection {
        machine.camera_config.as_ref().unwrap_or(&self.camera_config)
    }

    pub fn watchdog_timeout_for(&self, machine: &MachineConfig) -> Duration {
        secs(machine.watchdog_timeout.unwrap_or(self.watchdog_timeout))
    }
}

/// Location of a machine's boundary polygons inside the config directory.
pub fn boundary_file(config_dir: &Path, machine_id: MachineId) -> PathBuf {
    config_dir.join(format!("machine{}_boundaries.json", machine_id.0))
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

fn frame_buffer_size_or_default(size: usize) -> usize {
    if size == 0 {
        DEFAULT_FRAME_BUFFER_CAPACITY
    } else {
        size
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Lower the default log filter to `debug`.
    pub verbose: bool,
}

/// Runtime options resolved from the CLI.
#[derive(Clone, Debug)]
pub struct RunOptions {
    pub config_dir: PathBuf,
    pub config_path: PathBuf,
    pub model_override: Option<PathBuf>,
    pub stream_events: bool,
    pub telemetry: TelemetryOptions,
}

/// CLI arguments shared by every `line-monitor` subcommand.
#[derive(Debug, Args)]
pub struct MonitorCliArgs {
    /// Directory holding the machines file and boundary files.
    #[arg(long = "config-dir", value_name = "DIR", default_value = "config")]
    pub config_dir: PathBuf,
    /// Machines file (defaults to `<config-dir>/machines_config.json`).
    #[arg(long = "config", value_name = "PATH")]
    pub config_path: Option<PathBuf>,
    /// TorchScript model path (overrides the machines file).
    #[arg(long = "model", value_name = "PATH")]
    pub model_path: Option<PathBuf>,
    /// Publish per-frame, heartbeat, detection and stats events.
    #[arg(long = "stream-events", action = clap::ArgAction::SetTrue)]
    pub stream_events: bool,
    /// Enable debug logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl From<MonitorCliArgs> for RunOptions {
    fn from(args: MonitorCliArgs) -> Self {
        let config_path = args
            .config_path
            .unwrap_or_else(|| args.config_dir.join(MACHINES_CONFIG_FILE));
        Self {
            config_dir: args.config_dir,
            config_path,
            model_override: args.model_path,
            stream_events: args.stream_events,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                verbose: args.verbose,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment() {
        let config = MonitorConfig::default();
        assert_eq!(config.machines.len(), 3);
        assert_eq!(
            config
                .machines
                .iter()
                .map(|m| m.relay_start_channel)
                .collect::<Vec<_>>(),
            vec![6, 9, 12]
        );
        assert_eq!(config.confidence_thresholds.oil_can, 0.40);
        assert_eq!(config.confidence_thresholds.bunk_hole, 0.35);
        assert_eq!(config.camera_config.max_reconnect_attempts, 10);
        assert_eq!(config.relay_config.max_retries, 3);
        assert_eq!(config.inference.queue_capacity, 30);
        config.validate().unwrap();
    }

    #[test]
    fn sparse_file_fills_defaults() {
        let raw = r#"{
            "model_path": "weights/best.pt",
            "camera_config": {"max_reconnect_attempts": 4},
            "machines": [
                {"machine_id": 2, "name": "Press", "camera_source": "0", "relay_start_channel": 1,
                 "confidence_thresholds": {"oil_can": 0.6}}
            ]
        }"#;
        let config: MonitorConfig = serde_json::from_str(raw).unwrap();
        let machine = &config.machines[0];
        assert!(machine.enabled);
        assert_eq!(config.camera_config.max_reconnect_attempts, 4);
        assert_eq!(config.camera_config.reconnect_backoff_max, 60.0);
        let thresholds = config.thresholds_for(machine);
        assert_eq!(thresholds.oil_can, 0.6);
        assert_eq!(thresholds.bunk_hole, 0.35);
        assert_eq!(config.watchdog_timeout_for(machine), Duration::from_secs(15));

        let timing = config.camera_for(machine).timing();
        assert_eq!(timing.max_reconnect_attempts, 4);
        assert_eq!(timing.backoff_cap, Duration::from_secs(60));
        assert_eq!(timing.buffer_capacity, 5);
    }

    #[test]
    fn machine_camera_section_overrides_the_shared_one() {
        let config = MonitorConfig::default();
        let mut machine = config.machines[0].clone();
        machine.camera_config = Some(CameraSection {
            max_reconnect_attempts: 2,
            ..CameraSection::default()
        });

        assert_eq!(config.camera_for(&machine).max_reconnect_attempts, 2);
        assert_eq!(config.camera_for(&config.machines[1]).max_reconnect_attempts, 10);
    }

    #[test]
    fn validation_rejects_duplicates_and_bad_thresholds() {
        let mut config = MonitorConfig::default();
        config.machines[1].machine_id = 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = MonitorConfig::default();
        config.confidence_thresholds.bunk_hole = 1.5;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.machines.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(MACHINES_CONFIG_FILE);
        let config = MonitorConfig::load_or_create(&path);
        assert!(path.exists());
        assert_eq!(MonitorConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn malformed_file_falls_back_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MACHINES_CONFIG_FILE);
        fs::write(&path, "{ not json").unwrap();
        let config = MonitorConfig::load_or_create(&path);
        assert_eq!(config, MonitorConfig::default());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn boundary_files_are_per_machine() {
        assert_eq!(
            boundary_file(Path::new("config"), MachineId(3)),
            PathBuf::from("config/machine3_boundaries.json")
        );
    }
}
