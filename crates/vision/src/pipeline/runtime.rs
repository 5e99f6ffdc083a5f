//! libtorch CUDA runtime loading and the TorchScript model loader.

use std::sync::Once;

use anyhow::Context;
use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_NOW};
use ml_core::{
    DetectionModel,
    detector::Detector,
    tch::{Cuda, Device},
};
use tracing::{debug, info, warn};

use crate::pipeline::{config::MonitorConfig, inference::ModelLoader};

/// Preload the libtorch CUDA libraries so `Device::cuda_if_available` can
/// see the GPU. Handles are leaked for the process lifetime.
pub(crate) fn load_torch_cuda_runtime(verbose: bool) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let mut handles = Vec::new();
        for lib in [
            "libtorch_cuda.so",
            "libtorch_cuda_cu.so",
            "libtorch_cuda_cpp.so",
        ] {
            match unsafe { Library::open(Some(lib), RTLD_NOW | RTLD_GLOBAL) } {
                Ok(handle) => {
                    if verbose {
                        info!("loaded {lib}");
                    }
                    handles.push(handle);
                }
                Err(err) => {
                    if verbose {
                        warn!("failed to load {lib}: {err}");
                    }
                }
            }
        }
        Box::leak(Box::new(handles));
    });
}

/// Loader for the configured TorchScript model. The model-level confidence
/// floor is the lowest per-class threshold in the config so per-machine
/// thresholds can still be applied downstream.
pub(crate) fn torch_model_loader(config: &MonitorConfig, verbose: bool) -> ModelLoader {
    let model_path = config.model_path.clone();
    let use_cpu = config.inference.use_cpu;
    let input_size = config.inference.input_size;
    let iou_threshold = config.inference.iou_threshold;
    let confidence_floor = config
        .machines
        .iter()
        .map(|machine| config.thresholds_for(machine))
        .chain(std::iter::once(config.confidence_thresholds))
        .flat_map(|t| [t.oil_can, t.bunk_hole])
        .fold(1.0f32, f32::min);

    Box::new(move || -> anyhow::Result<Box<dyn DetectionModel>> {
        if !use_cpu {
            load_torch_cuda_runtime(verbose);
        }
        let device = if use_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available()
        };
        debug!(
            "CUDA available: {} (devices: {})",
            Cuda::is_available(),
            Cuda::device_count()
        );

        let detector = Detector::new(&model_path, device, (input_size, input_size))
            .with_context(|| format!("failed to load model {}", model_path.display()))?
            .with_confidence_threshold(confidence_floor)
            .with_iou_threshold(iou_threshold);
        info!(
            "detector loaded from {} on {:?} ({}x{} input)",
            model_path.display(),
            detector.device(),
            input_size,
            input_size
        );
        Ok(Box::new(detector))
    })
}
