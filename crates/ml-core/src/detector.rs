use std::path::Path;

use anyhow::Result;
use tch::{self, Device, Kind, Tensor};

use crate::detection::{Detection, DetectionModel, non_max_suppression, top_by_score};

/// Upper bound on candidates handed to NMS for a single frame.
const MAX_CANDIDATES: usize = 512;

/// TorchScript-exported YOLO detector.
///
/// Expects the Ultralytics export layout: output `[1, 4 + classes, anchors]`
/// with center-xywh boxes in detector input pixels followed by per-class
/// scores.
pub struct Detector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl Detector {
    /// Load a TorchScript module onto `device`.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
    ) -> Result<Self> {
        let mut module = tch::CModule::load_on_device(model_path, device)?;
        module.set_eval();
        Ok(Self {
            module,
            device,
            input_size,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Override the model-level confidence floor applied before NMS.
    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    pub fn with_iou_threshold(mut self, iou: f32) -> Self {
        self.iou_threshold = iou;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn input_size(&self) -> (i64, i64) {
        self.input_size
    }

    /// Converts a BGR frame into a normalized RGB NCHW tensor resized to the
    /// detector input.
    pub fn bgr_to_tensor(&self, bgr: &[u8], width: i32, height: i32) -> Result<Tensor> {
        let expected = (width as usize) * (height as usize) * 3;
        if width <= 0 || height <= 0 || bgr.len() != expected {
            anyhow::bail!(
                "unexpected frame buffer size: got {} bytes, expected {}",
                bgr.len(),
                expected
            );
        }

        let (in_w, in_h) = self.input_size;
        let tensor = Tensor::from_slice(bgr)
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, height as i64, width as i64, 3])
            .flip([3])
            .permute([0, 3, 1, 2])
            / 255.0;

        if (width as i64, height as i64) == (in_w, in_h) {
            Ok(tensor)
        } else {
            Ok(tensor.upsample_bilinear2d([in_h, in_w], false, None, None))
        }
    }

    /// Executes the module and decodes boxes back into frame coordinates.
    pub fn infer(&self, input: &Tensor, frame_size: (i32, i32)) -> Result<Vec<Detection>> {
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))?;
        let shape = output.size();
        if shape.len() != 3 {
            anyhow::bail!("unexpected detector output shape: {shape:?}");
        }
        if shape[0] != 1 {
            anyhow::bail!("detector expected batch=1 but received {}", shape[0]);
        }
        if shape[1] < 5 {
            anyhow::bail!(
                "detector output requires at least 5 channels (x,y,w,h,score), got {}",
                shape[1]
            );
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let (in_w, in_h) = self.input_size;
        let scale_x = frame_size.0 as f32 / in_w as f32;
        let scale_y = frame_size.1 as f32 / in_h as f32;

        let mut candidates = Vec::new();
        for row in rows {
            let Some((class_id, score)) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if score < self.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            candidates.push(Detection {
                bbox_xyxy: [
                    (cx - w / 2.0) * scale_x,
                    (cy - h / 2.0) * scale_y,
                    (cx + w / 2.0) * scale_x,
                    (cy + h / 2.0) * scale_y,
                ],
                score,
                class_id: class_id as i64,
            });
        }

        Ok(non_max_suppression(
            top_by_score(candidates, MAX_CANDIDATES),
            self.iou_threshold,
        ))
    }
}

impl DetectionModel for Detector {
    fn detect(&mut self, bgr: &[u8], width: i32, height: i32) -> Result<Vec<Detection>> {
        let input = self.bgr_to_tensor(bgr, width, height)?;
        self.infer(&input, (width, height))
    }
}

