use std::{convert::TryFrom, path::Path};

use occupancy::Detection;
use tch::{self, Device, Kind, Tensor};
use tracing::debug;
use video_ingest::Frame;

use crate::detector::{DetectorConfig, DetectorError, PersonDetector, validate_frame};

/// TorchScript-exported YOLO-style model. Output layout is `[1, C, N]` with
/// rows `cx, cy, w, h, person_score, ...` in detector input pixels.
pub struct TorchScriptDetector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    config: DetectorConfig,
}

impl TorchScriptDetector {
    /// Load a TorchScript module onto `device`.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
        config: DetectorConfig,
    ) -> Result<Self, DetectorError> {
        let module = tch::CModule::load_on_device(model_path, device)?;
        Ok(Self {
            module,
            device,
            input_size,
            config,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn input_size(&self) -> (i64, i64) {
        self.input_size
    }

    /// BGR frame to a normalized `[1, 3, H, W]` RGB tensor at the model's
    /// input size.
    fn bgr_to_tensor(&self, frame: &Frame) -> Tensor {
        let (in_w, in_h) = self.input_size;
        let (w, h) = (i64::from(frame.width), i64::from(frame.height));
        let rgb_order = Tensor::from_slice(&[2i64, 1, 0]).to_device(self.device);

        let tensor = Tensor::from_slice(&frame.data)
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, h, w, 3])
            .index_select(3, &rgb_order)
            .permute([0, 3, 1, 2])
            / 255.0;

        if (w, h) == (in_w, in_h) {
            tensor
        } else {
            tensor.upsample_bilinear2d([in_h, in_w], false, None::<f64>, None::<f64>)
        }
    }

    fn decode(&self, output: &Tensor, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        let shape = output.size();
        if shape.len() != 3 {
            return Err(DetectorError::Output(format!("shape {shape:?}")));
        }
        if shape[0] != 1 {
            return Err(DetectorError::Output(format!("batch {} != 1", shape[0])));
        }
        if shape[1] < 5 {
            return Err(DetectorError::Output(format!(
                "need at least 5 channels (x,y,w,h,person), got {}",
                shape[1]
            )));
        }

        let preds = output
            .to_device(Device::Cpu)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let (in_w, in_h) = self.input_size;
        let scale_x = frame.width as f32 / in_w.max(1) as f32;
        let scale_y = frame.height as f32 / in_h.max(1) as f32;
        let max_x = (frame.width - 1).max(0) as f32;
        let max_y = (frame.height - 1).max(0) as f32;

        let candidates = rows
            .into_iter()
            .filter(|row| row[4] >= self.config.confidence_threshold)
            .map(|row| {
                let (cx, cy, bw, bh) = (row[0], row[1], row[2], row[3]);
                let left = ((cx - bw / 2.0) * scale_x).clamp(0.0, max_x);
                let top = ((cy - bh / 2.0) * scale_y).clamp(0.0, max_y);
                let right = ((cx + bw / 2.0) * scale_x).clamp(0.0, max_x);
                let bottom = ((cy + bh / 2.0) * scale_y).clamp(0.0, max_y);
                Detection::new([left, top, right, bottom], row[4].clamp(0.0, 1.0))
            })
            .collect();

        Ok(self.config.finalize(candidates))
    }
}

impl PersonDetector for TorchScriptDetector {
    fn name(&self) -> &str {
        "torchscript"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        validate_frame(frame)?;
        let input = tch::no_grad(|| self.bgr_to_tensor(frame));
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))?;
        let people = self.decode(&output, frame)?;
        debug!(count = people.len(), device = ?self.device, "torchscript inference");
        Ok(people)
    }
}
