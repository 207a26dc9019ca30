//! Classifier adapter: maps cropped particle images onto a configured label
//! set through an externally supplied model.
//!
//! The pipeline never depends on a particular model family, only on the
//! [`Classifier`] contract. When no model is available the
//! [`DisabledClassifier`] stands in so size and count statistics keep
//! flowing with every particle labelled `unclassified`.

use thiserror::Error;

use crate::image::GrayFrame;
use crate::segment::Region;

/// Label used when classification is disabled or unavailable.
pub const UNCLASSIFIED_LABEL: &str = "unclassified";

/// Fixed-shape normalized grayscale patch cut around one region.
pub struct Crop {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug)]
pub struct Prediction {
    /// Drawn from the configured closed label set.
    pub label: String,
    /// In `[0, 1]`.
    pub confidence: f32,
}

impl Prediction {
    pub fn unclassified() -> Self {
        Self {
            label: UNCLASSIFIED_LABEL.to_string(),
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Capability contract for an externally provided prediction function.
pub trait Classifier: Send + Sync {
    /// One prediction per crop, in order.
    fn predict(&self, crops: &[Crop]) -> Result<Vec<Prediction>, ClassifyError>;

    /// False for stand-ins that always answer `unclassified`; lets callers
    /// skip crop preparation entirely.
    fn enabled(&self) -> bool {
        true
    }
}

/// Stand-in used when no model is configured or the model failed to load.
pub struct DisabledClassifier;

impl Classifier for DisabledClassifier {
    fn predict(&self, crops: &[Crop]) -> Result<Vec<Prediction>, ClassifyError> {
        Ok(crops.iter().map(|_| Prediction::unclassified()).collect())
    }

    fn enabled(&self) -> bool {
        false
    }
}

/// Margin of context pixels kept around the region bounding box.
const CROP_MARGIN: u32 = 2;

/// Cut a square, fixed-size crop around a region from the corrected frame.
///
/// The bounding box (plus margin) is scaled to fit `size` with
/// nearest-neighbour sampling and centred on a background-level (1.0) canvas,
/// preserving the particle's aspect ratio.
pub fn crop_region(corrected: &GrayFrame, region: &Region, size: u32) -> Crop {
    let x0 = region.bbox.x0.saturating_sub(CROP_MARGIN);
    let y0 = region.bbox.y0.saturating_sub(CROP_MARGIN);
    let x1 = (region.bbox.x1 + CROP_MARGIN).min(corrected.width - 1);
    let y1 = (region.bbox.y1 + CROP_MARGIN).min(corrected.height - 1);
    let src_w = x1 - x0 + 1;
    let src_h = y1 - y0 + 1;

    let scale = (size as f32 / src_w.max(src_h) as f32).min(1.0);
    let dst_w = ((src_w as f32 * scale).round() as u32).clamp(1, size);
    let dst_h = ((src_h as f32 * scale).round() as u32).clamp(1, size);
    let off_x = (size - dst_w) / 2;
    let off_y = (size - dst_h) / 2;

    let mut data = vec![1.0f32; (size * size) as usize];
    for dy in 0..dst_h {
        let sy = y0 + ((dy as f32 + 0.5) / scale) as u32;
        let sy = sy.min(y1);
        for dx in 0..dst_w {
            let sx = x0 + ((dx as f32 + 0.5) / scale) as u32;
            let sx = sx.min(x1);
            let out = (off_y + dy) * size + (off_x + dx);
            data[out as usize] = corrected.get(sx, sy);
        }
    }

    Crop {
        data,
        width: size,
        height: size,
    }
}

#[cfg(feature = "with-tch")]
pub mod torch {
    //! TorchScript-backed classifier.

    use std::path::Path;

    use anyhow::{Context, Result, bail};
    use tch::{CModule, Device, Kind, Tensor};
    use tracing::debug;

    use super::{Classifier, ClassifyError, Crop, Prediction};

    /// Adapter around an already-trained TorchScript classification module.
    ///
    /// The module is expected to take `[N, 1, H, W]` float input in `[0, 1]`
    /// and return `[N, L]` scores over the configured label set.
    pub struct TorchClassifier {
        module: CModule,
        device: Device,
        labels: Vec<String>,
        input_size: (i64, i64),
    }

    impl TorchClassifier {
        pub fn new<P: AsRef<Path>>(
            model_path: P,
            device: Device,
            labels: Vec<String>,
            input_size: (i64, i64),
        ) -> Result<Self> {
            if labels.is_empty() {
                bail!("classifier label set must not be empty");
            }
            let module = CModule::load_on_device(model_path.as_ref(), device)
                .with_context(|| {
                    format!("failed to load classifier {}", model_path.as_ref().display())
                })?;
            debug!(
                "Classifier loaded on {:?} with {} label(s)",
                device,
                labels.len()
            );
            Ok(Self {
                module,
                device,
                labels,
                input_size,
            })
        }

        fn crops_to_tensor(&self, crops: &[Crop]) -> Result<Tensor, ClassifyError> {
            let (in_h, in_w) = self.input_size;
            let mut tensors = Vec::with_capacity(crops.len());
            for crop in crops {
                if (crop.width as i64, crop.height as i64) != (in_w, in_h) {
                    return Err(ClassifyError::Other(anyhow::anyhow!(
                        "crop is {}x{} but classifier expects {in_w}x{in_h}",
                        crop.width,
                        crop.height
                    )));
                }
                let tensor = Tensor::from_slice(&crop.data)
                    .to_device(self.device)
                    .to_kind(Kind::Float)
                    .view([1, 1, in_h, in_w]);
                tensors.push(tensor);
            }
            Ok(Tensor::cat(&tensors, 0))
        }
    }

    impl Classifier for TorchClassifier {
        fn predict(&self, crops: &[Crop]) -> Result<Vec<Prediction>, ClassifyError> {
            if crops.is_empty() {
                return Ok(Vec::new());
            }
            let input = self.crops_to_tensor(crops)?;
            let scores = self
                .module
                .forward_ts(&[input])
                .map_err(|err| ClassifyError::Unavailable(err.to_string()))?
                .softmax(-1, Kind::Float)
                .to_device(Device::Cpu);

            let (best_scores, best_indices) = scores.max_dim(-1, false);
            let confidences: Vec<f32> = Vec::<f32>::try_from(&best_scores)
                .map_err(|err| ClassifyError::Other(err.into()))?;
            let indices: Vec<i64> = Vec::<i64>::try_from(&best_indices)
                .map_err(|err| ClassifyError::Other(err.into()))?;

            let mut predictions = Vec::with_capacity(crops.len());
            for (index, confidence) in indices.into_iter().zip(confidences) {
                let label = self
                    .labels
                    .get(index as usize)
                    .cloned()
                    .unwrap_or_else(|| super::UNCLASSIFIED_LABEL.to_string());
                predictions.push(Prediction {
                    label,
                    confidence: confidence.clamp(0.0, 1.0),
                });
            }
            Ok(predictions)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::BoundingBox;

    fn region_with_bbox(bbox: BoundingBox) -> Region {
        Region {
            frame_seq: 1,
            index: 0,
            pixels: vec![(bbox.x0, bbox.y0)],
            bbox,
            truncated: false,
        }
    }

    #[test]
    fn disabled_classifier_answers_unclassified_for_every_crop() {
        let crops = vec![
            Crop {
                data: vec![1.0; 16],
                width: 4,
                height: 4,
            },
            Crop {
                data: vec![0.5; 16],
                width: 4,
                height: 4,
            },
        ];
        let predictions = DisabledClassifier.predict(&crops).expect("predict");
        assert_eq!(predictions.len(), 2);
        assert!(predictions.iter().all(|p| p.label == UNCLASSIFIED_LABEL));
        assert!(predictions.iter().all(|p| p.confidence == 0.0));
        assert!(!DisabledClassifier.enabled());
    }

    #[test]
    fn crop_has_requested_shape_and_contains_the_region() {
        let mut frame = GrayFrame::new(32, 32);
        frame.data.fill(1.0);
        // Dark 4x4 block at (10..14, 10..14).
        for y in 10..14u32 {
            for x in 10..14u32 {
                frame.data[(y * 32 + x) as usize] = 0.1;
            }
        }
        let region = region_with_bbox(BoundingBox {
            x0: 10,
            y0: 10,
            x1: 13,
            y1: 13,
        });
        let crop = crop_region(&frame, &region, 16);
        assert_eq!((crop.width, crop.height), (16, 16));
        assert_eq!(crop.data.len(), 256);
        let dark = crop.data.iter().filter(|&&v| v < 0.5).count();
        assert!(dark >= 16, "region pixels must survive the crop, got {dark}");
    }

    #[test]
    fn crop_near_border_is_clamped() {
        let frame = GrayFrame::new(8, 8);
        let region = region_with_bbox(BoundingBox {
            x0: 0,
            y0: 0,
            x1: 7,
            y1: 7,
        });
        let crop = crop_region(&frame, &region, 12);
        assert_eq!(crop.data.len(), 144);
    }
}
