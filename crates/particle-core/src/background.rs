//! Running background estimate for a frame stream.
//!
//! The model keeps a moving average of the *raw* scene so that slowly
//! drifting illumination is tracked while transient particles average out.
//! Rolling mode stores the last W frames and their pixel sum; exponential
//! mode stores only the running mean, so memory stays bounded for arbitrarily
//! long streams either way.

use std::collections::VecDeque;

use thiserror::Error;

use crate::image::GrayFrame;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BackgroundMode {
    /// Sliding mean over the most recent `window` frames.
    Rolling { window: usize },
    /// Exponentially decaying mean, `mean = (1 - decay) * mean + decay * raw`.
    Exponential { decay: f32 },
}

#[derive(Debug, Error)]
pub enum BackgroundError {
    #[error("frame is {got_width}x{got_height} but background is {want_width}x{want_height}")]
    DimensionMismatch {
        got_width: u32,
        got_height: u32,
        want_width: u32,
        want_height: u32,
    },
}

/// Background-corrected frame plus the warm-up marker.
pub struct CorrectedFrame {
    pub frame: GrayFrame,
    /// True while the estimate has absorbed too few frames to be trusted.
    /// Warm-up output is degraded and must not be treated as normal data.
    pub warming_up: bool,
}

/// Single-owner running background estimate. Exactly one instance exists per
/// pipeline run and only the orchestrator's in-order loop mutates it.
pub struct BackgroundModel {
    mode: BackgroundMode,
    mean: Option<GrayFrame>,
    sum: Vec<f32>,
    stack: VecDeque<GrayFrame>,
    absorbed: u64,
}

impl BackgroundModel {
    pub fn new(mode: BackgroundMode) -> Self {
        Self {
            mode,
            mean: None,
            sum: Vec::new(),
            stack: VecDeque::new(),
            absorbed: 0,
        }
    }

    /// Number of raw frames absorbed so far.
    pub fn absorbed(&self) -> u64 {
        self.absorbed
    }

    /// True while correction output is still degraded: a rolling model needs
    /// a full window, an exponential model needs more than one frame.
    pub fn warming_up(&self) -> bool {
        match self.mode {
            BackgroundMode::Rolling { window } => self.absorbed < window as u64,
            BackgroundMode::Exponential { .. } => self.absorbed <= 1,
        }
    }

    /// Absorb a raw frame into the estimate. Must be called with the raw
    /// frame, never a corrected one, and in frame-sequence order.
    pub fn update(&mut self, raw: &GrayFrame) -> Result<(), BackgroundError> {
        if let Some(mean) = &self.mean {
            if !mean.same_shape(raw) {
                return Err(dimension_mismatch(raw, mean));
            }
        }

        match self.mode {
            BackgroundMode::Rolling { window } => {
                if self.mean.is_none() {
                    self.sum = vec![0.0; raw.len()];
                    self.mean = Some(GrayFrame::new(raw.width, raw.height));
                }
                self.stack.push_back(raw.clone());
                for (acc, &v) in self.sum.iter_mut().zip(raw.data.iter()) {
                    *acc += v;
                }
                if self.stack.len() > window {
                    let oldest = self.stack.pop_front().expect("stack non-empty");
                    for (acc, &v) in self.sum.iter_mut().zip(oldest.data.iter()) {
                        *acc -= v;
                    }
                }
                let count = self.stack.len() as f32;
                let mean = self.mean.as_mut().expect("mean initialised above");
                for (out, &acc) in mean.data.iter_mut().zip(self.sum.iter()) {
                    *out = acc / count;
                }
            }
            BackgroundMode::Exponential { decay } => match self.mean.as_mut() {
                None => self.mean = Some(raw.clone()),
                Some(mean) => {
                    for (out, &v) in mean.data.iter_mut().zip(raw.data.iter()) {
                        *out = (1.0 - decay) * *out + decay * v;
                    }
                }
            },
        }

        self.absorbed += 1;
        Ok(())
    }

    /// Background-correct a raw frame against the current estimate.
    ///
    /// The result maps background pixels to ~1.0 and particles (darker than
    /// the estimate) below that, clamped to `[0, 1]`. Before any frame has
    /// been absorbed the raw frame is passed through unchanged and flagged as
    /// warm-up output.
    pub fn correct(&self, raw: &GrayFrame) -> Result<CorrectedFrame, BackgroundError> {
        let mean = match &self.mean {
            Some(mean) => mean,
            None => {
                return Ok(CorrectedFrame {
                    frame: raw.clone(),
                    warming_up: true,
                });
            }
        };
        if !mean.same_shape(raw) {
            return Err(dimension_mismatch(raw, mean));
        }

        let mut corrected = GrayFrame::new(raw.width, raw.height);
        for ((out, &v), &bg) in corrected
            .data
            .iter_mut()
            .zip(raw.data.iter())
            .zip(mean.data.iter())
        {
            *out = (v - bg + 1.0).clamp(0.0, 1.0);
        }
        Ok(CorrectedFrame {
            frame: corrected,
            warming_up: self.warming_up(),
        })
    }
}

fn dimension_mismatch(raw: &GrayFrame, mean: &GrayFrame) -> BackgroundError {
    BackgroundError::DimensionMismatch {
        got_width: raw.width,
        got_height: raw.height,
        want_width: mean.width,
        want_height: mean.height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(width: u32, height: u32, value: f32) -> GrayFrame {
        GrayFrame {
            width,
            height,
            data: vec![value; (width * height) as usize],
        }
    }

    #[test]
    fn rolling_window_warms_up_then_tracks_the_mean() {
        let mut model = BackgroundModel::new(BackgroundMode::Rolling { window: 5 });
        for i in 0..4 {
            model.update(&flat(4, 4, 0.1 * i as f32)).expect("update");
            assert!(model.warming_up(), "frame {} should still be warming", i + 1);
        }
        model.update(&flat(4, 4, 0.4)).expect("update");
        assert!(!model.warming_up(), "a full window ends warm-up");

        // Mean of 0.0, 0.1, 0.2, 0.3, 0.4.
        let corrected = model.correct(&flat(4, 4, 0.2)).expect("correct");
        assert!(!corrected.warming_up);
        assert!((corrected.frame.get(0, 0) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn rolling_window_drops_the_oldest_frame() {
        let mut model = BackgroundModel::new(BackgroundMode::Rolling { window: 2 });
        model.update(&flat(2, 2, 1.0)).expect("update");
        model.update(&flat(2, 2, 0.5)).expect("update");
        model.update(&flat(2, 2, 0.5)).expect("update");
        // Window now holds 0.5, 0.5; the 1.0 frame is gone.
        let corrected = model.correct(&flat(2, 2, 0.5)).expect("correct");
        assert!((corrected.frame.get(0, 0) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn exponential_mode_fades_in_new_content() {
        let mut model = BackgroundModel::new(BackgroundMode::Exponential { decay: 0.5 });
        model.update(&flat(2, 2, 0.8)).expect("update");
        assert!(model.warming_up(), "single frame is still warm-up");
        model.update(&flat(2, 2, 0.4)).expect("update");
        assert!(!model.warming_up());
        // mean = 0.5 * 0.8 + 0.5 * 0.4 = 0.6
        let corrected = model.correct(&flat(2, 2, 0.3)).expect("correct");
        assert!((corrected.frame.get(0, 0) - 0.7).abs() < 1e-5);
    }

    #[test]
    fn correction_before_any_update_is_flagged_passthrough() {
        let model = BackgroundModel::new(BackgroundMode::Exponential { decay: 0.1 });
        let corrected = model.correct(&flat(2, 2, 0.25)).expect("correct");
        assert!(corrected.warming_up);
        assert!((corrected.frame.get(1, 1) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn shape_changes_are_rejected() {
        let mut model = BackgroundModel::new(BackgroundMode::Rolling { window: 3 });
        model.update(&flat(4, 4, 0.5)).expect("update");
        let err = model.update(&flat(2, 2, 0.5)).expect_err("mismatch");
        assert!(matches!(err, BackgroundError::DimensionMismatch { .. }));
        assert!(model.correct(&flat(8, 8, 0.5)).is_err());
    }
}
