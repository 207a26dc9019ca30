//! Working image representation for correction and segmentation.

/// Single-channel `f32` image with intensities in `[0, 1]`.
///
/// All in-pipeline math happens on this plane; raw `u8` frames are converted
/// once on entry and never touched again.
#[derive(Clone)]
pub struct GrayFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl GrayFrame {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; (width * height) as usize],
        }
    }

    /// Convert an 8-bit grayscale buffer. Returns `None` on a length mismatch
    /// (a short read or a corrupt decode).
    pub fn from_gray8(data: &[u8], width: u32, height: u32) -> Option<Self> {
        if data.len() != (width * height) as usize {
            return None;
        }
        Some(Self {
            width,
            height,
            data: data.iter().map(|&v| v as f32 / 255.0).collect(),
        })
    }

    /// Convert a packed RGB8 buffer using the Rec. 601 luma weights.
    pub fn from_rgb8(data: &[u8], width: u32, height: u32) -> Option<Self> {
        if data.len() != (width * height * 3) as usize {
            return None;
        }
        let luma = data
            .chunks_exact(3)
            .map(|px| {
                (0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32) / 255.0
            })
            .collect();
        Some(Self {
            width,
            height,
            data: luma,
        })
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn same_shape(&self, other: &GrayFrame) -> bool {
        self.width == other.width && self.height == other.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray8_conversion_scales_to_unit_range() {
        let frame = GrayFrame::from_gray8(&[0, 51, 255, 102], 2, 2).expect("frame");
        assert!((frame.get(0, 0) - 0.0).abs() < 1e-6);
        assert!((frame.get(1, 1) - 0.4).abs() < 1e-3);
        assert!((frame.get(0, 1) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        assert!(GrayFrame::from_gray8(&[0, 1, 2], 2, 2).is_none());
        assert!(GrayFrame::from_rgb8(&[0; 11], 2, 2).is_none());
    }
}
