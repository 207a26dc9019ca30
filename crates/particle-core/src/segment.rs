//! Segmentation of a corrected frame into candidate particle regions.

use tracing::debug;

use crate::image::GrayFrame;

/// How the foreground threshold is chosen for a frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ThresholdMode {
    /// Pixels below this corrected intensity are foreground.
    Fixed(f32),
    /// Threshold at the given lower percentile (0..100) of the frame's
    /// corrected intensity distribution, recomputed per frame.
    Percentile(f32),
}

#[derive(Clone, Copy, Debug)]
pub struct SegmenterOptions {
    pub threshold: ThresholdMode,
    /// Components below this pixel count are dropped as noise.
    pub min_area_px: usize,
    /// Components above this pixel count are kept but flagged truncated.
    pub max_area_px: Option<usize>,
}

/// Connected candidate-particle area within one corrected frame. Regions are
/// transient: they exist between segmentation and feature extraction and are
/// never persisted.
#[derive(Clone, Debug)]
pub struct Region {
    pub frame_seq: u64,
    /// Index within the frame; stable even when later regions are dropped,
    /// so (frame_seq, index) stays unique.
    pub index: u32,
    pub pixels: Vec<(u32, u32)>,
    pub bbox: BoundingBox,
    /// Touches the image border or exceeds the configured area ceiling; such
    /// regions are likely truncated particles and carry the flag downstream.
    pub truncated: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Region {
    pub fn area_px(&self) -> usize {
        self.pixels.len()
    }
}

/// Policy for splitting touching particles inside one connected component.
/// Basic connected-component labelling makes no attempt at this; strategies
/// plug in here.
pub trait RegionSplitter: Send + Sync {
    fn split(&self, region: Region, corrected: &GrayFrame) -> Vec<Region>;
}

/// Default splitter: every connected component is one region.
pub struct NoSplit;

impl RegionSplitter for NoSplit {
    fn split(&self, region: Region, _corrected: &GrayFrame) -> Vec<Region> {
        vec![region]
    }
}

pub struct Segmenter {
    options: SegmenterOptions,
    splitter: Box<dyn RegionSplitter>,
}

impl Segmenter {
    pub fn new(options: SegmenterOptions) -> Self {
        Self {
            options,
            splitter: Box::new(NoSplit),
        }
    }

    pub fn with_splitter(mut self, splitter: Box<dyn RegionSplitter>) -> Self {
        self.splitter = splitter;
        self
    }

    /// Threshold the corrected frame and label 4-connected components.
    ///
    /// Zero regions is a valid outcome, not an error. Sub-`min_area_px`
    /// components are dropped; oversized or border-touching components are
    /// flagged truncated rather than silently accepted.
    pub fn segment(&self, corrected: &GrayFrame, frame_seq: u64) -> Vec<Region> {
        let threshold = self.resolve_threshold(corrected);
        let width = corrected.width;
        let height = corrected.height;
        let mut visited = vec![false; corrected.len()];
        let mut regions = Vec::new();
        let mut stack = Vec::new();
        let mut dropped = 0usize;
        let mut next_index = 0u32;

        for start in 0..corrected.len() {
            if visited[start] || corrected.data[start] >= threshold {
                continue;
            }

            // Flood fill one 4-connected component.
            let mut pixels = Vec::new();
            let (mut x0, mut y0) = (width - 1, height - 1);
            let (mut x1, mut y1) = (0u32, 0u32);
            let mut touches_border = false;
            visited[start] = true;
            stack.push(start);
            while let Some(idx) = stack.pop() {
                let x = idx as u32 % width;
                let y = idx as u32 / width;
                pixels.push((x, y));
                x0 = x0.min(x);
                y0 = y0.min(y);
                x1 = x1.max(x);
                y1 = y1.max(y);
                if x == 0 || y == 0 || x == width - 1 || y == height - 1 {
                    touches_border = true;
                }
                let mut push = |nidx: usize| {
                    if !visited[nidx] && corrected.data[nidx] < threshold {
                        visited[nidx] = true;
                        stack.push(nidx);
                    }
                };
                if x > 0 {
                    push(idx - 1);
                }
                if x + 1 < width {
                    push(idx + 1);
                }
                if y > 0 {
                    push(idx - width as usize);
                }
                if y + 1 < height {
                    push(idx + width as usize);
                }
            }

            if pixels.len() < self.options.min_area_px {
                dropped += 1;
                continue;
            }

            let oversized = self
                .options
                .max_area_px
                .map(|ceiling| pixels.len() > ceiling)
                .unwrap_or(false);
            let region = Region {
                frame_seq,
                index: next_index,
                pixels,
                bbox: BoundingBox { x0, y0, x1, y1 },
                truncated: touches_border || oversized,
            };
            next_index += 1;
            regions.extend(self.splitter.split(region, corrected));
        }

        if dropped > 0 {
            debug!(
                "frame #{frame_seq}: dropped {dropped} sub-minimum component(s), kept {}",
                regions.len()
            );
        }
        regions
    }

    fn resolve_threshold(&self, corrected: &GrayFrame) -> f32 {
        match self.options.threshold {
            ThresholdMode::Fixed(value) => value,
            ThresholdMode::Percentile(percentile) => {
                let mut values = corrected.data.clone();
                values.sort_unstable_by(|a, b| a.total_cmp(b));
                if values.is_empty() {
                    return 0.0;
                }
                let rank = (percentile / 100.0 * (values.len() - 1) as f32).round() as usize;
                values[rank.min(values.len() - 1)]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_from_rows(rows: &[&[f32]]) -> GrayFrame {
        let height = rows.len() as u32;
        let width = rows[0].len() as u32;
        GrayFrame {
            width,
            height,
            data: rows.iter().flat_map(|row| row.iter().copied()).collect(),
        }
    }

    fn options(threshold: f32, min_area: usize) -> SegmenterOptions {
        SegmenterOptions {
            threshold: ThresholdMode::Fixed(threshold),
            min_area_px: min_area,
            max_area_px: None,
        }
    }

    #[test]
    fn labels_separate_components() {
        let frame = frame_from_rows(&[
            &[1.0, 1.0, 1.0, 1.0, 1.0],
            &[1.0, 0.2, 1.0, 0.3, 1.0],
            &[1.0, 0.2, 1.0, 0.3, 1.0],
            &[1.0, 1.0, 1.0, 1.0, 1.0],
        ]);
        let regions = Segmenter::new(options(0.5, 1)).segment(&frame, 7);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].frame_seq, 7);
        assert_eq!(regions[0].area_px(), 2);
        assert_ne!(regions[0].index, regions[1].index);
        assert!(!regions[0].truncated, "interior components are not flagged");
    }

    #[test]
    fn diagonal_neighbours_are_separate_components() {
        let frame = frame_from_rows(&[
            &[0.2, 1.0, 1.0],
            &[1.0, 0.2, 1.0],
            &[1.0, 1.0, 1.0],
        ]);
        let regions = Segmenter::new(options(0.5, 1)).segment(&frame, 1);
        assert_eq!(regions.len(), 2, "4-connectivity must not bridge diagonals");
    }

    #[test]
    fn sub_minimum_components_are_dropped() {
        let frame = frame_from_rows(&[
            &[1.0, 1.0, 1.0, 1.0],
            &[1.0, 0.2, 1.0, 1.0],
            &[1.0, 1.0, 0.2, 1.0],
            &[1.0, 1.0, 0.2, 1.0],
        ]);
        let regions = Segmenter::new(options(0.5, 2)).segment(&frame, 1);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].area_px(), 2);
    }

    #[test]
    fn border_contact_flags_truncation() {
        let frame = frame_from_rows(&[
            &[0.2, 0.2, 1.0],
            &[1.0, 1.0, 1.0],
            &[1.0, 1.0, 1.0],
        ]);
        let regions = Segmenter::new(options(0.5, 1)).segment(&frame, 1);
        assert_eq!(regions.len(), 1);
        assert!(regions[0].truncated);
    }

    #[test]
    fn oversized_components_are_flagged_not_dropped() {
        let frame = frame_from_rows(&[
            &[1.0, 1.0, 1.0, 1.0],
            &[1.0, 0.2, 0.2, 1.0],
            &[1.0, 0.2, 0.2, 1.0],
            &[1.0, 1.0, 1.0, 1.0],
        ]);
        let opts = SegmenterOptions {
            threshold: ThresholdMode::Fixed(0.5),
            min_area_px: 1,
            max_area_px: Some(3),
        };
        let regions = Segmenter::new(opts).segment(&frame, 1);
        assert_eq!(regions.len(), 1);
        assert!(regions[0].truncated);
    }

    #[test]
    fn blank_frame_yields_zero_regions() {
        let frame = frame_from_rows(&[&[1.0, 1.0], &[1.0, 1.0]]);
        let regions = Segmenter::new(options(0.5, 1)).segment(&frame, 1);
        assert!(regions.is_empty());
    }

    #[test]
    fn percentile_threshold_adapts_to_the_frame() {
        // 100 pixels, four of them markedly dark.
        let mut data = vec![0.9f32; 100];
        data[10] = 0.1;
        data[11] = 0.1;
        data[20] = 0.1;
        data[21] = 0.1;
        let frame = GrayFrame {
            width: 10,
            height: 10,
            data,
        };
        let opts = SegmenterOptions {
            threshold: ThresholdMode::Percentile(5.0),
            min_area_px: 1,
            max_area_px: None,
        };
        let regions = Segmenter::new(opts).segment(&frame, 1);
        let total: usize = regions.iter().map(Region::area_px).sum();
        assert_eq!(total, 4, "only the dark tail should be foreground");
    }
}
