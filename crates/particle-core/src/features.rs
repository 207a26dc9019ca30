//! Per-region geometric and photometric descriptors.
//!
//! All geometric outputs are in physical units: the pixel→unit calibration is
//! applied exactly once here and never re-derived downstream.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image::GrayFrame;
use crate::segment::Region;

/// Pixel-to-physical-length calibration, pixels per unit length (e.g. px/µm).
#[derive(Clone, Copy, Debug)]
pub struct Calibration {
    pub pixels_per_unit: f32,
}

impl Calibration {
    pub fn length(&self, px: f32) -> f32 {
        px / self.pixels_per_unit
    }

    pub fn area(&self, px2: f32) -> f32 {
        px2 / (self.pixels_per_unit * self.pixels_per_unit)
    }

    /// Inverse of [`Calibration::area`], used once at startup to turn
    /// configured physical area bounds into pixel counts.
    pub fn area_to_px(&self, units2: f32) -> f32 {
        units2 * self.pixels_per_unit * self.pixels_per_unit
    }
}

#[derive(Debug, Error)]
pub enum FeatureError {
    /// Region too small or too thin to measure; the caller skips the region,
    /// not the frame.
    #[error("degenerate region of {pixels} pixel(s)")]
    DegenerateRegion { pixels: usize },
}

/// Measured descriptors for one region, geometric values in physical units.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureVector {
    pub area: f32,
    pub equiv_diameter: f32,
    pub major_axis: f32,
    pub minor_axis: f32,
    pub aspect_ratio: f32,
    pub solidity: f32,
    pub mean_intensity: f32,
    pub intensity_variance: f32,
}

/// Minimum pixel count for a measurable region; below this the covariance
/// ellipse is meaningless.
const MIN_MEASURABLE_PIXELS: usize = 3;

/// Compute the feature vector for one region of a corrected frame.
pub fn extract(
    region: &Region,
    corrected: &GrayFrame,
    calibration: &Calibration,
) -> Result<FeatureVector, FeatureError> {
    let n = region.pixels.len();
    if n < MIN_MEASURABLE_PIXELS {
        return Err(FeatureError::DegenerateRegion { pixels: n });
    }

    let inv_n = 1.0 / n as f64;
    let (mut sum_x, mut sum_y) = (0.0f64, 0.0f64);
    let (mut sum_i, mut sum_i2) = (0.0f64, 0.0f64);
    for &(x, y) in &region.pixels {
        sum_x += x as f64;
        sum_y += y as f64;
        let v = corrected.get(x, y) as f64;
        sum_i += v;
        sum_i2 += v * v;
    }
    let mean_x = sum_x * inv_n;
    let mean_y = sum_y * inv_n;
    let mean_i = sum_i * inv_n;
    let var_i = (sum_i2 * inv_n - mean_i * mean_i).max(0.0);

    // Central second moments with the 1/12 per-pixel correction, matching the
    // covariance of a square pixel footprint.
    let (mut cxx, mut cyy, mut cxy) = (0.0f64, 0.0f64, 0.0f64);
    for &(x, y) in &region.pixels {
        let dx = x as f64 - mean_x;
        let dy = y as f64 - mean_y;
        cxx += dx * dx;
        cyy += dy * dy;
        cxy += dx * dy;
    }
    cxx = cxx * inv_n + 1.0 / 12.0;
    cyy = cyy * inv_n + 1.0 / 12.0;
    cxy *= inv_n;

    // Eigenvalues of the 2x2 covariance; axis lengths follow the moment
    // ellipse convention (4 * sqrt(eigenvalue)).
    let trace_half = (cxx + cyy) / 2.0;
    let det = cxx * cyy - cxy * cxy;
    let gap = (trace_half * trace_half - det).max(0.0).sqrt();
    let lambda_major = trace_half + gap;
    let lambda_minor = trace_half - gap;
    if lambda_minor <= 0.0 {
        return Err(FeatureError::DegenerateRegion { pixels: n });
    }
    let major_px = 4.0 * lambda_major.sqrt();
    let minor_px = 4.0 * lambda_minor.sqrt();

    let area_px = n as f32;
    let hull_area_px = convex_hull_area(&region.pixels).max(area_px as f64);
    let solidity = (area_px as f64 / hull_area_px).min(1.0) as f32;
    let equiv_diameter_px = 2.0 * (area_px / std::f32::consts::PI).sqrt();

    Ok(FeatureVector {
        area: calibration.area(area_px),
        equiv_diameter: calibration.length(equiv_diameter_px),
        major_axis: calibration.length(major_px as f32),
        minor_axis: calibration.length(minor_px as f32),
        aspect_ratio: (major_px / minor_px) as f32,
        solidity,
        mean_intensity: mean_i as f32,
        intensity_variance: var_i as f32,
    })
}

/// Area of the convex hull of the pixel footprint.
///
/// Pixels are treated as unit squares: the hull is computed over their four
/// corners so a straight row of N pixels has hull area N, not zero.
fn convex_hull_area(pixels: &[(u32, u32)]) -> f64 {
    let mut corners: Vec<(i64, i64)> = Vec::with_capacity(pixels.len() * 4);
    for &(x, y) in pixels {
        let (x, y) = (x as i64, y as i64);
        corners.push((x, y));
        corners.push((x + 1, y));
        corners.push((x, y + 1));
        corners.push((x + 1, y + 1));
    }
    corners.sort_unstable();
    corners.dedup();
    let hull = monotone_chain(&corners);
    polygon_area(&hull)
}

/// Andrew's monotone chain; input must be sorted and deduplicated.
fn monotone_chain(points: &[(i64, i64)]) -> Vec<(i64, i64)> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let cross = |o: (i64, i64), a: (i64, i64), b: (i64, i64)| -> i64 {
        (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
    };

    let mut hull: Vec<(i64, i64)> = Vec::with_capacity(points.len() * 2);
    for &p in points {
        while hull.len() >= 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0 {
            hull.pop();
        }
        hull.push(p);
    }
    let lower_len = hull.len() + 1;
    for &p in points.iter().rev() {
        while hull.len() >= lower_len && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0 {
            hull.pop();
        }
        hull.push(p);
    }
    hull.pop();
    hull
}

fn polygon_area(hull: &[(i64, i64)]) -> f64 {
    if hull.len() < 3 {
        return 0.0;
    }
    let mut twice_area = 0i64;
    for i in 0..hull.len() {
        let (x0, y0) = hull[i];
        let (x1, y1) = hull[(i + 1) % hull.len()];
        twice_area += x0 * y1 - x1 * y0;
    }
    (twice_area.abs() as f64) / 2.0
}
