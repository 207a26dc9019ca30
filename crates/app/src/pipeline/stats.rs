//! Aggregate particle statistics: running counters plus per-label size-bin
//! histograms from which particle size distributions are derived.
//!
//! The aggregate is a pure fold over the committed record log. Folding is
//! associative and commutative, so the same structure can be maintained
//! incrementally during a run or rebuilt from scratch by replaying the log;
//! both must produce identical results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::data::ParticleRecord;

/// Logarithmically spaced equivalent-diameter bin edges (physical units).
///
/// Edges are persisted with the aggregate snapshot so a replay always uses
/// the binning the log was accumulated under.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SizeBins {
    pub edges: Vec<f32>,
}

impl SizeBins {
    /// `bins` log-spaced bins spanning `[min_diameter, max_diameter)`.
    pub fn logarithmic(min_diameter: f32, max_diameter: f32, bins: usize) -> Self {
        let log_min = min_diameter.ln();
        let step = (max_diameter.ln() - log_min) / bins as f32;
        let mut edges: Vec<f32> = (0..=bins)
            .map(|i| (log_min + step * i as f32).exp())
            .collect();
        // ln/exp does not round-trip exactly; pin the end edges so the
        // half-open [min, max) range holds to the bit.
        edges[0] = min_diameter;
        if bins > 0 {
            edges[bins] = max_diameter;
        }
        Self { edges }
    }

    pub fn bin_count(&self) -> usize {
        self.edges.len().saturating_sub(1)
    }

    /// Bin index for a diameter, `None` outside the covered range.
    pub fn index_of(&self, diameter: f32) -> Option<usize> {
        if self.edges.len() < 2 {
            return None;
        }
        if diameter < self.edges[0] || diameter >= self.edges[self.edges.len() - 1] {
            return None;
        }
        Some(self.edges.partition_point(|edge| *edge <= diameter) - 1)
    }
}

/// Running counters over all committed [`ParticleRecord`]s.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AggregateStats {
    pub bins: SizeBins,
    pub total_particles: u64,
    /// Particle count per class label.
    pub by_label: BTreeMap<String, u64>,
    /// Per-label histogram over the size bins; particles outside the bin
    /// range count toward the label totals but not the histogram.
    pub histograms: BTreeMap<String, Vec<u64>>,
}

impl AggregateStats {
    pub fn new(bins: SizeBins) -> Self {
        Self {
            bins,
            total_particles: 0,
            by_label: BTreeMap::new(),
            histograms: BTreeMap::new(),
        }
    }

    /// Fold one record into the counters.
    pub fn fold(&mut self, record: &ParticleRecord) {
        self.total_particles += 1;
        *self.by_label.entry(record.label.clone()).or_insert(0) += 1;
        if let Some(bin) = self.bins.index_of(record.features.equiv_diameter) {
            let histogram = self
                .histograms
                .entry(record.label.clone())
                .or_insert_with(|| vec![0; self.bins.bin_count()]);
            histogram[bin] += 1;
        }
    }

    /// Rebuild the aggregate from scratch over a record log.
    pub fn replay<'a>(
        bins: SizeBins,
        records: impl IntoIterator<Item = &'a ParticleRecord>,
    ) -> Self {
        let mut stats = Self::new(bins);
        for record in records {
            stats.fold(record);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use particle_core::FeatureVector;

    fn record(frame_id: u64, region_index: u32, label: &str, diameter: f32) -> ParticleRecord {
        ParticleRecord {
            frame_id,
            region_index,
            features: FeatureVector {
                area: diameter * diameter,
                equiv_diameter: diameter,
                major_axis: diameter,
                minor_axis: diameter,
                aspect_ratio: 1.0,
                solidity: 1.0,
                mean_intensity: 0.5,
                intensity_variance: 0.0,
            },
            label: label.to_string(),
            confidence: 0.9,
            truncated: false,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn logarithmic_edges_are_monotonic_and_span_the_range() {
        let bins = SizeBins::logarithmic(1.0, 1000.0, 30);
        assert_eq!(bins.edges.len(), 31);
        assert_eq!(bins.edges[0], 1.0, "first edge is exactly the minimum");
        assert_eq!(bins.edges[30], 1000.0, "last edge is exactly the maximum");
        assert!(bins.edges.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn index_of_respects_bin_boundaries() {
        let bins = SizeBins::logarithmic(1.0, 100.0, 10);
        assert_eq!(bins.index_of(0.5), None, "below range");
        assert_eq!(bins.index_of(100.0), None, "upper edge is exclusive");
        assert_eq!(bins.index_of(1.0), Some(0), "lower edge is inclusive");
        let mid = bins.index_of(10.0).expect("in range");
        assert!(mid > 0 && mid < 10);
    }

    #[test]
    fn fold_is_order_independent() {
        let records = vec![
            record(1, 0, "copepod", 25.0),
            record(1, 1, "diatom", 3.0),
            record(2, 0, "copepod", 80.0),
            record(3, 0, "unclassified", 12.0),
        ];
        let bins = SizeBins::logarithmic(1.0, 1000.0, 20);

        let forward = AggregateStats::replay(bins.clone(), &records);
        let mut reversed: Vec<_> = records.iter().collect();
        reversed.reverse();
        let backward = AggregateStats::replay(bins, reversed);

        assert_eq!(forward, backward);
        assert_eq!(forward.total_particles, 4);
        assert_eq!(forward.by_label["copepod"], 2);
        assert_eq!(
            forward.histograms["copepod"].iter().sum::<u64>(),
            2,
            "both copepods are in range"
        );
    }

    #[test]
    fn out_of_range_particles_count_toward_labels_only() {
        let bins = SizeBins::logarithmic(10.0, 100.0, 5);
        let mut stats = AggregateStats::new(bins);
        stats.fold(&record(1, 0, "fibre", 5.0));
        assert_eq!(stats.total_particles, 1);
        assert_eq!(stats.by_label["fibre"], 1);
        assert!(stats.histograms.get("fibre").is_none());
    }
}
