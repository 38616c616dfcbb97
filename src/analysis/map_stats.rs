//! Summary statistics over a scan map snapshot
//!
//! A GUI colours the map by scalar value. Scaling the colour map to the raw
//! min/max lets a single hot pixel wash out everything else, so
//! [`MapStatistics`] also carries a percentile-clipped display range.

use crate::pipeline::id::Generation;
use crate::pipeline::scan_map::MapSnapshot;
use serde::Serialize;

/// Lower/upper percentiles used for the display range
pub const DEFAULT_DISPLAY_PERCENTILES: (f64, f64) = (1.0, 99.0);

/// Statistics of the filled cells of one snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapStatistics {
    /// Generation of the snapshot these were computed from
    pub generation: Generation,
    /// Cells holding a reduced value
    pub filled: usize,
    /// Cells holding the "no data" sentinel
    pub unfilled: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    /// Population standard deviation
    pub std_dev: Option<f64>,
    /// Percentile-clipped `(low, high)` range for colour scaling
    pub display_range: Option<(f64, f64)>,
}

impl MapStatistics {
    /// Compute statistics with the default display percentiles
    pub fn from_snapshot(snapshot: &MapSnapshot) -> Self {
        Self::with_percentiles(snapshot, DEFAULT_DISPLAY_PERCENTILES)
    }

    /// Compute statistics, clipping the display range to `(low, high)` percentiles.
    ///
    /// Percentiles are clamped to `0..=100` and swapped if given in reverse.
    /// Non-finite values are ignored.
    pub fn with_percentiles(snapshot: &MapSnapshot, percentiles: (f64, f64)) -> Self {
        let mut values: Vec<f64> = snapshot.values().filter(|v| v.is_finite()).collect();
        let filled = snapshot.filled_len();
        let unfilled = snapshot.len() - filled;

        if values.is_empty() {
            return Self {
                generation: snapshot.generation,
                filled,
                unfilled,
                min: None,
                max: None,
                mean: None,
                std_dev: None,
                display_range: None,
            };
        }

        values.sort_by(f64::total_cmp);
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        let (lo, hi) = {
            let a = clamp_percentile(percentiles.0);
            let b = clamp_percentile(percentiles.1);
            if a <= b {
                (a, b)
            } else {
                (b, a)
            }
        };

        Self {
            generation: snapshot.generation,
            filled,
            unfilled,
            min: values.first().copied(),
            max: values.last().copied(),
            mean: Some(mean),
            std_dev: Some(variance.sqrt()),
            display_range: Some((percentile(&values, lo), percentile(&values, hi))),
        }
    }

    /// Fraction of known cells that hold data
    pub fn fill_ratio(&self) -> f64 {
        let total = self.filled + self.unfilled;
        if total == 0 {
            0.0
        } else {
            self.filled as f64 / total as f64
        }
    }
}

fn clamp_percentile(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 100.0)
    }
}

/// Linear-interpolated percentile of sorted, non-empty `values`
fn percentile(values: &[f64], p: f64) -> f64 {
    let rank = p / 100.0 * (values.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    values[lower] + (values[upper] - values[lower]) * frac
}
