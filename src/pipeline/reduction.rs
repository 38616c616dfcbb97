//! Frame reduction: recipes, reduced values and the engine that applies them.
//!
//! A [`ReductionRecipe`] is a closed set of operations, each carrying only the
//! parameters it uses. Recipes are validated when they are built (or
//! deserialized from config), so `reduce` only has to check them against the
//! frame at hand.
//!
//! Reduction is a pure function of the frame pixels, frame metadata and the
//! recipe. Pixels are visited in row-major order, so sums are bit-identical
//! across calls.

use crate::pipeline::error::{PipelineError, PipelineResult, ReductionError};
use crate::pipeline::id::RecipeId;
use crate::types::{Frame, FrameStatus};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Rectangular sub-region of a frame. Always non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RegionRepr", into = "RegionRepr")]
pub struct Region {
    row: usize,
    col: usize,
    rows: usize,
    cols: usize,
}

#[derive(Serialize, Deserialize)]
struct RegionRepr {
    row: usize,
    col: usize,
    rows: usize,
    cols: usize,
}

impl TryFrom<RegionRepr> for Region {
    type Error = PipelineError;

    fn try_from(repr: RegionRepr) -> PipelineResult<Self> {
        Region::new(repr.row, repr.col, repr.rows, repr.cols)
    }
}

impl From<Region> for RegionRepr {
    fn from(r: Region) -> Self {
        RegionRepr {
            row: r.row,
            col: r.col,
            rows: r.rows,
            cols: r.cols,
        }
    }
}

impl Region {
    /// A `rows x cols` window whose top-left pixel is `(row, col)`.
    pub fn new(row: usize, col: usize, rows: usize, cols: usize) -> PipelineResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(PipelineError::InvalidRecipe(format!(
                "ROI extent must be non-zero, got {}x{}",
                rows, cols
            )));
        }
        if row.checked_add(rows).is_none() || col.checked_add(cols).is_none() {
            return Err(PipelineError::InvalidRecipe(
                "ROI end overflows the index range".to_string(),
            ));
        }
        Ok(Self {
            row,
            col,
            rows,
            cols,
        })
    }

    pub fn row(&self) -> usize {
        self.row
    }

    pub fn col(&self) -> usize {
        self.col
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    fn fits(&self, frame_rows: usize, frame_cols: usize) -> bool {
        self.row + self.rows <= frame_rows && self.col + self.cols <= frame_cols
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}..{}, {}..{}]",
            self.row,
            self.row + self.rows,
            self.col,
            self.col + self.cols
        )
    }
}

/// Region of interest a reduction runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Roi {
    /// The whole frame, whatever its shape
    #[default]
    Full,
    Region(Region),
}

impl Roi {
    /// Resolve against a frame shape, rejecting regions that do not fit.
    fn resolve(&self, rows: usize, cols: usize) -> Result<Region, ReductionError> {
        match self {
            Roi::Full => Ok(Region {
                row: 0,
                col: 0,
                rows,
                cols,
            }),
            Roi::Region(region) if region.fits(rows, cols) => Ok(*region),
            Roi::Region(region) => Err(ReductionError::RoiOutOfBounds {
                roi: region.to_string(),
                rows,
                cols,
            }),
        }
    }
}

/// Validated, finite, non-zero divisor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Divisor(f64);

impl Divisor {
    pub fn new(value: f64) -> PipelineResult<Self> {
        if value.is_finite() && value != 0.0 {
            Ok(Self(value))
        } else {
            Err(PipelineError::InvalidRecipe(format!(
                "normalization divisor must be finite and non-zero, got {}",
                value
            )))
        }
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Divisor {
    type Error = PipelineError;

    fn try_from(value: f64) -> PipelineResult<Self> {
        Divisor::new(value)
    }
}

impl From<Divisor> for f64 {
    fn from(d: Divisor) -> f64 {
        d.0
    }
}

/// How a scalar result is normalized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Divide by a fixed value
    Constant(Divisor),
    /// Divide by the frame's incident-beam monitor counts
    Monitor,
}

/// How to reduce a frame to a compact value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum ReductionRecipe {
    Sum {
        #[serde(default)]
        roi: Roi,
        #[serde(default)]
        normalization: Option<Normalization>,
    },
    Mean {
        #[serde(default)]
        roi: Roi,
        #[serde(default)]
        normalization: Option<Normalization>,
    },
    Max {
        #[serde(default)]
        roi: Roi,
        #[serde(default)]
        normalization: Option<Normalization>,
    },
    /// Brightest pixel; ties go to the lowest row-major index.
    PeakFind {
        #[serde(default)]
        roi: Roi,
    },
}

impl Default for ReductionRecipe {
    fn default() -> Self {
        ReductionRecipe::sum(Roi::Full)
    }
}

impl ReductionRecipe {
    pub fn sum(roi: Roi) -> Self {
        ReductionRecipe::Sum {
            roi,
            normalization: None,
        }
    }

    pub fn mean(roi: Roi) -> Self {
        ReductionRecipe::Mean {
            roi,
            normalization: None,
        }
    }

    pub fn max(roi: Roi) -> Self {
        ReductionRecipe::Max {
            roi,
            normalization: None,
        }
    }

    pub fn peak_find(roi: Roi) -> Self {
        ReductionRecipe::PeakFind { roi }
    }

    /// Attach a normalization. Peak finding reports raw pixel values and
    /// refuses one.
    pub fn with_normalization(self, norm: Normalization) -> PipelineResult<Self> {
        match self {
            ReductionRecipe::Sum { roi, .. } => Ok(ReductionRecipe::Sum {
                roi,
                normalization: Some(norm),
            }),
            ReductionRecipe::Mean { roi, .. } => Ok(ReductionRecipe::Mean {
                roi,
                normalization: Some(norm),
            }),
            ReductionRecipe::Max { roi, .. } => Ok(ReductionRecipe::Max {
                roi,
                normalization: Some(norm),
            }),
            ReductionRecipe::PeakFind { .. } => Err(PipelineError::InvalidRecipe(
                "peak finding does not take a normalization".to_string(),
            )),
        }
    }

    pub fn roi(&self) -> Roi {
        match self {
            ReductionRecipe::Sum { roi, .. }
            | ReductionRecipe::Mean { roi, .. }
            | ReductionRecipe::Max { roi, .. }
            | ReductionRecipe::PeakFind { roi } => *roi,
        }
    }

    pub fn normalization(&self) -> Option<Normalization> {
        match self {
            ReductionRecipe::Sum { normalization, .. }
            | ReductionRecipe::Mean { normalization, .. }
            | ReductionRecipe::Max { normalization, .. } => *normalization,
            ReductionRecipe::PeakFind { .. } => None,
        }
    }

    /// Short operation name for logs and UI labels.
    pub fn operation_name(&self) -> &'static str {
        match self {
            ReductionRecipe::Sum { .. } => "sum",
            ReductionRecipe::Mean { .. } => "mean",
            ReductionRecipe::Max { .. } => "max",
            ReductionRecipe::PeakFind { .. } => "peak_find",
        }
    }

    /// Stable fingerprint of this recipe within a process.
    pub fn id(&self) -> RecipeId {
        let mut hasher = DefaultHasher::new();
        self.operation_name().hash(&mut hasher);
        self.roi().hash(&mut hasher);
        match self.normalization() {
            None => 0u8.hash(&mut hasher),
            Some(Normalization::Monitor) => 1u8.hash(&mut hasher),
            Some(Normalization::Constant(d)) => {
                2u8.hash(&mut hasher);
                d.get().to_bits().hash(&mut hasher);
            }
        }
        RecipeId(hasher.finish())
    }
}

/// Result payload of one reduction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Scalar(f64),
    /// Peak position in frame pixel coordinates
    Peak { row: usize, col: usize, value: f64 },
}

/// A reduced value tagged with the recipe that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReducedValue {
    pub recipe: RecipeId,
    pub quantity: Quantity,
}

impl ReducedValue {
    /// The value a map display colours by (peak height for peak finding).
    pub fn scalar(&self) -> f64 {
        match self.quantity {
            Quantity::Scalar(v) => v,
            Quantity::Peak { value, .. } => value,
        }
    }
}

/// Applies recipes to frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReductionEngine {
    /// Skip NaN/inf pixels (masked detector gaps) instead of failing the frame.
    skip_non_finite: bool,
}

impl ReductionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skip_non_finite(mut self, skip: bool) -> Self {
        self.skip_non_finite = skip;
        self
    }

    /// Reduce `frame` under `recipe`. Never mutates the frame.
    pub fn reduce(
        &self,
        frame: &Frame,
        recipe: &ReductionRecipe,
    ) -> Result<ReducedValue, ReductionError> {
        if frame.status == FrameStatus::Discarded {
            return Err(ReductionError::FrameDiscarded(frame.sequence_id()));
        }
        let data = &frame.data;
        let region = recipe.roi().resolve(data.rows(), data.cols())?;

        let quantity = match recipe {
            ReductionRecipe::Sum { .. } => {
                let (sum, _) = self.accumulate(frame, &region)?;
                Quantity::Scalar(sum)
            }
            ReductionRecipe::Mean { .. } => {
                let (sum, count) = self.accumulate(frame, &region)?;
                Quantity::Scalar(sum / count as f64)
            }
            ReductionRecipe::Max { .. } => {
                let (_, _, value) = self.peak(frame, &region)?;
                Quantity::Scalar(value)
            }
            ReductionRecipe::PeakFind { .. } => {
                let (row, col, value) = self.peak(frame, &region)?;
                Quantity::Peak { row, col, value }
            }
        };

        let quantity = match (quantity, recipe.normalization()) {
            (Quantity::Scalar(v), Some(norm)) => Quantity::Scalar(v / divisor(frame, norm)?),
            (q, _) => q,
        };

        Ok(ReducedValue {
            recipe: recipe.id(),
            quantity,
        })
    }

    /// Sum and count of the pixels in `region`.
    fn accumulate(&self, frame: &Frame, region: &Region) -> Result<(f64, usize), ReductionError> {
        let mut sum = 0.0;
        let mut count = 0usize;
        for r in region.row..region.row + region.rows {
            for (i, &v) in frame
                .data
                .row_span(r, region.col, region.cols)
                .iter()
                .enumerate()
            {
                if !v.is_finite() {
                    if self.skip_non_finite {
                        continue;
                    }
                    return Err(ReductionError::CorruptPixel {
                        row: r,
                        col: region.col + i,
                    });
                }
                sum += v;
                count += 1;
            }
        }
        if count == 0 {
            return Err(ReductionError::NoFinitePixels);
        }
        Ok((sum, count))
    }

    /// Brightest pixel in `region`; the first one in row-major order wins ties.
    fn peak(&self, frame: &Frame, region: &Region) -> Result<(usize, usize, f64), ReductionError> {
        let mut best: Option<(usize, usize, f64)> = None;
        for r in region.row..region.row + region.rows {
            for (i, &v) in frame
                .data
                .row_span(r, region.col, region.cols)
                .iter()
                .enumerate()
            {
                if !v.is_finite() {
                    if self.skip_non_finite {
                        continue;
                    }
                    return Err(ReductionError::CorruptPixel {
                        row: r,
                        col: region.col + i,
                    });
                }
                if best.map_or(true, |(_, _, b)| v > b) {
                    best = Some((r, region.col + i, v));
                }
            }
        }
        best.ok_or(ReductionError::NoFinitePixels)
    }
}

fn divisor(frame: &Frame, norm: Normalization) -> Result<f64, ReductionError> {
    match norm {
        Normalization::Constant(d) => Ok(d.get()),
        Normalization::Monitor => frame
            .meta
            .monitor
            .filter(|m| m.is_finite() && *m > 0.0)
            .ok_or(ReductionError::MissingMonitor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::id::SequenceId;
    use crate::types::{Coordinate, FrameData, FrameMetadata};
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(data: FrameData) -> Frame {
        Frame {
            meta: FrameMetadata {
                sequence_id: SequenceId(1),
                position: Coordinate::new(0, 0),
                timestamp: Duration::ZERO,
                monitor: None,
            },
            data: Arc::new(data),
            status: FrameStatus::Raw,
        }
    }

    fn ramp(rows: usize, cols: usize) -> Frame {
        frame(FrameData::from_fn(rows, cols, |r, c| (r * cols + c) as f64).unwrap())
    }

    #[test]
    fn test_sum_full_frame_of_ones() {
        let f = frame(FrameData::filled(4, 4, 1.0).unwrap());
        let v = ReductionEngine::new()
            .reduce(&f, &ReductionRecipe::sum(Roi::Full))
            .unwrap();
        assert_eq!(v.quantity, Quantity::Scalar(16.0));
    }

    #[test]
    fn test_mean_and_max_over_region() {
        let f = ramp(4, 4);
        let roi = Roi::Region(Region::new(1, 1, 2, 2).unwrap());
        let engine = ReductionEngine::new();
        // pixels 5, 6, 9, 10
        let mean = engine.reduce(&f, &ReductionRecipe::mean(roi)).unwrap();
        assert_eq!(mean.scalar(), 7.5);
        let max = engine.reduce(&f, &ReductionRecipe::max(roi)).unwrap();
        assert_eq!(max.scalar(), 10.0);
    }

    #[test]
    fn test_peak_find_ties_pick_lowest_index() {
        let mut pixels = vec![0.0; 9];
        pixels[4] = 7.0;
        pixels[2] = 7.0;
        pixels[8] = 7.0;
        let f = frame(FrameData::new(3, 3, pixels).unwrap());
        let v = ReductionEngine::new()
            .reduce(&f, &ReductionRecipe::peak_find(Roi::Full))
            .unwrap();
        assert_eq!(
            v.quantity,
            Quantity::Peak {
                row: 0,
                col: 2,
                value: 7.0
            }
        );
    }

    #[test]
    fn test_peak_find_reports_frame_coordinates() {
        let f = ramp(4, 4);
        let roi = Roi::Region(Region::new(1, 0, 2, 2).unwrap());
        let v = ReductionEngine::new()
            .reduce(&f, &ReductionRecipe::peak_find(roi))
            .unwrap();
        assert_eq!(
            v.quantity,
            Quantity::Peak {
                row: 2,
                col: 1,
                value: 9.0
            }
        );
    }

    #[test]
    fn test_roi_out_of_bounds_is_error() {
        let f = ramp(4, 4);
        let roi = Roi::Region(Region::new(3, 0, 2, 2).unwrap());
        let err = ReductionEngine::new()
            .reduce(&f, &ReductionRecipe::sum(roi))
            .unwrap_err();
        assert!(matches!(
            err,
            ReductionError::RoiOutOfBounds {
                rows: 4,
                cols: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_discarded_frame_is_error() {
        let mut f = ramp(2, 2);
        f.status = FrameStatus::Discarded;
        let err = ReductionEngine::new()
            .reduce(&f, &ReductionRecipe::default())
            .unwrap_err();
        assert_eq!(err, ReductionError::FrameDiscarded(SequenceId(1)));
    }

    #[test]
    fn test_non_finite_pixel_rejected_or_skipped() {
        let mut pixels = vec![1.0; 4];
        pixels[3] = f64::NAN;
        let f = frame(FrameData::new(2, 2, pixels).unwrap());
        let recipe = ReductionRecipe::mean(Roi::Full);

        let err = ReductionEngine::new().reduce(&f, &recipe).unwrap_err();
        assert_eq!(err, ReductionError::CorruptPixel { row: 1, col: 1 });

        let v = ReductionEngine::new()
            .with_skip_non_finite(true)
            .reduce(&f, &recipe)
            .unwrap();
        assert_eq!(v.scalar(), 1.0);
    }

    #[test]
    fn test_all_masked_roi_fails() {
        let f = frame(FrameData::filled(2, 2, f64::NAN).unwrap());
        let err = ReductionEngine::new()
            .with_skip_non_finite(true)
            .reduce(&f, &ReductionRecipe::max(Roi::Full))
            .unwrap_err();
        assert_eq!(err, ReductionError::NoFinitePixels);
    }

    #[test]
    fn test_constant_and_monitor_normalization() {
        let mut f = frame(FrameData::filled(2, 2, 3.0).unwrap());
        let engine = ReductionEngine::new();

        let recipe = ReductionRecipe::sum(Roi::Full)
            .with_normalization(Normalization::Constant(Divisor::new(4.0).unwrap()))
            .unwrap();
        assert_eq!(engine.reduce(&f, &recipe).unwrap().scalar(), 3.0);

        let recipe = ReductionRecipe::sum(Roi::Full)
            .with_normalization(Normalization::Monitor)
            .unwrap();
        assert_eq!(
            engine.reduce(&f, &recipe).unwrap_err(),
            ReductionError::MissingMonitor
        );
        f.meta.monitor = Some(2.0);
        assert_eq!(engine.reduce(&f, &recipe).unwrap().scalar(), 6.0);
    }

    #[test]
    fn test_recipe_validation_at_construction() {
        assert!(Region::new(0, 0, 0, 3).is_err());
        assert!(Region::new(usize::MAX, 0, 2, 2).is_err());
        assert!(Divisor::new(0.0).is_err());
        assert!(Divisor::new(f64::INFINITY).is_err());
        assert!(ReductionRecipe::peak_find(Roi::Full)
            .with_normalization(Normalization::Monitor)
            .is_err());
    }

    #[test]
    fn test_recipe_id_distinguishes_recipes() {
        let a = ReductionRecipe::sum(Roi::Full);
        let b = ReductionRecipe::mean(Roi::Full);
        let c = ReductionRecipe::sum(Roi::Region(Region::new(0, 0, 1, 1).unwrap()));
        assert_eq!(a.id(), a.clone().id());
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_recipe_deserialize_validates() {
        let ok: ReductionRecipe = serde_json::from_str(
            r#"{"operation":"sum","roi":{"region":{"row":0,"col":0,"rows":2,"cols":2}},"normalization":{"constant":2.0}}"#,
        )
        .unwrap();
        assert_eq!(ok.operation_name(), "sum");
        assert!(ok.normalization().is_some());

        let defaulted: ReductionRecipe = serde_json::from_str(r#"{"operation":"peak_find"}"#).unwrap();
        assert_eq!(defaulted, ReductionRecipe::peak_find(Roi::Full));

        let bad = serde_json::from_str::<ReductionRecipe>(
            r#"{"operation":"mean","roi":{"region":{"row":0,"col":0,"rows":0,"cols":2}}}"#,
        );
        assert!(bad.is_err());
        let bad = serde_json::from_str::<ReductionRecipe>(
            r#"{"operation":"sum","normalization":{"constant":0.0}}"#,
        );
        assert!(bad.is_err());
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_reduce_is_deterministic(
            pixels in prop::collection::vec(-1e6f64..1e6, 16),
            op in 0u8..4,
        ) {
            let f = frame(FrameData::new(4, 4, pixels).unwrap());
            let recipe = match op {
                0 => ReductionRecipe::sum(Roi::Full),
                1 => ReductionRecipe::mean(Roi::Full),
                2 => ReductionRecipe::max(Roi::Full),
                _ => ReductionRecipe::peak_find(Roi::Full),
            };
            let engine = ReductionEngine::new();
            let a = engine.reduce(&f, &recipe).unwrap();
            let b = engine.reduce(&f, &recipe).unwrap();
            prop_assert_eq!(a.scalar().to_bits(), b.scalar().to_bits());
            prop_assert_eq!(a, b);
        }

        #[test]
        fn test_out_of_bounds_roi_always_errors(
            row in 0usize..8,
            col in 0usize..8,
            rows in 1usize..8,
            cols in 1usize..8,
        ) {
            let f = ramp(4, 4);
            let roi = Roi::Region(Region::new(row, col, rows, cols).unwrap());
            let result = ReductionEngine::new().reduce(&f, &ReductionRecipe::sum(roi));
            if row + rows > 4 || col + cols > 4 {
                let is_oob = matches!(result, Err(ReductionError::RoiOutOfBounds { .. }));
                prop_assert!(is_oob);
            } else {
                prop_assert!(result.is_ok());
            }
        }
    }
}
