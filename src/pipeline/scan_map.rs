//! Scan map: latest reduced value per scan coordinate.
//!
//! Cells are spread over a fixed number of shards, each behind its own
//! `RwLock`, so writers to unrelated coordinates do not serialize. Every write
//! bumps a global generation counter while the shard lock is held.
//!
//! # Snapshot guarantee
//!
//! `snapshot` reads the generation *before* copying the shards. Any write that
//! obtained a generation `<= g` did so under its shard lock, and the snapshot
//! takes that same lock afterwards, so a snapshot stamped `g` contains every
//! write up to `g` (and possibly some later ones). Cells are copied whole under
//! the shard lock; a torn cell is never observable.
//!
//! # Ordering
//!
//! Per coordinate, the filled cell with the highest sequence id wins. Updates
//! carrying an older sequence id are rejected. Equal ids replace the value,
//! which is how a frame is reprocessed under a new recipe.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{Generation, SequenceId};
use crate::pipeline::reduction::ReducedValue;
use crate::types::Coordinate;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Number of shards used by [`ScanMap::new`].
pub const DEFAULT_SHARDS: usize = 16;

/// Contents of one map coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MapCell {
    Filled {
        sequence_id: SequenceId,
        value: ReducedValue,
        generation: Generation,
    },
    /// A frame for this coordinate failed reduction and nothing better exists.
    /// Distinct from a zero value.
    Unfilled {
        sequence_id: SequenceId,
        generation: Generation,
    },
}

impl MapCell {
    pub fn sequence_id(&self) -> SequenceId {
        match self {
            MapCell::Filled { sequence_id, .. } | MapCell::Unfilled { sequence_id, .. } => {
                *sequence_id
            }
        }
    }

    pub fn generation(&self) -> Generation {
        match self {
            MapCell::Filled { generation, .. } | MapCell::Unfilled { generation, .. } => {
                *generation
            }
        }
    }

    pub fn value(&self) -> Option<&ReducedValue> {
        match self {
            MapCell::Filled { value, .. } => Some(value),
            MapCell::Unfilled { .. } => None,
        }
    }

    pub fn is_filled(&self) -> bool {
        matches!(self, MapCell::Filled { .. })
    }
}

type Shard = HashMap<Coordinate, MapCell>;

/// Concurrent coordinate → value map with a generation counter.
pub struct ScanMap {
    shards: Box<[RwLock<Shard>]>,
    generation: AtomicU64,
}

impl ScanMap {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            generation: AtomicU64::new(0),
        }
    }

    fn shard_index(&self, coordinate: &Coordinate) -> usize {
        let mut hasher = DefaultHasher::new();
        coordinate.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn read_shard(&self, idx: usize) -> RwLockReadGuard<'_, Shard> {
        self.shards[idx]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_shard(&self, idx: usize) -> RwLockWriteGuard<'_, Shard> {
        self.shards[idx]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called with the target shard's write lock held.
    fn bump(&self) -> Generation {
        Generation(self.generation.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Store `value` for `coordinate` unless a newer frame already filled it.
    pub fn update(
        &self,
        coordinate: Coordinate,
        sequence_id: SequenceId,
        value: ReducedValue,
    ) -> PipelineResult<Generation> {
        let mut shard = self.write_shard(self.shard_index(&coordinate));
        if let Some(existing @ MapCell::Filled { .. }) = shard.get(&coordinate) {
            if sequence_id < existing.sequence_id() {
                return Err(PipelineError::StaleUpdateRejected {
                    coordinate,
                    incoming: sequence_id,
                    stored: existing.sequence_id(),
                });
            }
        }
        let generation = self.bump();
        shard.insert(
            coordinate,
            MapCell::Filled {
                sequence_id,
                value,
                generation,
            },
        );
        Ok(generation)
    }

    /// Record "no data" for a coordinate that has no cell yet.
    ///
    /// Existing cells are left alone, so a failed frame never hides data from
    /// an earlier successful one. Returns the new generation if a sentinel was
    /// written.
    pub fn mark_unfilled(
        &self,
        coordinate: Coordinate,
        sequence_id: SequenceId,
    ) -> Option<Generation> {
        let mut shard = self.write_shard(self.shard_index(&coordinate));
        if shard.contains_key(&coordinate) {
            return None;
        }
        let generation = self.bump();
        shard.insert(
            coordinate,
            MapCell::Unfilled {
                sequence_id,
                generation,
            },
        );
        Some(generation)
    }

    /// Current cell at `coordinate`.
    pub fn get(&self, coordinate: Coordinate) -> Option<MapCell> {
        self.read_shard(self.shard_index(&coordinate))
            .get(&coordinate)
            .copied()
    }

    /// Latest generation. Cheap; use it to poll for staleness.
    pub fn generation(&self) -> Generation {
        Generation(self.generation.load(Ordering::Acquire))
    }

    /// Copy the current contents.
    pub fn snapshot(&self) -> MapSnapshot {
        let generation = self.generation();
        let mut cells = BTreeMap::new();
        for idx in 0..self.shards.len() {
            let shard = self.read_shard(idx);
            cells.extend(shard.iter().map(|(c, cell)| (*c, *cell)));
        }
        MapSnapshot {
            generation,
            cells,
            complete: true,
            taken_at: Utc::now(),
        }
    }

    /// Drop every cell. The generation keeps counting up.
    pub fn reset(&self) -> Generation {
        // Take every shard in index order so no update interleaves.
        let mut guards: Vec<_> = (0..self.shards.len()).map(|i| self.write_shard(i)).collect();
        for shard in guards.iter_mut() {
            shard.clear();
        }
        let generation = self.bump();
        drop(guards);
        tracing::debug!("Scan map reset at {}", generation);
        generation
    }

    pub fn len(&self) -> usize {
        (0..self.shards.len()).map(|i| self.read_shard(i).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ScanMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScanMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanMap")
            .field("shards", &self.shards.len())
            .field("generation", &self.generation())
            .finish()
    }
}

/// Immutable copy of a scan map.
#[derive(Debug, Clone, Serialize)]
pub struct MapSnapshot {
    pub generation: Generation,
    #[serde(serialize_with = "serialize_cells")]
    pub cells: BTreeMap<Coordinate, MapCell>,
    /// False when produced by a cancelled batch run
    pub complete: bool,
    pub taken_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct CellEntry<'a> {
    coordinate: Coordinate,
    #[serde(flatten)]
    cell: &'a MapCell,
}

fn serialize_cells<S: Serializer>(
    cells: &BTreeMap<Coordinate, MapCell>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(
        cells
            .iter()
            .map(|(coordinate, cell)| CellEntry {
                coordinate: *coordinate,
                cell,
            }),
    )
}

/// Largest grid [`MapSnapshot::to_grid`] will allocate (512 MiB of `f64`).
pub const MAX_GRID_CELLS: usize = 1 << 26;

/// Dense rendering of a snapshot, row-major, `NaN` where there is no data.
#[derive(Debug, Clone, Serialize)]
pub struct MapGrid {
    /// Coordinate of element 0
    pub origin: Coordinate,
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f64>,
}

impl MapGrid {
    pub fn get(&self, coordinate: Coordinate) -> Option<f64> {
        let r = usize::try_from(i64::from(coordinate.row) - i64::from(self.origin.row)).ok()?;
        let c = usize::try_from(i64::from(coordinate.col) - i64::from(self.origin.col)).ok()?;
        if r < self.rows && c < self.cols {
            Some(self.values[r * self.cols + c])
        } else {
            None
        }
    }
}

impl MapSnapshot {
    pub fn get(&self, coordinate: Coordinate) -> Option<&MapCell> {
        self.cells.get(&coordinate)
    }

    /// Scalar value at `coordinate`, `None` when missing or unfilled.
    pub fn value_at(&self, coordinate: Coordinate) -> Option<f64> {
        self.cells
            .get(&coordinate)
            .and_then(|cell| cell.value())
            .map(|v| v.scalar())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn filled_len(&self) -> usize {
        self.cells.values().filter(|c| c.is_filled()).count()
    }

    /// Coordinates holding the "no data" sentinel.
    pub fn unfilled(&self) -> impl Iterator<Item = Coordinate> + '_ {
        self.cells
            .iter()
            .filter(|(_, cell)| !cell.is_filled())
            .map(|(c, _)| *c)
    }

    /// Filled scalar values in coordinate order.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.cells
            .values()
            .filter_map(|cell| cell.value())
            .map(|v| v.scalar())
    }

    /// Inclusive `(min, max)` corners of all known coordinates.
    pub fn bounds(&self) -> Option<(Coordinate, Coordinate)> {
        let mut keys = self.cells.keys();
        let first = *keys.next()?;
        Some(keys.fold((first, first), |(lo, hi), c| {
            (
                Coordinate::new(lo.row.min(c.row), lo.col.min(c.col)),
                Coordinate::new(hi.row.max(c.row), hi.col.max(c.col)),
            )
        }))
    }

    /// Dense grid covering [`bounds`](Self::bounds).
    ///
    /// `None` for an empty snapshot, or when the bounds span more than
    /// [`MAX_GRID_CELLS`] cells.
    pub fn to_grid(&self) -> Option<MapGrid> {
        let (lo, hi) = self.bounds()?;
        let rows = usize::try_from(i64::from(hi.row) - i64::from(lo.row) + 1).ok()?;
        let cols = usize::try_from(i64::from(hi.col) - i64::from(lo.col) + 1).ok()?;
        let len = rows.checked_mul(cols).filter(|n| *n <= MAX_GRID_CELLS);
        let Some(len) = len else {
            tracing::warn!(
                "Map bounds {}..{} span {}x{} cells, too large for a dense grid",
                lo,
                hi,
                rows,
                cols
            );
            return None;
        };
        let mut values = vec![f64::NAN; len];
        for (c, cell) in &self.cells {
            if let Some(v) = cell.value() {
                let r = (i64::from(c.row) - i64::from(lo.row)) as usize;
                let k = (i64::from(c.col) - i64::from(lo.col)) as usize;
                values[r * cols + k] = v.scalar();
            }
        }
        Some(MapGrid {
            origin: lo,
            rows,
            cols,
            values,
        })
    }
}
