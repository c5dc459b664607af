//! Pruning tables: the exact move distance from solved of every coordinate
//! of one shape, under one allowed face set and one metric.

use crate::{
    coordinate::{CoordinateShape, CoordinateSpace, LocalMove},
    engine::CancellationToken,
    moves::{AllowedFaceSet, Metric, MoveSet},
    start, success, working,
};
use log::{debug, info};
use rayon::prelude::*;
use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
    time::Instant,
};
use thiserror::Error;

/// Raw table value of a coordinate the search has not reached.
pub const UNVISITED: u8 = u8::MAX;
/// Distance reported for coordinates that no sequence of allowed moves
/// reaches.
pub const UNREACHABLE: u8 = u8::MAX;
/// The deepest layer a build may stop at, so that `depth + 1` of a partial
/// table never collides with `UNREACHABLE`.
pub const MAX_TABLE_DEPTH: u8 = u8::MAX - 2;

/// Identifies one table: tables for different keys are never comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableKey {
    pub allowed_faces: AllowedFaceSet,
    pub metric: Metric,
    pub shape: CoordinateShape,
}

impl TableKey {
    #[must_use]
    pub fn space(&self) -> CoordinateSpace {
        CoordinateSpace::new(self.allowed_faces, self.shape)
    }

    /// The number of coordinates, which is also the number of bytes the table
    /// occupies in memory.
    #[must_use]
    pub fn coordinate_count(&self) -> usize {
        self.space().len()
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.allowed_faces, self.metric, self.shape)
    }
}

/// A flat array with one distance byte per coordinate.
///
/// A complete table knows every reachable coordinate; anything left unvisited
/// is unreachable. A partial table stopped after `depth` layers, so anything
/// left unvisited is at least `depth + 1` moves away.
pub struct PruningTable {
    key: TableKey,
    data: Vec<u8>,
    depth: u8,
    complete: bool,
}

impl fmt::Debug for PruningTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PruningTable")
            .field("key", &self.key)
            .field("len", &self.data.len())
            .field("depth", &self.depth)
            .field("complete", &self.complete)
            .finish_non_exhaustive()
    }
}

impl PruningTable {
    pub(crate) fn from_parts(key: TableKey, data: Vec<u8>, depth: u8, complete: bool) -> Self {
        debug_assert_eq!(data.len(), key.coordinate_count());
        Self {
            key,
            data,
            depth,
            complete,
        }
    }

    #[must_use]
    pub fn key(&self) -> TableKey {
        self.key
    }

    #[must_use]
    pub fn depth(&self) -> u8 {
        self.depth
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The raw serialized form: one byte per coordinate, `UNVISITED` for
    /// coordinates the build did not reach.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn memory_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    /// An admissible lower bound on the distance from `coordinate` to solved.
    #[must_use]
    pub fn distance(&self, coordinate: usize) -> u8 {
        match self.data[coordinate] {
            UNVISITED if self.complete => UNREACHABLE,
            UNVISITED => self.depth + 1,
            distance => distance,
        }
    }
}

#[derive(Error, Debug)]
pub enum BuildError {
    /// Holds everything up to the last completed layer, ready to resume from
    #[error("Building the {} table was cancelled at depth {}", .0.key, .0.depth)]
    Cancelled(Box<PruningTable>),
}

struct LayerCancelled;

/// Breadth first search from the solved coordinate over the unit steps of a
/// metric, one layer at a time.
pub struct PruningTableBuilder<'a> {
    key: TableKey,
    space: CoordinateSpace,
    generators: Vec<LocalMove>,
    max_depth: u8,
    cancellation: &'a CancellationToken,
}

impl<'a> PruningTableBuilder<'a> {
    #[must_use]
    pub fn new(key: TableKey, max_depth: u8, cancellation: &'a CancellationToken) -> Self {
        let space = key.space();
        let generators = MoveSet::moves_for(key.allowed_faces)
            .bfs_generators(key.metric)
            .into_iter()
            .map(|move_| space.local_move(move_))
            .collect();
        Self {
            key,
            space,
            generators,
            max_depth: max_depth.min(MAX_TABLE_DEPTH),
            cancellation,
        }
    }

    /// Run the search, resuming from `resume` if it is a partial table of the
    /// same key. `on_layer` sees the raw bytes after every completed layer.
    ///
    /// # Errors
    ///
    /// If cancelled, the layer in progress is rolled back and the table as of
    /// the last completed layer is returned inside the error.
    pub fn build(
        &self,
        resume: Option<PruningTable>,
        on_layer: &mut dyn FnMut(u8, &[u8]),
    ) -> Result<PruningTable, BuildError> {
        let (cells, mut depth) = match resume {
            Some(table) if table.key == self.key && !table.complete => {
                (into_cells(table.data), table.depth)
            }
            _ => {
                let mut data = vec![UNVISITED; self.space.len()];
                data[0] = 0;
                (into_cells(data), 0)
            }
        };

        info!(
            start!("Building pruning table {} with {} coordinates from depth {}"),
            self.key,
            cells.len(),
            depth
        );
        let start = Instant::now();

        let complete = loop {
            if depth >= self.max_depth {
                break false;
            }
            let layer_start = Instant::now();
            match self.expand_layer(&cells, depth) {
                Ok(0) => break true,
                Ok(added) => {
                    depth += 1;
                    debug!(
                        working!("Depth {}: {} coordinates in {:.3}s"),
                        depth,
                        added,
                        layer_start.elapsed().as_secs_f64()
                    );
                    on_layer(depth, cells_as_bytes(&cells));
                }
                Err(LayerCancelled) => {
                    let next = depth + 1;
                    cells.par_iter().for_each(|cell| {
                        if cell.load(Ordering::Relaxed) == next {
                            cell.store(UNVISITED, Ordering::Relaxed);
                        }
                    });
                    info!("Cancelled building {} at depth {}", self.key, depth);
                    return Err(BuildError::Cancelled(Box::new(PruningTable::from_parts(
                        self.key,
                        into_bytes(cells),
                        depth,
                        false,
                    ))));
                }
            }
        };

        info!(
            success!("Built pruning table {} to depth {} ({}) in {:.3}s"),
            self.key,
            depth,
            if complete { "complete" } else { "partial" },
            start.elapsed().as_secs_f64()
        );
        Ok(PruningTable::from_parts(
            self.key,
            into_bytes(cells),
            depth,
            complete,
        ))
    }

    /// Visit every coordinate at `depth` and mark its unvisited neighbours.
    /// Coordinates sharing a position part form a block that is expanded
    /// together; blocks are spread across the thread pool.
    fn expand_layer(&self, cells: &[AtomicU8], depth: u8) -> Result<u64, LayerCancelled> {
        let orientation_count = self.space.orientation_count();
        let next = depth + 1;
        (0..self.space.position_count())
            .into_par_iter()
            .map(|position| {
                if self.cancellation.is_cancelled() {
                    return Err(LayerCancelled);
                }
                let block = &cells[position * orientation_count..(position + 1) * orientation_count];
                if !block
                    .iter()
                    .any(|cell| cell.load(Ordering::Relaxed) == depth)
                {
                    return Ok(0);
                }
                let steps = self
                    .generators
                    .iter()
                    .map(|generator| self.space.block_step(position, generator))
                    .collect::<Vec<_>>();
                let mut added = 0;
                for (orientation, cell) in block.iter().enumerate() {
                    if cell.load(Ordering::Relaxed) != depth {
                        continue;
                    }
                    for step in &steps {
                        let neighbour = self.space.apply_block_step(step, orientation);
                        // Every writer of a layer writes the same value, so
                        // the result does not depend on scheduling
                        if cells[neighbour]
                            .compare_exchange(UNVISITED, next, Ordering::Relaxed, Ordering::Relaxed)
                            .is_ok()
                        {
                            added += 1;
                        }
                    }
                }
                Ok(added)
            })
            .try_reduce(|| 0, |a, b| Ok(a + b))
    }
}

fn into_cells(data: Vec<u8>) -> Vec<AtomicU8> {
    let mut data = std::mem::ManuallyDrop::new(data);
    // SAFETY: `AtomicU8` has the same size, alignment, and bit validity as
    // `u8`, and the original vector is never dropped.
    unsafe { Vec::from_raw_parts(data.as_mut_ptr().cast::<AtomicU8>(), data.len(), data.capacity()) }
}

fn into_bytes(cells: Vec<AtomicU8>) -> Vec<u8> {
    let mut cells = std::mem::ManuallyDrop::new(cells);
    // SAFETY: see `into_cells`
    unsafe { Vec::from_raw_parts(cells.as_mut_ptr().cast::<u8>(), cells.len(), cells.capacity()) }
}

fn cells_as_bytes(cells: &[AtomicU8]) -> &[u8] {
    // SAFETY: Same layout as in `into_cells`. This is only called between
    // layers when no thread writes to the cells.
    unsafe { std::slice::from_raw_parts(cells.as_ptr().cast::<u8>(), cells.len()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        coordinate::Orbit,
        puzzle::{IgnoreFlags, PuzzleState},
    };
    use fxhash::FxHashMap;

    fn key(allowed_faces: AllowedFaceSet, metric: Metric, shape: CoordinateShape) -> TableKey {
        TableKey {
            allowed_faces,
            metric,
            shape,
        }
    }

    fn build(key: TableKey, max_depth: u8) -> PruningTable {
        PruningTableBuilder::new(key, max_depth, &CancellationToken::new())
            .build(None, &mut |_, _| {})
            .unwrap()
    }

    /// Exact distances of every state within `max_depth` unit steps.
    fn brute_force(
        allowed_faces: AllowedFaceSet,
        metric: Metric,
        max_depth: u8,
    ) -> FxHashMap<PuzzleState, u8> {
        let generators = MoveSet::moves_for(allowed_faces).bfs_generators(metric);
        let mut distances = FxHashMap::default();
        distances.insert(PuzzleState::solved(), 0);
        let mut frontier = vec![PuzzleState::solved()];
        for depth in 1..=max_depth {
            let mut next_frontier = vec![];
            for state in &frontier {
                for &move_ in &generators {
                    let next = state.apply_move(move_);
                    distances.entry(next).or_insert_with(|| {
                        next_frontier.push(next);
                        depth
                    });
                }
            }
            frontier = next_frontier;
        }
        distances
    }

    #[test_log::test]
    fn test_solved_is_zero_and_neighbours_are_one() {
        let [corners, _] = CoordinateShape::for_ignore_flags(IgnoreFlags {
            corner_orientations: true,
            ..IgnoreFlags::NONE
        });
        let key = key(AllowedFaceSet::RU, Metric::Qtm, corners);
        let table = build(key, MAX_TABLE_DEPTH);
        assert!(table.is_complete());
        assert_eq!(table.distance(0), 0);
        let space = key.space();
        for move_ in MoveSet::moves_for(AllowedFaceSet::RU).moves() {
            let state = PuzzleState::solved().apply_move(*move_);
            assert_eq!(
                table.distance(space.coordinate_for(&state)),
                move_.cost(Metric::Qtm) as u8
            );
        }
    }

    #[test_log::test]
    fn test_tables_are_admissible() {
        let shapes = [
            CoordinateShape {
                orbit: Orbit::Corners,
                permutation: true,
                orientation: true,
            },
            CoordinateShape {
                orbit: Orbit::Edges,
                permutation: true,
                orientation: false,
            },
            CoordinateShape {
                orbit: Orbit::Edges,
                permutation: false,
                orientation: true,
            },
        ];
        for metric in [Metric::Qtm, Metric::Ftm] {
            let distances = brute_force(AllowedFaceSet::RU, metric, 6);
            for shape in shapes {
                let key = key(AllowedFaceSet::RU, metric, shape);
                // A shallow partial table must stay admissible too
                for max_depth in [3, MAX_TABLE_DEPTH] {
                    let table = build(key, max_depth);
                    let space = key.space();
                    for (state, &distance) in &distances {
                        assert!(table.distance(space.coordinate_for(state)) <= distance);
                    }
                }
            }
        }
    }

    #[test_log::test]
    fn test_build_is_deterministic() {
        let key = key(
            AllowedFaceSet::RUF,
            Metric::Ftm,
            CoordinateShape {
                orbit: Orbit::Edges,
                permutation: false,
                orientation: true,
            },
        );
        let first = build(key, MAX_TABLE_DEPTH);
        let second = build(key, MAX_TABLE_DEPTH);
        assert!(first.is_complete());
        assert_eq!(first.depth(), second.depth());
        assert_eq!(first.bytes(), second.bytes());
    }

    #[test_log::test]
    fn test_cancelled_build_resumes_to_the_same_table() {
        let key = key(
            AllowedFaceSet::RUL,
            Metric::Qtm,
            CoordinateShape {
                orbit: Orbit::Corners,
                permutation: false,
                orientation: true,
            },
        );
        let uninterrupted = build(key, MAX_TABLE_DEPTH);

        let cancellation = CancellationToken::new();
        let builder = PruningTableBuilder::new(key, MAX_TABLE_DEPTH, &cancellation);
        let Err(BuildError::Cancelled(partial)) = builder.build(None, &mut |depth, _| {
            if depth == 3 {
                cancellation.cancel();
            }
        }) else {
            panic!("The build should have been cancelled");
        };
        assert_eq!(partial.depth(), 3);
        assert!(!partial.is_complete());
        assert!(partial.bytes().iter().all(|&d| d <= 3 || d == UNVISITED));

        let resumed = PruningTableBuilder::new(key, MAX_TABLE_DEPTH, &CancellationToken::new())
            .build(Some(*partial), &mut |_, _| {})
            .unwrap();
        assert!(resumed.is_complete());
        assert_eq!(resumed.bytes(), uninterrupted.bytes());
    }

    #[test_log::test]
    fn test_partial_table_bounds_unvisited() {
        let key = key(
            AllowedFaceSet::RU,
            Metric::Qtm,
            CoordinateShape {
                orbit: Orbit::Edges,
                permutation: true,
                orientation: false,
            },
        );
        let table = build(key, 2);
        assert!(!table.is_complete());
        assert_eq!(table.depth(), 2);
        let unvisited = table
            .bytes()
            .iter()
            .position(|&d| d == UNVISITED)
            .unwrap();
        assert_eq!(table.distance(unvisited), 3);
    }
}
