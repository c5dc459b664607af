use crate::{
    canonical_fsm::{CanonicalFSM, CanonicalFSMState},
    coordinate::CoordinateSpace,
    engine::SolverConfig,
    moves::{AllowedFaceSet, Metric, Move, MoveSet, format_algorithm},
    pruning::{PruningTable, UNREACHABLE},
    puzzle::{IgnoreFlags, PuzzleState},
    puzzle_state_history::PuzzleStateHistory,
    start, success, working,
};
use log::{debug, info};
use std::{fmt, ops::ControlFlow, sync::Arc, time::Instant};

/// Nodes visited between checks for cancellation and progress reports.
const POLL_INTERVAL: u64 = 1024;

/// How a solution was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolutionSource {
    pub allowed_faces: AllowedFaceSet,
    pub metric: Metric,
    /// The IDA* threshold of the iteration that found it.
    pub threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    pub moves: Vec<Move>,
    /// The length of `moves` under the source metric.
    pub move_count: u32,
    pub source: SolutionSource,
}

impl fmt::Display for Solution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.moves.is_empty() {
            write!(f, "(solved) (0 {})", self.source.metric)
        } else {
            write!(
                f,
                "{} ({} {})",
                format_algorithm(&self.moves),
                self.move_count,
                self.source.metric
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSolution {
    pub solution: Solution,
    pub score: f64,
    /// Position in the order solutions were found.
    pub index: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SearchProgress {
    pub threshold: u32,
    pub nodes_visited: u64,
    /// Estimated completion in `[0, 1]`, never decreasing within a search.
    pub fraction: f64,
}

/// Receives search events and decides whether to keep going.
pub trait SearchObserver {
    fn is_cancelled(&self) -> bool;

    fn on_progress(&self, _progress: SearchProgress) {}

    fn on_solution(&self, _solution: &Solution) {}
}

impl SearchObserver for () {
    fn is_cancelled(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    /// At least one solution was found.
    Completed,
    NoSolutionFound,
    Cancelled,
}

#[derive(Debug)]
pub struct SearchResult {
    pub solutions: Vec<Solution>,
    pub outcome: SearchOutcome,
    pub nodes_visited: u64,
}

/// The maximum of a corner table and an edge table lookup.
pub struct LastLayerHeuristic {
    tables: [(CoordinateSpace, Arc<PruningTable>); 2],
}

impl LastLayerHeuristic {
    #[must_use]
    pub fn new(tables: [Arc<PruningTable>; 2]) -> Self {
        Self {
            tables: tables.map(|table| (table.key().space(), table)),
        }
    }

    /// A lower bound on the cost to solve `state`, or `UNREACHABLE`.
    #[must_use]
    pub fn admissible_heuristic(&self, state: &PuzzleState) -> u8 {
        self.tables
            .iter()
            .map(|(space, table)| table.distance(space.coordinate_for(state)))
            .max()
            .unwrap_or(0)
    }
}

pub struct LastLayerSolver {
    move_set: MoveSet,
    move_classes: Vec<usize>,
    canonical_fsm: CanonicalFSM,
    heuristic: LastLayerHeuristic,
    metric: Metric,
    ignore: IgnoreFlags,
    max_depth: Option<u32>,
    /// Threshold progress is measured against, with or without a limit.
    horizon: u32,
    solution_count: usize,
}

struct LastLayerSolverMutable<'a> {
    puzzle_state_history: PuzzleStateHistory,
    observer: &'a dyn SearchObserver,
    solutions: Vec<Solution>,
    threshold: u32,
    /// Goals cheaper than this were reported by an earlier iteration.
    min_new_cost: u32,
    next_threshold: u32,
    initial_threshold: u32,
    iteration: u32,
    root_moves_done: usize,
    nodes_visited: u64,
    fraction: f64,
    cancelled: bool,
}

impl LastLayerSolver {
    #[must_use]
    pub fn new(config: &SolverConfig, heuristic: LastLayerHeuristic) -> Self {
        let move_set = MoveSet::moves_for(config.allowed_faces);
        let move_classes = move_set
            .moves()
            .iter()
            .map(|move_| {
                move_set
                    .face_class(move_.face)
                    .expect("Every generated move turns an allowed face")
            })
            .collect();
        let canonical_fsm = CanonicalFSM::from(&move_set);
        Self {
            move_set,
            move_classes,
            canonical_fsm,
            heuristic,
            metric: config.metric,
            ignore: config.ignore,
            max_depth: config.limit_depth.then_some(config.max_depth),
            horizon: config.max_depth,
            solution_count: config.solution_count,
        }
    }

    #[must_use]
    pub fn move_set(&self) -> &MoveSet {
        &self.move_set
    }

    /// Find up to `solution_count` solutions in nondecreasing move count.
    /// Each solution is reported to the observer as it is found.
    pub fn solve(&self, start: &PuzzleState, observer: &dyn SearchObserver) -> SearchResult {
        info!(start!("Searching for last layer solutions"));
        let search_start = Instant::now();

        let root_heuristic = self.heuristic.admissible_heuristic(start);
        let root_solved = start.is_solved(self.ignore);
        let threshold = match root_heuristic {
            UNREACHABLE => u32::from(UNREACHABLE),
            0 if !root_solved => 1,
            h => u32::from(h),
        };

        let mut mutable = LastLayerSolverMutable {
            puzzle_state_history: (*start).into(),
            observer,
            solutions: vec![],
            threshold,
            min_new_cost: 0,
            next_threshold: u32::MAX,
            initial_threshold: threshold,
            iteration: 0,
            root_moves_done: 0,
            nodes_visited: 0,
            fraction: 0.0,
            cancelled: false,
        };

        loop {
            if mutable.threshold >= u32::from(UNREACHABLE)
                || self.max_depth.is_some_and(|max_depth| mutable.threshold > max_depth)
            {
                break;
            }
            debug!(
                working!("Searching threshold {}"),
                mutable.threshold
            );
            mutable.next_threshold = u32::MAX;
            mutable.root_moves_done = 0;
            mutable
                .puzzle_state_history
                .reserve(mutable.threshold as usize + 1);

            let flow = if root_solved {
                // Goals are never expanded
                if mutable.min_new_cost == 0 {
                    self.record_solution(&mut mutable, 0)
                } else {
                    ControlFlow::Continue(())
                }
            } else {
                self.search_for_solution(&mut mutable, CanonicalFSMState::default(), 0)
            };

            if flow.is_break() || mutable.next_threshold == u32::MAX {
                break;
            }
            mutable.min_new_cost = mutable.threshold + 1;
            mutable.threshold = mutable.next_threshold;
            mutable.iteration += 1;
        }

        let outcome = if mutable.cancelled {
            SearchOutcome::Cancelled
        } else if mutable.solutions.is_empty() {
            SearchOutcome::NoSolutionFound
        } else {
            SearchOutcome::Completed
        };
        info!(
            success!("Search finished as {:?} with {} solutions in {:.3}s"),
            outcome,
            mutable.solutions.len(),
            search_start.elapsed().as_secs_f64()
        );
        debug!("Visited {} nodes", mutable.nodes_visited);

        SearchResult {
            solutions: mutable.solutions,
            outcome,
            nodes_visited: mutable.nodes_visited,
        }
    }

    fn search_for_solution(
        &self,
        mutable: &mut LastLayerSolverMutable,
        current_fsm_state: CanonicalFSMState,
        cost_so_far: u32,
    ) -> ControlFlow<()> {
        for (move_index, &move_) in self.move_set.moves().iter().enumerate() {
            if cost_so_far == 0 {
                mutable.root_moves_done = move_index;
            }
            let Some(next_fsm_state) = self
                .canonical_fsm
                .next_state(current_fsm_state, self.move_classes[move_index])
            else {
                continue;
            };

            mutable.nodes_visited += 1;
            if mutable.nodes_visited % POLL_INTERVAL == 0 && self.poll(mutable).is_break() {
                return ControlFlow::Break(());
            }

            let cost = cost_so_far + move_.cost(self.metric);
            mutable
                .puzzle_state_history
                .push_stack(move_index, &self.move_set);
            let flow = self.visit(mutable, next_fsm_state, cost);
            mutable.puzzle_state_history.pop_stack();
            if flow.is_break() {
                return flow;
            }
        }
        ControlFlow::Continue(())
    }

    /// Handle the state on top of the history, reached at `cost`.
    fn visit(
        &self,
        mutable: &mut LastLayerSolverMutable,
        fsm_state: CanonicalFSMState,
        cost: u32,
    ) -> ControlFlow<()> {
        let state = mutable.puzzle_state_history.last_state();
        let heuristic = self.heuristic.admissible_heuristic(state);
        let solved = heuristic == 0 && state.is_solved(self.ignore);

        // A nonzero cost remains for unsolved states the tables cannot tell
        // apart from solved ones
        let remaining = if heuristic == 0 && !solved {
            1
        } else {
            u32::from(heuristic)
        };
        let estimate = cost + remaining;
        if estimate > mutable.threshold {
            mutable.next_threshold = mutable.next_threshold.min(estimate);
            return ControlFlow::Continue(());
        }

        if solved {
            if cost >= mutable.min_new_cost {
                return self.record_solution(mutable, cost);
            }
            return ControlFlow::Continue(());
        }

        self.search_for_solution(mutable, fsm_state, cost)
    }

    fn record_solution(&self, mutable: &mut LastLayerSolverMutable, cost: u32) -> ControlFlow<()> {
        let moves = mutable
            .puzzle_state_history
            .create_move_history()
            .into_iter()
            .map(|move_index| self.move_set.moves()[move_index])
            .collect();
        let solution = Solution {
            moves,
            move_count: cost,
            source: SolutionSource {
                allowed_faces: self.move_set.allowed_faces(),
                metric: self.metric,
                threshold: mutable.threshold,
            },
        };
        debug!("Found solution {solution}");
        mutable.observer.on_solution(&solution);
        mutable.solutions.push(solution);
        if mutable.solutions.len() >= self.solution_count {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    fn poll(&self, mutable: &mut LastLayerSolverMutable) -> ControlFlow<()> {
        if mutable.observer.is_cancelled() {
            mutable.cancelled = true;
            return ControlFlow::Break(());
        }
        let fraction = self.fraction(mutable).max(mutable.fraction);
        mutable.fraction = fraction;
        mutable.observer.on_progress(SearchProgress {
            threshold: mutable.threshold,
            nodes_visited: mutable.nodes_visited,
            fraction,
        });
        ControlFlow::Continue(())
    }

    fn fraction(&self, mutable: &LastLayerSolverMutable) -> f64 {
        estimate_fraction(
            mutable.threshold,
            mutable.initial_threshold,
            self.horizon,
            self.max_depth.is_some(),
            mutable.root_moves_done as f64 / self.move_set.moves().len() as f64,
        )
    }
}

/// Share of the fraction an unlimited search spends climbing to `horizon`.
const HORIZON_SHARE: f64 = 0.9;

/// Thresholds are the coarse measure of progress and `within`, the share of
/// root moves done at the current threshold, the fine one. An unlimited
/// search climbs to `HORIZON_SHARE` by `horizon` and then covers half of what
/// remains per threshold, so past the horizon the value is only a heuristic.
fn estimate_fraction(
    threshold: u32,
    initial_threshold: u32,
    horizon: u32,
    limited: bool,
    within: f64,
) -> f64 {
    let climbed = f64::from(threshold.saturating_sub(initial_threshold)) + within;
    let span = f64::from(horizon.saturating_sub(initial_threshold) + 1);
    let fraction = if limited {
        climbed / span
    } else if climbed <= span {
        HORIZON_SHARE * climbed / span
    } else {
        HORIZON_SHARE + (1.0 - HORIZON_SHARE) * (1.0 - 0.5_f64.powf(climbed - span))
    };
    fraction.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::CancellationToken,
        moves::parse_algorithm,
        pruning::{PruningTableBuilder, TableKey},
    };
    use std::{
        cell::Cell,
        collections::{HashMap, HashSet},
        sync::{LazyLock, Mutex},
    };

    static TABLES: LazyLock<Mutex<HashMap<TableKey, Arc<PruningTable>>>> =
        LazyLock::new(Mutex::default);

    fn heuristic(config: &SolverConfig) -> LastLayerHeuristic {
        let cancellation = CancellationToken::new();
        LastLayerHeuristic::new(config.table_keys().map(|key| {
            let mut tables = TABLES.lock().unwrap();
            Arc::clone(tables.entry(key).or_insert_with(|| {
                Arc::new(
                    PruningTableBuilder::new(key, 40, &cancellation)
                        .build(None, &mut |_, _| {})
                        .unwrap(),
                )
            }))
        }))
    }

    fn solve(config: &SolverConfig, algorithm: &str) -> SearchResult {
        let solver = LastLayerSolver::new(config, heuristic(config));
        let state = PuzzleState::solved().apply_moves(&parse_algorithm(algorithm).unwrap());
        solver.solve(&state, &())
    }

    #[test_log::test]
    fn test_solves_single_turn() {
        let config = SolverConfig::default();
        let result = solve(&config, "U");
        assert_eq!(result.outcome, SearchOutcome::Completed);
        assert_eq!(result.solutions.len(), 1);
        assert_eq!(format_algorithm(&result.solutions[0].moves), "U'");
        assert_eq!(result.solutions[0].move_count, 1);
    }

    #[test_log::test]
    fn test_solutions_solve_and_are_nondecreasing() {
        let config = SolverConfig {
            solution_count: 5,
            ..SolverConfig::default()
        };
        let scramble = "R U R' U'";
        let state = PuzzleState::solved().apply_moves(&parse_algorithm(scramble).unwrap());
        let result = solve(&config, scramble);
        assert_eq!(result.outcome, SearchOutcome::Completed);
        assert_eq!(result.solutions.len(), 5);
        for window in result.solutions.windows(2) {
            assert!(window[0].move_count <= window[1].move_count);
        }
        for solution in &result.solutions {
            assert!(state.apply_moves(&solution.moves).is_solved(IgnoreFlags::NONE));
            let cost = solution
                .moves
                .iter()
                .map(|move_| move_.cost(Metric::Qtm))
                .sum::<u32>();
            assert_eq!(cost, solution.move_count);
        }
        let unique = result
            .solutions
            .iter()
            .map(|solution| &solution.moves)
            .collect::<HashSet<_>>();
        assert_eq!(unique.len(), 5);
    }

    #[test_log::test]
    fn test_depth_limit() {
        let scramble = "R U R' U R U2 R'";
        let optimal = solve(&SolverConfig::default(), scramble).solutions[0].move_count;

        let limited = |max_depth| SolverConfig {
            limit_depth: true,
            max_depth,
            ..SolverConfig::default()
        };
        assert_eq!(
            solve(&limited(optimal - 1), scramble).outcome,
            SearchOutcome::NoSolutionFound
        );
        let result = solve(&limited(optimal), scramble);
        assert_eq!(result.outcome, SearchOutcome::Completed);
        assert_eq!(result.solutions[0].move_count, optimal);
    }

    #[test_log::test]
    fn test_search_is_deterministic() {
        let config = SolverConfig {
            metric: Metric::Ftm,
            solution_count: 3,
            ..SolverConfig::default()
        };
        let first = solve(&config, "R U R' U R");
        let second = solve(&config, "R U R' U R");
        assert_eq!(first.solutions, second.solutions);
        assert_eq!(first.nodes_visited, second.nodes_visited);
    }

    #[test_log::test]
    fn test_solved_root() {
        let config = SolverConfig {
            solution_count: 3,
            ..SolverConfig::default()
        };
        let result = solve(&config, "");
        assert_eq!(result.outcome, SearchOutcome::Completed);
        assert_eq!(result.solutions.len(), 1);
        assert!(result.solutions[0].moves.is_empty());
    }

    #[test_log::test]
    fn test_ignoring_edges() {
        let config = SolverConfig {
            ignore: IgnoreFlags {
                edge_positions: true,
                edge_orientations: true,
                ..IgnoreFlags::NONE
            },
            ..SolverConfig::default()
        };
        let scramble = "R U2 R' U'";
        let state = PuzzleState::solved().apply_moves(&parse_algorithm(scramble).unwrap());
        let result = solve(&config, scramble);
        assert_eq!(result.outcome, SearchOutcome::Completed);
        assert!(state
            .apply_moves(&result.solutions[0].moves)
            .is_solved(config.ignore));
    }

    #[test]
    fn test_unlimited_progress_follows_the_threshold_ladder() {
        let fraction = |threshold, within| estimate_fraction(threshold, 10, 20, false, within);
        assert!(fraction(10, 0.0).abs() < f64::EPSILON);
        assert!(fraction(14, 0.0) < 0.5);
        assert!(fraction(20, 0.99) < HORIZON_SHARE);
        assert!(fraction(25, 0.0) < 1.0);

        let mut previous = 0.0;
        for threshold in 10..40 {
            for step in 0..4 {
                let next = fraction(threshold, f64::from(step) / 4.0);
                assert!(next >= previous);
                previous = next;
            }
        }

        let limited = estimate_fraction(15, 10, 20, true, 0.5);
        assert!((limited - 5.5 / 11.0).abs() < 1e-9);
    }

    struct CancelAfter {
        polls: Cell<u32>,
        progress: Cell<f64>,
    }

    impl SearchObserver for CancelAfter {
        fn is_cancelled(&self) -> bool {
            self.polls.set(self.polls.get() + 1);
            self.polls.get() > 3
        }

        fn on_progress(&self, progress: SearchProgress) {
            assert!(progress.fraction >= self.progress.get());
            self.progress.set(progress.fraction);
        }
    }

    #[test_log::test]
    fn test_cancellation() {
        let config = SolverConfig {
            metric: Metric::Ftm,
            solution_count: 10_000,
            ..SolverConfig::default()
        };
        let solver = LastLayerSolver::new(&config, heuristic(&config));
        let state = PuzzleState::solved().apply_moves(&parse_algorithm("R U R' U'").unwrap());
        let observer = CancelAfter {
            polls: Cell::new(0),
            progress: Cell::new(0.0),
        };
        let result = solver.solve(&state, &observer);
        assert_eq!(result.outcome, SearchOutcome::Cancelled);
        assert!(result.nodes_visited >= 4 * POLL_INTERVAL);
    }
}
