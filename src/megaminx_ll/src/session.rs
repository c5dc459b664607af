use crate::{
    engine::{CancellationToken, Engine, SolverConfig},
    moves::MoveSet,
    puzzle::PuzzleState,
    ranking::{RankingPolicy, rank},
    solver::{
        LastLayerHeuristic, LastLayerSolver, ScoredSolution, SearchObserver, SearchOutcome,
        SearchProgress, Solution, SolutionSource,
    },
    pruning::TableKey,
    store::{Resource, StoreError},
};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{error, info, warn};
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

/// Fractions are stored as parts per million so they can be raised atomically.
const FRACTION_SCALE: f64 = 1_000_000.0;
/// Progress events are sent when the threshold changes or the fraction
/// crosses a step of this many parts per million.
const PROGRESS_EVENT_STEP: u32 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    /// At least one solution was found.
    Completed,
    Cancelled,
    NoSolutionFound,
    /// A pruning table could not be loaded or built within the resources
    /// available.
    ResourceExhausted {
        key: TableKey,
        resource: Resource,
        needed: u64,
        available: u64,
    },
    Failed(String),
}

impl SessionStatus {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        *self != SessionStatus::Running
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Running => f.write_str("running"),
            SessionStatus::Completed => f.write_str("completed"),
            SessionStatus::Cancelled => f.write_str("cancelled"),
            SessionStatus::NoSolutionFound => f.write_str("no solution found"),
            SessionStatus::ResourceExhausted {
                key,
                resource,
                needed,
                available,
            } => write!(
                f,
                "the {key} table needs {needed} bytes of {resource} but only {available} are available"
            ),
            SessionStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Progress(SearchProgress),
    Solution(ScoredSolution),
    /// Always the last event of a session.
    Finished(SessionStatus),
}

struct SessionShared {
    cancellation: CancellationToken,
    threshold: AtomicU32,
    nodes_visited: AtomicU64,
    fraction: AtomicU32,
    /// Threshold and fraction step of the last progress event, packed so
    /// that later progress compares greater.
    last_reported: AtomicU64,
    solutions: Mutex<Vec<ScoredSolution>>,
    status: Mutex<SessionStatus>,
    events: Sender<SessionEvent>,
    ranking: Arc<dyn RankingPolicy>,
}

impl SessionShared {
    fn new(events: Sender<SessionEvent>, ranking: Arc<dyn RankingPolicy>) -> Self {
        Self {
            cancellation: CancellationToken::new(),
            threshold: AtomicU32::new(0),
            nodes_visited: AtomicU64::new(0),
            fraction: AtomicU32::new(0),
            last_reported: AtomicU64::new(0),
            solutions: Mutex::default(),
            status: Mutex::new(SessionStatus::Running),
            events,
            ranking,
        }
    }

    fn progress(&self) -> SearchProgress {
        SearchProgress {
            threshold: self.threshold.load(Ordering::Relaxed),
            nodes_visited: self.nodes_visited.load(Ordering::Relaxed),
            fraction: f64::from(self.fraction.load(Ordering::Relaxed)) / FRACTION_SCALE,
        }
    }

    fn raise_fraction(&self, fraction: f64) {
        #[allow(clippy::cast_sign_loss)]
        let scaled = (fraction.clamp(0.0, 1.0) * FRACTION_SCALE) as u32;
        self.fraction.fetch_max(scaled, Ordering::Relaxed);
    }

    fn status(&self) -> SessionStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn finish(&self, status: SessionStatus) {
        if matches!(
            status,
            SessionStatus::Completed | SessionStatus::NoSolutionFound
        ) {
            self.raise_fraction(1.0);
        }
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status.clone();
        // Nobody may be listening
        let _ = self.events.send(SessionEvent::Finished(status));
    }
}

impl SearchObserver for SessionShared {
    fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    fn on_progress(&self, progress: SearchProgress) {
        self.threshold.store(progress.threshold, Ordering::Relaxed);
        self.nodes_visited
            .store(progress.nodes_visited, Ordering::Relaxed);
        self.raise_fraction(progress.fraction);
        let progress = self.progress();
        let step = self.fraction.load(Ordering::Relaxed) / PROGRESS_EVENT_STEP;
        let reported = ((u64::from(progress.threshold) + 1) << 32) | u64::from(step);
        if self.last_reported.fetch_max(reported, Ordering::Relaxed) < reported {
            let _ = self.events.send(SessionEvent::Progress(progress));
        }
    }

    fn on_solution(&self, solution: &Solution) {
        let score = self.ranking.score(&solution.moves);
        let scored = {
            let mut solutions = self.solutions.lock().unwrap_or_else(PoisonError::into_inner);
            let scored = ScoredSolution {
                solution: solution.clone(),
                score,
                index: solutions.len(),
            };
            solutions.push(scored.clone());
            scored
        };
        let _ = self.events.send(SessionEvent::Solution(scored));
    }
}

/// One solve running on its own thread. Dropping the session cancels it and
/// waits for the thread to stop.
pub struct SolverSession {
    shared: Arc<SessionShared>,
    events: Receiver<SessionEvent>,
    handle: Option<JoinHandle<()>>,
    state: PuzzleState,
    config: SolverConfig,
}

impl SolverSession {
    pub(crate) fn spawn(
        engine: Arc<Engine>,
        state: PuzzleState,
        config: SolverConfig,
    ) -> std::io::Result<Self> {
        // Progress events are throttled and solutions are capped by the
        // solution count, so the queue stays small even if nobody reads it
        let (sender, events) = unbounded();
        let shared = Arc::new(SessionShared::new(
            sender,
            Arc::clone(engine.ranking_policy()),
        ));

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("ll-solver".to_owned())
            .spawn(move || {
                let status = panic::catch_unwind(AssertUnwindSafe(|| {
                    run(&engine, &worker_shared, &state, &config)
                }))
                .unwrap_or_else(|_| {
                    error!("The solver thread panicked");
                    SessionStatus::Failed("the solver panicked".to_owned())
                });
                info!("Session finished: {status}");
                worker_shared.finish(status);
            })?;

        Ok(Self {
            shared,
            events,
            handle: Some(handle),
            state,
            config,
        })
    }

    #[must_use]
    pub fn state(&self) -> &PuzzleState {
        &self.state
    }

    #[must_use]
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Request cancellation. The session reaches `Cancelled` soon after,
    /// keeping the solutions found so far.
    pub fn cancel(&self) {
        self.shared.cancellation.cancel();
    }

    #[must_use]
    pub fn progress(&self) -> SearchProgress {
        self.shared.progress()
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    /// Solutions in the order they were found.
    #[must_use]
    pub fn solutions(&self) -> Vec<ScoredSolution> {
        self.shared
            .solutions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Solutions in ranked order.
    #[must_use]
    pub fn ranked_solutions(&self) -> Vec<ScoredSolution> {
        let mut solutions = self.solutions();
        rank(&mut solutions, &MoveSet::moves_for(self.config.allowed_faces));
        solutions
    }

    /// Progress, solutions, and the final status as they happen.
    #[must_use]
    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }

    /// Block until the session finishes.
    pub fn wait(&mut self) -> SessionStatus {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                self.shared
                    .finish(SessionStatus::Failed("the solver panicked".to_owned()));
            }
        }
        self.status()
    }
}

impl Drop for SolverSession {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
    }
}

/// A solved state needs no search when one solution is enough.
pub(crate) fn needs_tables(state: &PuzzleState, config: &SolverConfig) -> bool {
    config.solution_count > 1 || !state.is_solved(config.ignore)
}

fn run(
    engine: &Engine,
    shared: &SessionShared,
    state: &PuzzleState,
    config: &SolverConfig,
) -> SessionStatus {
    if !needs_tables(state, config) {
        shared.on_solution(&Solution {
            moves: vec![],
            move_count: 0,
            source: SolutionSource {
                allowed_faces: config.allowed_faces,
                metric: config.metric,
                threshold: 0,
            },
        });
        return SessionStatus::Completed;
    }

    let tables = match engine.prepare_tables(config, &shared.cancellation) {
        Ok(tables) => tables,
        Err(StoreError::Cancelled(_)) => return SessionStatus::Cancelled,
        Err(StoreError::ResourceExhausted {
            key,
            resource,
            needed,
            available,
        }) => {
            warn!("Not enough {resource} for the {key} table");
            return SessionStatus::ResourceExhausted {
                key,
                resource,
                needed,
                available,
            };
        }
        Err(e) => {
            warn!("Could not prepare pruning tables: {e}");
            return SessionStatus::Failed(e.to_string());
        }
    };
    if shared.cancellation.is_cancelled() {
        return SessionStatus::Cancelled;
    }

    let solver = LastLayerSolver::new(config, LastLayerHeuristic::new(tables));
    match solver.solve(state, shared).outcome {
        SearchOutcome::Completed => SessionStatus::Completed,
        SearchOutcome::NoSolutionFound => SessionStatus::NoSolutionFound,
        SearchOutcome::Cancelled => SessionStatus::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{moves::parse_algorithm, ranking::MovecountCoefficient};

    #[test]
    fn test_undrained_events_stay_bounded() {
        let (sender, events) = unbounded();
        let shared = SessionShared::new(sender, Arc::new(MovecountCoefficient::default()));
        let polls = 1_000_000_u32;
        for poll in 0..polls {
            shared.on_progress(SearchProgress {
                threshold: 10 + poll / 100_000,
                nodes_visited: u64::from(poll) * 1024,
                fraction: f64::from(poll) / f64::from(polls),
            });
        }
        shared.on_solution(&Solution {
            moves: parse_algorithm("R U R'").unwrap(),
            move_count: 3,
            source: SolutionSource {
                allowed_faces: SolverConfig::default().allowed_faces,
                metric: SolverConfig::default().metric,
                threshold: 3,
            },
        });
        shared.finish(SessionStatus::Completed);

        let received = events.try_iter().collect::<Vec<_>>();
        let progress_events = received
            .iter()
            .filter(|event| matches!(event, SessionEvent::Progress(_)))
            .count();
        assert!(progress_events >= 10);
        assert!(progress_events <= 1_000 + 10 + 1);
        assert!(matches!(
            received[received.len() - 2],
            SessionEvent::Solution(_)
        ));
        assert_eq!(
            received.last(),
            Some(&SessionEvent::Finished(SessionStatus::Completed))
        );
        assert_eq!(shared.progress().threshold, 19);
    }
}
