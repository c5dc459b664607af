//! Ranking of solutions beyond move count.

use crate::{
    moves::{Move, MoveSet, format_algorithm},
    solver::ScoredSolution,
};
use itertools::Itertools;
use movecount_coefficient::AlgSpeed;
use std::cmp::Ordering;

/// Scores a solution; lower scores rank first among equal move counts.
pub trait RankingPolicy: Send + Sync {
    fn score(&self, moves: &[Move]) -> f64;
}

/// Ranks by estimated execution speed.
#[derive(Debug, Default)]
pub struct MovecountCoefficient {
    speed: AlgSpeed,
}

impl MovecountCoefficient {
    #[must_use]
    pub fn new(speed: AlgSpeed) -> Self {
        Self { speed }
    }
}

impl RankingPolicy for MovecountCoefficient {
    fn score(&self, moves: &[Move]) -> f64 {
        // Every formatted move is one the model knows
        self.speed
            .evaluate(&format_algorithm(moves))
            .unwrap_or(f64::INFINITY)
    }
}

fn distinct_faces(moves: &[Move]) -> usize {
    moves.iter().map(|move_| move_.face).unique().count()
}

fn generator_order(moves: &[Move], move_set: &MoveSet) -> Vec<usize> {
    moves
        .iter()
        .map(|move_| {
            move_set
                .moves()
                .iter()
                .position(|generator| generator == move_)
                .unwrap_or(usize::MAX)
        })
        .collect()
}

/// Order solutions by move count, then score, then fewer distinct faces,
/// then fewer moves, then the order of their moves among the generators.
pub fn ranking_cmp(a: &ScoredSolution, b: &ScoredSolution, move_set: &MoveSet) -> Ordering {
    let (a_moves, b_moves) = (&a.solution.moves, &b.solution.moves);
    a.solution
        .move_count
        .cmp(&b.solution.move_count)
        .then_with(|| a.score.total_cmp(&b.score))
        .then_with(|| distinct_faces(a_moves).cmp(&distinct_faces(b_moves)))
        .then_with(|| a_moves.len().cmp(&b_moves.len()))
        .then_with(|| generator_order(a_moves, move_set).cmp(&generator_order(b_moves, move_set)))
}

/// Sort solutions into ranked order.
pub fn rank(solutions: &mut [ScoredSolution], move_set: &MoveSet) {
    solutions.sort_by(|a, b| ranking_cmp(a, b, move_set));
}
