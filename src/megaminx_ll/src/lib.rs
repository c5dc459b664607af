#![warn(clippy::pedantic)]
#![allow(
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::module_name_repetitions
)]

//! A last-layer solver for the Megaminx. Given a last-layer configuration, a
//! restricted set of turnable faces, and a metric, it searches for short
//! solutions with IDA* guided by precomputed pruning tables.
//!
//! Everything hangs off an [`Engine`](engine::Engine): it owns the table
//! store, the ranking policy, and the capabilities supplied by the host, and
//! every [`SolverSession`](session::SolverSession) is submitted through it.

pub(crate) mod canonical_fsm;
pub mod coordinate;
pub mod engine;
pub mod moves;
pub mod pruning;
pub mod puzzle;
pub(crate) mod puzzle_state_history;
pub mod ranking;
pub mod session;
pub mod solver;
pub mod store;

pub use engine::{
    CancellationToken, DirectoryHost, Engine, EngineConfig, Host, InvalidInput, SolverConfig,
    SubmitError,
};
pub use moves::{AllowedFaceSet, Amount, Face, Metric, Move, MoveSet};
pub use puzzle::{IgnoreFlags, LastLayerState, PuzzleState};
pub use session::{SessionEvent, SessionStatus, SolverSession};
pub use solver::{ScoredSolution, SearchProgress, Solution};
pub use store::{Resource, StoreError, TableFileInfo};

#[macro_export]
macro_rules! start {
    ($msg:expr) => {
        concat!("⏳ ", $msg)
    };
}

#[macro_export]
macro_rules! working {
    ($msg:expr) => {
        concat!("🛠  ", $msg)
    };
}

#[macro_export]
macro_rules! success {
    ($msg:expr) => {
        concat!("✅ ", $msg)
    };
}

// Binomial coefficients up to the largest orbit we track (20 edge slots)
const BINOMIAL: [[usize; 6]; 21] = {
    let mut arr = [[0; 6]; 21];
    let mut n = 0;
    while n < arr.len() {
        arr[n][0] = 1;
        let mut k = 1;
        while k < 6 {
            arr[n][k] = if n == 0 {
                0
            } else {
                arr[n - 1][k - 1] + arr[n - 1][k]
            };
            k += 1;
        }
        n += 1;
    }
    arr
};
