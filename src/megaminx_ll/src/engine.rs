use crate::{
    coordinate::CoordinateShape,
    moves::{AllowedFaceSet, Metric},
    pruning::{MAX_TABLE_DEPTH, PruningTable, TableKey},
    puzzle::{IgnoreFlags, InvalidStateError, LastLayerState, PuzzleState},
    ranking::{MovecountCoefficient, RankingPolicy},
    session::{SolverSession, needs_tables},
    store::{Resource, StoreError, TableFileInfo, TableStore},
};
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use thiserror::Error;

/// A cooperative cancellation flag shared between a caller and the work it
/// started.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What the engine needs from its environment.
pub trait Host: Send + Sync {
    /// The directory pruning tables are persisted in.
    fn data_directory(&self) -> PathBuf;

    /// Free bytes on the data directory's disk, if known.
    fn available_disk_space(&self) -> Option<u64> {
        None
    }

    /// Free bytes of memory, if known.
    fn available_memory(&self) -> Option<u64> {
        None
    }
}

/// A host that only knows where to put its tables.
#[derive(Debug, Clone)]
pub struct DirectoryHost(pub PathBuf);

impl Host for DirectoryHost {
    fn data_directory(&self) -> PathBuf {
        self.0.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on the bytes of pruning tables held in memory.
    pub memory_ceiling_bytes: u64,
    /// Tables stop growing at this depth and are kept as partial tables.
    pub max_table_depth: u8,
    /// Minimum time between checkpoints written during a build.
    pub checkpoint_interval_secs: u64,
    /// Threads used to build tables; rayon's default when absent.
    pub build_threads: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_bytes: 1 << 30,
            max_table_depth: 40,
            checkpoint_interval_secs: 30,
            build_threads: None,
        }
    }
}

/// Parameters of one solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub allowed_faces: AllowedFaceSet,
    pub metric: Metric,
    /// Stop once the search threshold would exceed `max_depth`.
    pub limit_depth: bool,
    pub max_depth: u32,
    pub ignore: IgnoreFlags,
    /// Stop after this many solutions.
    pub solution_count: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            allowed_faces: AllowedFaceSet::RU,
            metric: Metric::Qtm,
            limit_depth: false,
            max_depth: 20,
            ignore: IgnoreFlags::NONE,
            solution_count: 1,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Every aspect of the last layer is ignored, so there is nothing to solve")]
    AllAspectsIgnored,
    #[error("At least one solution must be requested")]
    ZeroSolutionCount,
}

impl SolverConfig {
    /// # Errors
    ///
    /// Rejects configurations that leave nothing to search for.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ignore.ignores_everything() {
            return Err(ConfigError::AllAspectsIgnored);
        }
        if self.solution_count == 0 {
            return Err(ConfigError::ZeroSolutionCount);
        }
        Ok(())
    }

    /// The corner and edge tables this configuration searches with.
    #[must_use]
    pub fn table_keys(&self) -> [TableKey; 2] {
        CoordinateShape::for_ignore_flags(self.ignore).map(|shape| TableKey {
            allowed_faces: self.allowed_faces,
            metric: self.metric,
            shape,
        })
    }
}

#[derive(Error, Debug)]
pub enum InvalidInput {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    State(#[from] InvalidStateError),
    #[error("The state cannot be solved by turning only {0}")]
    OutsideAllowedFaces(AllowedFaceSet),
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Invalid input: {0}")]
    InvalidInput(#[from] InvalidInput),
    #[error("The {key} table needs {needed} bytes of {resource} but only {available} are available")]
    ResourceExhausted {
        key: TableKey,
        resource: Resource,
        needed: u64,
        available: u64,
    },
    #[error("Failed to start the solver thread: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to create the data directory: {0}")]
    DataDirectory(#[from] io::Error),
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("The maximum table depth cannot exceed {MAX_TABLE_DEPTH}")]
    TableDepthTooLarge,
}

/// Owns the table store and starts solver sessions.
pub struct Engine {
    config: EngineConfig,
    host: Arc<dyn Host>,
    store: TableStore,
    ranking: Arc<dyn RankingPolicy>,
}

impl Engine {
    /// Create an engine that ranks solutions by movecount coefficient.
    ///
    /// # Errors
    ///
    /// Fails if the data directory cannot be created or the build thread
    /// pool cannot be started.
    pub fn new(host: Arc<dyn Host>, config: EngineConfig) -> Result<Arc<Self>, EngineError> {
        Self::with_ranking_policy(host, config, Arc::new(MovecountCoefficient::default()))
    }

    /// # Errors
    ///
    /// See [`Engine::new`].
    pub fn with_ranking_policy(
        host: Arc<dyn Host>,
        config: EngineConfig,
        ranking: Arc<dyn RankingPolicy>,
    ) -> Result<Arc<Self>, EngineError> {
        if config.max_table_depth > MAX_TABLE_DEPTH {
            return Err(EngineError::TableDepthTooLarge);
        }
        let pool = match config.build_threads {
            Some(num_threads) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(num_threads)
                    .thread_name(|i| format!("table-builder-{i}"))
                    .build()?,
            ),
            None => None,
        };
        let store = TableStore::new(Arc::clone(&host), &config, pool)?;
        info!(
            "Storing pruning tables in {}",
            store.directory().display()
        );
        Ok(Arc::new(Self {
            config,
            host,
            store,
            ranking,
        }))
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    #[must_use]
    pub fn store(&self) -> &TableStore {
        &self.store
    }

    #[must_use]
    pub fn ranking_policy(&self) -> &Arc<dyn RankingPolicy> {
        &self.ranking
    }

    /// Solve a last layer state in the background.
    ///
    /// # Errors
    ///
    /// Invalid configurations, and states that pieces outside the allowed
    /// faces would have to reach, are rejected before anything starts. So is
    /// a configuration whose tables cannot fit in the memory ceiling.
    pub fn submit(
        self: &Arc<Self>,
        state: &LastLayerState,
        config: SolverConfig,
    ) -> Result<SolverSession, SubmitError> {
        self.submit_state(PuzzleState::from(*state), config)
    }

    /// Solve any state of the tracked region in the background, such as one
    /// reached by scrambling with an algorithm.
    ///
    /// # Errors
    ///
    /// See [`Engine::submit`].
    pub fn submit_state(
        self: &Arc<Self>,
        state: PuzzleState,
        config: SolverConfig,
    ) -> Result<SolverSession, SubmitError> {
        config.validate().map_err(InvalidInput::from)?;
        if !state.is_confined_to(config.allowed_faces.faces()) {
            return Err(InvalidInput::OutsideAllowedFaces(config.allowed_faces).into());
        }
        if needs_tables(&state, &config) {
            for key in config.table_keys() {
                let needed = key.coordinate_count() as u64;
                if needed > self.config.memory_ceiling_bytes {
                    return Err(SubmitError::ResourceExhausted {
                        key,
                        resource: Resource::Memory,
                        needed,
                        available: self.config.memory_ceiling_bytes,
                    });
                }
            }
        }
        Ok(SolverSession::spawn(Arc::clone(self), state, config)?)
    }

    /// Load or build both tables a configuration needs.
    ///
    /// # Errors
    ///
    /// See [`TableStore::load`].
    pub fn prepare_tables(
        &self,
        config: &SolverConfig,
        cancellation: &CancellationToken,
    ) -> Result<[Arc<PruningTable>; 2], StoreError> {
        let [corner_key, edge_key] = config.table_keys();
        Ok([
            self.store.load(corner_key, cancellation)?,
            self.store.load(edge_key, cancellation)?,
        ])
    }

    #[must_use]
    pub fn memory_usage(&self) -> u64 {
        self.store.memory_usage()
    }

    /// # Errors
    ///
    /// Fails if the data directory cannot be read.
    pub fn list_tables(&self) -> Result<Vec<TableFileInfo>, StoreError> {
        self.store.list()
    }

    /// # Errors
    ///
    /// Fails for names that are not table files or if removal fails.
    pub fn delete_table(&self, file_name: &str) -> Result<(), StoreError> {
        self.store.delete(file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert_eq!(SolverConfig::default().validate(), Ok(()));
        let all_ignored = SolverConfig {
            ignore: IgnoreFlags {
                corner_positions: true,
                edge_positions: true,
                corner_orientations: true,
                edge_orientations: true,
            },
            ..SolverConfig::default()
        };
        assert_eq!(all_ignored.validate(), Err(ConfigError::AllAspectsIgnored));
        let no_solutions = SolverConfig {
            solution_count: 0,
            ..SolverConfig::default()
        };
        assert_eq!(no_solutions.validate(), Err(ConfigError::ZeroSolutionCount));
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
