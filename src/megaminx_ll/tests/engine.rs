use megaminx_ll::{
    Amount, CancellationToken, DirectoryHost, Engine, EngineConfig, Face, Host, IgnoreFlags,
    InvalidInput, LastLayerState, Metric, Move, PuzzleState, Resource, SessionEvent,
    SessionStatus, SolverConfig, StoreError, SubmitError,
    engine::ConfigError,
    moves::{format_algorithm, parse_algorithm},
    pruning::TableKey,
    store::table_file_name,
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

/// A scratch data directory removed when dropped.
struct TestDir(PathBuf);

impl TestDir {
    fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "megaminx-ll-{name}-{}-{}",
            std::process::id(),
            fastrand::u64(..)
        ));
        Self(path)
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

fn engine(dir: &TestDir, config: EngineConfig) -> Arc<Engine> {
    Engine::new(Arc::new(DirectoryHost(dir.path().to_owned())), config).unwrap()
}

fn scrambled(algorithm: &str) -> PuzzleState {
    PuzzleState::solved().apply_moves(&parse_algorithm(algorithm).unwrap())
}

#[test_log::test]
fn test_solved_state_needs_no_tables() {
    let dir = TestDir::new("solved");
    let engine = engine(&dir, EngineConfig::default());
    let mut session = engine
        .submit(&LastLayerState::solved(), SolverConfig::default())
        .unwrap();
    assert_eq!(session.wait(), SessionStatus::Completed);
    let solutions = session.solutions();
    assert_eq!(solutions.len(), 1);
    assert!(solutions[0].solution.moves.is_empty());
    assert_eq!(solutions[0].solution.move_count, 0);
    assert_eq!(engine.store().stats().builds, 0);
    assert!(engine.list_tables().unwrap().is_empty());
}

#[test_log::test]
fn test_single_u_turn() {
    let dir = TestDir::new("u-turn");
    let engine = engine(&dir, EngineConfig::default());
    let state = LastLayerState::solved()
        .apply_move(Move::new(Face::U, Amount::Clockwise))
        .unwrap();
    let mut session = engine.submit(&state, SolverConfig::default()).unwrap();
    assert_eq!(session.wait(), SessionStatus::Completed);
    let solutions = session.solutions();
    assert_eq!(solutions.len(), 1);
    assert_eq!(format_algorithm(&solutions[0].solution.moves), "U'");
    assert_eq!(solutions[0].solution.move_count, 1);
    assert!((session.progress().fraction - 1.0).abs() < 1e-9);
}

#[test_log::test]
fn test_depth_limit_below_optimal() {
    let dir = TestDir::new("depth-limit");
    let engine = engine(&dir, EngineConfig::default());
    let state = scrambled("R U R' U R U2 R'");

    let mut session = engine.submit_state(state, SolverConfig::default()).unwrap();
    assert_eq!(session.wait(), SessionStatus::Completed);
    let optimal = session.solutions()[0].solution.move_count;

    let limited = |max_depth| SolverConfig {
        limit_depth: true,
        max_depth,
        ..SolverConfig::default()
    };
    let mut session = engine.submit_state(state, limited(optimal - 1)).unwrap();
    assert_eq!(session.wait(), SessionStatus::NoSolutionFound);
    assert!(session.solutions().is_empty());

    let mut session = engine.submit_state(state, limited(optimal)).unwrap();
    assert_eq!(session.wait(), SessionStatus::Completed);
    assert_eq!(session.solutions()[0].solution.move_count, optimal);
}

#[test_log::test]
fn test_invalid_input_is_rejected_up_front() {
    let dir = TestDir::new("invalid");
    let engine = engine(&dir, EngineConfig::default());

    let all_ignored = SolverConfig {
        ignore: IgnoreFlags {
            corner_positions: true,
            edge_positions: true,
            corner_orientations: true,
            edge_orientations: true,
        },
        ..SolverConfig::default()
    };
    assert!(matches!(
        engine.submit(&LastLayerState::solved(), all_ignored),
        Err(SubmitError::InvalidInput(InvalidInput::Config(
            ConfigError::AllAspectsIgnored
        )))
    ));

    let no_solutions = SolverConfig {
        solution_count: 0,
        ..SolverConfig::default()
    };
    assert!(matches!(
        engine.submit(&LastLayerState::solved(), no_solutions),
        Err(SubmitError::InvalidInput(InvalidInput::Config(
            ConfigError::ZeroSolutionCount
        )))
    ));

    assert!(matches!(
        engine.submit_state(scrambled("F"), SolverConfig::default()),
        Err(SubmitError::InvalidInput(InvalidInput::OutsideAllowedFaces(_)))
    ));
    assert!(engine.list_tables().unwrap().is_empty());
}

#[test_log::test]
fn test_ignored_edges_count_as_solved() {
    let dir = TestDir::new("ignore-edges");
    let engine = engine(&dir, EngineConfig::default());
    let config = SolverConfig {
        ignore: IgnoreFlags {
            edge_positions: true,
            edge_orientations: true,
            ..IgnoreFlags::NONE
        },
        solution_count: 3,
        ..SolverConfig::default()
    };
    // Only the edges are out of place
    let state = LastLayerState::new([0, 1, 2, 3, 4], [0; 5], [1, 0, 3, 2, 4], [0; 5]).unwrap();
    let mut session = engine.submit(&state, config).unwrap();
    assert_eq!(session.wait(), SessionStatus::Completed);
    let solutions = session.solutions();
    assert_eq!(solutions.len(), 1);
    assert!(solutions[0].solution.moves.is_empty());
}

#[test_log::test]
fn test_sessions_are_deterministic() {
    let dir = TestDir::new("deterministic");
    let engine = engine(&dir, EngineConfig::default());
    let config = SolverConfig {
        metric: Metric::Ftm,
        solution_count: 4,
        ..SolverConfig::default()
    };
    let state = scrambled("R U2 R' U' R U' R'");
    let run = || {
        let mut session = engine.submit_state(state, config).unwrap();
        assert_eq!(session.wait(), SessionStatus::Completed);
        session.solutions()
    };
    let first = run();
    assert_eq!(first.len(), 4);
    assert_eq!(first, run());
    for solution in &first {
        assert!(
            state
                .apply_moves(&solution.solution.moves)
                .is_solved(IgnoreFlags::NONE)
        );
    }
}

#[test_log::test]
fn test_events_and_cancellation() {
    let dir = TestDir::new("events");
    let engine = engine(&dir, EngineConfig::default());
    let config = SolverConfig {
        solution_count: 1_000_000,
        ..SolverConfig::default()
    };
    let mut session = engine.submit_state(scrambled("R U R'"), config).unwrap();

    let mut fraction = 0.0;
    let mut solutions = 0;
    for event in session.events().clone() {
        match event {
            SessionEvent::Progress(progress) => {
                assert!(progress.fraction >= fraction);
                fraction = progress.fraction;
            }
            SessionEvent::Solution(solution) => {
                assert_eq!(solution.index, solutions);
                solutions += 1;
                if solutions == 3 {
                    session.cancel();
                }
            }
            SessionEvent::Finished(status) => {
                assert_eq!(status, SessionStatus::Cancelled);
                break;
            }
        }
    }
    assert_eq!(session.wait(), SessionStatus::Cancelled);
    assert!(session.solutions().len() >= 3);

    let ranked = session.ranked_solutions();
    for window in ranked.windows(2) {
        assert!(window[0].solution.move_count <= window[1].solution.move_count);
    }
}

#[test_log::test]
fn test_tables_persist_across_engines() {
    let dir = TestDir::new("persist");
    let config = SolverConfig::default();
    {
        let engine = engine(&dir, EngineConfig::default());
        engine
            .prepare_tables(&config, &CancellationToken::new())
            .unwrap();
        assert_eq!(engine.store().stats().builds, 2);
        let tables = engine.list_tables().unwrap();
        assert_eq!(tables.len(), 2);
        assert!(tables.iter().all(|table| table.complete));
    }

    let engine = engine(&dir, EngineConfig::default());
    engine
        .prepare_tables(&config, &CancellationToken::new())
        .unwrap();
    let stats = engine.store().stats();
    assert_eq!(stats.builds, 0);
    assert_eq!(stats.disk_loads, 2);
}

#[test_log::test]
fn test_corrupt_tables_are_rebuilt() {
    let dir = TestDir::new("corrupt");
    let config = SolverConfig::default();
    let [corner_key, _] = config.table_keys();
    let file_name = {
        let engine = engine(&dir, EngineConfig::default());
        engine
            .store()
            .load(corner_key, &CancellationToken::new())
            .unwrap();
        engine.list_tables().unwrap()[0].file_name.clone()
    };
    fs::write(dir.path().join(&file_name), b"MLLT garbage").unwrap();

    let engine = engine(&dir, EngineConfig::default());
    let table = engine
        .store()
        .load(corner_key, &CancellationToken::new())
        .unwrap();
    assert!(table.is_complete());
    assert_eq!(engine.store().stats().builds, 1);
    assert!(fs::metadata(dir.path().join(&file_name)).unwrap().len() > 32);
}

#[test_log::test]
fn test_unreadable_tables_are_removed() {
    let dir = TestDir::new("stale");
    let [corner_key, _] = SolverConfig::default().table_keys();
    engine(&dir, EngineConfig::default())
        .store()
        .load(corner_key, &CancellationToken::new())
        .unwrap();
    let stale = table_file_name(corner_key, 99, true);
    fs::write(dir.path().join(&stale), b"MLLT garbage").unwrap();

    let engine = engine(&dir, EngineConfig::default());
    let table = engine
        .store()
        .load(corner_key, &CancellationToken::new())
        .unwrap();
    assert!(table.is_complete());
    assert_eq!(engine.store().stats().builds, 0);
    assert_eq!(engine.store().stats().disk_loads, 1);
    assert!(!dir.path().join(&stale).exists());
    assert_eq!(engine.list_tables().unwrap().len(), 1);
}

#[test_log::test]
fn test_least_recently_used_table_is_evicted() {
    let dir = TestDir::new("lru");
    let [corner_key, edge_key] = SolverConfig::default().table_keys();
    let engine = engine(
        &dir,
        EngineConfig {
            memory_ceiling_bytes: corner_key.coordinate_count() as u64,
            ..EngineConfig::default()
        },
    );
    let cancellation = CancellationToken::new();
    engine.store().load(edge_key, &cancellation).unwrap();
    engine.store().load(corner_key, &cancellation).unwrap();
    assert!(engine.store().is_loaded(corner_key));
    assert!(!engine.store().is_loaded(edge_key));
    assert_eq!(engine.store().stats().evictions, 1);
    assert!(engine.memory_usage() <= corner_key.coordinate_count() as u64);

    // Reloading comes from disk
    engine.store().load(edge_key, &cancellation).unwrap();
    assert_eq!(engine.store().stats().disk_loads, 1);
}

#[test_log::test]
fn test_table_larger_than_ceiling() {
    let dir = TestDir::new("ceiling");
    let engine = engine(
        &dir,
        EngineConfig {
            memory_ceiling_bytes: 1000,
            ..EngineConfig::default()
        },
    );
    let [corner_key, _] = SolverConfig::default().table_keys();
    assert!(matches!(
        engine.submit_state(scrambled("R U"), SolverConfig::default()),
        Err(SubmitError::ResourceExhausted {
            key,
            resource: Resource::Memory,
            available: 1000,
            ..
        }) if key == corner_key
    ));
    assert!(matches!(
        engine.store().load(corner_key, &CancellationToken::new()),
        Err(StoreError::ResourceExhausted { .. })
    ));
    assert_eq!(engine.store().stats().builds, 0);

    // Solved states need no tables and are still accepted
    let mut session = engine
        .submit(&LastLayerState::solved(), SolverConfig::default())
        .unwrap();
    assert_eq!(session.wait(), SessionStatus::Completed);
}

/// A host that reports less free memory than any table needs.
struct LowMemoryHost(PathBuf);

impl Host for LowMemoryHost {
    fn data_directory(&self) -> PathBuf {
        self.0.clone()
    }

    fn available_memory(&self) -> Option<u64> {
        Some(16)
    }
}

#[test_log::test]
fn test_low_host_memory_is_reported_by_the_session() {
    let dir = TestDir::new("low-memory");
    let engine = Engine::new(
        Arc::new(LowMemoryHost(dir.path().to_owned())),
        EngineConfig::default(),
    )
    .unwrap();
    let mut session = engine
        .submit_state(scrambled("R U"), SolverConfig::default())
        .unwrap();
    let [corner_key, _] = SolverConfig::default().table_keys();
    assert_eq!(
        session.wait(),
        SessionStatus::ResourceExhausted {
            key: corner_key,
            resource: Resource::Memory,
            needed: corner_key.coordinate_count() as u64,
            available: 16,
        }
    );
    assert!(session.solutions().is_empty());
}

#[test_log::test]
fn test_concurrent_loads_are_coalesced() {
    let dir = TestDir::new("coalesce");
    let engine = engine(&dir, EngineConfig::default());
    let [corner_key, _] = SolverConfig::default().table_keys();
    let tables = thread::scope(|scope| {
        let handles = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    engine
                        .store()
                        .load(corner_key, &CancellationToken::new())
                        .unwrap()
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });
    assert!(tables.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(engine.store().stats().builds, 1);
}

#[test_log::test]
fn test_partial_tables_are_used_and_resumed() {
    let dir = TestDir::new("partial");
    let config = SolverConfig::default();
    let [corner_key, edge_key] = config.table_keys();
    let shallow = EngineConfig {
        max_table_depth: 3,
        ..EngineConfig::default()
    };
    let state = scrambled("R U R' U R U2 R'");
    let optimal = {
        let engine = engine(&dir, shallow.clone());
        let mut session = engine.submit_state(state, config).unwrap();
        assert_eq!(session.wait(), SessionStatus::Completed);
        let names = engine
            .list_tables()
            .unwrap()
            .into_iter()
            .map(|table| table.file_name)
            .collect::<Vec<_>>();
        assert!(names.contains(&"ru_qtm_corners-perm-ori_d3_partial.mllt".to_owned()));
        session.solutions()[0].solution.move_count
    };

    // A partial table at the configured depth is used as is
    {
        let engine = engine(&dir, shallow);
        engine
            .prepare_tables(&config, &CancellationToken::new())
            .unwrap();
        assert_eq!(engine.store().stats().builds, 0);
    }

    let engine = engine(&dir, EngineConfig::default());
    let mut session = engine.submit_state(state, config).unwrap();
    assert_eq!(session.wait(), SessionStatus::Completed);
    assert_eq!(session.solutions()[0].solution.move_count, optimal);
    assert_eq!(engine.store().stats().builds, 2);
    let tables = engine.list_tables().unwrap();
    assert_eq!(tables.len(), 2);
    for key in [corner_key, edge_key] {
        assert!(
            tables
                .iter()
                .any(|table| table.key == key && table.complete)
        );
    }
}

#[test_log::test]
fn test_delete_tables() {
    let dir = TestDir::new("delete");
    let engine = engine(&dir, EngineConfig::default());
    let [_, edge_key]: [TableKey; 2] = SolverConfig::default().table_keys();
    engine
        .store()
        .load(edge_key, &CancellationToken::new())
        .unwrap();
    let tables = engine.list_tables().unwrap();
    assert_eq!(tables.len(), 1);
    assert!(matches!(
        engine.delete_table("notes.txt"),
        Err(StoreError::NotATableFile(_))
    ));
    engine.delete_table(&tables[0].file_name).unwrap();
    assert!(engine.list_tables().unwrap().is_empty());
}
