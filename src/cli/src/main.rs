#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]

mod config;

use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{bail, eyre};
use config::{CliConfig, CliHost};
use env_logger::TimestampPrecision;
use itertools::Itertools;
use log::{LevelFilter, info};
use megaminx_ll::{
    AllowedFaceSet, CancellationToken, Engine, IgnoreFlags, LastLayerState, Metric, PuzzleState,
    SessionEvent, SessionStatus, SolverConfig, moves::parse_algorithm,
};
use std::{io::Write, path::PathBuf, sync::Arc, time::UNIX_EPOCH};

/// Finds short last layer solutions for the Megaminx
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file in TOML format; defaults to `megaminx-ll/config.toml`
    /// in the user configuration directory
    #[arg(long, short = 'c', value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (can be repeated)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve a last layer state
    Solve {
        /// The state as `CP/CO/EP/EO`, e.g. `10234/00000/01234/00000`
        #[arg(long, conflicts_with = "alg", required_unless_present = "alg")]
        state: Option<LastLayerState>,
        /// Solve the state this algorithm produces from solved, e.g. `R U R'`
        #[arg(long)]
        alg: Option<String>,
        #[command(flatten)]
        solver: SolverArgs,
        /// Stop after this many solutions
        #[arg(long, short = 'n')]
        solutions: Option<usize>,
        /// Give up once solutions would need more than this many moves
        #[arg(long)]
        max_depth: Option<u32>,
    },
    /// Manage stored pruning tables
    Tables {
        #[command(subcommand)]
        command: TablesCommand,
    },
}

#[derive(Subcommand)]
enum TablesCommand {
    /// List stored tables
    List,
    /// Delete a stored table by file name
    Delete { file_name: String },
    /// Build the tables a configuration needs ahead of time
    Build {
        #[command(flatten)]
        solver: SolverArgs,
    },
    /// Show memory and disk usage
    Usage,
}

#[derive(Args)]
struct SolverArgs {
    /// Faces that may be turned: RU, RUF, RUL, RUBR, RUFL, RUFBR, or RUFLBR
    #[arg(long, short = 'f')]
    faces: Option<AllowedFaceSet>,
    /// FTM or QTM
    #[arg(long, short = 'm')]
    metric: Option<Metric>,
    /// Last layer aspects to ignore, e.g. `co,eo`
    #[arg(long)]
    ignore: Option<IgnoreFlags>,
}

impl SolverArgs {
    fn apply(&self, config: &mut SolverConfig) {
        if let Some(faces) = self.faces {
            config.allowed_faces = faces;
        }
        if let Some(metric) = self.metric {
            config.metric = metric;
        }
        if let Some(ignore) = self.ignore {
            config.ignore = ignore;
        }
    }
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        })
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let config = CliConfig::load(cli.config.as_deref())?;
    let engine = Engine::new(Arc::new(CliHost::new(&config)?), config.engine.clone())?;

    match cli.command {
        Commands::Solve {
            state,
            alg,
            solver,
            solutions,
            max_depth,
        } => {
            let mut solver_config = config.solver;
            solver.apply(&mut solver_config);
            if let Some(solutions) = solutions {
                solver_config.solution_count = solutions;
            }
            if let Some(max_depth) = max_depth {
                solver_config.limit_depth = true;
                solver_config.max_depth = max_depth;
            }
            let state = match (state, alg) {
                (Some(state), _) => PuzzleState::from(state),
                (None, Some(alg)) => PuzzleState::solved().apply_moves(&parse_algorithm(&alg)?),
                (None, None) => bail!("Either --state or --alg is required"),
            };
            solve(&engine, state, solver_config)?;
        }
        Commands::Tables { command } => match command {
            TablesCommand::List => {
                let tables = engine.list_tables()?;
                if tables.is_empty() {
                    println!("No tables in {}", engine.store().directory().display());
                }
                for table in tables {
                    let modified = table
                        .modified
                        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
                        .map_or_else(|| "?".to_owned(), |since| since.as_secs().to_string());
                    println!(
                        "{:<48} {:>12} bytes  modified {modified}  {}",
                        table.file_name,
                        table.size_bytes,
                        table.display_name()
                    );
                }
            }
            TablesCommand::Delete { file_name } => engine.delete_table(&file_name)?,
            TablesCommand::Build { solver } => {
                let mut solver_config = config.solver;
                solver.apply(&mut solver_config);
                solver_config.validate()?;
                let tables = engine.prepare_tables(&solver_config, &CancellationToken::new())?;
                for table in tables {
                    println!(
                        "{} to depth {} ({})",
                        table.key(),
                        table.depth(),
                        if table.is_complete() { "complete" } else { "partial" }
                    );
                }
            }
            TablesCommand::Usage => {
                println!("Memory: {} bytes", engine.memory_usage());
                println!("Disk:   {} bytes", engine.store().disk_usage()?);
            }
        },
    }

    Ok(())
}

fn solve(engine: &Arc<Engine>, state: PuzzleState, config: SolverConfig) -> color_eyre::Result<()> {
    info!(
        "Solving with {} in {}, ignoring {}",
        config.allowed_faces, config.metric, config.ignore
    );
    let mut session = engine.submit_state(state, config)?;

    let mut stderr = std::io::stderr();
    for event in session.events().clone() {
        match event {
            SessionEvent::Progress(progress) => {
                write!(
                    stderr,
                    "\rthreshold {:>3}  {:>5.1}%  {} nodes",
                    progress.threshold,
                    progress.fraction * 100.0,
                    progress.nodes_visited
                )?;
            }
            SessionEvent::Solution(solution) => {
                writeln!(stderr, "\r{}", solution.solution)?;
            }
            SessionEvent::Finished(_) => break,
        }
    }

    match session.wait() {
        SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Running => {}
        SessionStatus::NoSolutionFound => bail!("No solution found"),
        SessionStatus::Failed(reason) => return Err(eyre!("Solving failed: {reason}")),
        status @ SessionStatus::ResourceExhausted { .. } => bail!("Solving failed: {status}"),
    }

    println!(
        "{}",
        session
            .ranked_solutions()
            .iter()
            .map(|scored| format!("{} [{:.2}]", scored.solution, scored.score))
            .join("\n")
    );
    Ok(())
}
