//! nacgen Command-Line Interface
//!
//! # Usage
//!
//! nacgen has four commands:
//!
//! 1. **Run** (`nacgen run <geometry_file> <input_template> [options]`):
//!    computes forces and couplings for every frame and writes the streams
//! 2. **Worker** (`nacgen worker --work_dir DIR --batch_id ID`):
//!    computes one batch of a prepared run; submitted by the SLURM backend
//! 3. **Cancel** (`nacgen cancel --work_dir DIR`):
//!    withdraws the queued and running units of a run
//! 4. **Settings template** (`nacgen init-config [PATH]`):
//!    writes a commented `nacgen.cfg`
//!
//! # Examples
//!
//! ```bash
//! # 10 frames on 3 parallel images, Q-Chem deck in grad.in
//! nacgen run traj.xyz grad.in --parallel_images 3
//!
//! # on SLURM, failing the run if any frame is missing
//! nacgen run traj.xyz grad.in --parallel_images 50 --backend slurm --strict --states 0,1
//! ```
//!
//! # Exit Codes
//!
//! - `0`: every frame is present in every stream
//! - `1`: relaxed run with gaps; streams and `gaps.json` were written
//! - `2`: strict run with gaps (nothing written) or a fatal error

use clap::{Args, Parser, Subcommand};
use nacgen::config::{parse_state_list, Backend, RunConfig, Strictness};
use nacgen::parser::QChemParser;
use nacgen::pipeline::{cancel, execute, prepare, run_worker, scheduler_for, RunError, RunReport};
use nacgen::settings::SettingsManager;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "nacgen",
    version,
    about = "Distributed generation of force and non-adiabatic coupling training data"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute forces and couplings for every frame of a trajectory
    Run(RunArgs),
    /// Compute one batch of a prepared run (invoked by SLURM jobs)
    Worker {
        /// Work directory of the run
        #[arg(long = "work_dir")]
        work_dir: PathBuf,
        /// One-based batch id
        #[arg(long = "batch_id")]
        batch_id: usize,
    },
    /// Cancel the queued and running units of a run
    Cancel {
        /// Work directory of the run
        #[arg(long = "work_dir", default_value = "TMP")]
        work_dir: PathBuf,
    },
    /// Write a settings file with every option at its default
    #[command(name = "init-config")]
    InitConfig {
        /// Where to write the file
        #[arg(default_value = "nacgen.cfg")]
        path: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Trajectory in (extended) XYZ format, Ångström
    geometry_file: PathBuf,
    /// Engine input deck with a $molecule block or a {geometry} placeholder
    input_template: PathBuf,
    /// Number of batches computed in parallel
    #[arg(long = "parallel_images", default_value_t = 1)]
    parallel_images: usize,
    /// Resubmissions of a batch evicted by the cluster
    #[arg(long = "retry_limit")]
    retry_limit: Option<u32>,
    /// Fail the run and write nothing if any frame is missing
    #[arg(long)]
    strict: bool,
    /// States whose forces must be present, e.g. 0,1
    #[arg(long)]
    states: Option<String>,
    /// Directory for checkpoint and batch results
    #[arg(long = "work_dir")]
    work_dir: Option<PathBuf>,
    /// Directory for the output streams
    #[arg(long = "out_dir")]
    out_dir: Option<PathBuf>,
    /// Scheduler backend: local or slurm
    #[arg(long)]
    backend: Option<Backend>,
    /// Wall-clock limit per frame in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

impl RunArgs {
    /// Builds the run configuration: settings files first, flags on top.
    fn into_config(self, settings: &SettingsManager) -> Result<RunConfig, RunError> {
        let mut config = settings.run_config(self.geometry_file, self.input_template);
        config.parallel_images = self.parallel_images;
        if let Some(retry_limit) = self.retry_limit {
            config.cluster.retry_limit = retry_limit;
        }
        if self.strict {
            config.strictness = Strictness::Strict;
        }
        if let Some(states) = &self.states {
            config.states = parse_state_list(states)?;
        }
        if let Some(work_dir) = self.work_dir {
            config.work_dir = work_dir;
        }
        if let Some(out_dir) = self.out_dir {
            config.out_dir = out_dir;
        }
        if let Some(backend) = self.backend {
            config.cluster.backend = backend;
        }
        if let Some(timeout) = self.timeout {
            config.engine.timeout_seconds = timeout;
        }
        Ok(config)
    }
}

fn main() {
    let cli = Cli::parse();

    let settings = match SettingsManager::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading settings: {}", e);
            process::exit(2);
        }
    };

    let level = settings
        .logging()
        .level
        .parse()
        .unwrap_or(log::LevelFilter::Info);
    // RUST_LOG, when set, overrides the level from the settings files
    env_logger::Builder::new()
        .filter_level(level)
        .parse_env(env_logger::Env::default())
        .target(env_logger::Target::Stdout)
        .format_timestamp_millis()
        .init();
    log::debug!("Settings loaded from {}", settings.config_source());

    let code = match cli.command {
        Commands::Run(args) => run(args, &settings),
        Commands::Worker { work_dir, batch_id } => match run_worker(&work_dir, batch_id) {
            Ok(()) => 0,
            Err(e) => {
                log::error!("batch {}: {}", batch_id, e);
                2
            }
        },
        Commands::Cancel { work_dir } => cancel_units(work_dir, &settings),
        Commands::InitConfig { path } => match SettingsManager::create_template(&path) {
            Ok(()) => {
                println!("Settings template written to {}", path.display());
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                2
            }
        },
    };
    process::exit(code);
}

fn run(args: RunArgs, settings: &SettingsManager) -> i32 {
    let outcome = args.into_config(settings).and_then(|config| {
        let parser = QChemParser::new(config.states.clone());
        let plan = prepare(config)?;
        let scheduler = scheduler_for(&plan)?;
        execute(plan, scheduler, &parser)
    });

    match outcome {
        Ok(report) => {
            print_report(&report);
            if report.has_gaps() {
                1
            } else {
                0
            }
        }
        Err(RunError::Incomplete(report)) => {
            print_report(&report);
            eprintln!("Error: strict run is incomplete, no output was written");
            2
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            2
        }
    }
}

fn print_report(report: &RunReport) {
    println!();
    println!("****Run Summary****");
    print!("{}", report);
}

fn cancel_units(work_dir: PathBuf, settings: &SettingsManager) -> i32 {
    match cancel(&work_dir, &settings.settings().cluster) {
        Ok(batches) => {
            println!("Cancelled {} units", batches.len());
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            2
        }
    }
}
