//! Run configuration structures.
//!
//! This module defines everything that parameterizes a dataset generation run:
//!
//! - [`RunConfig`]: the resolved configuration of one run (paths, parallelism, strictness)
//! - [`EngineConfig`]: how the external quantum chemistry engine is invoked
//! - [`ClusterConfig`]: which scheduler backend is used and how it is polled
//! - [`Strictness`]: whether gaps in the dataset fail the run
//!
//! Values come from three layers, later layers overriding earlier ones:
//! built-in defaults, INI settings files (see [`settings`](crate::settings)),
//! and command-line flags. [`RunConfig::validate`] is called once all layers
//! are merged, before any work starts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised for invalid run parameters.
///
/// Configuration errors are fatal and always raised before any unit of work
/// is submitted.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error when reading configuration or template files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// INI parsing error
    #[error("INI parsing error: {0}")]
    IniParse(String),
    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
    /// Input deck template has no geometry slot
    #[error("Input template {0} has neither a {{geometry}} placeholder nor a $molecule block")]
    MissingGeometrySlot(String),
    /// Existing run state in the work directory belongs to a different run
    #[error("Incompatible run state: {0}")]
    IncompatibleRun(String),
}

/// How missing frames affect the outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Strictness {
    /// Any gap fails the run and no output is written
    Strict,
    /// Gaps are skipped and recorded in a gap list
    #[default]
    Relaxed,
}

/// Scheduler backend used to execute batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Backend {
    /// In-process thread pool
    #[default]
    Local,
    /// SLURM batch queue (sbatch/sacct/scancel)
    Slurm,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Backend::Local),
            "slurm" => Ok(Backend::Slurm),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown backend '{}' (expected 'local' or 'slurm')",
                other
            ))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Local => write!(f, "local"),
            Backend::Slurm => write!(f, "slurm"),
        }
    }
}

/// Invocation of the external quantum chemistry engine.
///
/// Arguments may contain the placeholders `{input}` (deck file name),
/// `{stem}` (deck file name without extension), `{nprocs}` and `{mem}`.
/// The defaults call the usual Q-Chem wrapper script:
/// `run_qchem.sh --wait grad.in 1 6Gb`, reading results from `grad.out`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Executable to run
    pub command: String,
    /// Arguments with placeholders
    pub args: Vec<String>,
    /// File name of the rendered input deck inside the scratch directory
    pub deck_name: String,
    /// Output file produced by the engine (placeholders allowed); `None` reads stdout
    pub output: Option<String>,
    /// Wall-clock limit for one frame
    pub timeout_seconds: u64,
    /// Processors per frame calculation
    pub nprocs: u32,
    /// Memory per frame calculation, passed through verbatim
    pub mem: String,
    /// Root directory for per-frame scratch directories (system temp dir if `None`)
    pub scratch_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: "run_qchem.sh".to_string(),
            args: vec![
                "--wait".to_string(),
                "{input}".to_string(),
                "{nprocs}".to_string(),
                "{mem}".to_string(),
            ],
            deck_name: "grad.in".to_string(),
            output: Some("{stem}.out".to_string()),
            timeout_seconds: 24 * 3600,
            nprocs: 1,
            mem: "6Gb".to_string(),
            scratch_dir: None,
        }
    }
}

/// Scheduling and polling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Scheduler backend
    pub backend: Backend,
    /// Resubmissions allowed for an evicted unit
    pub retry_limit: u32,
    /// First polling interval
    pub poll_interval_ms: u64,
    /// Upper bound of the exponential polling backoff
    pub max_poll_interval_ms: u64,
    /// Thread count of the local backend (0 = one per batch)
    pub local_workers: usize,
    /// SLURM partition (`--partition`), empty for the cluster default
    pub slurm_partition: String,
    /// SLURM time limit (`--time`), empty for the partition default
    pub slurm_time: String,
    /// Additional raw `#SBATCH` options
    pub slurm_extra: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Local,
            retry_limit: 2,
            poll_interval_ms: 1000,
            max_poll_interval_ms: 30_000,
            local_workers: 0,
            slurm_partition: String::new(),
            slurm_time: String::new(),
            slurm_extra: Vec::new(),
        }
    }
}

/// Fully resolved configuration of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Trajectory with the geometries to compute
    pub geometry_file: PathBuf,
    /// Input deck template
    pub template_file: PathBuf,
    /// Number of batches the trajectory is split into
    pub parallel_images: usize,
    /// Directory holding the checkpoint, manifest and batch results
    pub work_dir: PathBuf,
    /// Directory receiving the output streams
    pub out_dir: PathBuf,
    /// Gap handling
    pub strictness: Strictness,
    /// States whose force blocks must be present in every output (empty = any)
    pub states: Vec<u32>,
    /// Engine invocation
    pub engine: EngineConfig,
    /// Scheduler settings
    pub cluster: ClusterConfig,
}

impl RunConfig {
    /// Creates a configuration with defaults for everything but the inputs.
    pub fn new(geometry_file: PathBuf, template_file: PathBuf) -> Self {
        Self {
            geometry_file,
            template_file,
            parallel_images: 1,
            work_dir: PathBuf::from("TMP"),
            out_dir: PathBuf::from("."),
            strictness: Strictness::Relaxed,
            states: Vec::new(),
            engine: EngineConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }

    /// Checks parameter ranges that do not require reading any file.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel_images < 1 {
            return Err(ConfigError::InvalidValue(
                "parallel_images must be at least 1".to_string(),
            ));
        }
        if self.engine.command.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "engine command must not be empty".to_string(),
            ));
        }
        if self.engine.deck_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "engine deck_name must not be empty".to_string(),
            ));
        }
        if self.engine.timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "engine timeout_seconds must be positive".to_string(),
            ));
        }
        if self.cluster.max_poll_interval_ms < self.cluster.poll_interval_ms {
            return Err(ConfigError::InvalidValue(format!(
                "max_poll_interval_ms ({}) is smaller than poll_interval_ms ({})",
                self.cluster.max_poll_interval_ms, self.cluster.poll_interval_ms
            )));
        }
        if self.work_dir == self.out_dir {
            return Err(ConfigError::InvalidValue(
                "work_dir and out_dir must differ".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses a comma-separated list of state numbers, e.g. `0,1,2`.
pub fn parse_state_list(s: &str) -> Result<Vec<u32>, ConfigError> {
    let mut states: Vec<u32> = s
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse()
                .map_err(|_| ConfigError::InvalidValue(format!("invalid state number '{}'", p)))
        })
        .collect::<Result<_, _>>()?;
    states.sort_unstable();
    states.dedup();
    Ok(states)
}
