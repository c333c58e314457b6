//! End-to-end run orchestration.
//!
//! A run is split into two phases:
//!
//! 1. [`prepare`] performs every step that can fail fatally: loading the
//!    trajectory and the deck template, partitioning, and opening (or
//!    resuming) the checkpoint. Nothing is submitted if any of them fails.
//! 2. [`execute`] scatters the unfinished batches over a scheduler, gathers
//!    their outputs, parses every frame, assembles the streams and writes
//!    them according to the run's [`Strictness`].
//!
//! Failures below the run level never abort it. An engine failure loses one
//! frame and a cluster failure loses one batch. Both end up as
//! [`FrameFailure`] entries in the [`RunReport`].
//!
//! [`run_worker`] is the entry point of a SLURM unit: it rebuilds its batch
//! from the run manifest and writes the batch result file.

use crate::assemble::{assemble, Dataset};
use crate::checkpoint::{input_digest, Checkpoint, RunManifest};
use crate::cluster::{
    BatchRunner, ClusterAdapter, ClusterError, ClusterFailure, JobId, JobSpec, LocalScheduler,
    Scheduler, SchedulerError, SlurmScheduler, UnitStatus,
};
use crate::config::{Backend, ClusterConfig, ConfigError, RunConfig, Strictness};
use crate::deck::DeckTemplate;
use crate::driver::{BatchOutput, JobDriver};
use crate::engine::{CommandEngine, Engine, EngineFailure};
use crate::geometry::Frame;
use crate::io::{load_trajectory, write_json_atomic, FormatError};
use crate::naming;
use crate::parser::{JobResult, ResultParser};
use crate::partition::{partition, Batch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Run-level errors.
#[derive(Error, Debug)]
pub enum RunError {
    /// The trajectory is malformed
    #[error("Invalid trajectory: {0}")]
    Format(#[from] FormatError),
    /// Invalid parameters, template or incompatible run state
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Reading or writing run files failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The scheduler could not be set up
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    /// A strict run has gaps; no output was written
    #[error("Run incomplete: {} of {} frames missing", .0.missing_frames.len(), .0.total_frames)]
    Incomplete(Box<RunReport>),
}

/// Why a frame has no result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The engine calculation failed
    Engine(EngineFailure),
    /// The frame's batch failed on the cluster
    Cluster(ClusterFailure),
    /// The engine output lacks required data
    Parse(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Engine(e) => write!(f, "engine: {}", e),
            FailureReason::Cluster(e) => write!(f, "cluster: {}", e),
            FailureReason::Parse(e) => write!(f, "parse: {}", e),
        }
    }
}

/// A frame that produced no result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameFailure {
    /// Zero-based frame index
    pub frame_index: usize,
    /// Batch the frame belongs to
    pub batch_id: usize,
    /// Cause
    pub reason: FailureReason,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Frames in the trajectory
    pub total_frames: usize,
    /// Frames with a parsed result
    pub frames_succeeded: usize,
    /// Frames with no result at all
    pub missing_frames: Vec<usize>,
    /// Why frames failed, in frame order
    pub failures: Vec<FrameFailure>,
    /// Missing frames per stream file, only for streams with gaps
    pub stream_gaps: BTreeMap<String, Vec<usize>>,
    /// Stream files written
    pub streams_written: Vec<PathBuf>,
    /// Gap list file, written by relaxed runs with gaps
    pub gap_file: Option<PathBuf>,
}

impl RunReport {
    /// Returns true if any frame is missing from any stream.
    pub fn has_gaps(&self) -> bool {
        !self.missing_frames.is_empty() || !self.stream_gaps.is_empty()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Frames: {} total, {} succeeded, {} missing",
            self.total_frames,
            self.frames_succeeded,
            self.missing_frames.len()
        )?;
        for failure in &self.failures {
            writeln!(
                f,
                "  frame {} (batch {}): {}",
                failure.frame_index, failure.batch_id, failure.reason
            )?;
        }
        for (stream, gaps) in &self.stream_gaps {
            writeln!(f, "  {} lacks {} frames", stream, gaps.len())?;
        }
        if self.streams_written.is_empty() {
            writeln!(f, "No output streams written")?;
        } else {
            let names: Vec<String> = self
                .streams_written
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            writeln!(f, "Streams written: {}", names.join(", "))?;
        }
        if let Some(gap_file) = &self.gap_file {
            writeln!(f, "Gap list: {}", gap_file.display())?;
        }
        Ok(())
    }
}

/// Contents of the gap list file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapList {
    /// Frames in the trajectory
    pub frame_count: usize,
    /// Frames with no result at all
    pub missing_frames: Vec<usize>,
    /// Missing frames per stream file
    pub streams: BTreeMap<String, Vec<usize>>,
    /// Failure causes
    pub failures: Vec<FrameFailure>,
}

/// A validated run, ready to execute.
pub struct RunPlan {
    /// Resolved configuration with absolute paths
    pub config: RunConfig,
    /// Trajectory frames
    pub frames: Vec<Frame>,
    /// Batch layout
    pub batches: Vec<Batch>,
    /// Input deck template
    pub template: DeckTemplate,
    /// Run checkpoint, possibly resumed
    pub checkpoint: Checkpoint,
}

/// Performs all fatal checks and sets up the work directory.
///
/// # Errors
///
/// Returns [`RunError::Format`] for a malformed trajectory and
/// [`RunError::Config`] for invalid parameters, a template without a
/// geometry slot or a work directory that belongs to a different run.
pub fn prepare(config: RunConfig) -> Result<RunPlan, RunError> {
    let mut config = config;
    config.validate()?;

    let frames = load_trajectory(&config.geometry_file)?;
    let template = DeckTemplate::load(&config.template_file)?;
    let batches = partition(&frames, config.parallel_images)?;

    fs::create_dir_all(&config.work_dir)?;
    config.work_dir = config.work_dir.canonicalize()?;
    // a path that does not exist yet cannot name the work directory
    if config.out_dir.exists() && config.out_dir.canonicalize()? == config.work_dir {
        return Err(ConfigError::InvalidValue(format!(
            "out_dir {} is the work directory",
            config.out_dir.display()
        ))
        .into());
    }
    config.geometry_file = config.geometry_file.canonicalize()?;
    config.template_file = config.template_file.canonicalize()?;

    let digest = input_digest(
        &fs::read(&config.geometry_file)?,
        &fs::read(&config.template_file)?,
        &config.engine,
    );
    let checkpoint = Checkpoint::open(
        &naming::checkpoint(&config.work_dir),
        frames.len(),
        config.parallel_images,
        &batches,
        &digest,
    )?;
    RunManifest {
        geometry_file: config.geometry_file.clone(),
        template_file: config.template_file.clone(),
        parallelism: config.parallel_images,
        backend: config.cluster.backend,
        engine: config.engine.clone(),
    }
    .save(&naming::manifest(&config.work_dir))?;

    log::info!(
        "Prepared run: {} frames in {} batches, work directory {}",
        frames.len(),
        batches.len(),
        config.work_dir.display()
    );
    Ok(RunPlan {
        config,
        frames,
        batches,
        template,
        checkpoint,
    })
}

/// Computes one batch and writes its result file.
fn run_batch(driver: &JobDriver, batch: &Batch, frames: &[Frame], result_path: &Path) -> std::io::Result<BatchOutput> {
    let output = driver.run(batch, frames);
    write_json_atomic(result_path, &output)?;
    Ok(output)
}

/// Builds the in-process scheduler for a plan.
///
/// Uses one worker thread per batch unless `local_workers` is set.
pub fn local_scheduler(plan: &RunPlan, engine: Arc<dyn Engine>) -> Result<LocalScheduler, RunError> {
    let driver = JobDriver::new(engine, plan.template.clone());
    let frames = Arc::new(plan.frames.clone());
    let batches: Arc<BTreeMap<usize, Batch>> = Arc::new(
        plan.batches
            .iter()
            .map(|b| (b.batch_id, b.clone()))
            .collect(),
    );
    let runner: BatchRunner = Arc::new(move |spec: &JobSpec| {
        let batch = batches
            .get(&spec.batch_id)
            .ok_or_else(|| format!("unknown batch {}", spec.batch_id))?;
        run_batch(&driver, batch, &frames, &spec.result_path)
            .map(|_| ())
            .map_err(|e| format!("failed to write {}: {}", spec.result_path.display(), e))
    });

    let workers = match plan.config.cluster.local_workers {
        0 => plan.batches.len(),
        n => n,
    };
    Ok(LocalScheduler::new(workers, runner)?)
}

/// Builds the scheduler selected by the plan's backend.
pub fn scheduler_for(plan: &RunPlan) -> Result<Box<dyn Scheduler>, RunError> {
    match plan.config.cluster.backend {
        Backend::Local => {
            let engine: Arc<dyn Engine> = Arc::new(CommandEngine::new(plan.config.engine.clone()));
            Ok(Box::new(local_scheduler(plan, engine)?))
        }
        Backend::Slurm => Ok(Box::new(SlurmScheduler::new(
            &plan.config.cluster,
            plan.config.engine.nprocs,
        )?)),
    }
}

/// Runs every unfinished batch of `plan` and writes the dataset.
///
/// Batches with a readable result from an earlier run are not submitted
/// again. Returns the report of a complete run or of a relaxed run with
/// gaps; a strict run with gaps yields [`RunError::Incomplete`] and writes
/// nothing.
pub fn execute<S: Scheduler>(
    plan: RunPlan,
    scheduler: S,
    parser: &dyn ResultParser,
) -> Result<RunReport, RunError> {
    let RunPlan {
        config,
        frames,
        batches,
        mut checkpoint,
        ..
    } = plan;
    let start = Instant::now();

    let mut outputs: BTreeMap<usize, Result<BatchOutput, ClusterError>> = BTreeMap::new();
    let mut specs = Vec::new();
    for batch in &batches {
        match checkpoint.completed_output(batch.batch_id) {
            Some(output) => {
                log::info!("batch {}: reusing stored result", batch.batch_id);
                outputs.insert(batch.batch_id, Ok(output));
            }
            None => specs.push(JobSpec::new(&config.work_dir, batch.batch_id)),
        }
    }

    if !specs.is_empty() {
        log::info!("Submitting {} of {} batches", specs.len(), batches.len());
        let adapter = ClusterAdapter::new(scheduler, &config.cluster);
        let mut handle = adapter.submit(specs);
        outputs.extend(adapter.collect(&mut handle, &mut checkpoint));
    }

    let (results, failures) = gather(&batches, &frames, outputs, parser);
    let dataset = assemble(results, frames.len());
    let report = finish(&config, &frames, &dataset, failures)?;
    log::info!(
        "Run finished in {:.1} s: {} of {} frames succeeded",
        start.elapsed().as_secs_f64(),
        report.frames_succeeded,
        report.total_frames
    );

    if report.has_gaps() && config.strictness == Strictness::Strict {
        return Err(RunError::Incomplete(Box::new(report)));
    }
    Ok(report)
}

/// Parses batch outputs into results, collecting per-frame failures.
fn gather(
    batches: &[Batch],
    frames: &[Frame],
    outputs: BTreeMap<usize, Result<BatchOutput, ClusterError>>,
    parser: &dyn ResultParser,
) -> (Vec<JobResult>, Vec<FrameFailure>) {
    let mut results = Vec::with_capacity(frames.len());
    let mut failures = Vec::new();

    for batch in batches {
        let batch_id = batch.batch_id;
        match outputs.get(&batch_id) {
            Some(Ok(output)) => {
                for entry in &output.outputs {
                    match entry {
                        Ok(raw) => {
                            let Some(frame) = frames.get(raw.frame_index) else {
                                log::warn!(
                                    "batch {}: output for unknown frame {} ignored",
                                    batch_id,
                                    raw.frame_index
                                );
                                continue;
                            };
                            match parser.parse(raw, frame, batch_id) {
                                Ok(result) => results.push(result),
                                Err(e) => {
                                    log::warn!("batch {}: {}", batch_id, e);
                                    failures.push(FrameFailure {
                                        frame_index: e.frame_index,
                                        batch_id,
                                        reason: FailureReason::Parse(e.reason),
                                    });
                                }
                            }
                        }
                        Err(e) => failures.push(FrameFailure {
                            frame_index: e.frame_index,
                            batch_id,
                            reason: FailureReason::Engine(e.cause.clone()),
                        }),
                    }
                }
            }
            Some(Err(e)) => {
                for &frame_index in &batch.frame_indices {
                    failures.push(FrameFailure {
                        frame_index,
                        batch_id,
                        reason: FailureReason::Cluster(e.kind.clone()),
                    });
                }
            }
            None => {
                for &frame_index in &batch.frame_indices {
                    failures.push(FrameFailure {
                        frame_index,
                        batch_id,
                        reason: FailureReason::Cluster(ClusterFailure::MissingResult(
                            "batch was never collected".to_string(),
                        )),
                    });
                }
            }
        }
    }

    failures.sort_by_key(|f| f.frame_index);
    (results, failures)
}

/// Builds the report and writes outputs according to strictness.
fn finish(
    config: &RunConfig,
    frames: &[Frame],
    dataset: &Dataset,
    failures: Vec<FrameFailure>,
) -> Result<RunReport, RunError> {
    let stream_gaps: BTreeMap<String, Vec<usize>> = dataset
        .incomplete_streams()
        .into_iter()
        .map(|(key, gaps)| (key.file_name(), gaps.to_vec()))
        .collect();
    let mut report = RunReport {
        total_frames: frames.len(),
        frames_succeeded: frames.len() - dataset.missing_frames.len(),
        missing_frames: dataset.missing_frames.clone(),
        failures,
        stream_gaps,
        streams_written: Vec::new(),
        gap_file: None,
    };

    let complete = dataset.is_complete();
    let gap_path = config.out_dir.join(naming::GAPS_FILE);
    if !complete && config.strictness == Strictness::Strict {
        remove_stale_outputs(&config.out_dir, &[])?;
        log::error!(
            "Strict run has gaps in frames {:?}; no output written",
            report.missing_frames
        );
        return Ok(report);
    }

    fs::create_dir_all(&config.out_dir)?;
    report.streams_written = dataset.write(frames, &config.out_dir)?;
    remove_stale_outputs(&config.out_dir, &report.streams_written)?;

    if !complete {
        let gaps = GapList {
            frame_count: dataset.frame_count,
            missing_frames: report.missing_frames.clone(),
            streams: dataset
                .gaps
                .iter()
                .map(|(key, gaps)| (key.file_name(), gaps.clone()))
                .collect(),
            failures: report.failures.clone(),
        };
        write_json_atomic(&gap_path, &gaps)?;
        log::warn!(
            "{} frames missing, gap list written to {}",
            report.missing_frames.len(),
            gap_path.display()
        );
        report.gap_file = Some(gap_path);
    }
    Ok(report)
}

/// Deletes stream files and the gap list of earlier runs from `out_dir`,
/// except the streams in `keep`.
fn remove_stale_outputs(out_dir: &Path, keep: &[PathBuf]) -> std::io::Result<()> {
    let entries = match fs::read_dir(out_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let path = entry?.path();
        let stale = match path.file_name().and_then(|n| n.to_str()) {
            Some(naming::GAPS_FILE) => true,
            Some(name) => naming::is_stream_file(name) && !keep.contains(&path),
            None => false,
        };
        if stale && path.is_file() {
            log::info!("Removing output of an earlier run: {}", path.display());
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Computes one batch of a prepared run (SLURM worker entry point).
pub fn run_worker(work_dir: &Path, batch_id: usize) -> Result<(), RunError> {
    let manifest = RunManifest::load(&naming::manifest(work_dir))?;
    let frames = load_trajectory(&manifest.geometry_file)?;
    let template = DeckTemplate::load(&manifest.template_file)?;
    let batches = partition(&frames, manifest.parallelism)?;
    let batch = batches
        .iter()
        .find(|b| b.batch_id == batch_id)
        .ok_or_else(|| {
            ConfigError::InvalidValue(format!(
                "batch {} does not exist, the run has {} batches",
                batch_id,
                batches.len()
            ))
        })?;

    let engine: Arc<dyn Engine> = Arc::new(CommandEngine::new(manifest.engine));
    let driver = JobDriver::new(engine, template);
    let result_path = naming::batch_result(work_dir, batch_id);
    let output = run_batch(&driver, batch, &frames, &result_path)?;
    log::info!(
        "batch {}: result written to {} ({} failed frames)",
        batch_id,
        result_path.display(),
        output.failure_count()
    );
    Ok(())
}

/// Withdraws every unit of a run that may still be queued or running.
///
/// `scheduler` is the backend the units were submitted to, or `None` if no
/// scheduler outside this process holds them. Returns the ids of the
/// batches whose units were cancelled. Jobs of the local backend died with
/// the process that ran them and are only marked.
pub fn cancel_run(work_dir: &Path, scheduler: Option<&dyn Scheduler>) -> Result<Vec<usize>, RunError> {
    let mut checkpoint = Checkpoint::load(&naming::checkpoint(work_dir))?;
    let mut cancelled = Vec::new();
    for (batch_id, job) in checkpoint.active_jobs() {
        if let Some(scheduler) = scheduler.filter(|_| !job.starts_with("local-")) {
            if let Err(e) = scheduler.cancel(&JobId(job.clone())) {
                log::warn!("batch {}: failed to cancel job {}: {}", batch_id, job, e);
                continue;
            }
        }
        checkpoint.update(batch_id, |r| r.status = UnitStatus::Failed)?;
        log::info!("batch {}: cancelled job {}", batch_id, job);
        cancelled.push(batch_id);
    }
    Ok(cancelled)
}

/// Cancels a run on the backend recorded in its manifest.
pub fn cancel(work_dir: &Path, cluster: &ClusterConfig) -> Result<Vec<usize>, RunError> {
    let manifest = RunManifest::load(&naming::manifest(work_dir))?;
    match manifest.backend {
        Backend::Local => cancel_run(work_dir, None),
        Backend::Slurm => {
            let scheduler = SlurmScheduler::new(cluster, manifest.engine.nprocs)?;
            cancel_run(work_dir, Some(&scheduler as &dyn Scheduler))
        }
    }
}
