//! Cluster adapter: submission, tracking and collection of batch units.
//!
//! Every batch becomes one scheduling unit. The adapter talks to the batch
//! system only through the [`Scheduler`] trait, which has three operations:
//! submit a unit, poll its status, and cancel it. On top of that it provides:
//!
//! - **Backoff polling**: the polling interval doubles while nothing changes
//!   and is reset to its initial value after any progress.
//! - **Eviction retries**: a unit the cluster evicted (node failure,
//!   preemption) is resubmitted up to `retry_limit` times.
//! - **Failure isolation**: a unit that fails, exhausts its retries or
//!   leaves no readable result yields a [`ClusterError`] for its batch only.
//! - **Checkpointing**: every status transition is written to the run
//!   [`Checkpoint`] so an interrupted run can resume.
//!
//! Two schedulers are provided. [`LocalScheduler`] executes units on an
//! in-process `rayon` thread pool. [`SlurmScheduler`] shells out to
//! `sbatch`, `sacct`/`squeue` and `scancel`.

use crate::checkpoint::Checkpoint;
use crate::config::ClusterConfig;
use crate::driver::BatchOutput;
use crate::naming;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Consecutive failed status queries tolerated before a unit is failed.
pub const MAX_POLL_ERRORS: u32 = 5;

/// Description of one scheduling unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Batch computed by the unit
    pub batch_id: usize,
    /// Submission attempt, starting at 0
    pub attempt: u32,
    /// Run work directory
    pub work_dir: PathBuf,
    /// Where the unit writes its [`BatchOutput`]
    pub result_path: PathBuf,
}

impl JobSpec {
    /// Creates the first-attempt spec of a batch in `work_dir`.
    pub fn new(work_dir: &Path, batch_id: usize) -> Self {
        Self {
            batch_id,
            attempt: 0,
            work_dir: work_dir.to_path_buf(),
            result_path: naming::batch_result(work_dir, batch_id),
        }
    }
}

/// Scheduler-assigned identifier of a submitted unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a scheduling unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    /// Queued, not yet started
    Pending,
    /// Executing
    Running,
    /// Finished normally; its result file should exist
    Completed,
    /// Finished abnormally
    Failed,
    /// Removed by the cluster for reasons unrelated to the job
    Evicted,
}

impl UnitStatus {
    /// Returns true once the scheduler is no longer working on the unit.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            UnitStatus::Completed | UnitStatus::Failed | UnitStatus::Evicted
        )
    }
}

/// Errors reported by a [`Scheduler`] implementation.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// I/O error while preparing or running a scheduler command
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A scheduler command exited unsuccessfully or printed garbage
    #[error("{program} failed: {message}")]
    Command {
        /// Command name (`sbatch`, `sacct`, ...)
        program: String,
        /// stderr or a description of the bad output
        message: String,
    },
    /// The scheduler has no record of the job
    #[error("unknown job {0}")]
    UnknownJob(String),
    /// The local worker pool could not be created
    #[error("failed to build worker pool: {0}")]
    Pool(String),
}

/// Capability of a batch system to run units of work.
pub trait Scheduler: Send + Sync {
    /// Submits a unit and returns its identifier.
    fn submit(&self, spec: &JobSpec) -> Result<JobId, SchedulerError>;
    /// Queries the current status of a unit.
    fn poll(&self, job: &JobId) -> Result<UnitStatus, SchedulerError>;
    /// Withdraws a unit that has not finished.
    fn cancel(&self, job: &JobId) -> Result<(), SchedulerError>;
}

impl<S: Scheduler + ?Sized> Scheduler for Box<S> {
    fn submit(&self, spec: &JobSpec) -> Result<JobId, SchedulerError> {
        (**self).submit(spec)
    }

    fn poll(&self, job: &JobId) -> Result<UnitStatus, SchedulerError> {
        (**self).poll(job)
    }

    fn cancel(&self, job: &JobId) -> Result<(), SchedulerError> {
        (**self).cancel(job)
    }
}

/// Failure of one batch at the cluster level.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("batch {batch_id}: {kind}")]
pub struct ClusterError {
    /// Affected batch
    pub batch_id: usize,
    /// What went wrong
    pub kind: ClusterFailure,
}

/// Reason a batch produced no result.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterFailure {
    /// The unit could not be submitted
    #[error("submission failed: {0}")]
    Submit(String),
    /// The unit finished abnormally
    #[error("unit failed: {0}")]
    Failed(String),
    /// The unit was evicted more often than the retry limit allows
    #[error("evicted {attempts} times, retry limit exhausted")]
    RetriesExhausted {
        /// Number of evictions observed
        attempts: u32,
    },
    /// The unit completed but its result file is absent or unreadable
    #[error("result file unusable: {0}")]
    MissingResult(String),
    /// The run was cancelled before the unit finished
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug)]
struct Unit {
    spec: JobSpec,
    job: Option<JobId>,
    status: UnitStatus,
    retries: u32,
    poll_errors: u32,
    failure: Option<ClusterFailure>,
    settled: bool,
}

/// Tracks the units of one submission.
#[derive(Debug, Default)]
pub struct Handle {
    units: BTreeMap<usize, Unit>,
}

impl Handle {
    /// Batch ids tracked by this handle, ascending.
    pub fn batch_ids(&self) -> Vec<usize> {
        self.units.keys().copied().collect()
    }

    /// Number of tracked units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Returns true if no unit is tracked.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Last known status of a batch's unit.
    pub fn status(&self, batch_id: usize) -> Option<UnitStatus> {
        self.units.get(&batch_id).map(|u| u.status)
    }

    /// Current scheduler id of a batch's unit.
    pub fn job_id(&self, batch_id: usize) -> Option<&JobId> {
        self.units.get(&batch_id).and_then(|u| u.job.as_ref())
    }

    /// Returns true when every unit has a final outcome.
    pub fn is_settled(&self) -> bool {
        self.units.values().all(|u| u.settled)
    }

    fn statuses(&self) -> BTreeMap<usize, UnitStatus> {
        self.units.iter().map(|(&id, u)| (id, u.status)).collect()
    }
}

/// Exponential polling interval.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    fn next(&mut self) -> Duration {
        let wait = self.current;
        self.current = (self.current * 2).min(self.max);
        wait
    }

    fn reset(&mut self) -> Duration {
        self.current = self.initial;
        self.next()
    }
}

/// Submits, tracks and collects batch units on a [`Scheduler`].
pub struct ClusterAdapter<S: Scheduler> {
    scheduler: S,
    retry_limit: u32,
    poll_interval: Duration,
    max_poll_interval: Duration,
    cancelled: Arc<AtomicBool>,
}

impl<S: Scheduler> ClusterAdapter<S> {
    /// Creates an adapter with the retry and polling settings of `config`.
    pub fn new(scheduler: S, config: &ClusterConfig) -> Self {
        Self {
            scheduler,
            retry_limit: config.retry_limit,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_poll_interval: Duration::from_millis(config.max_poll_interval_ms),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Underlying scheduler
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Flag that, once set, makes [`collect`](Self::collect) cancel all
    /// unfinished units and return.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Submits one unit per spec.
    ///
    /// A submission error fails that batch only; the other units are still
    /// submitted.
    pub fn submit(&self, specs: Vec<JobSpec>) -> Handle {
        let mut handle = Handle::default();
        for spec in specs {
            let batch_id = spec.batch_id;
            let mut unit = Unit {
                spec,
                job: None,
                status: UnitStatus::Pending,
                retries: 0,
                poll_errors: 0,
                failure: None,
                settled: false,
            };
            match self.scheduler.submit(&unit.spec) {
                Ok(job) => {
                    log::info!("batch {}: submitted as job {}", batch_id, job);
                    unit.job = Some(job);
                }
                Err(e) => {
                    log::error!("batch {}: submission failed: {}", batch_id, e);
                    unit.status = UnitStatus::Failed;
                    unit.failure = Some(ClusterFailure::Submit(e.to_string()));
                }
            }
            handle.units.insert(batch_id, unit);
        }
        handle
    }

    /// Refreshes the status of every unfinished unit.
    ///
    /// Query errors are tolerated up to [`MAX_POLL_ERRORS`] consecutive times
    /// per unit, after which the unit is marked failed.
    pub fn poll(&self, handle: &mut Handle) -> BTreeMap<usize, UnitStatus> {
        for (batch_id, unit) in handle.units.iter_mut() {
            if unit.settled || unit.status.is_final() {
                continue;
            }
            let Some(job) = &unit.job else { continue };
            match self.scheduler.poll(job) {
                Ok(status) => {
                    unit.poll_errors = 0;
                    if status != unit.status {
                        log::debug!("batch {}: job {} is {:?}", batch_id, job, status);
                    }
                    unit.status = status;
                }
                Err(e) => {
                    unit.poll_errors += 1;
                    log::warn!(
                        "batch {}: status query for job {} failed ({}/{}): {}",
                        batch_id,
                        job,
                        unit.poll_errors,
                        MAX_POLL_ERRORS,
                        e
                    );
                    if unit.poll_errors >= MAX_POLL_ERRORS {
                        unit.status = UnitStatus::Failed;
                        unit.failure = Some(ClusterFailure::Failed(format!(
                            "scheduler lost track of job {}: {}",
                            job, e
                        )));
                    }
                }
            }
        }
        handle.statuses()
    }

    /// Waits until every unit has an outcome and returns the outcomes.
    ///
    /// Evicted units are resubmitted while their retry budget lasts. Every
    /// status change is recorded in `checkpoint`; a failed checkpoint write
    /// is logged and does not stop collection.
    pub fn collect(
        &self,
        handle: &mut Handle,
        checkpoint: &mut Checkpoint,
    ) -> BTreeMap<usize, Result<BatchOutput, ClusterError>> {
        let mut results = BTreeMap::new();
        for (&batch_id, unit) in &handle.units {
            record(checkpoint, batch_id, unit, None);
        }

        let mut backoff = Backoff::new(self.poll_interval, self.max_poll_interval);
        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                log::warn!("cancellation requested, withdrawing unfinished units");
                self.cancel(handle);
                for (&batch_id, unit) in handle.units.iter_mut() {
                    if !unit.settled {
                        unit.settled = true;
                        results.insert(
                            batch_id,
                            Err(ClusterError {
                                batch_id,
                                kind: ClusterFailure::Cancelled,
                            }),
                        );
                    }
                }
                break;
            }

            let before = handle.statuses();
            self.poll(handle);

            let mut progressed = false;
            for (&batch_id, unit) in handle.units.iter_mut() {
                if unit.settled {
                    continue;
                }
                let changed = before.get(&batch_id) != Some(&unit.status);
                let outcome = match unit.status {
                    UnitStatus::Completed => Some(read_result(batch_id, unit)),
                    UnitStatus::Failed => Some(Err(ClusterError {
                        batch_id,
                        kind: unit.failure.take().unwrap_or_else(|| {
                            ClusterFailure::Failed("reported failed by the scheduler".to_string())
                        }),
                    })),
                    UnitStatus::Evicted => self.retry(batch_id, unit),
                    UnitStatus::Pending | UnitStatus::Running => None,
                };

                match outcome {
                    Some(outcome) => {
                        unit.settled = true;
                        progressed = true;
                        let location = outcome.as_ref().ok().map(|_| unit.spec.result_path.clone());
                        // a settled unit without a result is failed, whatever the scheduler last said
                        if outcome.is_err() {
                            unit.status = UnitStatus::Failed;
                        }
                        record(checkpoint, batch_id, unit, location);
                        results.insert(batch_id, outcome);
                    }
                    None if changed => {
                        progressed = true;
                        record(checkpoint, batch_id, unit, None);
                    }
                    None => {}
                }
            }

            if handle.is_settled() {
                break;
            }
            let wait = if progressed {
                backoff.reset()
            } else {
                backoff.next()
            };
            thread::sleep(wait);
        }

        let failed = results.values().filter(|r| r.is_err()).count();
        log::info!(
            "collected {} units, {} failed",
            results.len(),
            failed
        );
        results
    }

    /// Withdraws every unit that has not reached a final status.
    pub fn cancel(&self, handle: &Handle) {
        for (batch_id, unit) in &handle.units {
            if unit.settled || unit.status.is_final() {
                continue;
            }
            if let Some(job) = &unit.job {
                match self.scheduler.cancel(job) {
                    Ok(()) => log::info!("batch {}: cancelled job {}", batch_id, job),
                    Err(e) => log::warn!("batch {}: failed to cancel job {}: {}", batch_id, job, e),
                }
            }
        }
    }

    /// Resubmits an evicted unit; returns an outcome only if it is given up.
    fn retry(
        &self,
        batch_id: usize,
        unit: &mut Unit,
    ) -> Option<Result<BatchOutput, ClusterError>> {
        if unit.retries >= self.retry_limit {
            log::error!(
                "batch {}: evicted {} times, giving up",
                batch_id,
                unit.retries + 1
            );
            return Some(Err(ClusterError {
                batch_id,
                kind: ClusterFailure::RetriesExhausted {
                    attempts: unit.retries + 1,
                },
            }));
        }

        unit.retries += 1;
        unit.spec.attempt = unit.retries;
        log::warn!(
            "batch {}: evicted, resubmitting (retry {}/{})",
            batch_id,
            unit.retries,
            self.retry_limit
        );
        match self.scheduler.submit(&unit.spec) {
            Ok(job) => {
                log::info!("batch {}: resubmitted as job {}", batch_id, job);
                unit.job = Some(job);
                unit.status = UnitStatus::Pending;
                unit.poll_errors = 0;
                None
            }
            Err(e) => Some(Err(ClusterError {
                batch_id,
                kind: ClusterFailure::Submit(e.to_string()),
            })),
        }
    }
}

fn read_result(batch_id: usize, unit: &Unit) -> Result<BatchOutput, ClusterError> {
    let path = &unit.spec.result_path;
    let missing = |message: String| ClusterError {
        batch_id,
        kind: ClusterFailure::MissingResult(message),
    };
    let output: BatchOutput = crate::io::read_json(path)
        .map_err(|e| missing(format!("{}: {}", path.display(), e)))?;
    if output.batch_id != batch_id {
        return Err(missing(format!(
            "{} holds batch {}",
            path.display(),
            output.batch_id
        )));
    }
    Ok(output)
}

fn record(checkpoint: &mut Checkpoint, batch_id: usize, unit: &Unit, location: Option<PathBuf>) {
    let written = checkpoint.update(batch_id, |rec| {
        rec.status = unit.status;
        rec.retry_count = unit.retries;
        rec.job_id = unit.job.as_ref().map(|j| j.0.clone());
        rec.result_location = location;
    });
    if let Err(e) = written {
        log::error!("batch {}: failed to write checkpoint: {}", batch_id, e);
    }
}

/// Work executed by [`LocalScheduler`] for one unit.
///
/// The runner must write the unit's result file; an `Err` marks the unit
/// failed.
pub type BatchRunner = Arc<dyn Fn(&JobSpec) -> Result<(), String> + Send + Sync>;

/// Scheduler running units on an in-process thread pool.
///
/// Cancelling a pending unit prevents it from starting. A running unit
/// cannot be interrupted; it is reported failed once cancelled and its
/// result is ignored.
pub struct LocalScheduler {
    pool: rayon::ThreadPool,
    runner: BatchRunner,
    jobs: Arc<Mutex<HashMap<JobId, UnitStatus>>>,
    next_id: AtomicU64,
}

impl LocalScheduler {
    /// Creates a scheduler with `workers` threads (0 lets rayon decide).
    pub fn new(workers: usize, runner: BatchRunner) -> Result<Self, SchedulerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("nacgen-worker-{}", i))
            .build()
            .map_err(|e| SchedulerError::Pool(e.to_string()))?;
        log::debug!("local scheduler with {} threads", pool.current_num_threads());
        Ok(Self {
            pool,
            runner,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }
}

fn lock_jobs(jobs: &Mutex<HashMap<JobId, UnitStatus>>) -> MutexGuard<'_, HashMap<JobId, UnitStatus>> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scheduler for LocalScheduler {
    fn submit(&self, spec: &JobSpec) -> Result<JobId, SchedulerError> {
        let id = JobId(format!("local-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        lock_jobs(&self.jobs).insert(id.clone(), UnitStatus::Pending);

        let jobs = Arc::clone(&self.jobs);
        let runner = Arc::clone(&self.runner);
        let spec = spec.clone();
        let job = id.clone();
        self.pool.spawn(move || {
            {
                let mut table = lock_jobs(&jobs);
                // cancelled before a thread picked it up
                if table.get(&job).copied() != Some(UnitStatus::Pending) {
                    return;
                }
                table.insert(job.clone(), UnitStatus::Running);
            }

            let status = match catch_unwind(AssertUnwindSafe(|| runner(&spec))) {
                Ok(Ok(())) => UnitStatus::Completed,
                Ok(Err(message)) => {
                    log::error!("batch {}: {}", spec.batch_id, message);
                    UnitStatus::Failed
                }
                Err(_) => {
                    log::error!("batch {}: worker panicked", spec.batch_id);
                    UnitStatus::Failed
                }
            };

            let mut table = lock_jobs(&jobs);
            if table.get(&job) == Some(&UnitStatus::Running) {
                table.insert(job, status);
            }
        });
        Ok(id)
    }

    fn poll(&self, job: &JobId) -> Result<UnitStatus, SchedulerError> {
        lock_jobs(&self.jobs)
            .get(job)
            .copied()
            .ok_or_else(|| SchedulerError::UnknownJob(job.0.clone()))
    }

    fn cancel(&self, job: &JobId) -> Result<(), SchedulerError> {
        let mut table = lock_jobs(&self.jobs);
        match table.get(job).copied() {
            Some(status) if !status.is_final() => {
                table.insert(job.clone(), UnitStatus::Failed);
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(SchedulerError::UnknownJob(job.0.clone())),
        }
    }
}

/// Scheduler submitting units to SLURM.
///
/// Each unit is an `sbatch` script that re-invokes this program as
/// `worker --work_dir <dir> --batch_id <id>`.
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    program: PathBuf,
    cpus_per_task: u32,
    partition: String,
    time: String,
    extra: Vec<String>,
}

impl SlurmScheduler {
    /// Creates a scheduler whose workers run the current executable.
    pub fn new(config: &ClusterConfig, cpus_per_task: u32) -> Result<Self, SchedulerError> {
        Ok(Self::with_program(std::env::current_exe()?, config, cpus_per_task))
    }

    /// Creates a scheduler whose workers run `program`.
    pub fn with_program(program: PathBuf, config: &ClusterConfig, cpus_per_task: u32) -> Self {
        Self {
            program,
            cpus_per_task: cpus_per_task.max(1),
            partition: config.slurm_partition.clone(),
            time: config.slurm_time.clone(),
            extra: config.slurm_extra.clone(),
        }
    }

    /// Renders the batch script of a unit.
    pub fn render_script(&self, spec: &JobSpec) -> String {
        let mut lines = vec![
            "#!/bin/bash".to_string(),
            format!("#SBATCH --job-name=nacgen_{}", spec.batch_id),
            format!(
                "#SBATCH --output={}",
                naming::batch_log(&spec.work_dir, spec.batch_id, spec.attempt).display()
            ),
            "#SBATCH --ntasks=1".to_string(),
            format!("#SBATCH --cpus-per-task={}", self.cpus_per_task),
        ];
        if !self.partition.is_empty() {
            lines.push(format!("#SBATCH --partition={}", self.partition));
        }
        if !self.time.is_empty() {
            lines.push(format!("#SBATCH --time={}", self.time));
        }
        for option in &self.extra {
            lines.push(format!("#SBATCH {}", option));
        }
        lines.push(String::new());
        lines.push(format!(
            "exec \"{}\" worker --work_dir \"{}\" --batch_id {}",
            self.program.display(),
            spec.work_dir.display(),
            spec.batch_id
        ));
        lines.push(String::new());
        lines.join("\n")
    }
}

fn run_command(program: &str, args: &[&str]) -> Result<String, SchedulerError> {
    let output = Command::new(program).args(args).output()?;
    if !output.status.success() {
        return Err(SchedulerError::Command {
            program: program.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Extracts the job id from `sbatch --parsable` output (`<id>[;<cluster>]`).
pub fn parse_sbatch_output(stdout: &str) -> Option<JobId> {
    let first = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = first.split(';').next()?.trim();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit() || c == '_') {
        return None;
    }
    Some(JobId(id.to_string()))
}

/// Maps a SLURM job state to a unit status.
///
/// Accepts both `sacct` states (`CANCELLED by 1000`) and `squeue` states.
/// Returns `None` for states this program does not know.
pub fn map_slurm_state(state: &str) -> Option<UnitStatus> {
    let word = state.split_whitespace().next()?.trim_end_matches('+');
    let status = match word {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED"
        | "RESV_DEL_HOLD" | "SUSPENDED" | "STOPPED" => UnitStatus::Pending,
        "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" | "RESIZING" => UnitStatus::Running,
        "COMPLETED" => UnitStatus::Completed,
        "NODE_FAIL" | "PREEMPTED" | "BOOT_FAIL" => UnitStatus::Evicted,
        "FAILED" | "CANCELLED" | "TIMEOUT" | "OUT_OF_MEMORY" | "DEADLINE" | "REVOKED"
        | "SPECIAL_EXIT" => UnitStatus::Failed,
        _ => return None,
    };
    Some(status)
}

impl Scheduler for SlurmScheduler {
    fn submit(&self, spec: &JobSpec) -> Result<JobId, SchedulerError> {
        let script = naming::batch_script(&spec.work_dir, spec.batch_id);
        if let Some(dir) = script.parent() {
            fs::create_dir_all(dir)?;
        }
        if let Some(dir) = naming::batch_log(&spec.work_dir, spec.batch_id, spec.attempt).parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&script, self.render_script(spec))?;

        let script_arg = script.to_string_lossy();
        let stdout = run_command("sbatch", &["--parsable", &script_arg])?;
        parse_sbatch_output(&stdout).ok_or_else(|| SchedulerError::Command {
            program: "sbatch".to_string(),
            message: format!("unexpected output '{}'", stdout.trim()),
        })
    }

    fn poll(&self, job: &JobId) -> Result<UnitStatus, SchedulerError> {
        let accounted = run_command("sacct", &["-n", "-X", "-P", "-j", &job.0, "-o", "State"])?;
        let state = match accounted.lines().map(str::trim).find(|l| !l.is_empty()) {
            Some(state) => state.to_string(),
            // freshly submitted jobs can be missing from accounting for a while
            None => run_command("squeue", &["-h", "-j", &job.0, "-o", "%T"])?
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .ok_or_else(|| SchedulerError::UnknownJob(job.0.clone()))?
                .to_string(),
        };
        map_slurm_state(&state).ok_or_else(|| SchedulerError::Command {
            program: "sacct".to_string(),
            message: format!("unrecognized job state '{}'", state),
        })
    }

    fn cancel(&self, job: &JobId) -> Result<(), SchedulerError> {
        run_command("scancel", &[&job.0]).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RawOutput;
    use crate::geometry::Frame;
    use crate::partition::partition;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    /// Replays a scripted status sequence per (batch, attempt).
    struct ScriptedScheduler {
        scripts: Mutex<HashMap<(usize, u32), VecDeque<UnitStatus>>>,
        jobs: Mutex<HashMap<JobId, (usize, u32)>>,
        submissions: Mutex<Vec<(usize, u32)>>,
        fail_poll: bool,
    }

    impl ScriptedScheduler {
        fn new(scripts: Vec<((usize, u32), Vec<UnitStatus>)>) -> Self {
            Self {
                scripts: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|(k, v)| (k, v.into_iter().collect()))
                        .collect(),
                ),
                jobs: Mutex::new(HashMap::new()),
                submissions: Mutex::new(Vec::new()),
                fail_poll: false,
            }
        }
    }

    impl Scheduler for ScriptedScheduler {
        fn submit(&self, spec: &JobSpec) -> Result<JobId, SchedulerError> {
            let key = (spec.batch_id, spec.attempt);
            self.submissions.lock().unwrap().push(key);
            if !self.scripts.lock().unwrap().contains_key(&key) {
                return Err(SchedulerError::Command {
                    program: "fake".to_string(),
                    message: "queue closed".to_string(),
                });
            }
            let output = BatchOutput {
                batch_id: spec.batch_id,
                outputs: vec![Ok(RawOutput {
                    frame_index: 0,
                    text: format!("attempt {}", spec.attempt),
                })],
            };
            crate::io::write_json_atomic(&spec.result_path, &output).unwrap();
            let id = JobId(format!("{}.{}", spec.batch_id, spec.attempt));
            self.jobs.lock().unwrap().insert(id.clone(), key);
            Ok(id)
        }

        fn poll(&self, job: &JobId) -> Result<UnitStatus, SchedulerError> {
            if self.fail_poll {
                return Err(SchedulerError::UnknownJob(job.0.clone()));
            }
            let key = self.jobs.lock().unwrap()[job];
            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts.get_mut(&key).unwrap();
            Ok(if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script[0]
            })
        }

        fn cancel(&self, _job: &JobId) -> Result<(), SchedulerError> {
            Ok(())
        }
    }

    fn fast_config(retry_limit: u32) -> ClusterConfig {
        ClusterConfig {
            retry_limit,
            poll_interval_ms: 1,
            max_poll_interval_ms: 4,
            ..ClusterConfig::default()
        }
    }

    fn setup(dir: &Path, batches: usize) -> (Vec<JobSpec>, Checkpoint) {
        let frames: Vec<Frame> = (0..batches)
            .map(|i| Frame::new(i, vec!["H".to_string()], vec![0.0, 0.0, 0.0]))
            .collect();
        let layout = partition(&frames, batches).unwrap();
        let checkpoint = Checkpoint::open(&naming::checkpoint(dir), frames.len(), batches, &layout, "").unwrap();
        let specs = layout.iter().map(|b| JobSpec::new(dir, b.batch_id)).collect();
        (specs, checkpoint)
    }

    use UnitStatus::*;

    #[test]
    fn test_completed_units_are_collected() {
        let dir = TempDir::new().unwrap();
        let (specs, mut checkpoint) = setup(dir.path(), 2);
        let scheduler = ScriptedScheduler::new(vec![
            ((1, 0), vec![Pending, Running, Completed]),
            ((2, 0), vec![Running, Running, Running, Completed]),
        ]);
        let adapter = ClusterAdapter::new(scheduler, &fast_config(2));
        let mut handle = adapter.submit(specs);
        let results = adapter.collect(&mut handle, &mut checkpoint);

        assert!(handle.is_settled());
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| r.is_ok()));
        let record = checkpoint.record(2).unwrap();
        assert_eq!(record.status, Completed);
        assert_eq!(record.result_location.as_deref(), Some(naming::batch_result(dir.path(), 2).as_path()));
    }

    #[test]
    fn test_evicted_unit_is_resubmitted() {
        let dir = TempDir::new().unwrap();
        let (specs, mut checkpoint) = setup(dir.path(), 1);
        let scheduler = ScriptedScheduler::new(vec![
            ((1, 0), vec![Running, Evicted]),
            ((1, 1), vec![Pending, Completed]),
        ]);
        let adapter = ClusterAdapter::new(scheduler, &fast_config(1));
        let mut handle = adapter.submit(specs);
        let results = adapter.collect(&mut handle, &mut checkpoint);

        let output = results[&1].as_ref().unwrap();
        assert_eq!(output.outputs[0].as_ref().unwrap().text, "attempt 1");
        assert_eq!(*adapter.scheduler().submissions.lock().unwrap(), vec![(1, 0), (1, 1)]);
        assert_eq!(checkpoint.record(1).unwrap().retry_count, 1);
    }

    #[test]
    fn test_retry_limit_exhausted() {
        let dir = TempDir::new().unwrap();
        let (specs, mut checkpoint) = setup(dir.path(), 2);
        let scheduler = ScriptedScheduler::new(vec![
            ((1, 0), vec![Completed]),
            ((2, 0), vec![Evicted]),
            ((2, 1), vec![Evicted]),
            ((2, 2), vec![Evicted]),
        ]);
        let adapter = ClusterAdapter::new(scheduler, &fast_config(2));
        let mut handle = adapter.submit(specs);
        let results = adapter.collect(&mut handle, &mut checkpoint);

        assert!(results[&1].is_ok());
        assert_eq!(
            results[&2].as_ref().unwrap_err(),
            &ClusterError {
                batch_id: 2,
                kind: ClusterFailure::RetriesExhausted { attempts: 3 }
            }
        );
        assert_eq!(checkpoint.record(2).unwrap().status, Failed);
        assert_eq!(checkpoint.record(2).unwrap().retry_count, 2);
        assert!(checkpoint.active_jobs().is_empty());
    }

    #[test]
    fn test_failed_and_unsubmittable_units() {
        let dir = TempDir::new().unwrap();
        let (specs, mut checkpoint) = setup(dir.path(), 3);
        let scheduler = ScriptedScheduler::new(vec![((1, 0), vec![Failed]), ((2, 0), vec![Completed])]);
        let adapter = ClusterAdapter::new(scheduler, &fast_config(2));
        let mut handle = adapter.submit(specs);
        assert_eq!(handle.status(3), Some(Failed));
        let results = adapter.collect(&mut handle, &mut checkpoint);

        assert!(matches!(results[&1].as_ref().unwrap_err().kind, ClusterFailure::Failed(_)));
        assert!(results[&2].is_ok());
        assert!(matches!(results[&3].as_ref().unwrap_err().kind, ClusterFailure::Submit(_)));
    }

    #[test]
    fn test_missing_result_file() {
        let dir = TempDir::new().unwrap();
        let (specs, mut checkpoint) = setup(dir.path(), 1);
        let scheduler = ScriptedScheduler::new(vec![((1, 0), vec![Running, Completed])]);
        let adapter = ClusterAdapter::new(scheduler, &fast_config(0));
        let mut handle = adapter.submit(specs);
        fs::write(naming::batch_result(dir.path(), 1), "{ truncated").unwrap();
        let results = adapter.collect(&mut handle, &mut checkpoint);

        assert!(matches!(results[&1].as_ref().unwrap_err().kind, ClusterFailure::MissingResult(_)));
        assert_eq!(checkpoint.record(1).unwrap().status, Failed);
        assert!(checkpoint.record(1).unwrap().result_location.is_none());
    }

    #[test]
    fn test_persistent_poll_errors_fail_unit() {
        let dir = TempDir::new().unwrap();
        let (specs, mut checkpoint) = setup(dir.path(), 1);
        let mut scheduler = ScriptedScheduler::new(vec![((1, 0), vec![Running])]);
        scheduler.fail_poll = true;
        let adapter = ClusterAdapter::new(scheduler, &fast_config(2));
        let mut handle = adapter.submit(specs);
        let results = adapter.collect(&mut handle, &mut checkpoint);
        assert!(matches!(results[&1].as_ref().unwrap_err().kind, ClusterFailure::Failed(_)));
    }

    #[test]
    fn test_cancel_flag_stops_collection() {
        let dir = TempDir::new().unwrap();
        let (specs, mut checkpoint) = setup(dir.path(), 1);
        let scheduler = ScriptedScheduler::new(vec![((1, 0), vec![Running])]);
        let adapter = ClusterAdapter::new(scheduler, &fast_config(2));
        let mut handle = adapter.submit(specs);
        adapter.cancel_flag().store(true, Ordering::SeqCst);
        let results = adapter.collect(&mut handle, &mut checkpoint);
        assert_eq!(results[&1].as_ref().unwrap_err().kind, ClusterFailure::Cancelled);
    }

    #[test]
    fn test_backoff_doubles_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next(), Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(200));
        assert_eq!(backoff.next(), Duration::from_millis(350));
        assert_eq!(backoff.next(), Duration::from_millis(350));
        assert_eq!(backoff.reset(), Duration::from_millis(100));
        assert_eq!(backoff.next(), Duration::from_millis(200));
    }

    #[test]
    fn test_local_scheduler_runs_and_reports_panics() {
        let dir = TempDir::new().unwrap();
        let runner: BatchRunner = Arc::new(|spec: &JobSpec| match spec.batch_id {
            1 => Ok(()),
            2 => Err("engine missing".to_string()),
            _ => panic!("boom"),
        });
        let scheduler = LocalScheduler::new(2, runner).unwrap();
        let ids: Vec<JobId> = (1..=3)
            .map(|b| scheduler.submit(&JobSpec::new(dir.path(), b)).unwrap())
            .collect();

        let mut statuses = Vec::new();
        for _ in 0..500 {
            statuses = ids.iter().map(|id| scheduler.poll(id).unwrap()).collect();
            if statuses.iter().all(|s| s.is_final()) {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(statuses, vec![Completed, Failed, Failed]);
        assert!(scheduler.poll(&JobId("nope".to_string())).is_err());
    }

    #[test]
    fn test_slurm_state_mapping() {
        assert_eq!(map_slurm_state("PENDING"), Some(Pending));
        assert_eq!(map_slurm_state("RUNNING"), Some(Running));
        assert_eq!(map_slurm_state("COMPLETED"), Some(Completed));
        assert_eq!(map_slurm_state("NODE_FAIL"), Some(Evicted));
        assert_eq!(map_slurm_state("PREEMPTED"), Some(Evicted));
        assert_eq!(map_slurm_state("CANCELLED by 1000"), Some(Failed));
        assert_eq!(map_slurm_state("OUT_OF_MEMORY"), Some(Failed));
        assert_eq!(map_slurm_state("WHATEVER"), None);
    }

    #[test]
    fn test_sbatch_output_parsing() {
        assert_eq!(parse_sbatch_output("12345\n"), Some(JobId("12345".to_string())));
        assert_eq!(parse_sbatch_output("678;cluster2\n"), Some(JobId("678".to_string())));
        assert_eq!(parse_sbatch_output("sbatch: error: invalid partition"), None);
        assert_eq!(parse_sbatch_output(""), None);
    }

    #[test]
    fn test_slurm_script() {
        let config = ClusterConfig {
            slurm_partition: "short".to_string(),
            slurm_extra: vec!["--mem=8G".to_string()],
            ..ClusterConfig::default()
        };
        let scheduler = SlurmScheduler::with_program(PathBuf::from("/opt/bin/nacgen"), &config, 4);
        let script = scheduler.render_script(&JobSpec::new(Path::new("/scratch/TMP"), 2));
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --cpus-per-task=4\n"));
        assert!(script.contains("#SBATCH --partition=short\n"));
        assert!(!script.contains("--time"));
        assert!(script.contains("#SBATCH --mem=8G\n"));
        assert!(script.contains("exec \"/opt/bin/nacgen\" worker --work_dir \"/scratch/TMP\" --batch_id 2"));
    }
}
