// Shared fixtures for the integration tests.
#![allow(dead_code)]

use nacgen::cluster::{JobId, JobSpec, LocalScheduler, Scheduler, SchedulerError, UnitStatus};
use nacgen::config::{ClusterConfig, RunConfig};
use nacgen::engine::{Engine, EngineError, EngineFailure};
use nacgen::geometry::Frame;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const DECK: &str = "\
$molecule
0 1
O 0.0 0.0 0.0
$end

$rem
method          b3lyp
basis           6-31g*
cis_n_roots     2
cis_der_couple  true
$end
";

/// Writes a water trajectory of `n` frames with a stretching O-H bond.
pub fn write_trajectory(path: &Path, n: usize) {
    let mut text = String::new();
    for i in 0..n {
        let y = 0.7572 + 0.002 * i as f64;
        let _ = write!(
            text,
            "3\nframe {}\nO 0.0 0.0 0.1173\nH 0.0 {:.4} -0.4692\nH 0.0 -0.7572 -0.4692\n",
            i, y
        );
    }
    fs::write(path, text).unwrap();
}

/// Q-Chem style output with forces on states 0 and 1 and the 0-1 coupling.
///
/// Every number depends on the frame index, so a stream line can be traced
/// back to the frame it came from.
pub fn qchem_output(frame: &Frame) -> String {
    let v = 0.001 * (frame.index as f64 + 1.0);
    let n = frame.num_atoms();
    let mut out = String::new();
    let _ = writeln!(out, " Total energy in final basis set =      {:.10}", -76.4 - v);
    out.push_str(" ---------------------------------------------------\n");
    out.push_str("                    TDDFT Excitation Energies\n");
    out.push_str(" ---------------------------------------------------\n\n");
    let _ = writeln!(out, " Excited state   1: excitation energy (eV) =    {:.4}", 7.0 + v);
    out.push_str(" ---------------------------------------------------\n");

    out.push_str(" Gradient of SCF Energy\n");
    push_matrix(&mut out, n, v);
    out.push_str(" Max gradient component =       1.000E-02\n");

    let _ = writeln!(out, " RPA  1 State Energy is     {:.6}", -76.1 - v);
    out.push_str(" Gradient of the state energy (including CIS Excitation Energy)\n");
    push_matrix(&mut out, n, 2.0 * v);
    out.push_str(" Gradient time:  CPU 0.10 s  wall 0.10 s\n");

    out.push_str(" CIS derivative couplings between states 0 and 1\n");
    out.push_str(" DC between states 0 and 1 with ETF:\n");
    out.push_str(" Atom         X              Y              Z\n");
    out.push_str(" ---------------------------------------------------\n");
    for atom in 0..n {
        let _ = writeln!(out, " {}  {:14.6} {:14.6} {:14.6}", atom + 1, v * (atom as f64 + 1.0), -v, 0.0);
    }
    out.push_str(" ---------------------------------------------------\n");
    out.push_str(" Thank you very much for using Q-Chem.  Have a nice day.\n");
    out
}

/// Gradient block for up to six atoms; entry (k, atom) is `scale * (k + atom)`.
fn push_matrix(out: &mut String, atoms: usize, scale: f64) {
    out.push_str("     ");
    for atom in 0..atoms {
        let _ = write!(out, "{:>12}", atom + 1);
    }
    out.push('\n');
    for k in 0..3 {
        let _ = write!(out, "    {}", k + 1);
        for atom in 0..atoms {
            let _ = write!(out, " {:11.7}", scale * (k + atom) as f64);
        }
        out.push('\n');
    }
}

/// Engine stand-in that synthesizes output and remembers which frames it computed.
#[derive(Default)]
pub struct FakeEngine {
    pub computed: Mutex<Vec<usize>>,
    pub failing: BTreeSet<usize>,
}

impl FakeEngine {
    pub fn failing(frames: &[usize]) -> Self {
        Self {
            computed: Mutex::new(Vec::new()),
            failing: frames.iter().copied().collect(),
        }
    }

    pub fn computed(&self) -> Vec<usize> {
        let mut frames = self.computed.lock().unwrap().clone();
        frames.sort_unstable();
        frames
    }
}

impl Engine for FakeEngine {
    fn compute(&self, frame: &Frame, deck: &str) -> Result<String, EngineError> {
        assert!(deck.contains("$molecule"));
        self.computed.lock().unwrap().push(frame.index);
        if self.failing.contains(&frame.index) {
            return Err(EngineError {
                frame_index: frame.index,
                cause: EngineFailure::Exit { code: Some(1) },
            });
        }
        Ok(qchem_output(frame))
    }
}

/// Local scheduler whose units for the chosen batches are always evicted.
pub struct EvictingScheduler {
    inner: LocalScheduler,
    evict: BTreeSet<usize>,
    evicted_jobs: Mutex<BTreeSet<String>>,
    next: AtomicUsize,
    submissions: Arc<Mutex<Vec<usize>>>,
}

impl EvictingScheduler {
    pub fn new(inner: LocalScheduler, evict: &[usize]) -> Self {
        Self {
            inner,
            evict: evict.iter().copied().collect(),
            evicted_jobs: Mutex::new(BTreeSet::new()),
            next: AtomicUsize::new(0),
            submissions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Batch ids in submission order, shared with the scheduler.
    pub fn submissions(&self) -> Arc<Mutex<Vec<usize>>> {
        Arc::clone(&self.submissions)
    }
}

pub fn count(submissions: &Mutex<Vec<usize>>, batch_id: usize) -> usize {
    submissions
        .lock()
        .unwrap()
        .iter()
        .filter(|&&b| b == batch_id)
        .count()
}

/// Frame indices of the records in an extended-XYZ stream.
pub fn stream_frames(path: &Path) -> Vec<usize> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter_map(|line| line.split_whitespace().find_map(|t| t.strip_prefix("frame=")))
        .map(|v| v.parse().unwrap())
        .collect()
}

impl Scheduler for EvictingScheduler {
    fn submit(&self, spec: &JobSpec) -> Result<JobId, SchedulerError> {
        self.submissions.lock().unwrap().push(spec.batch_id);
        if self.evict.contains(&spec.batch_id) {
            let id = format!("evicted-{}", self.next.fetch_add(1, Ordering::SeqCst));
            self.evicted_jobs.lock().unwrap().insert(id.clone());
            return Ok(JobId(id));
        }
        self.inner.submit(spec)
    }

    fn poll(&self, job: &JobId) -> Result<UnitStatus, SchedulerError> {
        if self.evicted_jobs.lock().unwrap().contains(&job.0) {
            return Ok(UnitStatus::Evicted);
        }
        self.inner.poll(job)
    }

    fn cancel(&self, job: &JobId) -> Result<(), SchedulerError> {
        if self.evicted_jobs.lock().unwrap().contains(&job.0) {
            return Ok(());
        }
        self.inner.cancel(job)
    }
}

/// Run configuration rooted in `dir` with fast polling.
pub fn run_config(dir: &Path, frames: usize, parallel_images: usize) -> RunConfig {
    let geometry = dir.join("traj.xyz");
    let deck = dir.join("grad.in");
    write_trajectory(&geometry, frames);
    fs::write(&deck, DECK).unwrap();

    let mut config = RunConfig::new(geometry, deck);
    config.parallel_images = parallel_images;
    config.work_dir = dir.join("work");
    config.out_dir = dir.join("out");
    config.cluster = ClusterConfig {
        retry_limit: 2,
        poll_interval_ms: 5,
        max_poll_interval_ms: 20,
        ..ClusterConfig::default()
    };
    config
}

pub fn engine(fake: &Arc<FakeEngine>) -> Arc<dyn Engine> {
    fake.clone()
}
