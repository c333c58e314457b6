//! File layout of a run.
//!
//! All state of a run lives below its work directory, so that several runs
//! can share an output directory without clashing:
//!
//! ```text
//! TMP/
//! ├── checkpoint.json
//! ├── manifest.json
//! ├── results/batch_0001.json
//! ├── jobs/batch_0001.sh          (SLURM backend)
//! └── logs/batch_0001_a0.log      (SLURM backend)
//! ```
//!
//! # Example
//!
//! ```
//! use std::path::Path;
//! use nacgen::naming;
//! use nacgen::parser::StatePair;
//!
//! let work = Path::new("TMP");
//! assert_eq!(naming::batch_result(work, 2), Path::new("TMP/results/batch_0002.json"));
//! assert_eq!(naming::forces_stream(1), "forces_1.xyz");
//! assert_eq!(naming::nac_stream(StatePair::new(2, 1).unwrap()), "nacvec_1-2.xyz");
//! ```

use crate::parser::StatePair;
use std::path::{Path, PathBuf};

/// Name of the gap list written next to the output streams
pub const GAPS_FILE: &str = "gaps.json";

/// Name of the local settings file
pub const SETTINGS_FILE: &str = "nacgen.cfg";

/// Run checkpoint
pub fn checkpoint(work_dir: &Path) -> PathBuf {
    work_dir.join("checkpoint.json")
}

/// Run manifest read by cluster workers
pub fn manifest(work_dir: &Path) -> PathBuf {
    work_dir.join("manifest.json")
}

/// Result file of a batch
pub fn batch_result(work_dir: &Path, batch_id: usize) -> PathBuf {
    work_dir
        .join("results")
        .join(format!("batch_{:04}.json", batch_id))
}

/// Batch script submitted to SLURM
pub fn batch_script(work_dir: &Path, batch_id: usize) -> PathBuf {
    work_dir.join("jobs").join(format!("batch_{:04}.sh", batch_id))
}

/// Scheduler log of one submission attempt
pub fn batch_log(work_dir: &Path, batch_id: usize, attempt: u32) -> PathBuf {
    work_dir
        .join("logs")
        .join(format!("batch_{:04}_a{}.log", batch_id, attempt))
}

/// Output stream of the forces of `state`
pub fn forces_stream(state: u32) -> String {
    format!("forces_{}.xyz", state)
}

/// Output stream of the coupling vectors of `pair`
pub fn nac_stream(pair: StatePair) -> String {
    format!("nacvec_{}.xyz", pair)
}

/// Returns true if `name` follows the stream naming of [`forces_stream`]
/// or [`nac_stream`].
pub fn is_stream_file(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(".xyz") else {
        return false;
    };
    if let Some(state) = stem.strip_prefix("forces_") {
        return state.parse::<u32>().is_ok();
    }
    match stem.strip_prefix("nacvec_").and_then(|pair| pair.split_once('-')) {
        Some((i, j)) => i.parse::<u32>().is_ok() && j.parse::<u32>().is_ok(),
        None => false,
    }
}
