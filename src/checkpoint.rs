//! Persistent run state for resuming interrupted runs.
//!
//! Two JSON files live in the work directory:
//!
//! - **Checkpoint** (`checkpoint.json`): one record per batch with its
//!   frame indices, last known unit status, retry count, scheduler job id
//!   and the location of its result file once completed.
//! - **Manifest** (`manifest.json`): the inputs and engine settings of the
//!   run, which a cluster worker reads to rebuild its batch.
//!
//! Both files are replaced atomically on every write, so a crash leaves
//! either the previous or the new state on disk, never a torn file.
//!
//! # Resumption
//!
//! When a run is restarted in the same work directory,
//! [`Checkpoint::open`] reloads the checkpoint and verifies that it
//! describes the same frame partition and the same inputs. Batches whose
//! recorded result file is still readable are not submitted again.
//!
//! The inputs are identified by [`input_digest`], a SHA-256 over the
//! trajectory, the deck template and the engine settings. Editing any of
//! them between two runs would otherwise mix results of different
//! calculations in one stream.
//!
//! ```no_run
//! use nacgen::checkpoint::Checkpoint;
//! use nacgen::partition::Batch;
//! use std::path::Path;
//!
//! let batches = vec![Batch { batch_id: 1, frame_indices: vec![0, 1] }];
//! let checkpoint = Checkpoint::open(Path::new("TMP/checkpoint.json"), 2, 1, &batches, "d1g3st")?;
//! let todo = checkpoint.unfinished_batches();
//! # Ok::<(), nacgen::config::ConfigError>(())
//! ```

use crate::cluster::UnitStatus;
use crate::config::{Backend, ConfigError, EngineConfig};
use crate::driver::BatchOutput;
use crate::io::{read_json, write_json_atomic};
use crate::partition::Batch;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Persisted state of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Frames of the batch, in order
    pub frame_indices: Vec<usize>,
    /// Last known unit status
    pub status: UnitStatus,
    /// Number of resubmissions after evictions
    pub retry_count: u32,
    /// Scheduler id of the latest submission
    pub job_id: Option<String>,
    /// Result file, set once the batch completed with a readable result
    pub result_location: Option<PathBuf>,
}

/// Per-batch state of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Number of frames in the trajectory
    pub frame_count: usize,
    /// Requested number of parallel images
    pub parallelism: usize,
    /// Records keyed by batch id
    pub batches: BTreeMap<usize, BatchRecord>,
    /// Digest of the inputs the results were computed from
    #[serde(default)]
    pub input_digest: String,
    #[serde(skip)]
    path: PathBuf,
}

impl Checkpoint {
    /// Creates a fresh checkpoint with every batch pending.
    pub fn new(
        path: &Path,
        frame_count: usize,
        parallelism: usize,
        batches: &[Batch],
        input_digest: &str,
    ) -> Self {
        let batches = batches
            .iter()
            .map(|b| {
                (
                    b.batch_id,
                    BatchRecord {
                        frame_indices: b.frame_indices.clone(),
                        status: UnitStatus::Pending,
                        retry_count: 0,
                        job_id: None,
                        result_location: None,
                    },
                )
            })
            .collect();
        Self {
            frame_count,
            parallelism,
            batches,
            input_digest: input_digest.to_string(),
            path: path.to_path_buf(),
        }
    }

    /// Loads an existing checkpoint file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut checkpoint: Checkpoint = read_json(path).map_err(|e| {
            ConfigError::IncompatibleRun(format!("unreadable checkpoint {}: {}", path.display(), e))
        })?;
        checkpoint.path = path.to_path_buf();
        Ok(checkpoint)
    }

    /// Resumes the checkpoint at `path` or starts a new one.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::IncompatibleRun`] if the file exists but was
    /// written for a different trajectory length, partition or inputs.
    pub fn open(
        path: &Path,
        frame_count: usize,
        parallelism: usize,
        batches: &[Batch],
        input_digest: &str,
    ) -> Result<Self, ConfigError> {
        if !path.exists() {
            let checkpoint = Self::new(path, frame_count, parallelism, batches, input_digest);
            checkpoint.save()?;
            return Ok(checkpoint);
        }

        let checkpoint = Self::load(path)?;
        if checkpoint.frame_count != frame_count {
            return Err(ConfigError::IncompatibleRun(format!(
                "{} was written for {} frames, the trajectory has {}",
                path.display(),
                checkpoint.frame_count,
                frame_count
            )));
        }
        let same_layout = checkpoint.batches.len() == batches.len()
            && batches.iter().all(|b| {
                checkpoint
                    .batches
                    .get(&b.batch_id)
                    .is_some_and(|r| r.frame_indices == b.frame_indices)
            });
        if !same_layout {
            return Err(ConfigError::IncompatibleRun(format!(
                "{} was written for {} parallel images, this run uses {}",
                path.display(),
                checkpoint.parallelism,
                parallelism
            )));
        }
        if checkpoint.input_digest != input_digest {
            return Err(ConfigError::IncompatibleRun(format!(
                "{} was written for a different trajectory, template or engine setup",
                path.display()
            )));
        }
        log::info!(
            "Resuming from {}: {} of {} batches already completed",
            path.display(),
            checkpoint.batches.len() - checkpoint.unfinished_batches().len(),
            checkpoint.batches.len()
        );
        Ok(checkpoint)
    }

    /// Writes the checkpoint to its file.
    pub fn save(&self) -> std::io::Result<()> {
        write_json_atomic(&self.path, self)
    }

    /// Location of the checkpoint file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record of a batch
    pub fn record(&self, batch_id: usize) -> Option<&BatchRecord> {
        self.batches.get(&batch_id)
    }

    /// Modifies a batch record and saves the checkpoint.
    ///
    /// Unknown batch ids are ignored.
    pub fn update<F>(&mut self, batch_id: usize, f: F) -> std::io::Result<()>
    where
        F: FnOnce(&mut BatchRecord),
    {
        match self.batches.get_mut(&batch_id) {
            Some(record) => {
                f(record);
                self.save()
            }
            None => Ok(()),
        }
    }

    /// Loads the stored result of a completed batch.
    ///
    /// Returns `None` if the batch has no recorded result or the file can no
    /// longer be read, in which case the batch has to be computed again.
    pub fn completed_output(&self, batch_id: usize) -> Option<BatchOutput> {
        let record = self.batches.get(&batch_id)?;
        if record.status != UnitStatus::Completed {
            return None;
        }
        let location = record.result_location.as_ref()?;
        match read_json::<BatchOutput>(location) {
            Ok(output) if output.batch_id == batch_id => Some(output),
            Ok(_) => None,
            Err(e) => {
                log::warn!(
                    "batch {}: recorded result {} is unusable ({}), recomputing",
                    batch_id,
                    location.display(),
                    e
                );
                None
            }
        }
    }

    /// Batch ids without a usable stored result, ascending.
    pub fn unfinished_batches(&self) -> Vec<usize> {
        self.batches
            .keys()
            .copied()
            .filter(|&id| self.completed_output(id).is_none())
            .collect()
    }

    /// Scheduler job ids of batches that may still be queued or running.
    pub fn active_jobs(&self) -> Vec<(usize, String)> {
        self.batches
            .iter()
            .filter(|(_, r)| !r.status.is_final())
            .filter_map(|(&id, r)| r.job_id.clone().map(|job| (id, job)))
            .collect()
    }
}

/// SHA-256 over the trajectory, the deck template and the engine settings.
///
/// Only settings that can change an engine's output are included, so a
/// resumed run may use a different scratch directory or timeout.
pub fn input_digest(trajectory: &[u8], template: &[u8], engine: &EngineConfig) -> String {
    let invocation = (&engine.command, &engine.args, &engine.output, engine.nprocs, &engine.mem);
    // strings, lists and integers always serialize
    let invocation = serde_json::to_vec(&invocation).unwrap_or_default();

    let mut hasher = Sha256::new();
    for part in [trajectory, template, &invocation] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

/// Inputs of a run, as needed by a worker to rebuild its batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Absolute path of the trajectory
    pub geometry_file: PathBuf,
    /// Absolute path of the input deck template
    pub template_file: PathBuf,
    /// Requested number of parallel images
    pub parallelism: usize,
    /// Backend the units were submitted to
    #[serde(default)]
    pub backend: Backend,
    /// Engine invocation
    pub engine: EngineConfig,
}

impl RunManifest {
    /// Writes the manifest atomically.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        write_json_atomic(path, self)
    }

    /// Reads a manifest written by [`save`](Self::save).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        read_json(path).map_err(|e| {
            ConfigError::IncompatibleRun(format!("unreadable manifest {}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RawOutput;
    use tempfile::TempDir;

    fn layout(sizes: &[usize]) -> Vec<Batch> {
        let mut start = 0;
        sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| {
                let batch = Batch {
                    batch_id: i + 1,
                    frame_indices: (start..start + n).collect(),
                };
                start += n;
                batch
            })
            .collect()
    }

    #[test]
    fn test_open_creates_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        let batches = layout(&[2, 2]);

        let mut checkpoint = Checkpoint::open(&path, 4, 2, &batches, "abc").unwrap();
        assert!(path.exists());
        checkpoint
            .update(2, |r| {
                r.status = UnitStatus::Running;
                r.job_id = Some("42".to_string());
            })
            .unwrap();

        let reloaded = Checkpoint::open(&path, 4, 2, &batches, "abc").unwrap();
        assert_eq!(reloaded, checkpoint);
        assert_eq!(reloaded.active_jobs(), vec![(2, "42".to_string())]);
    }

    #[test]
    fn test_incompatible_layout_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        Checkpoint::open(&path, 4, 2, &layout(&[2, 2]), "abc").unwrap();

        assert!(matches!(
            Checkpoint::open(&path, 5, 2, &layout(&[3, 2]), "abc"),
            Err(ConfigError::IncompatibleRun(_))
        ));
        assert!(matches!(
            Checkpoint::open(&path, 4, 4, &layout(&[1, 1, 1, 1]), "abc"),
            Err(ConfigError::IncompatibleRun(_))
        ));
        assert!(matches!(
            Checkpoint::open(&path, 4, 2, &layout(&[2, 2]), "abd"),
            Err(ConfigError::IncompatibleRun(_))
        ));
    }

    #[test]
    fn test_unfinished_batches_require_readable_result() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut checkpoint = Checkpoint::open(&path, 6, 3, &layout(&[2, 2, 2]), "abc").unwrap();

        let good = dir.path().join("batch_0001.json");
        let output = BatchOutput {
            batch_id: 1,
            outputs: vec![Ok(RawOutput {
                frame_index: 0,
                text: "ok".to_string(),
            })],
        };
        write_json_atomic(&good, &output).unwrap();
        checkpoint
            .update(1, |r| {
                r.status = UnitStatus::Completed;
                r.result_location = Some(good.clone());
            })
            .unwrap();
        checkpoint
            .update(2, |r| {
                r.status = UnitStatus::Completed;
                r.result_location = Some(dir.path().join("deleted.json"));
            })
            .unwrap();

        assert_eq!(checkpoint.completed_output(1), Some(output));
        assert_eq!(checkpoint.unfinished_batches(), vec![2, 3]);
    }

    #[test]
    fn test_input_digest_tracks_every_input() {
        let engine = EngineConfig::default();
        let base = input_digest(b"traj", b"deck", &engine);
        assert_eq!(base.len(), 64);
        assert_eq!(base, input_digest(b"traj", b"deck", &engine));
        assert_ne!(base, input_digest(b"traj2", b"deck", &engine));
        assert_ne!(base, input_digest(b"traj", b"deck2", &engine));
        // moving bytes across the boundary changes the digest
        assert_ne!(base, input_digest(b"tra", b"jdeck", &engine));

        let mut other = engine.clone();
        other.nprocs += 1;
        assert_ne!(base, input_digest(b"traj", b"deck", &other));

        let mut relocated = engine.clone();
        relocated.timeout_seconds += 60;
        relocated.scratch_dir = Some(PathBuf::from("/scratch/elsewhere"));
        assert_eq!(base, input_digest(b"traj", b"deck", &relocated));
    }

    #[test]
    fn test_manifest_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        let manifest = RunManifest {
            geometry_file: PathBuf::from("/data/traj.xyz"),
            template_file: PathBuf::from("/data/grad.in"),
            parallelism: 3,
            backend: Backend::Slurm,
            engine: EngineConfig::default(),
        };
        manifest.save(&path).unwrap();
        assert_eq!(RunManifest::load(&path).unwrap(), manifest);
        assert!(RunManifest::load(&dir.path().join("none.json")).is_err());
    }
}
