//! Trajectory assembly: merging per-frame results into output streams.
//!
//! Results arrive from the gather phase in whatever order the batches
//! finished. The assembler groups them into one stream per quantity
//! (forces of a state, coupling vectors of a state pair), orders every
//! stream by frame index and records, per stream, which frames are missing.
//!
//! A frame may be present in one stream and absent from another, for
//! example when its forces were computed but its coupling block was not
//! printed. Such a frame is a gap only in the stream that lacks it.

use crate::geometry::Frame;
use crate::io::{push_extxyz_record, write_atomic};
use crate::naming;
use crate::parser::{JobResult, StatePair};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Identifies one output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamKey {
    /// Forces of one electronic state
    Forces(u32),
    /// Coupling vectors of one state pair
    Nac(StatePair),
}

impl StreamKey {
    /// File name of the stream inside the output directory
    pub fn file_name(&self) -> String {
        match self {
            StreamKey::Forces(state) => naming::forces_stream(*state),
            StreamKey::Nac(pair) => naming::nac_stream(*pair),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKey::Forces(state) => write!(f, "forces of state {}", state),
            StreamKey::Nac(pair) => write!(f, "coupling {}", pair),
        }
    }
}

/// One frame's entry in a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    /// Zero-based frame index
    pub frame_index: usize,
    /// Total energy of the state (force streams only)
    pub energy: Option<f64>,
    /// One vector per atom
    pub vectors: Vec<Vector3<f64>>,
    /// Positions (Bohr) the vectors refer to, if the engine reported them
    pub positions: Option<Vec<Vector3<f64>>>,
}

/// Frame-ordered output streams with their gaps.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dataset {
    /// Number of frames in the trajectory
    pub frame_count: usize,
    /// Records of every stream, ascending by frame index
    pub streams: BTreeMap<StreamKey, Vec<StreamRecord>>,
    /// Frames in `0..frame_count` absent from each stream
    pub gaps: BTreeMap<StreamKey, Vec<usize>>,
    /// Frames with no result at all
    pub missing_frames: Vec<usize>,
}

/// Merges parsed results into frame-ordered streams.
///
/// If a frame appears more than once, the result from the lowest batch id
/// wins. Results with an index outside `0..frame_count` are dropped with a
/// warning. The outcome does not depend on the order of `results`.
pub fn assemble(results: Vec<JobResult>, frame_count: usize) -> Dataset {
    let mut results = results;
    results.sort_by_key(|r| (r.frame_index, r.batch_id));

    let mut streams: BTreeMap<StreamKey, Vec<StreamRecord>> = BTreeMap::new();
    let mut seen = BTreeSet::new();
    for result in results {
        if result.frame_index >= frame_count {
            log::warn!(
                "dropping result for frame {} from batch {}: trajectory has {} frames",
                result.frame_index,
                result.batch_id,
                frame_count
            );
            continue;
        }
        if !seen.insert(result.frame_index) {
            log::warn!(
                "duplicate result for frame {} from batch {} ignored",
                result.frame_index,
                result.batch_id
            );
            continue;
        }

        for (state, forces) in result.forces {
            streams
                .entry(StreamKey::Forces(state))
                .or_default()
                .push(StreamRecord {
                    frame_index: result.frame_index,
                    energy: result.energies.get(&state).copied(),
                    vectors: forces,
                    positions: result.positions.clone(),
                });
        }
        for (pair, vectors) in result.nac {
            streams.entry(StreamKey::Nac(pair)).or_default().push(StreamRecord {
                frame_index: result.frame_index,
                energy: None,
                vectors,
                positions: result.positions.clone(),
            });
        }
    }

    let gaps = streams
        .iter()
        .map(|(key, records)| {
            let present: BTreeSet<usize> = records.iter().map(|r| r.frame_index).collect();
            let missing = (0..frame_count).filter(|i| !present.contains(i)).collect();
            (*key, missing)
        })
        .collect();
    let missing_frames = (0..frame_count).filter(|i| !seen.contains(i)).collect();

    Dataset {
        frame_count,
        streams,
        gaps,
        missing_frames,
    }
}

impl Dataset {
    /// Returns true when every stream covers every frame.
    pub fn is_complete(&self) -> bool {
        self.frame_count > 0
            && self.missing_frames.is_empty()
            && self.gaps.values().all(|g| g.is_empty())
    }

    /// Streams with at least one gap, with their missing frames.
    pub fn incomplete_streams(&self) -> Vec<(StreamKey, &[usize])> {
        self.gaps
            .iter()
            .filter(|(_, g)| !g.is_empty())
            .map(|(k, g)| (*k, g.as_slice()))
            .collect()
    }

    /// Renders one stream as extended XYZ text.
    ///
    /// Positions are the engine's own, so that they share the vectors'
    /// orientation; records without them fall back to `frames` converted to
    /// Bohr. The numeric format is fixed, so equal inputs give
    /// byte-identical text.
    pub fn render_stream(&self, key: StreamKey, frames: &[Frame]) -> String {
        let mut out = String::new();
        let Some(records) = self.streams.get(&key) else {
            return out;
        };
        for record in records {
            let frame = &frames[record.frame_index];
            let info = match (key, record.energy) {
                (StreamKey::Nac(pair), _) => {
                    format!("Units=a.u. States={} frame={}", pair, record.frame_index)
                }
                (StreamKey::Forces(_), Some(energy)) => {
                    format!("Units=a.u. Energy={:.10} frame={}", energy, record.frame_index)
                }
                (StreamKey::Forces(_), None) => format!("Units=a.u. frame={}", record.frame_index),
            };
            let positions = match &record.positions {
                Some(positions) => positions.clone(),
                None => frame.positions_bohr(),
            };
            push_extxyz_record(&mut out, &frame.species, &positions, &record.vectors, &info);
        }
        out
    }

    /// Writes every stream into `out_dir` and returns the written paths.
    ///
    /// `frames` must be the trajectory the results were computed from.
    pub fn write(&self, frames: &[Frame], out_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(self.streams.len());
        for (key, records) in &self.streams {
            let path = out_dir.join(key.file_name());
            write_atomic(&path, self.render_stream(*key, frames).as_bytes())?;
            log::info!("Wrote {} frames to {}", records.len(), path.display());
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn frames(n: usize) -> Vec<Frame> {
        (0..n)
            .map(|i| Frame::new(i, vec!["H".to_string(), "H".to_string()], vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.74 + i as f64 * 0.01]))
            .collect()
    }

    fn result(frame_index: usize, batch_id: usize, with_nac: bool) -> JobResult {
        let v = frame_index as f64;
        let mut forces = BTreeMap::new();
        forces.insert(0, vec![Vector3::new(v, 0.0, 0.0), Vector3::new(-v, 0.0, 0.0)]);
        forces.insert(1, vec![Vector3::new(0.0, v, 0.0), Vector3::new(0.0, -v, 0.0)]);
        let mut energies = BTreeMap::new();
        energies.insert(0, -1.0 - v);
        energies.insert(1, -0.5 - v);
        let mut nac = BTreeMap::new();
        if with_nac {
            nac.insert(StatePair::new(0, 1).unwrap(), vec![Vector3::new(0.0, 0.0, v); 2]);
        }
        JobResult {
            batch_id,
            frame_index,
            energies,
            forces,
            nac,
            positions: None,
            normal_termination: true,
        }
    }

    #[test]
    fn test_order_independent_of_completion_order() {
        let forward: Vec<JobResult> = (0..5).map(|i| result(i, 1 + i / 2, true)).collect();
        let mut shuffled = forward.clone();
        shuffled.swap(0, 4);
        shuffled.swap(1, 3);

        let a = assemble(forward, 5);
        let b = assemble(shuffled, 5);
        assert_eq!(a, b);
        assert!(a.is_complete());
        let order: Vec<usize> = a.streams[&StreamKey::Forces(1)].iter().map(|r| r.frame_index).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_per_stream_gaps() {
        let results = vec![result(0, 1, true), result(1, 1, false), result(3, 2, true)];
        let dataset = assemble(results, 4);

        assert!(!dataset.is_complete());
        assert_eq!(dataset.missing_frames, vec![2]);
        assert_eq!(dataset.gaps[&StreamKey::Forces(0)], vec![2]);
        let nac = StreamKey::Nac(StatePair::new(0, 1).unwrap());
        assert_eq!(dataset.gaps[&nac], vec![1, 2]);
        assert_eq!(dataset.incomplete_streams().len(), 3);
    }

    #[test]
    fn test_duplicates_keep_lowest_batch_and_out_of_range_dropped() {
        let mut late = result(1, 3, true);
        late.energies.insert(0, 99.0);
        let results = vec![late, result(1, 2, true), result(0, 1, true), result(7, 1, true)];
        let dataset = assemble(results, 2);

        let records = &dataset.streams[&StreamKey::Forces(0)];
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].energy, Some(-2.0));
        assert!(dataset.is_complete());
    }

    #[test]
    fn test_write_is_byte_identical_on_rerun() {
        let traj = frames(3);
        let dir = TempDir::new().unwrap();
        let results: Vec<JobResult> = (0..3).map(|i| result(i, 1, true)).collect();

        let first = assemble(results.clone(), 3).write(&traj, dir.path()).unwrap();
        let names: Vec<String> = first
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["forces_0.xyz", "forces_1.xyz", "nacvec_0-1.xyz"]);
        let before: Vec<Vec<u8>> = first.iter().map(|p| std::fs::read(p).unwrap()).collect();

        let mut reversed = results;
        reversed.reverse();
        let second = assemble(reversed, 3).write(&traj, dir.path()).unwrap();
        let after: Vec<Vec<u8>> = second.iter().map(|p| std::fs::read(p).unwrap()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_engine_positions_take_precedence() {
        let traj = frames(1);
        let mut oriented = result(0, 1, false);
        oriented.positions = Some(vec![Vector3::new(-0.7, 0.0, 0.0), Vector3::new(0.7, 0.0, 0.0)]);
        let dataset = assemble(vec![oriented], 1);

        let text = dataset.render_stream(StreamKey::Forces(0), &traj);
        let cols: Vec<f64> = text.lines().nth(3).unwrap().split_whitespace().skip(1).map(|v| v.parse().unwrap()).collect();
        assert_eq!(&cols[..3], &[0.7, 0.0, 0.0]);
    }

    #[test]
    fn test_record_format() {
        let traj = frames(1);
        let dataset = assemble(vec![result(0, 1, true)], 1);

        let forces = dataset.render_stream(StreamKey::Forces(0), &traj);
        let lines: Vec<&str> = forces.lines().collect();
        assert_eq!(lines[0], "2");
        assert_eq!(
            lines[1],
            "Properties=species:S:1:pos:R:3:momenta:R:3 Units=a.u. Energy=-1.0000000000 frame=0 pbc=\"F F F\""
        );
        let z: f64 = lines[3].split_whitespace().nth(3).unwrap().parse().unwrap();
        assert!((z - 0.74 / 0.529177210903).abs() < 1e-7);

        let nac = dataset.render_stream(StreamKey::Nac(StatePair::new(0, 1).unwrap()), &traj);
        assert!(nac.lines().nth(1).unwrap().contains("States=0-1 frame=0"));
    }
}
