//! Splitting a trajectory into independently schedulable batches.
//!
//! A batch ("parallel image") is a contiguous run of frames that is processed
//! by one scheduling unit on the cluster. Partitioning is deterministic so
//! that a resumed run sees exactly the same batches as the run it continues.

use crate::config::ConfigError;
use crate::geometry::Frame;
use serde::{Deserialize, Serialize};

/// A contiguous subset of frames processed as one scheduling unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// One-based batch id, stable across reruns with the same partition
    pub batch_id: usize,
    /// Zero-based frame indices in processing order
    pub frame_indices: Vec<usize>,
}

impl Batch {
    /// Number of frames in the batch
    pub fn len(&self) -> usize {
        self.frame_indices.len()
    }

    /// Whether the batch holds no frames
    pub fn is_empty(&self) -> bool {
        self.frame_indices.is_empty()
    }

    /// Human-readable frame range, e.g. `4-6`
    pub fn range_label(&self) -> String {
        match (self.frame_indices.first(), self.frame_indices.last()) {
            (Some(first), Some(last)) if first != last => format!("{}-{}", first, last),
            (Some(first), _) => first.to_string(),
            _ => String::from("-"),
        }
    }
}

/// Splits `frames` into `min(parallelism, frames.len())` contiguous batches.
///
/// Batch lengths differ by at most one frame; the longer batches come first.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidValue`] if `parallelism` is zero or `frames`
/// is empty.
///
/// # Examples
///
/// ```
/// use nacgen::geometry::Frame;
/// use nacgen::partition::partition;
///
/// let frames: Vec<Frame> = (0..10)
///     .map(|i| Frame::new(i, vec!["H".to_string()], vec![0.0, 0.0, i as f64]))
///     .collect();
/// let batches = partition(&frames, 3).unwrap();
/// let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
/// assert_eq!(sizes, vec![4, 3, 3]);
/// assert_eq!(batches[1].batch_id, 2);
/// assert_eq!(batches[1].frame_indices, vec![4, 5, 6]);
/// ```
pub fn partition(frames: &[Frame], parallelism: usize) -> Result<Vec<Batch>, ConfigError> {
    if parallelism < 1 {
        return Err(ConfigError::InvalidValue(
            "parallel_images must be at least 1".to_string(),
        ));
    }
    if frames.is_empty() {
        return Err(ConfigError::InvalidValue(
            "cannot partition an empty trajectory".to_string(),
        ));
    }

    let n_batches = parallelism.min(frames.len());
    let base = frames.len() / n_batches;
    let remainder = frames.len() % n_batches;

    let mut batches = Vec::with_capacity(n_batches);
    let mut start = 0;
    for b in 0..n_batches {
        let len = base + usize::from(b < remainder);
        batches.push(Batch {
            batch_id: b + 1,
            frame_indices: frames[start..start + len].iter().map(|f| f.index).collect(),
        });
        start += len;
    }
    Ok(batches)
}
