//! Job driver: runs all frames of one batch through the engine.
//!
//! One driver invocation corresponds to one scheduling unit on the cluster.
//! Frames are processed sequentially in batch order; a failing frame is
//! recorded in its slot and the driver moves on to the next frame, so one
//! non-converging geometry never discards the rest of its batch.

use crate::deck::DeckTemplate;
use crate::engine::{Engine, EngineError};
use crate::geometry::Frame;
use crate::partition::Batch;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Raw engine output of one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOutput {
    /// Zero-based frame index
    pub frame_index: usize,
    /// Captured engine output text
    pub text: String,
}

/// Everything one scheduling unit produced, in frame order.
///
/// This is what a unit persists as its result file and what the gather
/// phase reads back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutput {
    /// Batch the outputs belong to
    pub batch_id: usize,
    /// One entry per frame of the batch
    pub outputs: Vec<Result<RawOutput, EngineError>>,
}

impl BatchOutput {
    /// Number of frames whose engine run failed
    pub fn failure_count(&self) -> usize {
        self.outputs.iter().filter(|o| o.is_err()).count()
    }
}

/// Renders decks and invokes the engine for the frames of a batch.
#[derive(Clone)]
pub struct JobDriver {
    engine: Arc<dyn Engine>,
    template: DeckTemplate,
}

impl JobDriver {
    /// Creates a driver from an engine and a deck template.
    pub fn new(engine: Arc<dyn Engine>, template: DeckTemplate) -> Self {
        Self { engine, template }
    }

    /// Runs every frame of `batch`.
    ///
    /// `frames` is the full trajectory; the batch selects from it by index.
    /// The returned outputs are in batch order, one per frame, with engine
    /// failures kept in place as `Err` entries.
    pub fn run(&self, batch: &Batch, frames: &[Frame]) -> BatchOutput {
        let start = Instant::now();
        log::info!(
            "batch {}: computing {} frames ({})",
            batch.batch_id,
            batch.len(),
            batch.range_label()
        );

        let outputs: Vec<Result<RawOutput, EngineError>> = batch
            .frame_indices
            .iter()
            .map(|&idx| {
                let frame = &frames[idx];
                let deck = self.template.render(frame);
                let result = self.engine.compute(frame, &deck).map(|text| RawOutput {
                    frame_index: idx,
                    text,
                });
                if let Err(e) = &result {
                    log::warn!("batch {}: {}", batch.batch_id, e);
                }
                result
            })
            .collect();

        let output = BatchOutput {
            batch_id: batch.batch_id,
            outputs,
        };
        log::info!(
            "batch {}: finished in {:.1} s, {} of {} frames failed",
            batch.batch_id,
            start.elapsed().as_secs_f64(),
            output.failure_count(),
            batch.len()
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineFailure;
    use crate::partition::partition;
    use std::sync::Mutex;

    /// Echoes the deck back, failing on a chosen frame.
    struct EchoEngine {
        fail_on: usize,
        seen: Mutex<Vec<usize>>,
    }

    impl Engine for EchoEngine {
        fn compute(&self, frame: &Frame, deck: &str) -> Result<String, EngineError> {
            self.seen.lock().unwrap().push(frame.index);
            if frame.index == self.fail_on {
                return Err(EngineError {
                    frame_index: frame.index,
                    cause: EngineFailure::Exit { code: Some(1) },
                });
            }
            Ok(deck.to_string())
        }
    }

    #[test]
    fn test_failure_isolated_to_frame() {
        let frames: Vec<Frame> = (0..6)
            .map(|i| Frame::new(i, vec!["H".to_string()], vec![0.0, 0.0, i as f64]))
            .collect();
        let batches = partition(&frames, 2).unwrap();
        let engine = Arc::new(EchoEngine {
            fail_on: 4,
            seen: Mutex::new(Vec::new()),
        });
        let template = DeckTemplate::parse("{geometry}\n", "deck").unwrap();
        let driver = JobDriver::new(engine.clone(), template);

        let output = driver.run(&batches[1], &frames);
        assert_eq!(output.batch_id, 2);
        assert_eq!(output.outputs.len(), 3);
        assert_eq!(output.failure_count(), 1);
        assert_eq!(output.outputs[0].as_ref().unwrap().frame_index, 3);
        assert_eq!(output.outputs[1].as_ref().unwrap_err().frame_index, 4);
        assert!(output.outputs[2].as_ref().unwrap().text.contains("+5.0000000000"));
        assert_eq!(*engine.seen.lock().unwrap(), vec![3, 4, 5]);
    }
}
