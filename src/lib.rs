#![deny(missing_docs)]

//! nacgen - Distributed Generation of Force and Coupling Training Data
//!
//! nacgen computes, for every geometry of a molecular trajectory, the forces
//! on each electronic state and the non-adiabatic coupling (NAC) vectors
//! between state pairs with an external quantum chemistry engine (Q-Chem),
//! and assembles the results into frame-ordered extended-XYZ files that
//! machine-learned potentials are trained on.
//!
//! # Overview
//!
//! The expensive part, one engine calculation per frame, is embarrassingly
//! parallel. nacgen splits the trajectory into contiguous batches
//! ("parallel images"), submits one scheduling unit per batch to a batch
//! cluster, survives node failures and preemptions by resubmitting evicted
//! units, and merges whatever came back into output streams ordered by frame
//! index:
//!
//! ```text
//! trajectory ──► partition ──► batch 1 ─┐
//!                              batch 2 ─┼─► parse ──► assemble ──► forces_0.xyz
//!                              batch 3 ─┘                          forces_1.xyz
//!                                                                  nacvec_0-1.xyz
//! ```
//!
//! # Failure Handling
//!
//! - **Frame level**: an engine failure (non-zero exit, timeout, missing
//!   output) or unparsable output loses that frame only.
//! - **Batch level**: a unit that fails or is evicted more often than the
//!   retry limit allows loses its batch only.
//! - **Run level**: malformed input and invalid configuration fail the run
//!   before anything is submitted. In strict mode any gap fails the run and
//!   nothing is written; in relaxed mode the available frames are written
//!   together with a gap list.
//!
//! Progress is checkpointed per batch, so an interrupted run resumes by
//! recomputing only the batches without a stored result.
//!
//! # Quick Start
//!
//! ```no_run
//! use nacgen::parser::QChemParser;
//! use nacgen::pipeline::{execute, prepare, scheduler_for};
//! use nacgen::settings::SettingsManager;
//! use std::path::PathBuf;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = SettingsManager::load()?;
//!     let mut config = settings.run_config(PathBuf::from("traj.xyz"), PathBuf::from("grad.in"));
//!     config.parallel_images = 3;
//!
//!     let parser = QChemParser::new(config.states.clone());
//!     let plan = prepare(config)?;
//!     let scheduler = scheduler_for(&plan)?;
//!     let report = execute(plan, scheduler, &parser)?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```
//!
//! # Output Format
//!
//! Every stream holds one extended-XYZ record per frame with positions in
//! Bohr and the per-atom vector in the `momenta` column, all in atomic
//! units:
//!
//! ```text
//! 3
//! Properties=species:S:1:pos:R:3:momenta:R:3 Units=a.u. Energy=-76.4089004741 frame=0 pbc="F F F"
//! O        0.00000000       0.00000000       0.22166345       0.00000000       0.00000000       0.02000000
//! ...
//! ```

/// Merging per-frame results into output streams
pub mod assemble;
/// Run checkpoint and manifest
pub mod checkpoint;
/// Batch scheduling on local threads or SLURM
pub mod cluster;
pub mod config;
/// Engine input deck templates
pub mod deck;
/// Per-batch job driver
pub mod driver;
pub mod engine;
pub mod geometry;
pub mod io;
/// Work directory and output file names
pub mod naming;
pub mod parser;
/// Splitting frames into batches
pub mod partition;
/// Run orchestration
pub mod pipeline;
/// Configuration file management
pub mod settings;

pub use config::RunConfig;
pub use geometry::Frame;
