//! Core frame data structures for trajectory geometries.
//!
//! This module provides the fundamental types shared by every stage of a
//! dataset generation run:
//!
//! - [`Frame`]: one molecular geometry snapshot with its position in the trajectory
//! - Unit conversion helpers between Ångström (input) and Bohr (output)
//!
//! Coordinates are stored in Ångström exactly as read from the trajectory file.
//! Conversion to atomic units happens only when output streams are written.

use nalgebra::{DVector, Vector3};

/// Bohr radius in Ångström (CODATA 2018)
pub const BOHR_TO_ANGSTROM: f64 = 0.529177210903;
/// Inverse of [`BOHR_TO_ANGSTROM`]
pub const ANGSTROM_TO_BOHR: f64 = 1.0 / BOHR_TO_ANGSTROM;
/// Hartree in electron volts (CODATA 2018)
pub const HARTREE_TO_EV: f64 = 27.211386245988;

/// Convert coordinates from Angstroms to Bohrs
pub fn angstrom_to_bohr(coords: &DVector<f64>) -> DVector<f64> {
    coords * ANGSTROM_TO_BOHR
}

/// One molecular geometry of an ordered trajectory.
///
/// Frames are created once when the trajectory is loaded and never mutated
/// afterwards. All frames of a run describe the same molecule, so the species
/// list is identical across frames; only positions differ.
///
/// Positions use the flat layout `[x1, y1, z1, x2, y2, z2, ...]`.
///
/// # Examples
///
/// ```
/// use nacgen::geometry::Frame;
///
/// let frame = Frame::new(
///     3,
///     vec!["O".to_string(), "H".to_string(), "H".to_string()],
///     vec![0.0, 0.0, 0.0, 0.757, 0.586, 0.0, -0.757, 0.586, 0.0],
/// );
/// assert_eq!(frame.num_atoms(), 3);
/// assert_eq!(frame.atom_position(1), [0.757, 0.586, 0.0]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Zero-based position of the frame in the trajectory file
    pub index: usize,
    /// Element symbols in atom order
    pub species: Vec<String>,
    /// Flattened Cartesian positions in Ångström
    pub positions: DVector<f64>,
}

impl Frame {
    /// Creates a frame from species and flattened positions.
    ///
    /// # Panics
    ///
    /// Panics if `positions.len() != 3 * species.len()`. The trajectory reader
    /// checks this before constructing frames.
    pub fn new(index: usize, species: Vec<String>, positions: Vec<f64>) -> Self {
        assert_eq!(positions.len(), species.len() * 3);
        Self {
            index,
            species,
            positions: DVector::from_vec(positions),
        }
    }

    /// Number of atoms in the frame
    pub fn num_atoms(&self) -> usize {
        self.species.len()
    }

    /// Cartesian position of one atom in Ångström.
    pub fn atom_position(&self, atom_idx: usize) -> [f64; 3] {
        let i = atom_idx * 3;
        [self.positions[i], self.positions[i + 1], self.positions[i + 2]]
    }

    /// Positions in Bohr as one vector per atom.
    pub fn positions_bohr(&self) -> Vec<Vector3<f64>> {
        let bohr = angstrom_to_bohr(&self.positions);
        bohr.as_slice()
            .chunks_exact(3)
            .map(|xyz| Vector3::new(xyz[0], xyz[1], xyz[2]))
            .collect()
    }
}
