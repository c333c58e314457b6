//! Trajectory file I/O.
//!
//! This module is the geometry store of a run: it reads the ordered sequence
//! of frames from an (extended) XYZ trajectory. It also holds the writers
//! shared by the output streams and the run state files.
//!
//! # Trajectory Format
//!
//! Each frame consists of:
//! 1. Number of atoms
//! 2. A comment line (ignored, may carry extended-XYZ key=value pairs)
//! 3. One line per atom: `Element X Y Z [extra columns...]` in Ångström
//!
//! Extra columns after the coordinates are ignored, so extended-XYZ files
//! written by other tools (velocities, forces) can be used directly as input.

use crate::geometry::Frame;
use nalgebra::Vector3;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use thiserror::Error;

/// Error type for malformed trajectory input.
///
/// Every variant is fatal for a run: it is raised before any work is
/// submitted to the cluster.
#[derive(Error, Debug)]
pub enum FormatError {
    /// Trajectory file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The atom count line of a frame is not a non-negative integer
    #[error("line {line}: expected atom count, found '{content}'")]
    InvalidAtomCount {
        /// One-based line number
        line: usize,
        /// Offending line content
        content: String,
    },
    /// Declared atom count differs from the number of coordinate lines
    #[error("frame {frame}: declares {declared} atoms but has {found} coordinate lines")]
    AtomCountMismatch {
        /// Zero-based frame index
        frame: usize,
        /// Count from the header line
        declared: usize,
        /// Coordinate lines actually present
        found: usize,
    },
    /// A coordinate line could not be parsed
    #[error("line {line}: invalid coordinate line '{content}'")]
    InvalidCoordinate {
        /// One-based line number
        line: usize,
        /// Offending line content
        content: String,
    },
    /// Two frames describe different molecules
    #[error("frame {frame}: species list differs from frame 0 (the molecule must be fixed across the trajectory)")]
    SpeciesMismatch {
        /// Zero-based index of the first disagreeing frame
        frame: usize,
    },
    /// No frames in the file
    #[error("trajectory contains no frames")]
    Empty,
}

type Result<T> = std::result::Result<T, FormatError>;

/// Loads all frames of a trajectory file in file order.
///
/// # Errors
///
/// Returns a [`FormatError`] if the file cannot be read, if any frame's
/// declared atom count does not match its coordinate lines, or if frames
/// disagree on the species list.
pub fn load_trajectory(path: &Path) -> Result<Vec<Frame>> {
    let content = fs::read_to_string(path)?;
    let frames = parse_trajectory(&content)?;
    log::info!(
        "Loaded {} frames with {} atoms from {}",
        frames.len(),
        frames[0].num_atoms(),
        path.display()
    );
    Ok(frames)
}

/// Parses trajectory text into frames.
///
/// # Examples
///
/// ```
/// use nacgen::io::parse_trajectory;
///
/// let text = "2\nframe 0\nH 0.0 0.0 0.0\nH 0.0 0.0 0.74\n\
///             2\nframe 1\nH 0.0 0.0 0.0\nH 0.0 0.0 0.75\n";
/// let frames = parse_trajectory(text).unwrap();
/// assert_eq!(frames.len(), 2);
/// assert_eq!(frames[1].index, 1);
/// ```
pub fn parse_trajectory(content: &str) -> Result<Vec<Frame>> {
    let lines: Vec<&str> = content.lines().collect();
    let mut frames: Vec<Frame> = Vec::new();
    let mut pos = 0;

    loop {
        // blank lines between frames and at the end of file are tolerated
        while pos < lines.len() && lines[pos].trim().is_empty() {
            pos += 1;
        }
        if pos >= lines.len() {
            break;
        }

        let count_line = lines[pos].trim();
        let declared: usize = match count_line.parse() {
            Ok(n) => n,
            Err(_) => {
                // an atom line where a count is expected means the previous
                // frame had more coordinate lines than it declared
                if let Some(prev) = frames.last() {
                    if looks_like_atom_line(count_line) {
                        let extra = count_atom_lines(&lines[pos..]);
                        return Err(FormatError::AtomCountMismatch {
                            frame: prev.index,
                            declared: prev.num_atoms(),
                            found: prev.num_atoms() + extra,
                        });
                    }
                }
                return Err(FormatError::InvalidAtomCount {
                    line: pos + 1,
                    content: count_line.to_string(),
                });
            }
        };
        let frame_index = frames.len();
        // the comment line must be present even when empty
        pos += 2;

        let available = count_atom_lines(lines.get(pos..).unwrap_or(&[]));
        if available < declared {
            return Err(FormatError::AtomCountMismatch {
                frame: frame_index,
                declared,
                found: available,
            });
        }

        let mut species = Vec::with_capacity(declared);
        let mut positions = Vec::with_capacity(3 * declared);
        for offset in 0..declared {
            let line = lines[pos + offset];
            let parts: Vec<&str> = line.split_whitespace().collect();
            species.push(parts[0].to_string());
            for coord in &parts[1..4] {
                let value: f64 = coord.parse().map_err(|_| FormatError::InvalidCoordinate {
                    line: pos + offset + 1,
                    content: line.trim().to_string(),
                })?;
                positions.push(value);
            }
        }
        pos += declared;

        if let Some(first) = frames.first() {
            if first.species != species {
                return Err(FormatError::SpeciesMismatch { frame: frame_index });
            }
        }
        frames.push(Frame::new(frame_index, species, positions));
    }

    if frames.is_empty() {
        return Err(FormatError::Empty);
    }
    Ok(frames)
}

fn looks_like_atom_line(line: &str) -> bool {
    let parts: Vec<&str> = line.split_whitespace().collect();
    parts.len() >= 4 && parts[0].chars().next().is_some_and(|c| c.is_alphabetic())
}

fn count_atom_lines(lines: &[&str]) -> usize {
    lines.iter().take_while(|l| looks_like_atom_line(l)).count()
}

/// Appends one extended-XYZ record with a per-atom vector column.
///
/// `positions` and `vectors` must both be in atomic units and have one entry
/// per species. The comment line declares the columns so the record can be
/// read back by standard extended-XYZ readers.
pub fn push_extxyz_record(
    out: &mut String,
    species: &[String],
    positions: &[Vector3<f64>],
    vectors: &[Vector3<f64>],
    info: &str,
) {
    let _ = writeln!(out, "{}", species.len());
    let _ = writeln!(
        out,
        "Properties=species:S:1:pos:R:3:momenta:R:3 {} pbc=\"F F F\"",
        info
    );
    for ((symbol, r), v) in species.iter().zip(positions).zip(vectors) {
        let _ = writeln!(
            out,
            "{:<2} {:>16.8} {:>16.8} {:>16.8} {:>16.8} {:>16.8} {:>16.8}",
            symbol, r.x, r.y, r.z, v.x, v.y, v.z
        );
    }
}

/// Atomically replaces `path` with `contents`.
///
/// The data is written to a sibling temporary file first and then renamed
/// over the target, so a reader never observes a half-written file even if
/// the process dies mid-write. Missing parent directories are created.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Serializes `value` as pretty JSON and atomically replaces `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    write_atomic(path, json.as_bytes())
}

/// Reads a JSON file written by [`write_json_atomic`].
pub fn read_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<T> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
