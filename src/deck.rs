//! Input deck templates for the quantum chemistry engine.
//!
//! A template is an engine input file with a slot for the geometry. Two slot
//! styles are recognized:
//!
//! 1. A literal `{geometry}` placeholder, replaced by the atom lines.
//! 2. A Q-Chem `$molecule` block. The line after `$molecule` (charge and
//!    multiplicity) is kept, the atom lines up to `$end` are replaced.
//!
//! ```text
//! $molecule
//! 0 1
//! C   0.000  0.000  0.000     <- replaced per frame
//! $end
//!
//! $rem
//! method  wb97x-d
//! cis_n_roots 3
//! cis_der_couple true
//! $end
//! ```

use crate::config::ConfigError;
use crate::geometry::Frame;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

const PLACEHOLDER: &str = "{geometry}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GeometrySlot {
    Placeholder,
    /// Line index of `$molecule` and of its closing `$end`
    MoleculeBlock { start: usize, end: usize },
}

/// A loaded input deck template.
#[derive(Debug, Clone)]
pub struct DeckTemplate {
    lines: Vec<String>,
    text: String,
    slot: GeometrySlot,
}

impl DeckTemplate {
    /// Reads and validates a template file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingGeometrySlot`] if the template has no
    /// place for the geometry, or [`ConfigError::Io`] if it cannot be read.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text, &path.display().to_string())
    }

    /// Validates template text; `name` is only used in error messages.
    pub fn parse(text: &str, name: &str) -> Result<Self, ConfigError> {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();

        let slot = if text.contains(PLACEHOLDER) {
            GeometrySlot::Placeholder
        } else {
            let start = lines
                .iter()
                .position(|l| l.trim().to_lowercase().starts_with("$molecule"))
                .ok_or_else(|| ConfigError::MissingGeometrySlot(name.to_string()))?;
            let end = lines[start + 1..]
                .iter()
                .position(|l| l.trim().to_lowercase().starts_with("$end"))
                .map(|offset| start + 1 + offset)
                .ok_or_else(|| {
                    ConfigError::InvalidValue(format!("{}: $molecule block has no $end", name))
                })?;
            if end < start + 2 {
                return Err(ConfigError::InvalidValue(format!(
                    "{}: $molecule block lacks the charge/multiplicity line",
                    name
                )));
            }
            if lines[start + 1].trim().eq_ignore_ascii_case("read") {
                return Err(ConfigError::InvalidValue(format!(
                    "{}: '$molecule read' leaves no room for the frame geometry",
                    name
                )));
            }
            GeometrySlot::MoleculeBlock { start, end }
        };

        Ok(Self {
            lines,
            text: text.to_string(),
            slot,
        })
    }

    /// Renders the deck for one frame.
    pub fn render(&self, frame: &Frame) -> String {
        let geometry = geometry_lines(frame);
        match self.slot {
            GeometrySlot::Placeholder => self.text.replace(PLACEHOLDER, geometry.trim_end()),
            GeometrySlot::MoleculeBlock { start, end } => {
                let mut deck = String::with_capacity(self.text.len() + geometry.len());
                for line in &self.lines[..start + 2] {
                    deck.push_str(line);
                    deck.push('\n');
                }
                deck.push_str(&geometry);
                for line in &self.lines[end..] {
                    deck.push_str(line);
                    deck.push('\n');
                }
                deck
            }
        }
    }
}

/// Formats the atom lines of a frame, one per atom, in Ångström.
pub fn geometry_lines(frame: &Frame) -> String {
    let mut out = String::new();
    for i in 0..frame.num_atoms() {
        let p = frame.atom_position(i);
        let _ = writeln!(
            out,
            "{:>2}    {:+13.10}   {:+13.10}   {:+13.10}",
            frame.species[i], p[0], p[1], p[2]
        );
    }
    out
}
