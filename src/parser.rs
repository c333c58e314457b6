//! Q-Chem output parsing.
//!
//! This module turns the raw text printed by one engine run into a
//! [`JobResult`]: per-state total energies, per-state forces and
//! non-adiabatic coupling vectors between state pairs. The parser scans the
//! output once, line by line, and recognizes the following sections:
//!
//! | Marker | Extracted data |
//! |--------|----------------|
//! | `Standard Nuclear Orientation (Angstroms)` | geometry in the engine's frame |
//! | `Total energy in final basis set` | ground-state energy |
//! | `TDDFT Excitation Energies` block | excitation energies (eV) |
//! | `Gradient of SCF Energy` ... `Max gradient` | state 0 gradient |
//! | `RPA <n> State Energy is` / `CIS <n> State Energy is` | current excited state |
//! | `Gradient of the state energy` ... `Gradient time` | gradient of the current excited state |
//! | `between states I and J` ... `DC between ... with ETF` | coupling vector I-J |
//! | `Thank you very much for using Q-Chem` | normal termination |
//!
//! Gradients are printed as column blocks of at most six atoms:
//!
//! ```text
//!  Gradient of SCF Energy
//!             1           2           3
//!     1   0.0000000   0.0000000   0.0000000
//!     2   0.0000000   0.0123000  -0.0123000
//!     3  -0.0200000   0.0100000   0.0100000
//!  Max gradient component =       2.000E-02
//! ```
//!
//! Forces are stored as negated gradients. Everything else in the output is
//! ignored.
//!
//! Q-Chem may rotate and translate the molecule into its standard
//! orientation, and every gradient and coupling is printed in that frame. The
//! orientation block is therefore kept as the result's geometry; vectors are
//! only meaningful together with it.

use crate::driver::RawOutput;
use crate::geometry::{Frame, ANGSTROM_TO_BOHR, HARTREE_TO_EV};
use lazy_static::lazy_static;
use nalgebra::Vector3;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

lazy_static! {
    static ref FLOAT: String = r"[-+]?(?:\d+\.\d*|\.\d+)(?:[eE][-+]?\d+)?".to_string();

    // " Total energy in final basis set =      -76.4089004741"
    static ref SCF_ENERGY_RE: Regex = Regex::new(&format!(
        r"Total energy in final basis set\s*=\s*({0})",
        *FLOAT
    )).unwrap();

    static ref TDDFT_HEADER_RE: Regex =
        Regex::new(r"(?:TDDFT|TDDFT/TDA|CIS) Excitation Energies").unwrap();

    // " Excited state   1: excitation energy (eV) =    7.2345"
    static ref EXCITED_RE: Regex = Regex::new(&format!(
        r"Excited state\s+(\d+)\s*:\s*excitation energy \(eV\)\s*=\s*({0})",
        *FLOAT
    )).unwrap();

    // " RPA  1 State Energy is     -76.143037"
    static ref STATE_ENERGY_RE: Regex = Regex::new(&format!(
        r"(?:RPA|CIS)\s+(\d+)\s+State Energy is\s*({0})?",
        *FLOAT
    )).unwrap();

    static ref COUPLING_RE: Regex = Regex::new(r"between states\s+(\d+)\s+and\s+(\d+)").unwrap();
}

const SCF_GRADIENT: &str = "Gradient of SCF Energy";
const SCF_GRADIENT_END: &str = "Max gradient";
const STATE_GRADIENT: &str = "Gradient of the state energy";
const STATE_GRADIENT_END: &str = "Gradient time";
const NORMAL_TERMINATION: &str = "Thank you very much for using Q-Chem";
const ORIENTATION: &str = "Standard Nuclear Orientation (Angstroms)";

/// Unordered pair of electronic states, normalized so that `lo < hi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatePair {
    /// Lower state number
    pub lo: u32,
    /// Higher state number
    pub hi: u32,
}

impl StatePair {
    /// Creates a normalized pair. Returns `None` if both states are equal.
    pub fn new(a: u32, b: u32) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { lo: a, hi: b }),
            std::cmp::Ordering::Greater => Some(Self { lo: b, hi: a }),
            std::cmp::Ordering::Equal => None,
        }
    }
}

impl fmt::Display for StatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.lo, self.hi)
    }
}

/// Parsed quantities of one frame.
///
/// States absent from the output are absent from the maps; nothing is
/// zero-filled. Every vector list has one entry per atom of the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    /// Batch the frame was computed in
    pub batch_id: usize,
    /// Zero-based frame index
    pub frame_index: usize,
    /// Total energy per state (Hartree)
    pub energies: BTreeMap<u32, f64>,
    /// Forces per state (Hartree/Bohr)
    pub forces: BTreeMap<u32, Vec<Vector3<f64>>>,
    /// Non-adiabatic coupling vectors per state pair (1/Bohr)
    pub nac: BTreeMap<StatePair, Vec<Vector3<f64>>>,
    /// Positions (Bohr) in the orientation the vectors refer to; `None` if
    /// the engine kept the input orientation and printed no such block
    pub positions: Option<Vec<Vector3<f64>>>,
    /// Whether the engine printed its normal termination banner
    pub normal_termination: bool,
}

/// Engine output that does not contain the required data.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("frame {frame_index}: {reason}")]
pub struct ParseError {
    /// Zero-based frame index
    pub frame_index: usize,
    /// Description of the defect
    pub reason: String,
}

/// Extracts a [`JobResult`] from raw engine output.
pub trait ResultParser: Send + Sync {
    /// Parses the output of `frame`, computed in batch `batch_id`.
    fn parse(&self, raw: &RawOutput, frame: &Frame, batch_id: usize) -> Result<JobResult, ParseError>;
}

/// Parser for Q-Chem TDDFT gradient and derivative coupling output.
///
/// # Examples
///
/// ```
/// use nacgen::driver::RawOutput;
/// use nacgen::geometry::Frame;
/// use nacgen::parser::{QChemParser, ResultParser};
///
/// let text = " Total energy in final basis set =       -1.1000000000\n\
///             \x20Gradient of SCF Energy\n\
///             \x20           1\n\
///             \x20   1   0.0100000\n\
///             \x20   2   0.0000000\n\
///             \x20   3  -0.0200000\n\
///             \x20Max gradient component =       2.000E-02\n";
/// let frame = Frame::new(0, vec!["H".to_string()], vec![0.0, 0.0, 0.0]);
/// let raw = RawOutput { frame_index: 0, text: text.to_string() };
/// let result = QChemParser::new(vec![0]).parse(&raw, &frame, 1).unwrap();
/// assert_eq!(result.forces[&0][0].x, -0.01);
/// assert_eq!(result.energies[&0], -1.1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct QChemParser {
    required_states: Vec<u32>,
}

impl QChemParser {
    /// Creates a parser that requires force blocks for `required_states`.
    ///
    /// With an empty list any output with at least one force block is
    /// accepted.
    pub fn new(required_states: Vec<u32>) -> Self {
        Self { required_states }
    }
}

/// Accumulates raw sections while scanning an output.
#[derive(Default)]
struct Sections {
    orientation: Option<(Vec<String>, Vec<Vector3<f64>>)>,
    scf_energy: Option<f64>,
    excitation_ev: BTreeMap<u32, f64>,
    state_energies: BTreeMap<u32, f64>,
    gradients: BTreeMap<u32, Vec<Vector3<f64>>>,
    couplings: BTreeMap<StatePair, Vec<Vector3<f64>>>,
    normal_termination: bool,
}

fn parse_float(token: &str) -> Result<f64, String> {
    token
        .parse()
        .map_err(|_| format!("invalid number '{}'", token))
}

fn next_line<'a, I>(lines: &mut I, section: &str) -> Result<&'a str, String>
where
    I: Iterator<Item = &'a str>,
{
    lines
        .next()
        .ok_or_else(|| format!("output ends inside the {} block", section))
}

/// Reads column blocks of a gradient until a line containing `terminator`.
fn read_gradient<'a, I>(lines: &mut I, terminator: &str) -> Result<Vec<Vector3<f64>>, String>
where
    I: Iterator<Item = &'a str>,
{
    let mut gradient = Vec::new();
    loop {
        let header = next_line(lines, "gradient")?;
        if header.contains(terminator) {
            break;
        }
        if header.trim().is_empty() {
            continue;
        }
        let columns: Vec<usize> = header
            .split_whitespace()
            .map(|p| p.parse::<usize>())
            .collect::<Result<_, _>>()
            .map_err(|_| format!("unexpected line in gradient block: '{}'", header.trim()))?;
        if columns.len() > 6 {
            return Err(format!(
                "gradient block header has {} columns, at most 6 expected",
                columns.len()
            ));
        }
        if columns.first() != Some(&(gradient.len() + 1)) {
            return Err(format!(
                "gradient block header '{}' does not continue at atom {}",
                header.trim(),
                gradient.len() + 1
            ));
        }

        let mut rows: [Vec<f64>; 3] = Default::default();
        for row in rows.iter_mut() {
            let line = next_line(lines, "gradient")?;
            *row = line
                .split_whitespace()
                .skip(1)
                .map(parse_float)
                .collect::<Result<_, _>>()?;
            if row.len() != columns.len() {
                return Err(format!(
                    "gradient row '{}' has {} values, {} expected",
                    line.trim(),
                    row.len(),
                    columns.len()
                ));
            }
        }
        for k in 0..columns.len() {
            gradient.push(Vector3::new(rows[0][k], rows[1][k], rows[2][k]));
        }
    }
    Ok(gradient)
}

/// Reads a coupling table: skips to the ETF header, then rows until a
/// dashed line.
fn read_coupling<'a, I>(lines: &mut I, already_at_header: bool) -> Result<Vec<Vector3<f64>>, String>
where
    I: Iterator<Item = &'a str>,
{
    if !already_at_header {
        loop {
            let line = next_line(lines, "derivative coupling")?;
            if line.contains("DC between") && line.contains("with ETF") {
                break;
            }
        }
    }
    for _ in 0..2 {
        next_line(lines, "derivative coupling")?;
    }

    let mut vectors = Vec::new();
    loop {
        let line = next_line(lines, "derivative coupling")?;
        if line.contains("-----") {
            break;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            return Err(format!("malformed coupling row '{}'", line.trim()));
        }
        vectors.push(Vector3::new(
            parse_float(parts[1])?,
            parse_float(parts[2])?,
            parse_float(parts[3])?,
        ));
    }
    Ok(vectors)
}

/// Reads the atom table of an orientation block: skips to the first dashed
/// line, then `index symbol x y z` rows until the next one.
fn read_orientation<'a, I>(lines: &mut I) -> Result<(Vec<String>, Vec<Vector3<f64>>), String>
where
    I: Iterator<Item = &'a str>,
{
    while !next_line(lines, "orientation")?.contains("-----") {}

    let mut species = Vec::new();
    let mut positions = Vec::new();
    loop {
        let line = next_line(lines, "orientation")?;
        if line.contains("-----") {
            return Ok((species, positions));
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            return Err(format!("malformed orientation row '{}'", line.trim()));
        }
        species.push(parts[1].to_string());
        positions.push(Vector3::new(
            parse_float(parts[2])?,
            parse_float(parts[3])?,
            parse_float(parts[4])?,
        ));
    }
}

fn read_excitations<'a, I>(lines: &mut I, into: &mut BTreeMap<u32, f64>) -> Result<(), String>
where
    I: Iterator<Item = &'a str>,
{
    for _ in 0..2 {
        next_line(lines, "excitation energies")?;
    }
    loop {
        let line = next_line(lines, "excitation energies")?;
        if line.contains("-----") {
            return Ok(());
        }
        if let Some(caps) = EXCITED_RE.captures(line) {
            let state: u32 = caps[1]
                .parse()
                .map_err(|_| format!("invalid state number in '{}'", line.trim()))?;
            into.insert(state, parse_float(&caps[2])?);
        }
    }
}

fn scan(text: &str) -> Result<Sections, String> {
    let mut sections = Sections::default();
    let mut current_state: Option<u32> = None;
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        if line.contains(ORIENTATION) {
            let block = read_orientation(&mut lines)?;
            // later blocks belong to follow-up jobs of the same input
            if sections.orientation.is_none() {
                sections.orientation = Some(block);
            }
        } else if let Some(caps) = SCF_ENERGY_RE.captures(line) {
            sections.scf_energy = Some(parse_float(&caps[1])?);
        } else if TDDFT_HEADER_RE.is_match(line) {
            read_excitations(&mut lines, &mut sections.excitation_ev)?;
        } else if let Some(caps) = COUPLING_RE.captures(line) {
            let (i, j): (u32, u32) = match (caps[1].parse(), caps[2].parse()) {
                (Ok(i), Ok(j)) => (i, j),
                _ => return Err(format!("invalid state pair in '{}'", line.trim())),
            };
            let at_header = line.contains("DC between") && line.contains("with ETF");
            let mut vectors = read_coupling(&mut lines, at_header)?;
            let pair = StatePair::new(i, j)
                .ok_or_else(|| format!("coupling of state {} with itself", i))?;
            // d_ji = -d_ij
            if pair.lo != i {
                vectors.iter_mut().for_each(|v| *v = -*v);
            }
            sections.couplings.insert(pair, vectors);
        } else if line.contains(SCF_GRADIENT) {
            let gradient = read_gradient(&mut lines, SCF_GRADIENT_END)?;
            sections.gradients.insert(0, gradient);
        } else if let Some(caps) = STATE_ENERGY_RE.captures(line) {
            let state: u32 = caps[1]
                .parse()
                .map_err(|_| format!("invalid state number in '{}'", line.trim()))?;
            current_state = Some(state);
            if let Some(energy) = caps.get(2) {
                sections.state_energies.insert(state, parse_float(energy.as_str())?);
            }
        } else if line.contains(STATE_GRADIENT) {
            let state = current_state
                .ok_or_else(|| "excited-state gradient without a preceding state line".to_string())?;
            let gradient = read_gradient(&mut lines, STATE_GRADIENT_END)?;
            sections.gradients.insert(state, gradient);
        } else if line.contains(NORMAL_TERMINATION) {
            sections.normal_termination = true;
        }
    }
    Ok(sections)
}

impl ResultParser for QChemParser {
    fn parse(&self, raw: &RawOutput, frame: &Frame, batch_id: usize) -> Result<JobResult, ParseError> {
        let fail = |reason: String| ParseError {
            frame_index: frame.index,
            reason,
        };
        let sections = scan(&raw.text).map_err(fail)?;

        if !sections.normal_termination {
            log::warn!(
                "frame {}: engine output lacks the normal termination banner",
                frame.index
            );
        }

        let mut energies = BTreeMap::new();
        if let Some(e0) = sections.scf_energy {
            energies.insert(0, e0);
            for (&state, &ev) in &sections.excitation_ev {
                energies.insert(state, e0 + ev / HARTREE_TO_EV);
            }
        }
        for (&state, &energy) in &sections.state_energies {
            energies.entry(state).or_insert(energy);
        }

        let natoms = frame.num_atoms();
        let positions = match sections.orientation {
            Some((species, positions)) => {
                if positions.len() != natoms {
                    return Err(fail(format!(
                        "orientation block has {} atoms, frame has {}",
                        positions.len(),
                        natoms
                    )));
                }
                if let Some(i) = (0..natoms).find(|&i| !species[i].eq_ignore_ascii_case(&frame.species[i])) {
                    return Err(fail(format!(
                        "orientation block lists {} as atom {}, frame has {}",
                        species[i],
                        i + 1,
                        frame.species[i]
                    )));
                }
                Some(positions.into_iter().map(|r| r * ANGSTROM_TO_BOHR).collect())
            }
            None => None,
        };
        for (state, gradient) in &sections.gradients {
            if gradient.len() != natoms {
                return Err(fail(format!(
                    "gradient of state {} has {} atoms, frame has {}",
                    state,
                    gradient.len(),
                    natoms
                )));
            }
            if !energies.contains_key(state) {
                return Err(fail(format!("no energy found for state {}", state)));
            }
        }
        for (pair, vectors) in &sections.couplings {
            if vectors.len() != natoms {
                return Err(fail(format!(
                    "coupling vector {} has {} atoms, frame has {}",
                    pair,
                    vectors.len(),
                    natoms
                )));
            }
        }

        if self.required_states.is_empty() {
            if sections.gradients.is_empty() {
                return Err(fail("no force block in engine output".to_string()));
            }
        } else if let Some(missing) = self
            .required_states
            .iter()
            .find(|s| !sections.gradients.contains_key(s))
        {
            return Err(fail(format!("no force block for state {}", missing)));
        }

        let forces = sections
            .gradients
            .into_iter()
            .map(|(state, gradient)| (state, gradient.into_iter().map(|g| -g).collect()))
            .collect();

        Ok(JobResult {
            batch_id,
            frame_index: frame.index,
            energies,
            forces,
            nac: sections.couplings,
            positions,
            normal_termination: sections.normal_termination,
        })
    }
}
