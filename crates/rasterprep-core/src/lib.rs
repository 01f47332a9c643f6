//! # RasterPrep Core
//!
//! Shared types for preparing recorded spiking data for visualization.
//!
//! A completed simulation run is represented as a read-only [`SimulationRun`]:
//! the population registry in creation order, the cell records with their
//! connection lists and tag maps, the recorded spike events as parallel
//! time/gid sequences, and the stimulus deliveries recorded per cell and
//! per stimulus label.
//!
//! This crate provides:
//! - Cell, population, connection and spike-train records
//! - The inclusion specification used to select cells and stimulus labels
//! - The [`SpikeSource`] interface consumed by the preparation pipeline
//! - The [`FigureStore`] interface for persisting prepared figure data

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("Spike retrieval failed: {0}")]
    Retrieval(String),

    #[error("Figure store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RasterError>;

/// Time point (ms)
pub type Time = f64;

/// Global cell identifier, unique within a run
pub type Gid = u64;

/// Closed time interval [start, end] in ms
pub type TimeRange = (Time, Time);

// ============================================================================
// CELLS AND POPULATIONS
// ============================================================================

/// Value of a per-cell tag. Tag sets are sparse and heterogeneous, so a tag
/// present on one cell may be missing or non-numeric on another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Number(f64),
    Text(String),
}

impl TagValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            TagValue::Number(x) => Some(*x),
            TagValue::Text(_) => None,
        }
    }
}

/// Incoming connection onto a cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conn {
    pub pre_gid: Gid,
    pub weight: f64,
    pub delay: f64,   // ms
}

/// A simulated cell: population membership, connection list, and an open
/// tag map holding whatever attributes the model attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub gid: Gid,
    pub pop: String,
    pub conns: Vec<Conn>,
    pub tags: HashMap<String, TagValue>,
}

impl CellRecord {
    pub fn new(gid: Gid, pop: &str) -> Self {
        Self {
            gid,
            pop: pop.to_string(),
            conns: Vec::new(),
            tags: HashMap::new(),
        }
    }

    pub fn with_tag(mut self, name: &str, value: TagValue) -> Self {
        self.tags.insert(name.to_string(), value);
        self
    }
}

/// Population registry entry. The order of entries on the run is the
/// creation order and drives population-based cell ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Population {
    pub name: String,
    pub cell_gids: Vec<Gid>,
}

impl Population {
    pub fn new(name: &str, cell_gids: Vec<Gid>) -> Self {
        Self {
            name: name.to_string(),
            cell_gids,
        }
    }
}

// ============================================================================
// RECORDED SPIKES
// ============================================================================

/// Recorded spike events as parallel time/gid sequences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpikeRecord {
    pub times: Vec<Time>,
    pub gids: Vec<Gid>,
}

impl SpikeRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, time: Time, gid: Gid) {
        self.times.push(time);
        self.gids.push(gid);
    }

    pub fn n_events(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Spike trains organized by cell.
    pub fn spike_trains(&self) -> HashMap<Gid, Vec<Time>> {
        let mut trains: HashMap<Gid, Vec<Time>> = HashMap::new();
        for (&time, &gid) in self.times.iter().zip(self.gids.iter()) {
            trains.entry(gid).or_default().push(time);
        }
        trains
    }
}

// ============================================================================
// SIMULATION RUN
// ============================================================================

/// Run-level configuration echoed from the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Configured total duration (ms)
    pub duration: Time,
    /// Run label, used as the default base name for saved files
    pub label: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            duration: 1000.0,
            label: "run".to_string(),
        }
    }
}

/// Read-only view of a completed simulation run. The preparation pipeline
/// never mutates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationRun {
    pub config: RunConfig,
    /// Population registry in creation order
    pub pops: Vec<Population>,
    pub cells: Vec<CellRecord>,
    /// Recorded spike events for simulated cells
    pub spikes: SpikeRecord,
    /// Stimulus deliveries recorded per cell, keyed by stimulus label
    pub stims: BTreeMap<Gid, BTreeMap<String, Vec<Time>>>,
}

impl SimulationRun {
    pub fn cell(&self, gid: Gid) -> Option<&CellRecord> {
        self.cells.iter().find(|c| c.gid == gid)
    }

    pub fn pop(&self, name: &str) -> Option<&Population> {
        self.pops.iter().find(|p| p.name == name)
    }

    /// All stimulus labels with at least one recorded delivery, sorted.
    pub fn stim_labels(&self) -> Vec<String> {
        let labels: BTreeSet<&String> = self
            .stims
            .values()
            .flat_map(|per_label| per_label.keys())
            .collect();
        labels.into_iter().cloned().collect()
    }
}

// ============================================================================
// INCLUSION SPECIFICATION
// ============================================================================

/// Caller-supplied selector resolved into concrete cells and stimulus labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Include {
    /// Every cell and every stimulus label
    All,
    /// Every cell
    AllCells,
    /// Every stimulus label
    AllNetStims,
    /// Every population's cells
    EachPop,
    /// A population name or a stimulus label
    Name(String),
    /// A single cell
    Gid(Gid),
    /// Cells of a population by relative index within it
    PopSlice { pop: String, indices: Vec<usize> },
}

/// Concrete result of resolving an inclusion specification.
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub cells: Vec<CellRecord>,
    pub gids: Vec<Gid>,
    pub stim_labels: Vec<String>,
}

// ============================================================================
// COLLABORATOR INTERFACES
// ============================================================================

/// Read-only context the preparation pipeline draws on. Implemented by
/// [`SimulationRun`]; test doubles may fail retrieval to exercise the
/// degraded path.
pub trait SpikeSource {
    /// Resolve an inclusion specification into matching cell records, their
    /// gids, and any matched stimulus labels.
    fn resolve_include(&self, include: &[Include]) -> Resolved;

    /// Raw (time, gid) events for the given cells within a range, both ends
    /// inclusive. An empty `gids` slice means all cells.
    fn spikes_between(&self, gids: &[Gid], time_range: Option<TimeRange>) -> Result<SpikeRecord>;

    /// Population names in registry (creation) order.
    fn pop_order(&self) -> Vec<String>;

    /// Configured run duration (ms).
    fn duration(&self) -> Time;

    /// Every recorded delivery time for one stimulus label, across all cells.
    fn stim_times(&self, label: &str) -> Vec<Time>;
}

impl SpikeSource for SimulationRun {
    fn resolve_include(&self, include: &[Include]) -> Resolved {
        let all_labels = self.stim_labels();
        let mut gids: Vec<Gid> = Vec::new();
        let mut seen_gids: HashSet<Gid> = HashSet::new();
        let mut labels: Vec<String> = Vec::new();
        let mut seen_labels: HashSet<String> = HashSet::new();

        fn push_gid(gid: Gid, gids: &mut Vec<Gid>, seen: &mut HashSet<Gid>) {
            if seen.insert(gid) {
                gids.push(gid);
            }
        }
        fn push_label(label: &str, labels: &mut Vec<String>, seen: &mut HashSet<String>) {
            if seen.insert(label.to_string()) {
                labels.push(label.to_string());
            }
        }

        for item in include {
            match item {
                Include::All => {
                    for cell in &self.cells {
                        push_gid(cell.gid, &mut gids, &mut seen_gids);
                    }
                    for label in &all_labels {
                        push_label(label, &mut labels, &mut seen_labels);
                    }
                }
                Include::AllCells => {
                    for cell in &self.cells {
                        push_gid(cell.gid, &mut gids, &mut seen_gids);
                    }
                }
                Include::AllNetStims => {
                    for label in &all_labels {
                        push_label(label, &mut labels, &mut seen_labels);
                    }
                }
                Include::EachPop => {
                    for pop in &self.pops {
                        for &gid in &pop.cell_gids {
                            push_gid(gid, &mut gids, &mut seen_gids);
                        }
                    }
                }
                Include::Name(name) => {
                    if let Some(pop) = self.pop(name) {
                        for &gid in &pop.cell_gids {
                            push_gid(gid, &mut gids, &mut seen_gids);
                        }
                    } else if all_labels.iter().any(|l| l == name) {
                        push_label(name, &mut labels, &mut seen_labels);
                    }
                    // unknown names match nothing
                }
                Include::Gid(gid) => {
                    if self.cell(*gid).is_some() {
                        push_gid(*gid, &mut gids, &mut seen_gids);
                    }
                }
                Include::PopSlice { pop, indices } => {
                    if let Some(pop) = self.pop(pop) {
                        for &i in indices {
                            if let Some(&gid) = pop.cell_gids.get(i) {
                                push_gid(gid, &mut gids, &mut seen_gids);
                            }
                        }
                    }
                }
            }
        }

        let by_gid: HashMap<Gid, &CellRecord> = self.cells.iter().map(|c| (c.gid, c)).collect();
        let cells = gids
            .iter()
            .filter_map(|gid| by_gid.get(gid).map(|&c| c.clone()))
            .collect();

        Resolved {
            cells,
            gids,
            stim_labels: labels,
        }
    }

    fn spikes_between(&self, gids: &[Gid], time_range: Option<TimeRange>) -> Result<SpikeRecord> {
        let wanted: Option<HashSet<Gid>> = if gids.is_empty() {
            None
        } else {
            Some(gids.iter().copied().collect())
        };

        let mut out = SpikeRecord::new();
        for (&time, &gid) in self.spikes.times.iter().zip(self.spikes.gids.iter()) {
            if let Some(wanted) = &wanted {
                if !wanted.contains(&gid) {
                    continue;
                }
            }
            if let Some((start, end)) = time_range {
                if time < start || time > end {
                    continue;
                }
            }
            out.record(time, gid);
        }
        Ok(out)
    }

    fn pop_order(&self) -> Vec<String> {
        self.pops.iter().map(|p| p.name.clone()).collect()
    }

    fn duration(&self) -> Time {
        self.config.duration
    }

    fn stim_times(&self, label: &str) -> Vec<Time> {
        let mut times: Vec<Time> = Vec::new();
        for per_label in self.stims.values() {
            if let Some(spks) = per_label.get(label) {
                times.extend_from_slice(spks);
            }
        }
        times
    }
}

// ============================================================================
// FIGURE PERSISTENCE
// ============================================================================

/// File-naming parameters forwarded to the figure store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveNaming {
    /// Base file name; the store falls back to its own default when absent
    pub file_name: Option<String>,
    /// Requested output format
    pub file_type: Option<String>,
    /// Output directory
    pub file_dir: Option<String>,
}

/// Persistence collaborator for prepared figure data. The pipeline hands a
/// serialized payload plus a short description tag and forgets about it.
pub trait FigureStore {
    fn save(&mut self, desc: &str, data: &serde_json::Value, naming: &SaveNaming) -> Result<()>;
}

/// Figure store writing pretty-printed JSON to `<dir>/<name>_<desc>.json`.
#[derive(Debug, Clone)]
pub struct JsonFigureStore {
    /// Base name used when the caller supplies none
    pub default_name: String,
}

impl JsonFigureStore {
    pub fn new(default_name: &str) -> Self {
        Self {
            default_name: default_name.to_string(),
        }
    }
}

impl Default for JsonFigureStore {
    fn default() -> Self {
        Self::new("figure")
    }
}

impl FigureStore for JsonFigureStore {
    fn save(&mut self, desc: &str, data: &serde_json::Value, naming: &SaveNaming) -> Result<()> {
        if let Some(file_type) = &naming.file_type {
            if file_type != "json" {
                return Err(RasterError::Store(format!(
                    "unsupported figure data format: {}",
                    file_type
                )));
            }
        }

        let name = naming.file_name.as_deref().unwrap_or(&self.default_name);
        let mut path = PathBuf::from(naming.file_dir.as_deref().unwrap_or("."));
        path.push(format!("{}_{}.json", name, desc));

        let text = serde_json::to_string_pretty(data)?;
        fs::write(&path, text)?;
        log::debug!("saved figure data to {}", path.display());
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
