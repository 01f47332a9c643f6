//! # RasterPrep Spikes
//!
//! Preparation of recorded spike trains for raster and spike-histogram
//! figures.
//!
//! One pipeline, three stages, composed sequentially:
//!
//! 1. Cell selection and ordering: resolve the inclusion specification,
//!    build a table of the selected cells, sort it by the requested key.
//!    Row position after sorting is the cell's plot index.
//! 2. Spike retrieval and windowing: fetch raw (time, gid) events, translate
//!    gids to plot indices, append stimulus spikes above the real cells,
//!    clip to the time window, cap the event count.
//! 3. Statistics and packaging: per-population counts and firing rates,
//!    axis/legend/title text, one flat [`SpikeData`] result.
//!
//! The pipeline is synchronous and never mutates the simulation context.
//! The worst outcome of any failure is an empty or absent result: retrieval
//! errors degrade to no events and a zero-event preparation returns `None`.

use std::collections::{HashMap, HashSet};
use std::fmt;

use log::{debug, warn};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use rasterprep_core::{
    CellRecord, FigureStore, Gid, Include, SaveNaming, SpikeRecord, SpikeSource, TagValue, Time,
    TimeRange,
};

/// Pseudo-population appended after real cells for stimulus spikes
pub const NETSTIM_POP: &str = "NetStims";

/// Description tag handed to the figure store
pub const SPIKE_DATA_DESC: &str = "spike_data";

/// Default cap on prepared events
pub const DEFAULT_MAX_SPIKES: usize = 100_000_000;

// ============================================================================
// OPTIONS
// ============================================================================

/// Population-rate reporting mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateMode {
    Off,
    Full,
    Minimal,
}

/// Ordering key for the cell table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderBy {
    /// Numeric cell identifier
    Gid,
    /// Population membership, ranked by registry order
    Pop,
    /// A numeric cell tag
    Tag(String),
    /// Several keys, applied lexicographically
    Multi(Vec<OrderBy>),
}

impl Default for OrderBy {
    fn default() -> Self {
        OrderBy::Gid
    }
}

/// Parameters of a preparation call. All fields have defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareOptions {
    /// Which cells and stimulus labels to include
    pub include: Vec<Include>,
    /// Requested time window; `None` means the whole run
    pub time_range: Option<TimeRange>,
    /// Cap on the total event count
    pub max_spikes: usize,
    pub order_by: OrderBy,
    pub pop_rates: RateMode,
    /// Display tag per spike category, keyed by population name
    pub colors: HashMap<String, String>,
    /// Explicit figure title; wins verbatim over the generated one
    pub title: Option<String>,
    /// Hand the packaged result to the figure store
    pub save: bool,
    pub naming: SaveNaming,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            include: vec![Include::AllCells],
            time_range: None,
            max_spikes: DEFAULT_MAX_SPIKES,
            order_by: OrderBy::Gid,
            pop_rates: RateMode::Full,
            colors: HashMap::new(),
            title: None,
            save: false,
            naming: SaveNaming::default(),
        }
    }
}

impl PrepareOptions {
    /// Defaults for a raster figure.
    pub fn raster() -> Self {
        Self::default()
    }

    /// Defaults for a spike-histogram figure: every population plus the
    /// whole-network trace, ordered by gid.
    pub fn hist() -> Self {
        Self {
            include: vec![Include::EachPop, Include::AllCells],
            ..Self::default()
        }
    }
}

// ============================================================================
// CELL TABLE
// ============================================================================

/// Resolved sort key. Every component compares as a number: the gid, the
/// population's registry rank, or a numeric tag (missing values sort last).
#[derive(Debug, Clone, PartialEq)]
enum SortKey {
    Gid,
    PopRank,
    Tag(String),
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortKey::Gid => write!(f, "gid"),
            SortKey::PopRank => write!(f, "pop"),
            SortKey::Tag(name) => write!(f, "{}", name),
        }
    }
}

/// Resolve the requested ordering against the actual cell attributes.
/// Fallbacks are silent policy, evaluated top to bottom:
/// a single tag that is missing or non-numeric becomes the gid; the
/// population marker becomes a registry rank; inside a key list the same
/// rules apply per element.
fn resolve_order(order_by: &OrderBy, cells: &[CellRecord]) -> Vec<SortKey> {
    match order_by {
        OrderBy::Gid => vec![SortKey::Gid],
        OrderBy::Pop => vec![SortKey::PopRank],
        OrderBy::Tag(name) => vec![resolve_tag(name, cells)],
        OrderBy::Multi(items) => items
            .iter()
            .flat_map(|item| resolve_order(item, cells))
            .collect(),
    }
}

fn resolve_tag(name: &str, cells: &[CellRecord]) -> SortKey {
    match cells.first().and_then(|c| c.tags.get(name)) {
        Some(TagValue::Number(_)) => SortKey::Tag(name.to_string()),
        _ => SortKey::Gid,
    }
}

fn order_label(keys: &[SortKey]) -> String {
    if keys.len() == 1 {
        keys[0].to_string()
    } else {
        let names: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        format!("[{}]", names.join(", "))
    }
}

fn key_value(cell: &CellRecord, key: &SortKey, pop_rank: &HashMap<String, usize>) -> f64 {
    match key {
        SortKey::Gid => cell.gid as f64,
        SortKey::PopRank => pop_rank
            .get(&cell.pop)
            .map(|&r| r as f64)
            .unwrap_or(f64::NAN),
        SortKey::Tag(name) => cell
            .tags
            .get(name)
            .and_then(|v| v.as_number())
            .unwrap_or(f64::NAN),
    }
}

fn cmp_keys(a: &[f64], b: &[f64]) -> std::cmp::Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = x.total_cmp(y);
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

/// One row of the sorted cell table.
#[derive(Debug, Clone, PartialEq)]
pub struct CellRow {
    pub gid: Gid,
    pub pop: String,
    pub num_conns: usize,
}

/// The selected cells sorted by the resolved ordering key. Row position is
/// the plot index and stays fixed for the rest of the pipeline.
#[derive(Debug, Clone, Default)]
pub struct CellTable {
    rows: Vec<CellRow>,
    index: HashMap<Gid, usize>,
}

impl CellTable {
    fn build(cells: &[CellRecord], keys: &[SortKey], pop_rank: &HashMap<String, usize>) -> Self {
        if cells.is_empty() {
            return Self::default();
        }

        let cell_keys: Vec<Vec<f64>> = cells
            .iter()
            .map(|c| keys.iter().map(|k| key_value(c, k, pop_rank)).collect())
            .collect();

        // stable sort: ties keep the resolution order
        let mut order: Vec<usize> = (0..cells.len()).collect();
        order.sort_by(|&a, &b| cmp_keys(&cell_keys[a], &cell_keys[b]));

        let rows: Vec<CellRow> = order
            .iter()
            .map(|&i| CellRow {
                gid: cells[i].gid,
                pop: cells[i].pop.clone(),
                num_conns: cells[i].conns.len(),
            })
            .collect();
        let index = rows
            .iter()
            .enumerate()
            .map(|(row, r)| (r.gid, row))
            .collect();

        Self { rows, index }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[CellRow] {
        &self.rows
    }

    /// Plot index of a cell.
    pub fn row_of(&self, gid: Gid) -> Option<usize> {
        self.index.get(&gid).copied()
    }
}

// ============================================================================
// PREPARED DATA
// ============================================================================

/// One windowed event: a time, the plot index it renders at, and for
/// stimulus spikes the display tag of their category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotSpike {
    pub time: Time,
    pub index: usize,
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisArgs {
    pub xlabel: String,
    pub ylabel: String,
    pub title: String,
}

/// The packaged result of a preparation call, ready for rendering or
/// persistence. `pop_num_cells` and `legend_labels` are row-aligned with
/// `pop_labels`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeData {
    pub spk_times: Vec<Time>,
    pub spk_inds: Vec<usize>,
    pub spk_colors: Vec<Option<String>>,
    pub pop_labels: Vec<String>,
    pub pop_num_cells: Vec<usize>,
    pub num_net_stims: usize,
    pub include: Vec<Include>,
    pub time_range: TimeRange,
    pub max_spikes: usize,
    pub order_by: OrderBy,
    pub axis_args: AxisArgs,
    pub legend_labels: Vec<String>,
}

// ============================================================================
// PREPARATION PIPELINE
// ============================================================================

/// Prepare spike data for plotting. Returns `None` when the selection yields
/// no events at all ("nothing to plot").
pub fn prepare_spike_data<S: SpikeSource>(
    sim: &S,
    opts: &PrepareOptions,
    store: Option<&mut dyn FigureStore>,
) -> Option<SpikeData> {
    debug!("preparing spike data");

    // Stage 1: selection and ordering
    let resolved = sim.resolve_include(&opts.include);
    let registry = sim.pop_order();
    let pop_rank: HashMap<String, usize> = registry
        .iter()
        .enumerate()
        .map(|(rank, name)| (name.clone(), rank))
        .collect();

    let keys = resolve_order(&opts.order_by, &resolved.cells);
    let table = CellTable::build(&resolved.cells, &keys, &pop_rank);

    let mut ylabel = if table.is_empty() {
        String::new()
    } else {
        format!("Cells (ordered by {})", order_label(&keys))
    };

    // population labels in registry order, filtered to those present
    let present: HashSet<&str> = resolved.cells.iter().map(|c| c.pop.as_str()).collect();
    let mut pop_labels: Vec<String> = registry
        .iter()
        .filter(|name| present.contains(name.as_str()))
        .cloned()
        .collect();
    if !resolved.stim_labels.is_empty() {
        pop_labels.push(NETSTIM_POP.to_string());
    }

    // Stage 2: retrieval and windowing
    let mut sel: Vec<PlotSpike> = Vec::new();
    if !resolved.gids.is_empty() {
        // an empty gid list is the fast path for the whole network
        let query: &[Gid] = if opts.include == [Include::AllCells] {
            &[]
        } else {
            &resolved.gids
        };
        let events = match sim.spikes_between(query, opts.time_range) {
            Ok(events) => events,
            Err(err) => {
                warn!("spike retrieval failed, preparing without events: {}", err);
                SpikeRecord::default()
            }
        };
        if !table.is_empty() {
            for (&time, &gid) in events.times.iter().zip(events.gids.iter()) {
                if let Some(index) = table.row_of(gid) {
                    sel.push(PlotSpike {
                        time,
                        index,
                        color: None,
                    });
                }
            }
        }
    }
    let num_cell_spks = sel.len();

    // stimulus spikes render above real cells, one index per label
    let mut num_net_stims = 0usize;
    let stim_color = opts.colors.get(NETSTIM_POP).cloned();
    for label in &resolved.stim_labels {
        let times = sim.stim_times(label);
        if times.is_empty() {
            continue;
        }
        let index = table.len() + num_net_stims;
        for time in times {
            sel.push(PlotSpike {
                time,
                index,
                color: stim_color.clone(),
            });
        }
        num_net_stims += 1;
    }

    if !resolved.gids.is_empty() && num_net_stims > 0 {
        ylabel.push_str(" and NetStims (at the end)");
    } else if num_net_stims > 0 {
        ylabel.push_str(NETSTIM_POP);
    }

    if num_cell_spks + num_net_stims == 0 {
        debug!("no spikes available to plot");
        return None;
    }

    let duration = sim.duration();
    let mut time_range = match opts.time_range {
        Some(range) if range == (0.0, duration) => range,
        None => (0.0, duration),
        Some(range) => {
            sel.retain(|s| s.time >= range.0 && s.time <= range.1);
            range
        }
    };

    if sel.len() > opts.max_spikes {
        debug!(
            "showing only the first {} out of {} spikes",
            opts.max_spikes,
            sel.len()
        );
        if num_net_stims > 0 {
            // stimulus events were appended after real ones and are not
            // time-ordered relative to them
            sel.sort_by(|a, b| a.time.total_cmp(&b.time));
        }
        sel.truncate(opts.max_spikes);
        if let Some(last) = sel.iter().map(|s| s.time).reduce(f64::max) {
            time_range.1 = last;
        }
    }

    // Stage 3: statistics and packaging
    let mut pop_num_cells: Vec<usize> = if num_cell_spks > 0 {
        pop_labels
            .iter()
            .map(|pop| table.rows().iter().filter(|r| &r.pop == pop).count())
            .collect()
    } else {
        vec![0; pop_labels.len()]
    };
    let pop_num_conns: Vec<usize> = pop_labels
        .iter()
        .map(|pop| {
            table
                .rows()
                .iter()
                .filter(|r| &r.pop == pop)
                .map(|r| r.num_conns)
                .sum()
        })
        .collect();

    let total_spikes = sel.len();
    let total_connections: usize = table.rows().iter().map(|r| r.num_conns).sum();
    let num_cells = resolved.cells.len();
    let window = time_range.1 - time_range.0;

    let firing_rate = if total_spikes > 0 {
        total_spikes as f64 / (num_cells + num_net_stims) as f64 / window * 1e3
    } else {
        0.0
    };
    let conns_per_cell = if num_cells > 0 {
        total_connections as f64 / num_cells as f64
    } else {
        0.0
    };
    let pop_conns_per_cell: Vec<f64> = pop_num_conns
        .iter()
        .zip(pop_num_cells.iter())
        .map(|(&conns, &cells)| {
            if cells > 0 {
                conns as f64 / cells as f64
            } else {
                0.0
            }
        })
        .collect();

    let mut title = "Raster plot of spiking".to_string();
    let mut legend_labels: Vec<String> = Vec::new();

    if opts.pop_rates != RateMode::Off {
        let tsecs = window / 1e3;
        let n_rows = table.len();
        let mut avg_rates: Vec<Option<f64>> = vec![None; pop_labels.len()];

        for (i, pop) in pop_labels.iter().enumerate() {
            if num_cells == 0 || pop == NETSTIM_POP {
                continue;
            }
            let rate = if num_cell_spks == 0 || pop_num_cells[i] == 0 {
                0.0
            } else {
                let count = sel
                    .iter()
                    .filter(|s| s.index < n_rows && table.rows()[s.index].pop == *pop)
                    .count();
                count as f64 / pop_num_cells[i] as f64 / tsecs
            };
            avg_rates[i] = Some(rate);
        }

        if num_net_stims > 0 {
            let last = pop_labels.len() - 1;
            pop_num_cells[last] = num_net_stims;
            let stim_count = sel.iter().filter(|s| s.index >= n_rows).count();
            avg_rates[last] = Some(stim_count as f64 / num_net_stims as f64 / tsecs);
        }

        for (i, pop) in pop_labels.iter().enumerate() {
            let rate = match avg_rates[i] {
                Some(rate) => rate,
                None => continue,
            };
            let label = match opts.pop_rates {
                RateMode::Minimal => format!("{} ({} Hz)", pop, sig3(rate)),
                _ => format!(
                    "{}\n  cells: {}\n  syn/cell: {:.1}\n  rate: {} Hz",
                    pop,
                    pop_num_cells[i],
                    pop_conns_per_cell[i],
                    sig3(rate)
                ),
            };
            legend_labels.push(label);
        }

        title = format!(
            "cells: {}   syn/cell: {:.1}   rate: {:.1} Hz",
            num_cells, conns_per_cell, firing_rate
        );
    }

    if let Some(explicit) = &opts.title {
        title = explicit.clone();
    }

    let data = SpikeData {
        spk_times: sel.iter().map(|s| s.time).collect(),
        spk_inds: sel.iter().map(|s| s.index).collect(),
        spk_colors: sel.iter().map(|s| s.color.clone()).collect(),
        pop_labels,
        pop_num_cells,
        num_net_stims,
        include: opts.include.clone(),
        time_range,
        max_spikes: opts.max_spikes,
        order_by: opts.order_by.clone(),
        axis_args: AxisArgs {
            xlabel: "Time (ms)".to_string(),
            ylabel,
            title,
        },
        legend_labels,
    };

    if opts.save {
        if let Some(store) = store {
            match serde_json::to_value(&data) {
                Ok(value) => {
                    if let Err(err) = store.save(SPIKE_DATA_DESC, &value, &opts.naming) {
                        warn!("failed to save spike data: {}", err);
                    }
                }
                Err(err) => warn!("failed to serialize spike data: {}", err),
            }
        }
    }

    Some(data)
}

/// Prepare data for a raster plot.
pub fn prepare_raster<S: SpikeSource>(
    sim: &S,
    opts: &PrepareOptions,
    store: Option<&mut dyn FigureStore>,
) -> Option<SpikeData> {
    prepare_spike_data(sim, opts, store)
}

/// Prepare data for a spike histogram: same pipeline, gid ordering, and the
/// y axis relabeled to a count.
pub fn prepare_spike_hist<S: SpikeSource>(
    sim: &S,
    opts: &PrepareOptions,
    store: Option<&mut dyn FigureStore>,
) -> Option<SpikeData> {
    let mut opts = opts.clone();
    opts.order_by = OrderBy::Gid;
    let mut data = prepare_spike_data(sim, &opts, store)?;
    data.axis_args.ylabel = "Number of spikes".to_string();
    Some(data)
}

// ============================================================================
// HISTOGRAM BINNING
// ============================================================================

/// Bin spike times over a window. Returns bin centers and per-bin counts;
/// an event exactly at the window end lands in the last bin.
pub fn bin_spike_counts(
    times: &[Time],
    time_range: TimeRange,
    bin_size: Time,
) -> (Array1<f64>, Array1<f64>) {
    let (start, end) = time_range;
    let span = end - start;
    if bin_size <= 0.0 || span <= 0.0 {
        return (Array1::zeros(0), Array1::zeros(0));
    }

    let n_bins = (span / bin_size).ceil() as usize;
    let centers = Array1::from_iter((0..n_bins).map(|i| start + (i as f64 + 0.5) * bin_size));
    let mut counts = Array1::zeros(n_bins);

    for &time in times {
        if time < start || time > end {
            continue;
        }
        let bin = (((time - start) / bin_size).floor() as usize).min(n_bins - 1);
        counts[bin] += 1.0;
    }

    (centers, counts)
}

// ============================================================================
// FORMATTING
// ============================================================================

/// Three significant digits, trailing zeros trimmed, scientific notation for
/// large or tiny magnitudes.
fn sig3(value: f64) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{}", value);
    }
    let exp = value.abs().log10().floor() as i32;
    if exp < -4 || exp >= 3 {
        let mantissa = value / 10f64.powi(exp);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_zeros(&format!("{:.2}", mantissa)), sign, exp.abs())
    } else {
        let decimals = (2 - exp).max(0) as usize;
        trim_zeros(&format!("{:.*}", decimals, value))
    }
}

fn trim_zeros(text: &str) -> String {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text.to_string()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rasterprep_core::{
        Conn, Population, RasterError, Resolved, Result as CoreResult, RunConfig, SimulationRun,
    };

    fn conn(pre_gid: Gid) -> Conn {
        Conn {
            pre_gid,
            weight: 0.5,
            delay: 1.0,
        }
    }

    /// Two populations in deliberately non-alphabetical registry order, plus
    /// two stimulus labels. Duration 1000 ms.
    fn demo_run() -> SimulationRun {
        let mut run = SimulationRun {
            config: RunConfig {
                duration: 1000.0,
                label: "demo".to_string(),
            },
            pops: vec![
                Population::new("S2", vec![0, 1]),
                Population::new("M1", vec![2, 3]),
            ],
            cells: vec![
                CellRecord::new(0, "S2").with_tag("y", TagValue::Number(0.3)),
                CellRecord::new(1, "S2").with_tag("y", TagValue::Number(0.1)),
                CellRecord::new(2, "M1").with_tag("y", TagValue::Number(0.4)),
                CellRecord::new(3, "M1").with_tag("y", TagValue::Number(0.2)),
            ],
            ..Default::default()
        };
        for cell in &mut run.cells {
            cell.tags
                .insert("cellType".to_string(), TagValue::Text("PYR".to_string()));
        }
        run.cells[0].conns = vec![conn(2), conn(3)];
        run.cells[1].conns = vec![conn(2)];
        run.cells[2].conns = vec![conn(0), conn(1), conn(3)];

        run.spikes.record(100.0, 0);
        run.spikes.record(200.0, 1);
        run.spikes.record(300.0, 0);
        run.spikes.record(400.0, 2);
        run.spikes.record(500.0, 3);
        run.spikes.record(900.0, 1);

        run.stims
            .entry(0)
            .or_default()
            .insert("bkg".to_string(), vec![150.0, 650.0]);
        run.stims
            .entry(2)
            .or_default()
            .insert("bkg".to_string(), vec![250.0]);
        run.stims
            .entry(3)
            .or_default()
            .insert("noise".to_string(), vec![750.0]);
        run
    }

    fn index_of_time(data: &SpikeData, time: f64) -> usize {
        let at = data
            .spk_times
            .iter()
            .position(|&t| t == time)
            .expect("event time present");
        data.spk_inds[at]
    }

    struct FailingSource(SimulationRun);

    impl SpikeSource for FailingSource {
        fn resolve_include(&self, include: &[Include]) -> Resolved {
            self.0.resolve_include(include)
        }
        fn spikes_between(
            &self,
            _gids: &[Gid],
            _time_range: Option<TimeRange>,
        ) -> CoreResult<SpikeRecord> {
            Err(RasterError::Retrieval("recorder went away".to_string()))
        }
        fn pop_order(&self) -> Vec<String> {
            self.0.pop_order()
        }
        fn duration(&self) -> Time {
            self.0.duration()
        }
        fn stim_times(&self, label: &str) -> Vec<Time> {
            self.0.stim_times(label)
        }
    }

    #[derive(Default)]
    struct CountingStore {
        calls: usize,
    }

    impl FigureStore for CountingStore {
        fn save(
            &mut self,
            _desc: &str,
            _data: &serde_json::Value,
            _naming: &SaveNaming,
        ) -> CoreResult<()> {
            self.calls += 1;
            Ok(())
        }
    }

    #[test]
    fn test_empty_selection_is_nothing_to_plot() {
        let run = demo_run();
        let opts = PrepareOptions {
            include: vec![Include::Name("nope".to_string())],
            ..Default::default()
        };
        assert!(prepare_spike_data(&run, &opts, None).is_none());
    }

    #[test]
    fn test_indices_follow_gid_order() {
        let run = demo_run();
        let data = prepare_spike_data(&run, &PrepareOptions::default(), None).unwrap();
        assert_eq!(index_of_time(&data, 100.0), 0);
        assert_eq!(index_of_time(&data, 200.0), 1);
        assert_eq!(index_of_time(&data, 400.0), 2);
        assert_eq!(index_of_time(&data, 500.0), 3);
        assert_eq!(data.axis_args.ylabel, "Cells (ordered by gid)");
    }

    #[test]
    fn test_indices_follow_numeric_tag_order() {
        let run = demo_run();
        let opts = PrepareOptions {
            order_by: OrderBy::Tag("y".to_string()),
            ..Default::default()
        };
        let data = prepare_spike_data(&run, &opts, None).unwrap();
        // sorted by y: gid 1 (0.1), gid 3 (0.2), gid 0 (0.3), gid 2 (0.4)
        assert_eq!(index_of_time(&data, 100.0), 2);
        assert_eq!(index_of_time(&data, 200.0), 0);
        assert_eq!(index_of_time(&data, 400.0), 3);
        assert_eq!(index_of_time(&data, 500.0), 1);
        assert_eq!(data.axis_args.ylabel, "Cells (ordered by y)");
    }

    #[test]
    fn test_pop_order_uses_registry_not_alphabet() {
        let run = demo_run();
        let opts = PrepareOptions {
            order_by: OrderBy::Pop,
            ..Default::default()
        };
        let data = prepare_spike_data(&run, &opts, None).unwrap();
        // S2 precedes M1 in the registry, ties keep gid order
        assert_eq!(index_of_time(&data, 100.0), 0);
        assert_eq!(index_of_time(&data, 200.0), 1);
        assert_eq!(index_of_time(&data, 400.0), 2);
        assert_eq!(index_of_time(&data, 500.0), 3);
        assert_eq!(data.axis_args.ylabel, "Cells (ordered by pop)");
    }

    #[test]
    fn test_multi_key_order() {
        let run = demo_run();
        let opts = PrepareOptions {
            order_by: OrderBy::Multi(vec![OrderBy::Pop, OrderBy::Tag("y".to_string())]),
            ..Default::default()
        };
        let data = prepare_spike_data(&run, &opts, None).unwrap();
        // S2 by y: gid 1 then gid 0; M1 by y: gid 3 then gid 2
        assert_eq!(index_of_time(&data, 100.0), 1);
        assert_eq!(index_of_time(&data, 200.0), 0);
        assert_eq!(index_of_time(&data, 400.0), 3);
        assert_eq!(index_of_time(&data, 500.0), 2);
        assert_eq!(data.axis_args.ylabel, "Cells (ordered by [pop, y])");
    }

    #[test]
    fn test_unknown_or_text_tag_falls_back_to_gid() {
        let run = demo_run();
        for order_by in [
            OrderBy::Tag("zzz".to_string()),
            OrderBy::Tag("cellType".to_string()),
        ] {
            let opts = PrepareOptions {
                order_by,
                ..Default::default()
            };
            let data = prepare_spike_data(&run, &opts, None).unwrap();
            assert_eq!(index_of_time(&data, 100.0), 0);
            assert_eq!(index_of_time(&data, 500.0), 3);
            assert_eq!(data.axis_args.ylabel, "Cells (ordered by gid)");
        }
    }

    #[test]
    fn test_stim_indices_sit_above_real_cells() {
        let run = demo_run();
        let opts = PrepareOptions {
            include: vec![Include::All],
            colors: HashMap::from([(NETSTIM_POP.to_string(), "gray".to_string())]),
            ..Default::default()
        };
        let data = prepare_spike_data(&run, &opts, None).unwrap();

        assert_eq!(data.num_net_stims, 2);
        let max_real = data
            .spk_inds
            .iter()
            .zip(data.spk_colors.iter())
            .filter(|(_, color)| color.is_none())
            .map(|(&i, _)| i)
            .max()
            .unwrap();
        let stim_inds: HashSet<usize> = data
            .spk_inds
            .iter()
            .zip(data.spk_colors.iter())
            .filter(|(_, color)| color.is_some())
            .map(|(&i, _)| i)
            .collect();

        assert_eq!(max_real, 3);
        assert_eq!(stim_inds, HashSet::from([4, 5]));
        assert!(stim_inds.iter().all(|&i| i > max_real));
        // label blocks: bkg below noise
        assert_eq!(index_of_time(&data, 150.0), 4);
        assert_eq!(index_of_time(&data, 750.0), 5);
        assert!(data
            .spk_colors
            .iter()
            .filter_map(|c| c.as_ref())
            .all(|c| c == "gray"));
        assert_eq!(
            data.axis_args.ylabel,
            "Cells (ordered by gid) and NetStims (at the end)"
        );
    }

    #[test]
    fn test_preparation_is_deterministic() {
        let run = demo_run();
        let opts = PrepareOptions {
            include: vec![Include::All],
            order_by: OrderBy::Multi(vec![OrderBy::Pop, OrderBy::Tag("y".to_string())]),
            ..Default::default()
        };
        let first = prepare_spike_data(&run, &opts, None).unwrap();
        let second = prepare_spike_data(&run, &opts, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_window_is_inclusive_on_both_ends() {
        let run = demo_run();
        let opts = PrepareOptions {
            include: vec![Include::All],
            time_range: Some((200.0, 500.0)),
            ..Default::default()
        };
        let data = prepare_spike_data(&run, &opts, None).unwrap();
        assert!(data.spk_times.contains(&200.0));
        assert!(data.spk_times.contains(&500.0));
        assert!(!data.spk_times.contains(&100.0));
        assert!(!data.spk_times.contains(&900.0));
        // stimulus events are windowed too
        assert!(data.spk_times.contains(&250.0));
        assert!(!data.spk_times.contains(&750.0));
        assert_eq!(data.time_range, (200.0, 500.0));
    }

    #[test]
    fn test_cap_truncates_in_time_order() {
        let run = demo_run();
        let opts = PrepareOptions {
            include: vec![Include::All],
            max_spikes: 5,
            ..Default::default()
        };
        let data = prepare_spike_data(&run, &opts, None).unwrap();
        assert_eq!(data.spk_times.len(), 5);
        assert!(data.spk_times.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(data.spk_times, vec![100.0, 150.0, 200.0, 250.0, 300.0]);
        assert_eq!(data.time_range.1, 300.0);
    }

    #[test]
    fn test_pop_cell_counts_sum_to_total() {
        let run = demo_run();
        let opts = PrepareOptions {
            include: vec![Include::All],
            ..Default::default()
        };
        let data = prepare_spike_data(&run, &opts, None).unwrap();
        assert_eq!(
            data.pop_labels,
            vec!["S2".to_string(), "M1".to_string(), NETSTIM_POP.to_string()]
        );
        let real_total: usize = data
            .pop_labels
            .iter()
            .zip(data.pop_num_cells.iter())
            .filter(|(label, _)| label.as_str() != NETSTIM_POP)
            .map(|(_, &n)| n)
            .sum();
        assert_eq!(real_total, 4);
        // the pseudo-population slot reports the stimulus group count
        assert_eq!(*data.pop_num_cells.last().unwrap(), 2);
    }

    #[test]
    fn test_population_rate() {
        let run = demo_run();
        let opts = PrepareOptions {
            include: vec![Include::Name("S2".to_string())],
            pop_rates: RateMode::Minimal,
            ..Default::default()
        };
        let data = prepare_spike_data(&run, &opts, None).unwrap();
        // 4 events, 2 cells, 1000 ms window: 2 events per second per cell
        assert_eq!(data.legend_labels, vec!["S2 (2 Hz)".to_string()]);
        assert_eq!(
            data.axis_args.title,
            "cells: 2   syn/cell: 1.5   rate: 2.0 Hz"
        );
    }

    #[test]
    fn test_full_rate_legend() {
        let run = demo_run();
        let opts = PrepareOptions {
            include: vec![Include::Name("S2".to_string())],
            ..Default::default()
        };
        let data = prepare_spike_data(&run, &opts, None).unwrap();
        assert_eq!(
            data.legend_labels,
            vec!["S2\n  cells: 2\n  syn/cell: 1.5\n  rate: 2 Hz".to_string()]
        );
    }

    #[test]
    fn test_zero_real_spikes_keeps_placeholder_counts() {
        let run = demo_run();
        let opts = PrepareOptions {
            include: vec![
                Include::Name("S2".to_string()),
                Include::Name("noise".to_string()),
            ],
            time_range: Some((700.0, 800.0)),
            pop_rates: RateMode::Minimal,
            ..Default::default()
        };
        let data = prepare_spike_data(&run, &opts, None).unwrap();

        assert_eq!(
            data.pop_labels,
            vec!["S2".to_string(), NETSTIM_POP.to_string()]
        );
        // no real spikes: real counts stay zero placeholders, the stimulus
        // slot reports the group count
        assert_eq!(data.pop_num_cells, vec![0, 1]);
        // one stimulus event over a 0.1 s window
        assert_eq!(
            data.legend_labels,
            vec!["S2 (0 Hz)".to_string(), "NetStims (10 Hz)".to_string()]
        );
    }

    #[test]
    fn test_rates_off_keeps_default_title() {
        let run = demo_run();
        let opts = PrepareOptions {
            pop_rates: RateMode::Off,
            ..Default::default()
        };
        let data = prepare_spike_data(&run, &opts, None).unwrap();
        assert!(data.legend_labels.is_empty());
        assert_eq!(data.axis_args.title, "Raster plot of spiking");
    }

    #[test]
    fn test_explicit_title_wins() {
        let run = demo_run();
        let opts = PrepareOptions {
            title: Some("L5 raster".to_string()),
            ..Default::default()
        };
        let data = prepare_spike_data(&run, &opts, None).unwrap();
        assert_eq!(data.axis_args.title, "L5 raster");
    }

    #[test]
    fn test_retrieval_failure_degrades_to_stims_only() {
        let source = FailingSource(demo_run());
        let opts = PrepareOptions {
            include: vec![Include::All],
            ..Default::default()
        };
        let data = prepare_spike_data(&source, &opts, None).unwrap();
        assert_eq!(data.spk_times.len(), 4);
        assert!(data.spk_inds.iter().all(|&i| i >= 4));
        assert_eq!(data.num_net_stims, 2);
    }

    #[test]
    fn test_store_called_exactly_once_when_saving() {
        let run = demo_run();
        let mut store = CountingStore::default();
        let opts = PrepareOptions {
            save: true,
            ..Default::default()
        };
        prepare_spike_data(&run, &opts, Some(&mut store)).unwrap();
        assert_eq!(store.calls, 1);

        let mut store = CountingStore::default();
        let opts = PrepareOptions::default();
        prepare_spike_data(&run, &opts, Some(&mut store)).unwrap();
        assert_eq!(store.calls, 0);
    }

    #[test]
    fn test_hist_wrapper_relabels_and_forces_gid_order() {
        let run = demo_run();
        let opts = PrepareOptions {
            order_by: OrderBy::Pop,
            ..PrepareOptions::hist()
        };
        let data = prepare_spike_hist(&run, &opts, None).unwrap();
        assert_eq!(data.axis_args.ylabel, "Number of spikes");
        assert_eq!(data.order_by, OrderBy::Gid);
    }

    #[test]
    fn test_raster_wrapper_matches_core() {
        let run = demo_run();
        let opts = PrepareOptions::raster();
        assert_eq!(
            prepare_raster(&run, &opts, None),
            prepare_spike_data(&run, &opts, None)
        );
    }

    #[test]
    fn test_bin_spike_counts() {
        let (centers, counts) = bin_spike_counts(&[0.0, 1.0, 2.5, 5.0, 10.0], (0.0, 10.0), 5.0);
        assert_eq!(centers.to_vec(), vec![2.5, 7.5]);
        // the event at the window end lands in the last bin
        assert_eq!(counts.to_vec(), vec![3.0, 2.0]);

        let (centers, counts) = bin_spike_counts(&[1.0], (0.0, 0.0), 5.0);
        assert!(centers.is_empty());
        assert!(counts.is_empty());
    }

    #[test]
    fn test_sig3_formatting() {
        assert_eq!(sig3(0.0), "0");
        assert_eq!(sig3(2.0), "2");
        assert_eq!(sig3(10.0), "10");
        assert_eq!(sig3(23.46), "23.5");
        assert_eq!(sig3(0.001234), "0.00123");
        assert_eq!(sig3(1234.0), "1.23e+03");
    }
}
