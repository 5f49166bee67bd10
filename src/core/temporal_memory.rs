//! The `temporal_memory` module implements the apical tiebreak temporal memory, the engine shared by the
//! pair memory and the sequence memory.
//!
//! At a high level, it models a set of columns, where each column contains multiple cells.
//! Each cell owns two kinds of dendritic segments, stored in two separate connection substrates.
//!
//! Basal Segment:
//! - Receives context from the basal input (for a sequence memory: the previously active cells).
//! - An active basal segment puts its cell into a predicted (depolarized) state.
//!
//! Apical Segment:
//! - Receives feedback from the apical input.
//! - Apical activity alone never predicts a cell. It only breaks ties between basally predicted cells.
//!
//! Apical Tiebreak:
//! - A cell with both an active basal and an active apical segment is fully depolarized.
//! - Within a column, fully depolarized cells inhibit the cells that only have basal support.
//! - Without any apical support in the column, every basally predicted cell stays predicted.
//!
//! Active vs Matching Segment:
//! - Active: the number of connected synapses to active input passes `activation_threshold`.
//! - Matching: the number of potential synapses (any permanence) to active input passes `min_threshold`.
//!
//! Bursting:
//! - An active column without predicted cells activates all of its cells.
//! - One winner cell per bursting column learns: the owner of the best matching segment, or a cell with
//!   the fewest segments, which then grows a new segment.
//!
//! How It Works:
//! - `depolarize_cells` scores both segment kinds against their inputs and derives the predicted cells.
//! - `activate_cells` turns the active columns into active and winner cells using those predictions.
//! - When learning, it reinforces the segments that explain the winner cells, punishes matching segments
//!   in inactive columns, grows new segments where nothing matched, then clips permanences and removes
//!   segments left without synapses.

use fxhash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::core::connections::{SampleSize, SparseMatrixConnections};
use crate::core::random::Random;
use crate::core::segment_matrix::SegmentOps;
use crate::core::sparse_matrix::ThresholdMode;
use crate::error::{check_index, check_sorted, HtmError, Result};
use crate::serialization::Serializable;

/// Holds the parameters of an apical tiebreak temporal memory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalMemoryParams {
    pub column_count: usize,
    pub basal_input_size: usize,
    pub apical_input_size: usize,
    pub cells_per_column: usize,
    pub activation_threshold: usize,
    pub min_threshold: usize,
    /// Desired number of active synapses per learning segment; `None` grows toward every candidate.
    pub sample_size: Option<usize>,
    pub initial_permanence: f32,
    pub connected_permanence: f32,
    pub permanence_increment: f32,
    pub permanence_decrement: f32,
    pub basal_predicted_segment_decrement: f32,
    pub apical_predicted_segment_decrement: f32,
    /// Keep picking the same winner cell each time a column bursts, until `reset`.
    pub learn_on_one_cell: bool,
    pub max_segments_per_cell: usize,
    pub max_synapses_per_segment: usize,
    pub seed: u64,
    /// Validate that every input is sorted and in range before computing.
    pub check_inputs: bool,
    /// Pair memory only: prepend the memory's own previous active cells to the basal input.
    pub basal_input_prepend: bool,
    pub threshold_mode: ThresholdMode,
}

impl Default for TemporalMemoryParams {
    fn default() -> Self {
        Self {
            column_count: 2048,
            basal_input_size: 0,
            apical_input_size: 0,
            cells_per_column: 32,
            activation_threshold: 13,
            min_threshold: 10,
            sample_size: Some(20),
            initial_permanence: 0.21,
            connected_permanence: 0.50,
            permanence_increment: 0.10,
            permanence_decrement: 0.10,
            basal_predicted_segment_decrement: 0.0,
            apical_predicted_segment_decrement: 0.0,
            learn_on_one_cell: false,
            max_segments_per_cell: 255,
            max_synapses_per_segment: 255,
            seed: 42,
            check_inputs: true,
            basal_input_prepend: false,
            threshold_mode: ThresholdMode::Inclusive,
        }
    }
}

impl TemporalMemoryParams {
    /// Rejects parameter combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |name: &'static str, message: &str| {
            Err(HtmError::InvalidParameter {
                name,
                message: message.to_string(),
            })
        };

        if self.column_count == 0 {
            return invalid("column_count", "must be at least 1");
        }
        if self.cells_per_column == 0 {
            return invalid("cells_per_column", "must be at least 1");
        }
        if self
            .column_count
            .checked_mul(self.cells_per_column)
            .map_or(true, |n| n > u32::MAX as usize)
        {
            return invalid("cells_per_column", "too many cells to index");
        }
        if self.activation_threshold == 0 {
            return invalid("activation_threshold", "must be at least 1");
        }
        if self.min_threshold == 0 {
            return invalid("min_threshold", "must be at least 1");
        }
        if self.max_segments_per_cell == 0 {
            return invalid("max_segments_per_cell", "must be at least 1");
        }
        if self.max_synapses_per_segment == 0 {
            return invalid("max_synapses_per_segment", "must be at least 1");
        }
        if !(self.initial_permanence > 0.0 && self.initial_permanence <= 1.0) {
            return invalid("initial_permanence", "must be in (0, 1]");
        }
        let unit = [
            ("connected_permanence", self.connected_permanence),
            ("permanence_increment", self.permanence_increment),
            ("permanence_decrement", self.permanence_decrement),
            ("basal_predicted_segment_decrement", self.basal_predicted_segment_decrement),
            ("apical_predicted_segment_decrement", self.apical_predicted_segment_decrement),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return invalid(name, "must be in [0, 1]");
            }
        }
        Ok(())
    }

    #[inline]
    pub fn number_of_cells(&self) -> usize {
        self.column_count * self.cells_per_column
    }
}

/// Presynaptic bits a learning segment may grow new synapses to.
#[derive(Clone, Copy, Debug, Default)]
pub enum GrowthCandidates<'a> {
    /// Grow toward the same bits that were given as input.
    #[default]
    SameAsInput,
    /// Grow toward these sorted bits instead.
    Explicit(&'a [u32]),
}

/// Which segments learn, and which cells need a new segment, on one side (basal or apical).
#[derive(Debug, Default)]
struct SegmentLearning {
    active: Vec<u32>,
    matching: Vec<u32>,
    punished: Vec<u32>,
    new_segment_cells: Vec<u32>,
}

/// The engine shared by `ApicalTiebreakPairMemory` and `ApicalTiebreakSequenceMemory`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApicalTiebreakTemporalMemory {
    params: TemporalMemoryParams,
    basal_connections: SparseMatrixConnections,
    apical_connections: SparseMatrixConnections,
    rng: Random,

    active_cells: Vec<u32>,
    winner_cells: Vec<u32>,
    predicted_cells: Vec<u32>,
    predicted_active_cells: Vec<u32>,
    basal_predicted_cells: Vec<u32>,
    apical_predicted_cells: Vec<u32>,

    active_basal_segments: Vec<u32>,
    matching_basal_segments: Vec<u32>,
    basal_potential_overlaps: Vec<u32>,
    active_apical_segments: Vec<u32>,
    matching_apical_segments: Vec<u32>,
    apical_potential_overlaps: Vec<u32>,

    // Winner cell remembered per bursting column under `learn_on_one_cell`.
    chosen_cell_for_column: BTreeMap<u32, u32>,
}

impl ApicalTiebreakTemporalMemory {
    /// Constructs a temporal memory whose basal input space has `params.basal_input_size` bits.
    pub fn new(params: TemporalMemoryParams) -> Result<Self> {
        let basal_input_size = params.basal_input_size;
        Self::with_basal_input_size(params, basal_input_size)
    }

    /// Constructs a temporal memory with an explicit basal input space.
    /// - Validates the parameters.
    /// - Creates empty basal and apical connections capped per the parameters.
    /// - Seeds the random source from `params.seed`.
    pub(crate) fn with_basal_input_size(params: TemporalMemoryParams, basal_input_size: usize) -> Result<Self> {
        params.validate()?;
        let n_cells = params.number_of_cells();
        let connections = |n_inputs| {
            SparseMatrixConnections::new(n_cells, n_inputs)
                .with_max_segments_per_cell(params.max_segments_per_cell)
                .with_max_synapses_per_segment(params.max_synapses_per_segment)
        };
        let basal_connections = connections(basal_input_size);
        let apical_connections = connections(params.apical_input_size);

        debug!(
            columns = params.column_count,
            cells_per_column = params.cells_per_column,
            basal_input_size,
            apical_input_size = params.apical_input_size,
            "created apical tiebreak temporal memory"
        );

        Ok(Self {
            rng: Random::new(params.seed),
            params,
            basal_connections,
            apical_connections,
            active_cells: Vec::new(),
            winner_cells: Vec::new(),
            predicted_cells: Vec::new(),
            predicted_active_cells: Vec::new(),
            basal_predicted_cells: Vec::new(),
            apical_predicted_cells: Vec::new(),
            active_basal_segments: Vec::new(),
            matching_basal_segments: Vec::new(),
            basal_potential_overlaps: Vec::new(),
            active_apical_segments: Vec::new(),
            matching_apical_segments: Vec::new(),
            apical_potential_overlaps: Vec::new(),
            chosen_cell_for_column: BTreeMap::new(),
        })
    }

    /// Clears all activity. Learned connections are kept.
    pub fn reset(&mut self) {
        self.active_cells.clear();
        self.winner_cells.clear();
        self.predicted_cells.clear();
        self.predicted_active_cells.clear();
        self.basal_predicted_cells.clear();
        self.apical_predicted_cells.clear();
        self.active_basal_segments.clear();
        self.matching_basal_segments.clear();
        self.basal_potential_overlaps.clear();
        self.active_apical_segments.clear();
        self.matching_apical_segments.clear();
        self.apical_potential_overlaps.clear();
        self.chosen_cell_for_column.clear();
    }

    /// Computes segment activity and the resulting predicted cells:
    /// - Scores apical segments against `apical_input` and basal segments against `basal_input`.
    /// - Keeps active and matching segments sorted by cell, plus the potential overlap of every segment.
    /// - Applies the apical tiebreak to the basally predicted cells.
    ///
    /// Both inputs must be sorted and within their input spaces.
    pub fn depolarize_cells(&mut self, basal_input: &[u32], apical_input: &[u32]) -> Result<()> {
        let (active_apical, matching_apical, apical_overlaps) =
            Self::compute_segment_activity(&self.apical_connections, apical_input, &self.params)?;
        let (active_basal, matching_basal, basal_overlaps) =
            Self::compute_segment_activity(&self.basal_connections, basal_input, &self.params)?;

        let basal_cells = unique_cells(&self.basal_connections, &active_basal)?;
        let apical_cells = unique_cells(&self.apical_connections, &active_apical)?;
        self.predicted_cells = self.calculate_predicted_cells(&basal_cells, &apical_cells);
        self.basal_predicted_cells = basal_cells;
        self.apical_predicted_cells = apical_cells;

        self.active_basal_segments = active_basal;
        self.matching_basal_segments = matching_basal;
        self.basal_potential_overlaps = basal_overlaps;
        self.active_apical_segments = active_apical;
        self.matching_apical_segments = matching_apical;
        self.apical_potential_overlaps = apical_overlaps;
        Ok(())
    }

    /// Activates cells in the active columns using the predictions of the last `depolarize_cells`:
    /// - Predicted cells in active columns become active and winners.
    /// - Columns without a predicted cell burst, and each picks one winner cell.
    /// - If `learn` is set, adapts basal and apical segments of the winner cells, punishes matching
    ///   segments in inactive columns and grows new segments.
    ///
    /// Reinforce inputs are the bits whose synapses get incremented; growth candidates are the bits new
    /// synapses may connect to. All slices must be sorted.
    pub fn activate_cells(
        &mut self,
        active_columns: &[u32],
        basal_reinforce_candidates: &[u32],
        apical_reinforce_candidates: &[u32],
        basal_growth_candidates: &[u32],
        apical_growth_candidates: &[u32],
        learn: bool,
    ) -> Result<()> {
        let cells_per_column = self.params.cells_per_column as u32;
        let active_column_set: FxHashSet<u32> = active_columns.iter().copied().collect();

        let correct_predicted_cells: Vec<u32> = self
            .predicted_cells
            .iter()
            .copied()
            .filter(|cell| active_column_set.contains(&(cell / cells_per_column)))
            .collect();
        let predicted_columns: FxHashSet<u32> = correct_predicted_cells
            .iter()
            .map(|cell| cell / cells_per_column)
            .collect();
        let bursting_columns: Vec<u32> = active_columns
            .iter()
            .copied()
            .filter(|column| !predicted_columns.contains(column))
            .collect();
        let bursting_cells: Vec<u32> = bursting_columns
            .iter()
            .flat_map(|column| column * cells_per_column..(column + 1) * cells_per_column)
            .collect();
        let new_active_cells = union_sorted(&correct_predicted_cells, &bursting_cells);

        let (basal, learning_cells) =
            self.calculate_basal_learning(&active_column_set, &bursting_columns, &correct_predicted_cells)?;
        let apical = self.calculate_apical_learning(&learning_cells, &active_column_set)?;

        debug!(
            active_columns = active_columns.len(),
            bursting_columns = bursting_columns.len(),
            predicted_active_cells = correct_predicted_cells.len(),
            winner_cells = learning_cells.len(),
            learn,
            "activated cells"
        );

        if learn {
            self.apply_learning(
                &basal,
                &apical,
                basal_reinforce_candidates,
                apical_reinforce_candidates,
                basal_growth_candidates,
                apical_growth_candidates,
            )?;
        }

        self.active_cells = new_active_cells;
        self.winner_cells = learning_cells;
        self.predicted_active_cells = correct_predicted_cells;
        Ok(())
    }

    /// Scores segments against `input`, returning (active segments, matching segments, potential overlaps).
    fn compute_segment_activity(
        connections: &SparseMatrixConnections,
        input: &[u32],
        params: &TemporalMemoryParams,
    ) -> Result<(Vec<u32>, Vec<u32>, Vec<u32>)> {
        let mode = params.threshold_mode;
        let connected =
            connections.compute_activity(input, Some((params.connected_permanence, mode)))?;
        let potential = connections.compute_activity(input, None)?;

        let mut active: Vec<u32> = connected
            .iter()
            .enumerate()
            .filter(|(_, n)| mode.passes(**n as usize, params.activation_threshold))
            .map(|(segment, _)| segment as u32)
            .collect();
        let mut matching: Vec<u32> = potential
            .iter()
            .enumerate()
            .filter(|(_, n)| mode.passes(**n as usize, params.min_threshold))
            .map(|(segment, _)| segment as u32)
            .collect();
        connections.sort_segments_by_cell(&mut active)?;
        connections.sort_segments_by_cell(&mut matching)?;
        Ok((active, matching, potential))
    }

    /// Applies the apical tiebreak to the sorted basally and apically supported cells.
    fn calculate_predicted_cells(&self, basal_cells: &[u32], apical_cells: &[u32]) -> Vec<u32> {
        let cells_per_column = self.params.cells_per_column as u32;
        let fully_depolarized = intersect_sorted(basal_cells, apical_cells);
        let inhibiting_columns: FxHashSet<u32> = fully_depolarized
            .iter()
            .map(|cell| cell / cells_per_column)
            .collect();
        let partly_depolarized: Vec<u32> = difference_sorted(basal_cells, &fully_depolarized)
            .into_iter()
            .filter(|cell| !inhibiting_columns.contains(&(cell / cells_per_column)))
            .collect();
        union_sorted(&fully_depolarized, &partly_depolarized)
    }

    /// Decides the basal learning of this step and the resulting winner cells:
    /// - Active segments on correctly predicted cells are reinforced.
    /// - Each bursting column with matching segments reinforces its best one.
    /// - Each bursting column without any picks a cell for a new segment.
    /// - Matching segments in inactive columns are punished.
    fn calculate_basal_learning(
        &mut self,
        active_column_set: &FxHashSet<u32>,
        bursting_columns: &[u32],
        correct_predicted_cells: &[u32],
    ) -> Result<(SegmentLearning, Vec<u32>)> {
        let cells_per_column = self.params.cells_per_column as u32;
        let learn_on_one_cell = self.params.learn_on_one_cell;
        let connections = &self.basal_connections;

        let learning_active =
            connections.filter_segments_by_cell(&self.active_basal_segments, correct_predicted_cells, true)?;

        let matching = &self.matching_basal_segments;
        let matching_cells = connections.map_segments_to_cells(matching)?;
        let bursting_set: FxHashSet<u32> = bursting_columns.iter().copied().collect();
        let overlap = |segment: u32| {
            self.basal_potential_overlaps
                .get(segment as usize)
                .copied()
                .unwrap_or(0)
        };

        // Matching segments are sorted by cell, so each column's segments are contiguous.
        let mut learning_matching = Vec::new();
        let mut matched_winners: Vec<(u32, u32)> = Vec::new();
        let mut start = 0;
        while start < matching.len() {
            let column = matching_cells[start] / cells_per_column;
            let mut end = start;
            while end < matching.len() && matching_cells[end] / cells_per_column == column {
                end += 1;
            }

            if bursting_set.contains(&column) {
                let remembered = if learn_on_one_cell {
                    self.chosen_cell_for_column.get(&column).copied()
                } else {
                    None
                };
                let mut best = start;
                for k in start + 1..end {
                    let (candidate, current) = (overlap(matching[k]), overlap(matching[best]));
                    let prefer_remembered = remembered == Some(matching_cells[k])
                        && remembered != Some(matching_cells[best]);
                    if candidate > current || (candidate == current && prefer_remembered) {
                        best = k;
                    }
                }
                learning_matching.push(matching[best]);
                matched_winners.push((column, matching_cells[best]));
            }
            start = end;
        }

        let punished: Vec<u32> = matching
            .iter()
            .zip(&matching_cells)
            .filter(|(_, cell)| !active_column_set.contains(&(**cell / cells_per_column)))
            .map(|(segment, _)| *segment)
            .collect();

        let matched_columns: FxHashSet<u32> = matched_winners.iter().map(|(column, _)| *column).collect();
        if learn_on_one_cell {
            self.chosen_cell_for_column.extend(matched_winners.iter().copied());
        }

        let mut new_segment_cells = Vec::new();
        for &column in bursting_columns {
            if !matched_columns.contains(&column) {
                new_segment_cells.push(self.choose_cell_for_bursting_column(column)?);
            }
        }

        let mut learning_cells: Vec<u32> = correct_predicted_cells
            .iter()
            .copied()
            .chain(matched_winners.iter().map(|(_, cell)| *cell))
            .chain(new_segment_cells.iter().copied())
            .collect();
        learning_cells.sort_unstable();
        learning_cells.dedup();

        Ok((
            SegmentLearning {
                active: learning_active,
                matching: learning_matching,
                punished,
                new_segment_cells,
            },
            learning_cells,
        ))
    }

    /// Decides the apical learning of this step for the winner cells:
    /// - A winner cell with active apical segments reinforces them.
    /// - Otherwise its best matching apical segment is reinforced.
    /// - With neither, it gets a new apical segment.
    fn calculate_apical_learning(
        &self,
        learning_cells: &[u32],
        active_column_set: &FxHashSet<u32>,
    ) -> Result<SegmentLearning> {
        let cells_per_column = self.params.cells_per_column as u32;
        let connections = &self.apical_connections;

        let learning_active =
            connections.filter_segments_by_cell(&self.active_apical_segments, learning_cells, true)?;
        let cells_with_active = unique_cells(connections, &self.active_apical_segments)?;
        let without_active = difference_sorted(learning_cells, &cells_with_active);

        let matching = &self.matching_apical_segments;
        let matching_cells = connections.map_segments_to_cells(matching)?;
        let overlap = |segment: u32| {
            self.apical_potential_overlaps
                .get(segment as usize)
                .copied()
                .unwrap_or(0)
        };

        let mut learning_matching = Vec::new();
        let mut cells_with_matching = Vec::new();
        let mut start = 0;
        while start < matching.len() {
            let cell = matching_cells[start];
            let mut end = start;
            while end < matching.len() && matching_cells[end] == cell {
                end += 1;
            }
            if without_active.binary_search(&cell).is_ok() {
                let best = (start + 1..end).fold(start, |best, k| {
                    if overlap(matching[k]) > overlap(matching[best]) {
                        k
                    } else {
                        best
                    }
                });
                learning_matching.push(matching[best]);
                cells_with_matching.push(cell);
            }
            start = end;
        }

        let punished = matching
            .iter()
            .zip(&matching_cells)
            .filter(|(_, cell)| !active_column_set.contains(&(**cell / cells_per_column)))
            .map(|(segment, _)| *segment)
            .collect();

        Ok(SegmentLearning {
            active: learning_active,
            matching: learning_matching,
            punished,
            new_segment_cells: difference_sorted(&without_active, &cells_with_matching),
        })
    }

    /// Picks the winner cell of a bursting column that has no matching segment:
    /// - Under `learn_on_one_cell`, the cell previously chosen for the column, if any.
    /// - Otherwise one of the cells with the fewest basal segments, chosen at random.
    fn choose_cell_for_bursting_column(&mut self, column: u32) -> Result<u32> {
        if self.params.learn_on_one_cell {
            if let Some(&cell) = self.chosen_cell_for_column.get(&column) {
                return Ok(cell);
            }
        }

        let cells_per_column = self.params.cells_per_column as u32;
        let cells: Vec<u32> = (column * cells_per_column..(column + 1) * cells_per_column).collect();
        let counts = self.basal_connections.get_segment_counts(&cells)?;
        let min_segments = counts.iter().copied().min().unwrap_or(0);
        let min_cells: Vec<u32> = cells
            .iter()
            .zip(&counts)
            .filter(|(_, n)| **n == min_segments)
            .map(|(cell, _)| *cell)
            .collect();

        let cell = if min_cells.len() > 1 {
            min_cells[self.rng.get_usize(min_cells.len())]
        } else {
            min_cells[0]
        };

        if self.params.learn_on_one_cell {
            self.chosen_cell_for_column.insert(column, cell);
        }
        Ok(cell)
    }

    /// Mutates both connection substrates according to the learning decisions of this step.
    fn apply_learning(
        &mut self,
        basal: &SegmentLearning,
        apical: &SegmentLearning,
        basal_reinforce: &[u32],
        apical_reinforce: &[u32],
        basal_growth: &[u32],
        apical_growth: &[u32],
    ) -> Result<()> {
        let Self {
            params,
            basal_connections,
            apical_connections,
            rng,
            active_basal_segments,
            active_apical_segments,
            basal_potential_overlaps,
            apical_potential_overlaps,
            ..
        } = self;

        record_live_activity(basal_connections, active_basal_segments)?;
        record_live_activity(apical_connections, active_apical_segments)?;

        for segments in [&basal.active, &basal.matching] {
            learn_segments(basal_connections, rng, segments, basal_reinforce, basal_growth, basal_potential_overlaps, params)?;
        }
        for segments in [&apical.active, &apical.matching] {
            learn_segments(apical_connections, rng, segments, apical_reinforce, apical_growth, apical_potential_overlaps, params)?;
        }

        if params.basal_predicted_segment_decrement != 0.0 && !basal.punished.is_empty() {
            basal_connections.adjust_active_synapses(
                &basal.punished,
                basal_reinforce,
                -params.basal_predicted_segment_decrement,
            )?;
        }
        if params.apical_predicted_segment_decrement != 0.0 && !apical.punished.is_empty() {
            apical_connections.adjust_active_synapses(
                &apical.punished,
                apical_reinforce,
                -params.apical_predicted_segment_decrement,
            )?;
        }

        let new_basal = grow_new_segments(basal_connections, rng, &basal.new_segment_cells, basal_growth, params)?;
        let new_apical =
            grow_new_segments(apical_connections, rng, &apical.new_segment_cells, apical_growth, params)?;

        let destroyed_basal = clip_and_prune(
            basal_connections,
            [&basal.active, &basal.matching, &basal.punished, &new_basal],
        )?;
        let destroyed_apical = clip_and_prune(
            apical_connections,
            [&apical.active, &apical.matching, &apical.punished, &new_apical],
        )?;

        basal_connections.start_new_iteration();
        apical_connections.start_new_iteration();

        debug!(
            new_basal_segments = new_basal.len(),
            new_apical_segments = new_apical.len(),
            destroyed_basal,
            destroyed_apical,
            "applied learning"
        );
        Ok(())
    }

    /// Creates a basal segment on `cell` and returns its handle.
    pub fn create_basal_segment(&mut self, cell: u32) -> Result<u32> {
        Ok(self.basal_connections.create_segments(&[cell])?[0])
    }

    /// Creates an apical segment on `cell` and returns its handle.
    pub fn create_apical_segment(&mut self, cell: u32) -> Result<u32> {
        Ok(self.apical_connections.create_segments(&[cell])?[0])
    }

    /// Returns the column that contains `cell`.
    pub fn column_for_cell(&self, cell: u32) -> Result<u32> {
        check_index("cell", cell as usize, self.number_of_cells())?;
        Ok(cell / self.params.cells_per_column as u32)
    }

    /// Checks a sorted input against its input space (when `check_inputs` is set) and drops duplicates.
    pub(crate) fn normalize_input(&self, what: &'static str, values: &[u32], bound: usize) -> Result<Vec<u32>> {
        if self.params.check_inputs {
            check_sorted(what, values)?;
            if let Some(&last) = values.last() {
                check_index(what, last as usize, bound)?;
            }
        }
        let mut values = values.to_vec();
        values.dedup();
        Ok(values)
    }

    #[inline]
    pub fn params(&self) -> &TemporalMemoryParams {
        &self.params
    }

    #[inline]
    pub fn number_of_cells(&self) -> usize {
        self.params.number_of_cells()
    }

    #[inline]
    pub fn number_of_columns(&self) -> usize {
        self.params.column_count
    }

    #[inline]
    pub fn cells_per_column(&self) -> usize {
        self.params.cells_per_column
    }

    /// Size of the basal input space, including prepended cells.
    #[inline]
    pub fn basal_input_size(&self) -> usize {
        self.basal_connections.n_inputs()
    }

    #[inline]
    pub fn apical_input_size(&self) -> usize {
        self.apical_connections.n_inputs()
    }

    /// Sorted active cells of the last step.
    #[inline]
    pub fn active_cells(&self) -> &[u32] {
        &self.active_cells
    }

    /// Sorted winner cells of the last step.
    #[inline]
    pub fn winner_cells(&self) -> &[u32] {
        &self.winner_cells
    }

    /// Sorted cells predicted by the last `depolarize_cells`.
    #[inline]
    pub fn predicted_cells(&self) -> &[u32] {
        &self.predicted_cells
    }

    /// Sorted predicted cells that became active in the last `activate_cells`.
    #[inline]
    pub fn predicted_active_cells(&self) -> &[u32] {
        &self.predicted_active_cells
    }

    /// Sorted cells with an active basal segment, before the apical tiebreak.
    #[inline]
    pub fn basal_predicted_cells(&self) -> &[u32] {
        &self.basal_predicted_cells
    }

    /// Sorted cells with an active apical segment.
    #[inline]
    pub fn apical_predicted_cells(&self) -> &[u32] {
        &self.apical_predicted_cells
    }

    #[inline]
    pub fn active_basal_segments(&self) -> &[u32] {
        &self.active_basal_segments
    }

    #[inline]
    pub fn matching_basal_segments(&self) -> &[u32] {
        &self.matching_basal_segments
    }

    #[inline]
    pub fn active_apical_segments(&self) -> &[u32] {
        &self.active_apical_segments
    }

    #[inline]
    pub fn matching_apical_segments(&self) -> &[u32] {
        &self.matching_apical_segments
    }

    #[inline]
    pub fn basal_connections(&self) -> &SparseMatrixConnections {
        &self.basal_connections
    }

    #[inline]
    pub fn apical_connections(&self) -> &SparseMatrixConnections {
        &self.apical_connections
    }

    #[inline]
    pub fn basal_connections_mut(&mut self) -> &mut SparseMatrixConnections {
        &mut self.basal_connections
    }

    #[inline]
    pub fn apical_connections_mut(&mut self) -> &mut SparseMatrixConnections {
        &mut self.apical_connections
    }
}

impl Serializable for ApicalTiebreakTemporalMemory {
    fn validate_state(&self) -> Result<()> {
        self.params.validate()?;
        self.basal_connections.validate_state()?;
        self.apical_connections.validate_state()?;
        let n_cells = self.number_of_cells();
        if self.basal_connections.n_cells() != n_cells || self.apical_connections.n_cells() != n_cells {
            return Err(HtmError::InvalidState(
                "connections do not cover the cell population".to_string(),
            ));
        }
        if self.apical_connections.n_inputs() != self.params.apical_input_size {
            return Err(HtmError::InvalidState(
                "apical connections do not match the apical input size".to_string(),
            ));
        }
        if self.active_cells.last().is_some_and(|c| *c as usize >= n_cells) {
            return Err(HtmError::InvalidState("active cell out of range".to_string()));
        }
        Ok(())
    }
}

/// Reinforces `segments` toward `reinforce`, then grows each toward `sample_size` active synapses.
fn learn_segments(
    connections: &mut SparseMatrixConnections,
    rng: &mut Random,
    segments: &[u32],
    reinforce: &[u32],
    growth: &[u32],
    potential_overlaps: &[u32],
    params: &TemporalMemoryParams,
) -> Result<()> {
    if segments.is_empty() {
        return Ok(());
    }
    connections.adjust_synapses(
        segments,
        reinforce,
        params.permanence_increment,
        -params.permanence_decrement,
    )?;

    let counts: Vec<i32> = segments
        .iter()
        .map(|&segment| {
            let count = match params.sample_size {
                None => growth.len(),
                Some(n) => {
                    let overlap = potential_overlaps.get(segment as usize).copied().unwrap_or(0);
                    n.saturating_sub(overlap as usize)
                }
            };
            saturating_count(count)
        })
        .collect();
    connections.grow_synapses_to_sample(
        segments,
        growth,
        SampleSize::PerSegment(&counts),
        params.initial_permanence,
        rng,
        true,
    )
}

/// Creates one segment per cell and grows its initial synapses; nothing happens without growth candidates.
fn grow_new_segments(
    connections: &mut SparseMatrixConnections,
    rng: &mut Random,
    cells: &[u32],
    growth: &[u32],
    params: &TemporalMemoryParams,
) -> Result<Vec<u32>> {
    let n = growth
        .len()
        .min(params.sample_size.unwrap_or(usize::MAX))
        .min(params.max_synapses_per_segment);
    if cells.is_empty() || n == 0 {
        return Ok(Vec::new());
    }
    let segments = connections.create_segments(cells)?;
    connections.grow_synapses_to_sample(
        &segments,
        growth,
        SampleSize::Uniform(saturating_count(n)),
        params.initial_permanence,
        rng,
        true,
    )?;
    Ok(segments)
}

/// Growth counts past `i32::MAX` mean "as many as available".
#[inline]
fn saturating_count(count: usize) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

/// Records activity for the still-live segments among `segments`.
fn record_live_activity(connections: &mut SparseMatrixConnections, segments: &[u32]) -> Result<()> {
    let live: Vec<u32> = segments
        .iter()
        .copied()
        .filter(|s| connections.cell_for_segment(*s).is_ok())
        .collect();
    connections.record_segment_activity(&live)
}

/// Clips every touched live segment and destroys those left without synapses. Returns how many were destroyed.
fn clip_and_prune<const N: usize>(connections: &mut SparseMatrixConnections, touched: [&Vec<u32>; N]) -> Result<usize> {
    let mut segments: Vec<u32> = touched.iter().flat_map(|s| s.iter().copied()).collect();
    segments.sort_unstable();
    segments.dedup();
    segments.retain(|s| connections.cell_for_segment(*s).is_ok());

    connections.clip_permanences(&segments)?;
    let counts = connections.map_segments_to_synapse_counts(&segments)?;
    let empty: Vec<u32> = segments
        .iter()
        .zip(counts)
        .filter(|(_, n)| *n == 0)
        .map(|(s, _)| *s)
        .collect();
    connections.destroy_segments(&empty)?;
    Ok(empty.len())
}

/// Sorted distinct owner cells of `segments`.
fn unique_cells(connections: &SparseMatrixConnections, segments: &[u32]) -> Result<Vec<u32>> {
    let mut cells = connections.map_segments_to_cells(segments)?;
    cells.sort_unstable();
    cells.dedup();
    Ok(cells)
}

fn intersect_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    a.iter().copied().filter(|x| b.binary_search(x).is_ok()).collect()
}

fn difference_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    a.iter().copied().filter(|x| b.binary_search(x).is_err()).collect()
}

fn union_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out: Vec<u32> = a.iter().chain(b).copied().collect();
    out.sort_unstable();
    out.dedup();
    out
}
