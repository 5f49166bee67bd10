//! The `SparseMatrixConnections` stores every dendritic segment of a cell population as one row of a
//! `SparseMatrix`, with presynaptic input bits as columns and permanences as values.
//!
//! Synapse:
//! - A non-zero entry. Its permanence lives in `(0, 1]`.
//! - Adjustments clamp into `[0, 1]`; a synapse whose permanence reaches zero is removed.
//! - A synapse is connected when its permanence passes the connected threshold given to `compute_activity`.
//!
//! Growth:
//! - `grow_synapses` connects a segment to every active bit it is not yet connected to.
//! - `grow_synapses_to_sample` connects it to a uniform sample of those bits, drawn from the supplied `Random`.
//! - With `max_synapses_per_segment` set, growth that would overflow a segment first destroys its weakest
//!   synapses to bits outside the growth candidates, then grows only into the remaining room.
//!
//! Segment creation, destruction and the cell mapping come from `SegmentOps`.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::trace;

use crate::core::random::Random;
use crate::core::segment_matrix::{SegmentMatrixAdapter, SegmentOps, SegmentSparseMatrix};
use crate::core::sparse_matrix::{SparseMatrix, ThresholdMode};
use crate::error::{check_index, check_sorted, HtmError, Result};
use crate::serialization::Serializable;

/// How many synapses `grow_synapses_to_sample` should try to grow.
#[derive(Clone, Copy, Debug)]
pub enum SampleSize<'a> {
    /// The same count for every segment.
    Uniform(i32),
    /// One count per segment; non-positive counts grow nothing.
    PerSegment(&'a [i32]),
}

/// Segment-indexed synaptic connections from an input space to a population of cells.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SparseMatrixConnections {
    segments: SegmentSparseMatrix,
    max_synapses_per_segment: Option<usize>,
}

impl SparseMatrixConnections {
    /// Creates connections for `n_cells` cells over `n_inputs` presynaptic bits.
    pub fn new(n_cells: usize, n_inputs: usize) -> Self {
        Self {
            segments: SegmentMatrixAdapter::new(n_cells, SparseMatrix::new(0, n_inputs)),
            max_synapses_per_segment: None,
        }
    }

    /// Caps the number of segments per cell; creation on a full cell evicts its least recently active segment.
    pub fn with_max_segments_per_cell(mut self, max: usize) -> Self {
        self.segments = self.segments.with_max_segments_per_cell(max);
        self
    }

    /// Caps the number of synapses per segment.
    pub fn with_max_synapses_per_segment(mut self, max: usize) -> Self {
        self.max_synapses_per_segment = Some(max);
        self
    }

    #[inline]
    pub fn n_inputs(&self) -> usize {
        self.segments.matrix.n_cols()
    }

    #[inline]
    pub fn n_synapses(&self) -> usize {
        self.segments.matrix.n_non_zeros()
    }

    #[inline]
    pub fn max_synapses_per_segment(&self) -> Option<usize> {
        self.max_synapses_per_segment
    }

    /// The permanence matrix, one row per segment handle.
    #[inline]
    pub fn matrix(&self) -> &SparseMatrix {
        &self.segments.matrix
    }

    /// Computes, for every segment handle, how many of its synapses are to active inputs.
    ///
    /// - Without a threshold every synapse counts (potential activity).
    /// - With `(threshold, mode)` only synapses whose permanence passes the threshold count (connected activity).
    /// - The result has `segment_flat_list_length()` entries; destroyed handles score zero.
    pub fn compute_activity(
        &self,
        active_inputs: &[u32],
        permanence_threshold: Option<(f32, ThresholdMode)>,
    ) -> Result<Vec<u32>> {
        let matrix = &self.segments.matrix;
        match permanence_threshold {
            None => matrix.right_vec_sum_at_nz_sparse(active_inputs),
            Some((threshold, mode)) => matrix.right_vec_sum_at_nz_threshold_sparse(active_inputs, threshold, mode),
        }
    }

    /// Adds `active_delta` to synapses to active inputs and `inactive_delta` to all other synapses.
    pub fn adjust_synapses(
        &mut self,
        segments: &[u32],
        active_inputs: &[u32],
        active_delta: f32,
        inactive_delta: f32,
    ) -> Result<()> {
        self.map_segments_to_cells(segments)?;
        let active = self.prepare_inputs(active_inputs, false)?;
        let matrix = &mut self.segments.matrix;
        matrix.increment_non_zeros_on_outer(segments, &active, active_delta)?;
        matrix.increment_non_zeros_on_rows_excluding_cols(segments, &active, inactive_delta)?;
        matrix.clip_rows_below_and_above(segments, 0.0, 1.0)
    }

    /// Adds `delta` to the synapses of `segments` that connect to active inputs.
    pub fn adjust_active_synapses(&mut self, segments: &[u32], active_inputs: &[u32], delta: f32) -> Result<()> {
        self.map_segments_to_cells(segments)?;
        let active = self.prepare_inputs(active_inputs, false)?;
        let matrix = &mut self.segments.matrix;
        matrix.increment_non_zeros_on_outer(segments, &active, delta)?;
        matrix.clip_rows_below_and_above(segments, 0.0, 1.0)
    }

    /// Adds `delta` to the synapses of `segments` that connect to inactive inputs.
    pub fn adjust_inactive_synapses(&mut self, segments: &[u32], active_inputs: &[u32], delta: f32) -> Result<()> {
        self.map_segments_to_cells(segments)?;
        let active = self.prepare_inputs(active_inputs, false)?;
        let matrix = &mut self.segments.matrix;
        matrix.increment_non_zeros_on_rows_excluding_cols(segments, &active, delta)?;
        matrix.clip_rows_below_and_above(segments, 0.0, 1.0)
    }

    /// Grows a synapse from each segment to every active input it is not yet connected to.
    ///
    /// - With `assume_sorted` the inputs must be ascending, otherwise they are sorted first.
    /// - With a synapse cap, segments that would overflow keep the lowest-numbered new inputs.
    pub fn grow_synapses(
        &mut self,
        segments: &[u32],
        active_inputs: &[u32],
        initial_permanence: f32,
        assume_sorted: bool,
    ) -> Result<()> {
        self.map_segments_to_cells(segments)?;
        let active = self.prepare_inputs(active_inputs, assume_sorted)?;
        match self.max_synapses_per_segment {
            None => self.segments.matrix.set_zeros_on_outer(segments, &active, initial_permanence),
            Some(_) => {
                for &segment in segments {
                    self.grow_on_segment(segment, &active, usize::MAX, initial_permanence, None)?;
                }
                Ok(())
            }
        }
    }

    /// Grows, for each segment, synapses to a uniform sample of the active inputs it is not yet connected to.
    ///
    /// - Each segment gets `min(count, available)` new synapses; non-positive counts grow nothing.
    /// - Identical `rng` state yields identical growth.
    pub fn grow_synapses_to_sample(
        &mut self,
        segments: &[u32],
        active_inputs: &[u32],
        sample_size: SampleSize<'_>,
        initial_permanence: f32,
        rng: &mut Random,
        assume_sorted: bool,
    ) -> Result<()> {
        self.map_segments_to_cells(segments)?;
        if let SampleSize::PerSegment(counts) = sample_size {
            if counts.len() != segments.len() {
                return Err(HtmError::ShapeMismatch {
                    operation: "grow_synapses_to_sample",
                    left: (segments.len(), 1),
                    right: (counts.len(), 1),
                });
            }
        }
        let active = self.prepare_inputs(active_inputs, assume_sorted)?;

        for (i, &segment) in segments.iter().enumerate() {
            let count = match sample_size {
                SampleSize::Uniform(n) => n,
                SampleSize::PerSegment(counts) => counts[i],
            };
            if count <= 0 {
                continue;
            }
            match self.max_synapses_per_segment {
                None => {
                    self.segments.matrix.set_random_zeros_on_outer(
                        &[segment],
                        &active,
                        &[count],
                        initial_permanence,
                        rng,
                    )?;
                }
                Some(_) => {
                    self.grow_on_segment(segment, &active, count as usize, initial_permanence, Some(&mut *rng))?;
                }
            }
        }
        Ok(())
    }

    /// Clamps the permanences of `segments` into `[0, 1]`, removes non-positive synapses and enforces
    /// the synapse cap by destroying the weakest synapses.
    pub fn clip_permanences(&mut self, segments: &[u32]) -> Result<()> {
        self.map_segments_to_cells(segments)?;
        self.segments.matrix.clip_rows_below_and_above(segments, 0.0, 1.0)?;
        if let Some(max) = self.max_synapses_per_segment {
            for &segment in segments {
                let n = self.segments.matrix.n_non_zeros_on_row(segment as usize)?;
                if n > max {
                    self.destroy_weakest_synapses(segment, n - max, &[])?;
                }
            }
        }
        Ok(())
    }

    /// Returns the permanence of the synapse from `input` to `segment`, zero if there is none.
    pub fn permanence(&self, segment: u32, input: u32) -> Result<f32> {
        self.cell_for_segment(segment)?;
        self.segments.matrix.get(segment as usize, input as usize)
    }

    /// Creates, updates or (with zero) removes a single synapse.
    pub fn set_permanence(&mut self, segment: u32, input: u32, permanence: f32) -> Result<()> {
        self.cell_for_segment(segment)?;
        if !(0.0..=1.0).contains(&permanence) {
            return Err(HtmError::InvalidParameter {
                name: "permanence",
                message: format!("{permanence} is outside [0, 1]"),
            });
        }
        self.segments.matrix.set(segment as usize, input as usize, permanence)
    }

    /// The `(input, permanence)` pairs of one segment, ordered by input.
    pub fn synapses_for_segment(&self, segment: u32) -> Result<Vec<(u32, f32)>> {
        self.cell_for_segment(segment)?;
        let (cols, values) = self.segments.matrix.row(segment as usize)?;
        Ok(cols.iter().copied().zip(values.iter().copied()).collect())
    }

    fn prepare_inputs<'a>(&self, inputs: &'a [u32], assume_sorted: bool) -> Result<Cow<'a, [u32]>> {
        let inputs = if assume_sorted {
            check_sorted("active inputs", inputs)?;
            Cow::Borrowed(inputs)
        } else {
            let mut sorted = inputs.to_vec();
            sorted.sort_unstable();
            sorted.dedup();
            Cow::Owned(sorted)
        };
        if let Some(&last) = inputs.last() {
            check_index("input", last as usize, self.n_inputs())?;
        }
        Ok(inputs)
    }

    /// Grows up to `desired` synapses on one capped segment toward the sorted `candidates`.
    fn grow_on_segment(
        &mut self,
        segment: u32,
        candidates: &[u32],
        desired: usize,
        initial_permanence: f32,
        rng: Option<&mut Random>,
    ) -> Result<()> {
        let row = segment as usize;
        let (cols, _) = self.segments.matrix.row(row)?;
        let existing = cols.len();
        let absent: Vec<u32> = {
            let mut absent = candidates.to_vec();
            absent.dedup();
            absent.retain(|c| cols.binary_search(c).is_err());
            absent
        };
        let mut n_new = desired.min(absent.len());
        if n_new == 0 {
            return Ok(());
        }

        if let Some(max) = self.max_synapses_per_segment {
            let overrun = (existing + n_new).saturating_sub(max);
            if overrun > 0 {
                self.destroy_weakest_synapses(segment, overrun, candidates)?;
            }
            let remaining = self.segments.matrix.n_non_zeros_on_row(row)?;
            n_new = n_new.min(max.saturating_sub(remaining));
        }
        if n_new == 0 {
            return Ok(());
        }

        let picked = match rng {
            Some(rng) => rng.sample(&absent, n_new),
            None => absent[..n_new].to_vec(),
        };
        trace!(segment, grown = picked.len(), "growing synapses");
        self.segments
            .matrix
            .set_zeros_on_outer(&[segment], &picked, initial_permanence)
    }

    /// Destroys up to `count` lowest-permanence synapses of a segment, sparing those to `protected` inputs.
    fn destroy_weakest_synapses(&mut self, segment: u32, count: usize, protected: &[u32]) -> Result<()> {
        let row = segment as usize;
        let (cols, values) = self.segments.matrix.row(row)?;
        let mut weakest: Vec<(f32, u32)> = cols
            .iter()
            .zip(values)
            .filter(|(c, _)| protected.binary_search(*c).is_err())
            .map(|(c, v)| (*v, *c))
            .collect();
        weakest.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        let mut doomed: Vec<u32> = weakest.into_iter().take(count).map(|(_, c)| c).collect();
        doomed.sort_unstable();
        trace!(segment, destroyed = doomed.len(), "destroying weakest synapses");
        self.segments
            .matrix
            .retain_row(row, |c, _| doomed.binary_search(&c).is_err());
        Ok(())
    }
}

impl SegmentOps for SparseMatrixConnections {
    type Store = SparseMatrix;

    fn segments(&self) -> &SegmentSparseMatrix {
        &self.segments
    }

    fn segments_mut(&mut self) -> &mut SegmentSparseMatrix {
        &mut self.segments
    }
}

impl Serializable for SparseMatrixConnections {
    fn validate_state(&self) -> Result<()> {
        self.segments.matrix.validate_state()?;
        self.segments.validate_state()?;
        if self.segments.matrix.n_rows() > 0 {
            let max = self.segments.matrix.n_non_zeros_per_row().into_iter().max().unwrap_or(0);
            if self.max_synapses_per_segment.is_some_and(|cap| max > cap) {
                return Err(HtmError::InvalidState(format!(
                    "a segment holds {max} synapses, above the cap"
                )));
            }
        }
        Ok(())
    }
}
