//! Segment bookkeeping on top of a sparse row store.
//!
//! A segment is a row of the underlying matrix and belongs to exactly one cell. The
//! `SegmentMatrixAdapter` keeps the mapping in both directions and recycles the rows of
//! destroyed segments, so the matrix never shrinks and a segment handle stays valid until
//! the segment is destroyed.
//!
//! Capacity:
//! - With `max_segments_per_cell` set, creating a segment on a full cell first destroys the
//!   cell's least recently active segment.
//! - Activity is a per-segment iteration stamp, set at creation and refreshed by
//!   `record_segment_activity`. Ties go to the oldest segment.
//!
//! The operations live in the `SegmentOps` trait so that any type built around an adapter
//! (such as the connections substrate) exposes the same segment interface.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::core::sparse_binary_matrix::SparseBinaryMatrix;
use crate::core::sparse_matrix::SparseMatrix;
use crate::error::{check_index, check_sorted, HtmError, Result};
use crate::serialization::Serializable;

/// The row operations the segment bookkeeping needs from a matrix.
pub trait RowStore: Clone + Default + PartialEq + Serialize + DeserializeOwned {
    fn n_rows(&self) -> usize;
    fn n_cols(&self) -> usize;
    fn resize(&mut self, n_rows: usize, n_cols: usize);
    fn clear_row(&mut self, row: usize) -> Result<()>;
    fn row_cols(&self, row: usize) -> Result<&[u32]>;
}

impl RowStore for SparseMatrix {
    fn n_rows(&self) -> usize {
        SparseMatrix::n_rows(self)
    }

    fn n_cols(&self) -> usize {
        SparseMatrix::n_cols(self)
    }

    fn resize(&mut self, n_rows: usize, n_cols: usize) {
        SparseMatrix::resize(self, n_rows, n_cols)
    }

    fn clear_row(&mut self, row: usize) -> Result<()> {
        self.set_row_to_zero(row)
    }

    fn row_cols(&self, row: usize) -> Result<&[u32]> {
        self.row(row).map(|(cols, _)| cols)
    }
}

impl RowStore for SparseBinaryMatrix {
    fn n_rows(&self) -> usize {
        SparseBinaryMatrix::n_rows(self)
    }

    fn n_cols(&self) -> usize {
        SparseBinaryMatrix::n_cols(self)
    }

    fn resize(&mut self, n_rows: usize, n_cols: usize) {
        SparseBinaryMatrix::resize(self, n_rows, n_cols)
    }

    fn clear_row(&mut self, row: usize) -> Result<()> {
        self.set_row_to_zero(row)
    }

    fn row_cols(&self, row: usize) -> Result<&[u32]> {
        self.row(row)
    }
}

/// Maps the rows of a matrix to the cells that own them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentMatrixAdapter<M> {
    pub(crate) matrix: M,
    cell_for_segment: Vec<Option<u32>>,
    segments_for_cell: Vec<Vec<u32>>,
    destroyed_segments: Vec<u32>,
    created_seq: Vec<u64>,
    last_used: Vec<u64>,
    next_seq: u64,
    iteration: u64,
    max_segments_per_cell: Option<usize>,
}

/// A segment matrix over `f32` permanences.
pub type SegmentSparseMatrix = SegmentMatrixAdapter<SparseMatrix>;

/// A segment matrix over presence-only synapses.
pub type SegmentSparseBinaryMatrix = SegmentMatrixAdapter<SparseBinaryMatrix>;

impl<M: RowStore> SegmentMatrixAdapter<M> {
    /// Wraps an empty matrix with `n_cols` input columns for `n_cells` cells.
    pub fn new(n_cells: usize, matrix: M) -> Self {
        Self {
            matrix,
            cell_for_segment: Vec::new(),
            segments_for_cell: vec![Vec::new(); n_cells],
            destroyed_segments: Vec::new(),
            created_seq: Vec::new(),
            last_used: Vec::new(),
            next_seq: 0,
            iteration: 0,
            max_segments_per_cell: None,
        }
    }

    /// Caps the number of segments a single cell may own.
    pub fn with_max_segments_per_cell(mut self, max: usize) -> Self {
        self.max_segments_per_cell = Some(max);
        self
    }

    #[inline]
    pub fn matrix(&self) -> &M {
        &self.matrix
    }

    /// Mutable access to the underlying matrix. Rows of destroyed segments must stay empty.
    #[inline]
    pub fn matrix_mut(&mut self) -> &mut M {
        &mut self.matrix
    }

    #[inline]
    pub fn max_segments_per_cell(&self) -> Option<usize> {
        self.max_segments_per_cell
    }

    fn least_recently_active(&self, cell: usize) -> Option<u32> {
        self.segments_for_cell[cell]
            .iter()
            .copied()
            .min_by_key(|s| (self.last_used[*s as usize], self.created_seq[*s as usize]))
    }

    fn destroy_one(&mut self, segment: u32) -> Result<()> {
        let s = segment as usize;
        let Some(cell) = self.cell_for_segment[s] else {
            return Ok(());
        };
        self.matrix.clear_row(s)?;
        self.segments_for_cell[cell as usize].retain(|x| *x != segment);
        self.cell_for_segment[s] = None;
        self.destroyed_segments.push(segment);
        Ok(())
    }

    fn check_live(&self, segment: u32) -> Result<u32> {
        let s = segment as usize;
        check_index("segment", s, self.cell_for_segment.len())?;
        self.cell_for_segment[s].ok_or(HtmError::InvalidIndex {
            what: "destroyed segment",
            index: s,
            bound: self.cell_for_segment.len(),
        })
    }
}

impl<M: RowStore> Serializable for SegmentMatrixAdapter<M> {
    fn validate_state(&self) -> Result<()> {
        let n = self.cell_for_segment.len();
        if self.matrix.n_rows() != n || self.created_seq.len() != n || self.last_used.len() != n {
            return Err(HtmError::InvalidState(
                "segment bookkeeping does not match the matrix row count".to_string(),
            ));
        }
        for (cell, segments) in self.segments_for_cell.iter().enumerate() {
            for &s in segments {
                if self.cell_for_segment.get(s as usize).copied().flatten() != Some(cell as u32) {
                    return Err(HtmError::InvalidState(format!(
                        "segment {s} is listed on cell {cell} but owned elsewhere"
                    )));
                }
            }
        }
        for &s in &self.destroyed_segments {
            if self.cell_for_segment.get(s as usize).copied().flatten().is_some() {
                return Err(HtmError::InvalidState(format!("segment {s} is destroyed and live")));
            }
        }
        let live = self.cell_for_segment.iter().flatten().count();
        if live + self.destroyed_segments.len() != n {
            return Err(HtmError::InvalidState("segment handles are unaccounted for".to_string()));
        }
        Ok(())
    }
}

/// Segment and cell operations shared by everything built on a `SegmentMatrixAdapter`.
pub trait SegmentOps {
    type Store: RowStore;

    fn segments(&self) -> &SegmentMatrixAdapter<Self::Store>;

    fn segments_mut(&mut self) -> &mut SegmentMatrixAdapter<Self::Store>;

    #[inline]
    fn n_cells(&self) -> usize {
        self.segments().segments_for_cell.len()
    }

    /// Number of live segments.
    #[inline]
    fn n_segments(&self) -> usize {
        let adapter = self.segments();
        adapter.cell_for_segment.len() - adapter.destroyed_segments.len()
    }

    /// Number of segment handles ever allocated; per-segment activity vectors have this length.
    #[inline]
    fn segment_flat_list_length(&self) -> usize {
        self.segments().cell_for_segment.len()
    }

    #[inline]
    fn iteration(&self) -> u64 {
        self.segments().iteration
    }

    fn start_new_iteration(&mut self) {
        self.segments_mut().iteration += 1;
    }

    /// Creates one segment on each of `cells`, returning the new handles in the same order.
    ///
    /// - Recycles rows of destroyed segments before growing the matrix.
    /// - Evicts the least recently active segment of a cell that is at capacity.
    fn create_segments(&mut self, cells: &[u32]) -> Result<Vec<u32>> {
        let adapter = self.segments_mut();
        for &cell in cells {
            check_index("cell", cell as usize, adapter.segments_for_cell.len())?;
        }
        if adapter.max_segments_per_cell == Some(0) {
            return Err(HtmError::InvalidParameter {
                name: "max_segments_per_cell",
                message: "must be at least 1".to_string(),
            });
        }

        let mut created = Vec::with_capacity(cells.len());
        for &cell in cells {
            let c = cell as usize;
            if let Some(max) = adapter.max_segments_per_cell {
                while adapter.segments_for_cell[c].len() >= max {
                    let Some(victim) = adapter.least_recently_active(c) else {
                        break;
                    };
                    debug!(cell, segment = victim, "evicting least recently active segment");
                    adapter.destroy_one(victim)?;
                }
            }

            let segment = match adapter.destroyed_segments.pop() {
                Some(s) => s,
                None => {
                    let s = adapter.cell_for_segment.len();
                    let n_cols = adapter.matrix.n_cols();
                    adapter.matrix.resize(s + 1, n_cols);
                    adapter.cell_for_segment.push(None);
                    adapter.created_seq.push(0);
                    adapter.last_used.push(0);
                    s as u32
                }
            };

            let s = segment as usize;
            adapter.cell_for_segment[s] = Some(cell);
            adapter.segments_for_cell[c].push(segment);
            adapter.created_seq[s] = adapter.next_seq;
            adapter.next_seq += 1;
            adapter.last_used[s] = adapter.iteration;
            created.push(segment);
        }
        Ok(created)
    }

    /// Destroys segments and their synapses. Handles become invalid until recycled.
    fn destroy_segments(&mut self, segments: &[u32]) -> Result<()> {
        let adapter = self.segments_mut();
        for &s in segments {
            adapter.check_live(s)?;
        }
        for &s in segments {
            adapter.destroy_one(s)?;
        }
        Ok(())
    }

    /// Returns the cell that owns a live segment.
    fn cell_for_segment(&self, segment: u32) -> Result<u32> {
        self.segments().check_live(segment)
    }

    fn map_segments_to_cells(&self, segments: &[u32]) -> Result<Vec<u32>> {
        segments.iter().map(|s| self.segments().check_live(*s)).collect()
    }

    /// Number of synapses (non-zero entries) on each segment.
    fn map_segments_to_synapse_counts(&self, segments: &[u32]) -> Result<Vec<usize>> {
        let adapter = self.segments();
        segments
            .iter()
            .map(|&s| {
                adapter.check_live(s)?;
                Ok(adapter.matrix.row_cols(s as usize)?.len())
            })
            .collect()
    }

    fn get_segment_counts(&self, cells: &[u32]) -> Result<Vec<usize>> {
        let adapter = self.segments();
        cells
            .iter()
            .map(|&c| {
                check_index("cell", c as usize, adapter.segments_for_cell.len())?;
                Ok(adapter.segments_for_cell[c as usize].len())
            })
            .collect()
    }

    /// Live segments of a cell, oldest first.
    fn get_segments_for_cell(&self, cell: u32) -> Result<&[u32]> {
        let adapter = self.segments();
        check_index("cell", cell as usize, adapter.segments_for_cell.len())?;
        Ok(&adapter.segments_for_cell[cell as usize])
    }

    /// Sorts segments by owning cell, ties by creation order.
    fn sort_segments_by_cell(&self, segments: &mut [u32]) -> Result<()> {
        let adapter = self.segments();
        for &s in segments.iter() {
            adapter.check_live(s)?;
        }
        segments.sort_by_key(|s| {
            let s = *s as usize;
            (adapter.cell_for_segment[s], adapter.created_seq[s])
        });
        Ok(())
    }

    /// Keeps the segments whose cell is in `cells`.
    ///
    /// - With `assume_sorted`, `segments` must already be sorted by cell and `cells` ascending;
    ///   otherwise an `UnsortedInput` error is returned.
    /// - Without it, both are sorted first, and the result is ordered by cell.
    fn filter_segments_by_cell(&self, segments: &[u32], cells: &[u32], assume_sorted: bool) -> Result<Vec<u32>> {
        let mut segments = segments.to_vec();
        let mut cells = cells.to_vec();
        if assume_sorted {
            check_sorted("cells", &cells)?;
            let owners = self.map_segments_to_cells(&segments)?;
            check_sorted("segments by cell", &owners)?;
        } else {
            self.sort_segments_by_cell(&mut segments)?;
            cells.sort_unstable();
        }

        let owners = self.map_segments_to_cells(&segments)?;
        let mut filtered = Vec::with_capacity(segments.len());
        let mut j = 0;
        for (segment, owner) in segments.iter().zip(owners) {
            while j < cells.len() && cells[j] < owner {
                j += 1;
            }
            if j < cells.len() && cells[j] == owner {
                filtered.push(*segment);
            }
        }
        Ok(filtered)
    }

    /// Marks segments as active in the current iteration.
    fn record_segment_activity(&mut self, segments: &[u32]) -> Result<()> {
        let adapter = self.segments_mut();
        for &s in segments {
            adapter.check_live(s)?;
        }
        let iteration = adapter.iteration;
        for &s in segments {
            adapter.last_used[s as usize] = iteration;
        }
        Ok(())
    }

    /// Iteration at which a segment was last recorded active (or created).
    fn last_used_iteration(&self, segment: u32) -> Result<u64> {
        let adapter = self.segments();
        adapter.check_live(segment)?;
        Ok(adapter.last_used[segment as usize])
    }
}

impl<M: RowStore> SegmentOps for SegmentMatrixAdapter<M> {
    type Store = M;

    fn segments(&self) -> &SegmentMatrixAdapter<M> {
        self
    }

    fn segments_mut(&mut self) -> &mut SegmentMatrixAdapter<M> {
        self
    }
}
