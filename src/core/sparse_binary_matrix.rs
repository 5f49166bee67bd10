//! The `SparseBinaryMatrix` records only which positions are set.
//!
//! It is the presence-only counterpart of `SparseMatrix`: every row is a sorted list of column indices,
//! with no values attached. Overlap scoring counts set positions against a dense or sparse input, and
//! conversions to and from `SparseMatrix` keep exactly the non-zero positions.

use serde::{Deserialize, Serialize};

use crate::core::sparse_matrix::{DenseMatrix, SparseMatrix};
use crate::error::{check_index, check_sorted, HtmError, Result};
use crate::serialization::Serializable;

/// A sparse 0/1 matrix with sorted rows.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseBinaryMatrix {
    n_cols: usize,
    rows: Vec<Vec<u32>>,
}

impl SparseBinaryMatrix {
    #[inline]
    pub fn new(n_rows: usize, n_cols: usize) -> Self {
        Self {
            n_cols,
            rows: vec![Vec::new(); n_rows],
        }
    }

    #[inline]
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), self.n_cols)
    }

    /// Changes the extents, dropping every set position outside the new shape.
    pub fn resize(&mut self, n_rows: usize, n_cols: usize) {
        self.rows.resize_with(n_rows, Vec::new);
        if n_cols < self.n_cols {
            let bound = n_cols as u32;
            for row in &mut self.rows {
                row.retain(|c| *c < bound);
            }
        }
        self.n_cols = n_cols;
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> Result<bool> {
        check_index("row", row, self.rows.len())?;
        check_index("column", col, self.n_cols)?;
        Ok(self.rows[row].binary_search(&(col as u32)).is_ok())
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: bool) -> Result<()> {
        check_index("row", row, self.rows.len())?;
        check_index("column", col, self.n_cols)?;
        let r = &mut self.rows[row];
        match (r.binary_search(&(col as u32)), value) {
            (Ok(i), false) => {
                r.remove(i);
            }
            (Err(i), true) => r.insert(i, col as u32),
            _ => {}
        }
        Ok(())
    }

    /// Returns the sorted set columns of one row.
    #[inline]
    pub fn row(&self, row: usize) -> Result<&[u32]> {
        check_index("row", row, self.rows.len())?;
        Ok(&self.rows[row])
    }

    pub fn get_row(&self, row: usize) -> Result<Vec<bool>> {
        check_index("row", row, self.rows.len())?;
        let mut dense = vec![false; self.n_cols];
        for c in &self.rows[row] {
            dense[*c as usize] = true;
        }
        Ok(dense)
    }

    pub fn get_col(&self, col: usize) -> Result<Vec<bool>> {
        check_index("column", col, self.n_cols)?;
        Ok(self
            .rows
            .iter()
            .map(|r| r.binary_search(&(col as u32)).is_ok())
            .collect())
    }

    pub fn set_row_to_zero(&mut self, row: usize) -> Result<()> {
        check_index("row", row, self.rows.len())?;
        self.rows[row].clear();
        Ok(())
    }

    #[inline]
    pub fn n_non_zeros(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    #[inline]
    pub fn n_non_zeros_on_row(&self, row: usize) -> Result<usize> {
        check_index("row", row, self.rows.len())?;
        Ok(self.rows[row].len())
    }

    pub fn n_non_zeros_per_row(&self) -> Vec<usize> {
        self.rows.iter().map(Vec::len).collect()
    }

    pub fn n_non_zeros_per_col(&self) -> Vec<usize> {
        let mut counts = vec![0; self.n_cols];
        for row in &self.rows {
            for c in row {
                counts[*c as usize] += 1;
            }
        }
        counts
    }

    /// Replaces one row with the sorted columns `cols`.
    pub fn replace_sparse_row(&mut self, row: usize, cols: &[u32]) -> Result<()> {
        check_index("row", row, self.rows.len())?;
        self.rows[row] = self.checked_row(cols)?;
        Ok(())
    }

    /// Appends a row given by its sorted set columns and returns its index.
    pub fn append_sparse_row(&mut self, cols: &[u32]) -> Result<usize> {
        let row = self.checked_row(cols)?;
        self.rows.push(row);
        Ok(self.rows.len() - 1)
    }

    /// Appends a row given as a dense 0/1 vector and returns its index.
    pub fn append_dense_row(&mut self, dense: &[bool]) -> Result<usize> {
        if dense.len() != self.n_cols {
            return Err(HtmError::ShapeMismatch {
                operation: "append_dense_row",
                left: self.shape(),
                right: (1, dense.len()),
            });
        }
        let row = dense
            .iter()
            .enumerate()
            .filter(|(_, set)| **set)
            .map(|(c, _)| c as u32)
            .collect();
        self.rows.push(row);
        Ok(self.rows.len() - 1)
    }

    fn checked_row(&self, cols: &[u32]) -> Result<Vec<u32>> {
        check_sorted("row columns", cols)?;
        if let Some(&last) = cols.last() {
            check_index("column", last as usize, self.n_cols)?;
        }
        let mut row = cols.to_vec();
        row.dedup();
        Ok(row)
    }

    /// For each row, sums `x[j]` over the row's set columns `j`.
    pub fn right_vec_sum_at_nz(&self, x: &[f32]) -> Result<Vec<f32>> {
        if x.len() != self.n_cols {
            return Err(HtmError::ShapeMismatch {
                operation: "right_vec_sum_at_nz",
                left: self.shape(),
                right: (x.len(), 1),
            });
        }
        Ok(self
            .rows
            .iter()
            .map(|row| row.iter().map(|c| x[*c as usize]).sum::<f32>())
            .collect())
    }

    /// For each row, counts the set columns that are in the active set.
    pub fn right_vec_sum_at_nz_sparse(&self, active_cols: &[u32]) -> Result<Vec<u32>> {
        let mut indicator = vec![false; self.n_cols];
        for &c in active_cols {
            check_index("column", c as usize, self.n_cols)?;
            indicator[c as usize] = true;
        }
        Ok(self
            .rows
            .iter()
            .map(|row| row.iter().filter(|c| indicator[**c as usize]).count() as u32)
            .collect())
    }

    pub fn to_dense(&self) -> DenseMatrix<bool> {
        let mut dense = DenseMatrix::new(self.rows.len(), self.n_cols);
        for (r, row) in self.rows.iter().enumerate() {
            for c in row {
                // Indices are in range by construction.
                let _ = dense.set(r, *c as usize, true);
            }
        }
        dense
    }

    pub fn from_dense(dense: &DenseMatrix<bool>) -> Self {
        let mut matrix = Self::new(0, dense.n_cols());
        for r in 0..dense.n_rows() {
            let row = dense.data()[r * dense.n_cols()..(r + 1) * dense.n_cols()]
                .iter()
                .enumerate()
                .filter(|(_, set)| **set)
                .map(|(c, _)| c as u32)
                .collect();
            matrix.rows.push(row);
        }
        matrix
    }
}

impl From<&SparseMatrix> for SparseBinaryMatrix {
    fn from(matrix: &SparseMatrix) -> Self {
        let rows = (0..matrix.n_rows())
            .map(|r| matrix.row(r).map(|(cols, _)| cols.to_vec()).unwrap_or_default())
            .collect();
        Self {
            n_cols: matrix.n_cols(),
            rows,
        }
    }
}

impl From<&SparseBinaryMatrix> for SparseMatrix {
    fn from(binary: &SparseBinaryMatrix) -> Self {
        let mut matrix = SparseMatrix::new(binary.n_rows(), binary.n_cols());
        for (r, row) in binary.rows.iter().enumerate() {
            // Rows of a binary matrix are sorted and in range.
            let _ = matrix.set_zeros_on_outer(&[r as u32], row, 1.0);
        }
        matrix
    }
}

impl Serializable for SparseBinaryMatrix {
    fn validate_state(&self) -> Result<()> {
        for (r, row) in self.rows.iter().enumerate() {
            if row.windows(2).any(|w| w[0] >= w[1]) {
                return Err(HtmError::InvalidState(format!("row {r} is not strictly sorted")));
            }
            if row.last().is_some_and(|c| *c as usize >= self.n_cols) {
                return Err(HtmError::InvalidState(format!("row {r} exceeds the column count")));
            }
        }
        Ok(())
    }
}
