//! The `SparseMatrix` stores `f32` values for a rows × columns grid, materializing only non-zero entries.
//!
//! Each row keeps its non-zero column indices sorted ascending next to their values. In the temporal
//! memory a row is a dendritic segment, a column is a presynaptic input bit and a value is a permanence.
//!
//! Non-zero entry:
//! - Storing `0.0` at a position removes the entry; a stored zero never exists.
//! - Increments that land exactly on zero remove the entry as well.
//!
//! Overlap scoring:
//! - `right_vec_sum_at_nz` sums a dense vector over each row's non-zero positions.
//! - The `_sparse` variants take the sorted set of active columns and count instead.
//! - The threshold variants only let entries whose stored value passes the threshold contribute.
//!
//! Outer-product mutations:
//! - Bulk operations address the cartesian product of a set of rows and a sorted set of columns.
//! - They are what the connections substrate uses to reinforce, punish and grow synapses.
//!
//! Arithmetic:
//! - Binary operations accept an `Operand`, a closed set of scalar, dense and sparse right-hand sides.
//! - Incompatible shapes fail with `ShapeMismatch`; nothing is silently truncated or broadcast.

use serde::{Deserialize, Serialize};
use std::ops::{Mul, Neg};

use crate::core::random::Random;
use crate::error::{check_index, check_sorted, HtmError, Result};
use crate::serialization::Serializable;

/// Comparison used when a value is tested against a threshold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdMode {
    /// `value >= threshold`
    #[default]
    Inclusive,
    /// `value > threshold`
    Strict,
}

impl ThresholdMode {
    #[inline]
    pub fn passes<T: PartialOrd>(self, value: T, threshold: T) -> bool {
        match self {
            ThresholdMode::Inclusive => value >= threshold,
            ThresholdMode::Strict => value > threshold,
        }
    }
}

/// Row-major dense matrix used for interop with the sparse representations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DenseMatrix<T> {
    n_rows: usize,
    n_cols: usize,
    data: Vec<T>,
}

impl<T: Copy + Default> DenseMatrix<T> {
    /// Creates a matrix filled with `T::default()`.
    pub fn new(n_rows: usize, n_cols: usize) -> Self {
        Self {
            n_rows,
            n_cols,
            data: vec![T::default(); n_rows * n_cols],
        }
    }

    /// Builds a matrix from equally long rows.
    pub fn from_rows(rows: &[Vec<T>]) -> Result<Self> {
        let n_cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * n_cols);
        for row in rows {
            if row.len() != n_cols {
                return Err(HtmError::ShapeMismatch {
                    operation: "from_rows",
                    left: (1, n_cols),
                    right: (1, row.len()),
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            n_rows: rows.len(),
            n_cols,
            data,
        })
    }

    #[inline]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    #[inline]
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.n_rows, self.n_cols)
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> Result<T> {
        check_index("row", row, self.n_rows)?;
        check_index("column", col, self.n_cols)?;
        Ok(self.data[row * self.n_cols + col])
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: T) -> Result<()> {
        check_index("row", row, self.n_rows)?;
        check_index("column", col, self.n_cols)?;
        self.data[row * self.n_cols + col] = value;
        Ok(())
    }

    /// Returns a view of one row.
    #[inline]
    pub fn row(&self, row: usize) -> Result<&[T]> {
        check_index("row", row, self.n_rows)?;
        Ok(&self.data[row * self.n_cols..(row + 1) * self.n_cols])
    }

    #[inline]
    pub fn data(&self) -> &[T] {
        &self.data
    }
}

/// Right-hand side of a sparse matrix arithmetic operation.
#[derive(Clone, Copy, Debug)]
pub enum Operand<'a> {
    Scalar(f32),
    /// A row vector, shape `(1, len)`; a column vector when used as a product's right factor.
    DenseVector(&'a [f32]),
    Dense(&'a DenseMatrix<f32>),
    Sparse(&'a SparseMatrix),
}

impl Operand<'_> {
    fn shape(&self) -> (usize, usize) {
        match self {
            Operand::Scalar(_) => (1, 1),
            Operand::DenseVector(v) => (1, v.len()),
            Operand::Dense(m) => m.shape(),
            Operand::Sparse(m) => m.shape(),
        }
    }

    fn value_at(&self, row: usize, col: usize) -> f32 {
        match self {
            Operand::Scalar(s) => *s,
            Operand::DenseVector(v) => v[col],
            Operand::Dense(m) => m.data[row * m.n_cols + col],
            Operand::Sparse(m) => m.rows[row].value(col as u32),
        }
    }
}

/// The sorted non-zero entries of one row.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct SparseRow {
    cols: Vec<u32>,
    values: Vec<f32>,
}

impl SparseRow {
    #[inline]
    fn value(&self, col: u32) -> f32 {
        match self.cols.binary_search(&col) {
            Ok(i) => self.values[i],
            Err(_) => 0.0,
        }
    }

    #[inline]
    fn set(&mut self, col: u32, value: f32) {
        match self.cols.binary_search(&col) {
            Ok(i) if value == 0.0 => {
                self.cols.remove(i);
                self.values.remove(i);
            }
            Ok(i) => self.values[i] = value,
            Err(_) if value == 0.0 => {}
            Err(i) => {
                self.cols.insert(i, col);
                self.values.insert(i, value);
            }
        }
    }

    #[inline]
    fn clear(&mut self) {
        self.cols.clear();
        self.values.clear();
    }

    /// Keeps only the entries for which `keep` holds.
    fn retain(&mut self, mut keep: impl FnMut(u32, f32) -> bool) {
        let mut write = 0;
        for read in 0..self.cols.len() {
            if keep(self.cols[read], self.values[read]) {
                self.cols[write] = self.cols[read];
                self.values[write] = self.values[read];
                write += 1;
            }
        }
        self.cols.truncate(write);
        self.values.truncate(write);
    }

    /// Applies `f` to each stored entry whose column is (or is not) in the sorted `cols`.
    fn update_matching(&mut self, cols: &[u32], in_cols: bool, mut f: impl FnMut(f32) -> f32) {
        let mut j = 0;
        for i in 0..self.cols.len() {
            while j < cols.len() && cols[j] < self.cols[i] {
                j += 1;
            }
            let present = j < cols.len() && cols[j] == self.cols[i];
            if present == in_cols {
                self.values[i] = f(self.values[i]);
            }
        }
        self.retain(|_, v| v != 0.0);
    }

    /// Columns of the sorted `cols` that have no entry in this row.
    fn absent_from(&self, cols: &[u32]) -> Vec<u32> {
        let mut absent = Vec::with_capacity(cols.len());
        let mut i = 0;
        for &c in cols {
            while i < self.cols.len() && self.cols[i] < c {
                i += 1;
            }
            if i >= self.cols.len() || self.cols[i] != c {
                absent.push(c);
            }
        }
        absent.dedup();
        absent
    }

    /// Inserts entries for sorted columns known to be absent.
    fn insert_absent(&mut self, cols: &[u32], value: f32) {
        if value == 0.0 || cols.is_empty() {
            return;
        }
        let mut merged_cols = Vec::with_capacity(self.cols.len() + cols.len());
        let mut merged_values = Vec::with_capacity(self.cols.len() + cols.len());
        let (mut i, mut j) = (0, 0);
        while i < self.cols.len() || j < cols.len() {
            if j >= cols.len() || (i < self.cols.len() && self.cols[i] < cols[j]) {
                merged_cols.push(self.cols[i]);
                merged_values.push(self.values[i]);
                i += 1;
            } else {
                merged_cols.push(cols[j]);
                merged_values.push(value);
                j += 1;
            }
        }
        self.cols = merged_cols;
        self.values = merged_values;
    }
}

/// A numeric sparse matrix with sorted rows.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseMatrix {
    n_cols: usize,
    rows: Vec<SparseRow>,
}

impl SparseMatrix {
    /// Creates an empty `n_rows` × `n_cols` matrix.
    #[inline]
    pub fn new(n_rows: usize, n_cols: usize) -> Self {
        Self {
            n_cols,
            rows: vec![SparseRow::default(); n_rows],
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

    /// Changes the extents, dropping every entry that falls outside the new shape.
    pub fn resize(&mut self, n_rows: usize, n_cols: usize) {
        self.rows.resize_with(n_rows, SparseRow::default);
        if n_cols < self.n_cols {
            let bound = n_cols as u32;
            for row in &mut self.rows {
                row.retain(|c, _| c < bound);
            }
        }
        self.n_cols = n_cols;
    }

    /// Appends a row given as `(column, value)` pairs in any order and returns its index.
    pub fn add_row(&mut self, entries: &[(u32, f32)]) -> Result<usize> {
        let mut row = SparseRow::default();
        for &(c, v) in entries {
            check_index("column", c as usize, self.n_cols)?;
            row.set(c, v);
        }
        self.rows.push(row);
        Ok(self.rows.len() - 1)
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> Result<f32> {
        check_index("row", row, self.rows.len())?;
        check_index("column", col, self.n_cols)?;
        Ok(self.rows[row].value(col as u32))
    }

    /// Stores `value` at `(row, col)`; a zero removes the entry.
    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f32) -> Result<()> {
        check_index("row", row, self.rows.len())?;
        check_index("column", col, self.n_cols)?;
        self.rows[row].set(col as u32, value);
        Ok(())
    }

    /// Returns the sorted column indices and values of one row.
    #[inline]
    pub fn row(&self, row: usize) -> Result<(&[u32], &[f32])> {
        check_index("row", row, self.rows.len())?;
        let r = &self.rows[row];
        Ok((&r.cols, &r.values))
    }

    /// Returns one row as a dense vector.
    pub fn get_row(&self, row: usize) -> Result<Vec<f32>> {
        check_index("row", row, self.rows.len())?;
        let mut dense = vec![0.0; self.n_cols];
        let r = &self.rows[row];
        for (c, v) in r.cols.iter().zip(&r.values) {
            dense[*c as usize] = *v;
        }
        Ok(dense)
    }

    /// Returns one column as a dense vector.
    pub fn get_col(&self, col: usize) -> Result<Vec<f32>> {
        check_index("column", col, self.n_cols)?;
        Ok(self.rows.iter().map(|r| r.value(col as u32)).collect())
    }

    pub fn set_row_to_zero(&mut self, row: usize) -> Result<()> {
        check_index("row", row, self.rows.len())?;
        self.rows[row].clear();
        Ok(())
    }

    pub fn set_col_to_zero(&mut self, col: usize) -> Result<()> {
        check_index("column", col, self.n_cols)?;
        for row in &mut self.rows {
            row.set(col as u32, 0.0);
        }
        Ok(())
    }

    #[inline]
    pub fn n_non_zeros(&self) -> usize {
        self.rows.iter().map(|r| r.cols.len()).sum()
    }

    #[inline]
    pub fn n_non_zeros_on_row(&self, row: usize) -> Result<usize> {
        check_index("row", row, self.rows.len())?;
        Ok(self.rows[row].cols.len())
    }

    pub fn n_non_zeros_per_row(&self) -> Vec<usize> {
        self.rows.iter().map(|r| r.cols.len()).collect()
    }

    pub fn n_non_zeros_per_col(&self) -> Vec<usize> {
        let mut counts = vec![0; self.n_cols];
        for row in &self.rows {
            for c in &row.cols {
                counts[*c as usize] += 1;
            }
        }
        counts
    }

    /// Counts, for each of `rows`, the entries whose column is in `cols`.
    pub fn n_non_zeros_per_row_on_cols(&self, rows: &[u32], cols: &[u32]) -> Result<Vec<usize>> {
        self.check_rows(rows)?;
        let indicator = self.indicator(cols)?;
        Ok(rows
            .iter()
            .map(|&r| {
                self.rows[r as usize]
                    .cols
                    .iter()
                    .filter(|c| indicator[**c as usize])
                    .count()
            })
            .collect())
    }

    /// Expands to a dense matrix of the same shape.
    pub fn to_dense(&self) -> DenseMatrix<f32> {
        let mut dense = DenseMatrix::new(self.rows.len(), self.n_cols);
        for (r, row) in self.rows.iter().enumerate() {
            for (c, v) in row.cols.iter().zip(&row.values) {
                dense.data[r * self.n_cols + *c as usize] = *v;
            }
        }
        dense
    }

    /// Builds a sparse matrix from the non-zero entries of a dense one.
    pub fn from_dense(dense: &DenseMatrix<f32>) -> Self {
        let mut matrix = Self::new(dense.n_rows, dense.n_cols);
        for (r, row) in matrix.rows.iter_mut().enumerate() {
            for c in 0..dense.n_cols {
                let v = dense.data[r * dense.n_cols + c];
                if v != 0.0 {
                    row.cols.push(c as u32);
                    row.values.push(v);
                }
            }
        }
        matrix
    }

    /// For each row, sums `x[j]` over the row's non-zero columns `j`.
    pub fn right_vec_sum_at_nz(&self, x: &[f32]) -> Result<Vec<f32>> {
        self.sum_at_nz_where(x, |_| true)
    }

    /// Like `right_vec_sum_at_nz`, counting only entries whose value is `> threshold`.
    pub fn right_vec_sum_at_nz_gt_threshold(&self, x: &[f32], threshold: f32) -> Result<Vec<f32>> {
        self.sum_at_nz_where(x, |v| v > threshold)
    }

    /// Like `right_vec_sum_at_nz`, counting only entries whose value is `>= threshold`.
    pub fn right_vec_sum_at_nz_gte_threshold(&self, x: &[f32], threshold: f32) -> Result<Vec<f32>> {
        self.sum_at_nz_where(x, |v| v >= threshold)
    }

    /// For each row, counts the non-zero columns that are in the active set.
    pub fn right_vec_sum_at_nz_sparse(&self, active_cols: &[u32]) -> Result<Vec<u32>> {
        self.count_at_nz_where(active_cols, |_| true)
    }

    pub fn right_vec_sum_at_nz_gt_threshold_sparse(
        &self,
        active_cols: &[u32],
        threshold: f32,
    ) -> Result<Vec<u32>> {
        self.count_at_nz_where(active_cols, |v| v > threshold)
    }

    pub fn right_vec_sum_at_nz_gte_threshold_sparse(
        &self,
        active_cols: &[u32],
        threshold: f32,
    ) -> Result<Vec<u32>> {
        self.count_at_nz_where(active_cols, |v| v >= threshold)
    }

    /// Sparse overlap counting entries whose value passes `threshold` under `mode`.
    pub fn right_vec_sum_at_nz_threshold_sparse(
        &self,
        active_cols: &[u32],
        threshold: f32,
        mode: ThresholdMode,
    ) -> Result<Vec<u32>> {
        self.count_at_nz_where(active_cols, |v| mode.passes(v, threshold))
    }

    fn sum_at_nz_where(&self, x: &[f32], qualifies: impl Fn(f32) -> bool) -> Result<Vec<f32>> {
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
            .map(|row| {
                row.cols
                    .iter()
                    .zip(&row.values)
                    .filter(|(_, v)| qualifies(**v))
                    .map(|(c, _)| x[*c as usize])
                    .sum::<f32>()
            })
            .collect())
    }

    fn count_at_nz_where(&self, active_cols: &[u32], qualifies: impl Fn(f32) -> bool) -> Result<Vec<u32>> {
        let indicator = self.indicator(active_cols)?;
        Ok(self
            .rows
            .iter()
            .map(|row| {
                row.cols
                    .iter()
                    .zip(&row.values)
                    .filter(|(c, v)| indicator[**c as usize] && qualifies(**v))
                    .count() as u32
            })
            .collect())
    }

    fn indicator(&self, cols: &[u32]) -> Result<Vec<bool>> {
        let mut indicator = vec![false; self.n_cols];
        for &c in cols {
            check_index("column", c as usize, self.n_cols)?;
            indicator[c as usize] = true;
        }
        Ok(indicator)
    }

    fn check_rows(&self, rows: &[u32]) -> Result<()> {
        for &r in rows {
            check_index("row", r as usize, self.rows.len())?;
        }
        Ok(())
    }

    fn check_outer(&self, rows: &[u32], cols: &[u32]) -> Result<()> {
        self.check_rows(rows)?;
        check_sorted("columns", cols)?;
        if let Some(&last) = cols.last() {
            check_index("column", last as usize, self.n_cols)?;
        }
        Ok(())
    }

    /// Adds `delta` to the existing entries at `rows` × `cols`; entries that reach zero are removed.
    ///
    /// - `cols` must be sorted ascending.
    /// - Absent entries are never created.
    pub fn increment_non_zeros_on_outer(&mut self, rows: &[u32], cols: &[u32], delta: f32) -> Result<()> {
        self.check_outer(rows, cols)?;
        for &r in rows {
            self.rows[r as usize].update_matching(cols, true, |v| v + delta);
        }
        Ok(())
    }

    /// Adds `delta` to the existing entries of `rows` whose column is not in the sorted `cols`.
    pub fn increment_non_zeros_on_rows_excluding_cols(
        &mut self,
        rows: &[u32],
        cols: &[u32],
        delta: f32,
    ) -> Result<()> {
        self.check_outer(rows, cols)?;
        for &r in rows {
            self.rows[r as usize].update_matching(cols, false, |v| v + delta);
        }
        Ok(())
    }

    /// Stores `value` at every absent position of `rows` × `cols`.
    pub fn set_zeros_on_outer(&mut self, rows: &[u32], cols: &[u32], value: f32) -> Result<()> {
        self.check_outer(rows, cols)?;
        for &r in rows {
            let row = &mut self.rows[r as usize];
            let absent = row.absent_from(cols);
            row.insert_absent(&absent, value);
        }
        Ok(())
    }

    /// For each row `rows[i]`, stores `value` at `counts[i]` absent positions of `cols` picked uniformly.
    ///
    /// - A row with fewer absent positions than requested gets all of them.
    /// - Non-positive counts leave the row untouched.
    /// - Returns how many entries were created per row.
    pub fn set_random_zeros_on_outer(
        &mut self,
        rows: &[u32],
        cols: &[u32],
        counts: &[i32],
        value: f32,
        rng: &mut Random,
    ) -> Result<Vec<usize>> {
        self.check_outer(rows, cols)?;
        if counts.len() != rows.len() {
            return Err(HtmError::ShapeMismatch {
                operation: "set_random_zeros_on_outer",
                left: (rows.len(), 1),
                right: (counts.len(), 1),
            });
        }
        let mut created = Vec::with_capacity(rows.len());
        for (&r, &count) in rows.iter().zip(counts) {
            if count <= 0 {
                created.push(0);
                continue;
            }
            let row = &mut self.rows[r as usize];
            let absent = row.absent_from(cols);
            let picked = rng.sample(&absent, count as usize);
            row.insert_absent(&picked, value);
            created.push(picked.len());
        }
        Ok(created)
    }

    /// Clamps the entries of `rows` into `[lo, hi]`, removing any that clamp to zero.
    pub fn clip_rows_below_and_above(&mut self, rows: &[u32], lo: f32, hi: f32) -> Result<()> {
        self.check_rows(rows)?;
        for &r in rows {
            let row = &mut self.rows[r as usize];
            for v in row.values.iter_mut() {
                *v = v.clamp(lo, hi);
            }
            row.retain(|_, v| v != 0.0);
        }
        Ok(())
    }

    /// Removes every entry whose value is below `threshold`.
    pub fn threshold(&mut self, threshold: f32) {
        for row in &mut self.rows {
            row.retain(|_, v| v >= threshold);
        }
    }

    /// Keeps the entries of one row for which `keep(column, value)` holds.
    pub(crate) fn retain_row(&mut self, row: usize, keep: impl FnMut(u32, f32) -> bool) {
        self.rows[row].retain(keep);
    }

    /// Returns a copy with every value negated.
    pub fn negate(&self) -> SparseMatrix {
        let mut out = self.clone();
        for row in &mut out.rows {
            for v in row.values.iter_mut() {
                *v = -*v;
            }
        }
        out
    }

    /// Element-wise sum. A scalar is added to every position, including the implicit zeros.
    pub fn add(&self, rhs: Operand<'_>) -> Result<SparseMatrix> {
        self.zip_with("add", rhs, |a, b| a + b)
    }

    /// Element-wise difference.
    pub fn subtract(&self, rhs: Operand<'_>) -> Result<SparseMatrix> {
        self.zip_with("subtract", rhs, |a, b| a - b)
    }

    /// Scales by a scalar, or multiplies element-wise with a same-shape operand.
    pub fn multiply(&self, rhs: Operand<'_>) -> Result<SparseMatrix> {
        match rhs {
            Operand::Scalar(s) => Ok(self * s),
            other => self.zip_with("multiply", other, |a, b| a * b),
        }
    }

    /// Divides every entry by a non-zero scalar.
    pub fn divide(&self, rhs: Operand<'_>) -> Result<SparseMatrix> {
        match rhs {
            Operand::Scalar(s) if s == 0.0 => Err(HtmError::InvalidParameter {
                name: "divisor",
                message: "division by zero".to_string(),
            }),
            Operand::Scalar(s) => Ok(self * (1.0 / s)),
            other => Err(HtmError::ShapeMismatch {
                operation: "divide",
                left: self.shape(),
                right: other.shape(),
            }),
        }
    }

    /// Matrix product `self × rhs`. A dense vector is a column vector here and yields an `n_rows × 1` matrix.
    pub fn matmul(&self, rhs: Operand<'_>) -> Result<SparseMatrix> {
        let (inner, n_out) = match rhs {
            Operand::Scalar(s) => return Ok(self * s),
            Operand::DenseVector(v) => (v.len(), 1),
            other => other.shape(),
        };
        if inner != self.n_cols {
            return Err(HtmError::ShapeMismatch {
                operation: "matmul",
                left: self.shape(),
                right: (inner, n_out),
            });
        }

        let mut out = SparseMatrix::new(self.rows.len(), n_out);
        let mut acc = vec![0.0f32; n_out];
        for (r, row) in self.rows.iter().enumerate() {
            acc.iter_mut().for_each(|a| *a = 0.0);
            for (&k, &a) in row.cols.iter().zip(&row.values) {
                let k = k as usize;
                match rhs {
                    Operand::DenseVector(v) => acc[0] += a * v[k],
                    Operand::Dense(m) => {
                        for (j, b) in m.data[k * n_out..(k + 1) * n_out].iter().enumerate() {
                            acc[j] += a * b;
                        }
                    }
                    Operand::Sparse(m) => {
                        let other = &m.rows[k];
                        for (&j, &b) in other.cols.iter().zip(&other.values) {
                            acc[j as usize] += a * b;
                        }
                    }
                    Operand::Scalar(_) => {}
                }
            }
            let out_row = &mut out.rows[r];
            for (j, &v) in acc.iter().enumerate() {
                if v != 0.0 {
                    out_row.cols.push(j as u32);
                    out_row.values.push(v);
                }
            }
        }
        Ok(out)
    }

    fn zip_with(
        &self,
        operation: &'static str,
        rhs: Operand<'_>,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<SparseMatrix> {
        if !matches!(rhs, Operand::Scalar(_)) && rhs.shape() != self.shape() {
            return Err(HtmError::ShapeMismatch {
                operation,
                left: self.shape(),
                right: rhs.shape(),
            });
        }

        let mut out = SparseMatrix::new(self.rows.len(), self.n_cols);
        match rhs {
            Operand::Sparse(m) => {
                for (r, out_row) in out.rows.iter_mut().enumerate() {
                    let (a, b) = (&self.rows[r], &m.rows[r]);
                    let (mut i, mut j) = (0, 0);
                    while i < a.cols.len() || j < b.cols.len() {
                        let (col, v) = if j >= b.cols.len() || (i < a.cols.len() && a.cols[i] < b.cols[j]) {
                            i += 1;
                            (a.cols[i - 1], f(a.values[i - 1], 0.0))
                        } else if i >= a.cols.len() || b.cols[j] < a.cols[i] {
                            j += 1;
                            (b.cols[j - 1], f(0.0, b.values[j - 1]))
                        } else {
                            i += 1;
                            j += 1;
                            (a.cols[i - 1], f(a.values[i - 1], b.values[j - 1]))
                        };
                        if v != 0.0 {
                            out_row.cols.push(col);
                            out_row.values.push(v);
                        }
                    }
                }
            }
            other => {
                for (r, out_row) in out.rows.iter_mut().enumerate() {
                    let row = &self.rows[r];
                    for c in 0..self.n_cols {
                        let v = f(row.value(c as u32), other.value_at(r, c));
                        if v != 0.0 {
                            out_row.cols.push(c as u32);
                            out_row.values.push(v);
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Neg for &SparseMatrix {
    type Output = SparseMatrix;

    fn neg(self) -> SparseMatrix {
        self.negate()
    }
}

impl Mul<f32> for &SparseMatrix {
    type Output = SparseMatrix;

    fn mul(self, s: f32) -> SparseMatrix {
        if s == 0.0 {
            return SparseMatrix::new(self.n_rows(), self.n_cols);
        }
        let mut out = self.clone();
        for row in &mut out.rows {
            for v in row.values.iter_mut() {
                *v *= s;
            }
            row.retain(|_, v| v != 0.0);
        }
        out
    }
}

impl Serializable for SparseMatrix {
    fn validate_state(&self) -> Result<()> {
        for (r, row) in self.rows.iter().enumerate() {
            if row.cols.len() != row.values.len() {
                return Err(HtmError::InvalidState(format!("row {r} has mismatched lengths")));
            }
            if row.cols.windows(2).any(|w| w[0] >= w[1]) {
                return Err(HtmError::InvalidState(format!("row {r} is not strictly sorted")));
            }
            if row.cols.last().is_some_and(|c| *c as usize >= self.n_cols) {
                return Err(HtmError::InvalidState(format!("row {r} exceeds the column count")));
            }
            if row.values.iter().any(|v| *v == 0.0) {
                return Err(HtmError::InvalidState(format!("row {r} stores an explicit zero")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_matrix() -> SparseMatrix {
        let dense = DenseMatrix::from_rows(&[
            vec![0.0, 0.5, 0.0, 0.2],
            vec![0.0, 0.0, 0.0, 0.0],
            vec![0.9, 0.0, 0.3, 0.0],
        ])
        .unwrap();
        SparseMatrix::from_dense(&dense)
    }

    #[test]
    fn test_set_zero_removes_entry() {
        let mut m = SparseMatrix::new(2, 3);
        m.set(1, 2, 0.4).unwrap();
        assert_eq!(m.n_non_zeros(), 1);
        m.set(1, 2, 0.0).unwrap();
        assert_eq!(m.n_non_zeros(), 0);
        m.set(0, 0, 0.0).unwrap();
        assert_eq!(m.n_non_zeros(), 0);
    }

    #[test]
    fn test_out_of_range_is_invalid_index() {
        let mut m = SparseMatrix::new(2, 3);
        assert!(matches!(m.get(2, 0), Err(HtmError::InvalidIndex { .. })));
        assert!(matches!(m.set(0, 3, 1.0), Err(HtmError::InvalidIndex { .. })));
    }

    #[test]
    fn test_dense_round_trip() {
        let m = sample_matrix();
        assert_eq!(m.n_non_zeros(), 4);
        assert_eq!(SparseMatrix::from_dense(&m.to_dense()), m);
        assert_eq!(m.get_row(2).unwrap(), vec![0.9, 0.0, 0.3, 0.0]);
        assert_eq!(m.get_col(1).unwrap(), vec![0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_right_vec_sum_at_nz_and_thresholds() {
        let m = sample_matrix();
        let x = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(m.right_vec_sum_at_nz(&x).unwrap(), vec![6.0, 0.0, 4.0]);
        assert_eq!(m.right_vec_sum_at_nz_gte_threshold(&x, 0.3).unwrap(), vec![2.0, 0.0, 4.0]);
        assert_eq!(m.right_vec_sum_at_nz_gt_threshold(&x, 0.3).unwrap(), vec![2.0, 0.0, 1.0]);
        assert_eq!(m.right_vec_sum_at_nz_sparse(&[1, 2]).unwrap(), vec![1, 0, 1]);
        assert_eq!(m.right_vec_sum_at_nz_gt_threshold_sparse(&[0, 2, 3], 0.25).unwrap(), vec![0, 0, 2]);
        assert!(matches!(
            m.right_vec_sum_at_nz(&[1.0]),
            Err(HtmError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_outer_increments_only_touch_existing_entries() {
        let mut m = sample_matrix();
        m.increment_non_zeros_on_outer(&[0, 1], &[1, 2], 0.1).unwrap();
        assert!((m.get(0, 1).unwrap() - 0.6).abs() < 1e-6);
        assert_eq!(m.get(0, 2).unwrap(), 0.0);
        assert_eq!(m.n_non_zeros_on_row(1).unwrap(), 0);

        m.increment_non_zeros_on_rows_excluding_cols(&[0], &[1], -0.2).unwrap();
        assert_eq!(m.get(0, 3).unwrap(), 0.0);
        assert_eq!(m.n_non_zeros_on_row(0).unwrap(), 1);
    }

    #[test]
    fn test_outer_rejects_unsorted_columns() {
        let mut m = sample_matrix();
        assert!(matches!(
            m.set_zeros_on_outer(&[0], &[3, 1], 0.5),
            Err(HtmError::UnsortedInput { .. })
        ));
    }

    #[test]
    fn test_set_zeros_and_random_zeros_on_outer() {
        let mut m = sample_matrix();
        m.set_zeros_on_outer(&[1], &[0, 3], 0.7).unwrap();
        assert_eq!(m.row(1).unwrap().0, &[0, 3]);

        let mut rng = Random::new(1);
        let created = m
            .set_random_zeros_on_outer(&[0, 2], &[0, 1, 2, 3], &[1, 5], 0.4, &mut rng)
            .unwrap();
        assert_eq!(created, vec![1, 2]);
        assert_eq!(m.n_non_zeros_on_row(0).unwrap(), 3);
        assert_eq!(m.n_non_zeros_on_row(2).unwrap(), 4);
    }

    #[test]
    fn test_clip_removes_non_positive() {
        let mut m = sample_matrix();
        m.set(0, 0, -0.3).unwrap();
        m.set(0, 1, 1.7).unwrap();
        m.clip_rows_below_and_above(&[0], 0.0, 1.0).unwrap();
        assert_eq!(m.get(0, 0).unwrap(), 0.0);
        assert_eq!(m.get(0, 1).unwrap(), 1.0);
        assert_eq!(m.n_non_zeros_on_row(0).unwrap(), 2);
    }

    #[test]
    fn test_threshold_removes_small_entries() {
        let mut m = sample_matrix();
        m.threshold(0.3);
        assert_eq!(m.n_non_zeros(), 3);
        assert_eq!(m.get(0, 3).unwrap(), 0.0);
        assert_eq!(m.get(2, 2).unwrap(), 0.3);
    }

    #[test]
    fn test_arithmetic_dispatch() {
        let m = sample_matrix();
        let doubled = m.add(Operand::Sparse(&m)).unwrap();
        assert_eq!(doubled, &m * 2.0);
        assert_eq!(m.subtract(Operand::Sparse(&m)).unwrap().n_non_zeros(), 0);
        assert_eq!(m.multiply(Operand::Scalar(1.0)).unwrap(), m);
        assert_eq!((-&m).get(2, 0).unwrap(), -0.9);

        let shifted = m.add(Operand::Scalar(1.0)).unwrap();
        assert_eq!(shifted.n_non_zeros(), 12);

        let dense = m.to_dense();
        assert_eq!(m.multiply(Operand::Dense(&dense)).unwrap().n_non_zeros(), 4);
        assert!(matches!(m.divide(Operand::Scalar(0.0)), Err(HtmError::InvalidParameter { .. })));
        assert!(matches!(
            m.add(Operand::DenseVector(&[1.0, 2.0])),
            Err(HtmError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_matmul() {
        let m = sample_matrix();
        let identity = SparseMatrix::from_dense(
            &DenseMatrix::from_rows(&[
                vec![1.0, 0.0, 0.0, 0.0],
                vec![0.0, 1.0, 0.0, 0.0],
                vec![0.0, 0.0, 1.0, 0.0],
                vec![0.0, 0.0, 0.0, 1.0],
            ])
            .unwrap(),
        );
        assert_eq!(m.matmul(Operand::Sparse(&identity)).unwrap(), m);

        let column = m.matmul(Operand::DenseVector(&[1.0, 1.0, 1.0, 1.0])).unwrap();
        assert_eq!(column.shape(), (3, 1));
        assert!((column.get(0, 0).unwrap() - 0.7).abs() < 1e-6);
        assert!(matches!(m.matmul(Operand::Sparse(&m)), Err(HtmError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_resize_drops_outside_entries() {
        let mut m = sample_matrix();
        m.resize(2, 2);
        assert_eq!(m.shape(), (2, 2));
        assert_eq!(m.n_non_zeros(), 1);
        m.resize(4, 5);
        assert_eq!(m.n_non_zeros_on_row(3).unwrap(), 0);
    }

    #[test]
    fn test_serialization_round_trip() {
        let m = sample_matrix();
        let restored = SparseMatrix::from_bytes(&m.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, m);
    }
}
