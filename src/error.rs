//! Error types for the temporal memory and its sparse matrix substrate.

use thiserror::Error;

/// Errors raised by matrix, connections and temporal memory operations.
#[derive(Error, Debug)]
pub enum HtmError {
    /// An index (row, column, cell, segment, input bit) outside its valid range.
    #[error("Invalid {what} index {index}, expected less than {bound}")]
    InvalidIndex {
        what: &'static str,
        index: usize,
        bound: usize,
    },

    /// Operands whose shapes cannot be combined.
    #[error("Shape mismatch in {operation}: {left:?} vs {right:?}")]
    ShapeMismatch {
        operation: &'static str,
        left: (usize, usize),
        right: (usize, usize),
    },

    /// Input asserted to be sorted ascending that is not.
    #[error("Unsorted {what}: element at position {position} is smaller than its predecessor")]
    UnsortedInput { what: &'static str, position: usize },

    /// Construction parameter outside its valid domain.
    #[error("Invalid parameter '{name}': {message}")]
    InvalidParameter { name: &'static str, message: String },

    /// Restored state that violates internal consistency.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Binary encoding or decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Result type alias for temporal memory operations.
pub type Result<T> = std::result::Result<T, HtmError>;

/// Fails with `InvalidIndex` unless `index < bound`.
#[inline]
pub(crate) fn check_index(what: &'static str, index: usize, bound: usize) -> Result<()> {
    if index < bound {
        Ok(())
    } else {
        Err(HtmError::InvalidIndex { what, index, bound })
    }
}

/// Fails with `UnsortedInput` unless `values` is non-decreasing.
#[inline]
pub(crate) fn check_sorted(what: &'static str, values: &[u32]) -> Result<()> {
    match values.windows(2).position(|w| w[1] < w[0]) {
        Some(position) => Err(HtmError::UnsortedInput {
            what,
            position: position + 1,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_sorted_reports_position() {
        assert!(check_sorted("input", &[1, 2, 2, 5]).is_ok());
        match check_sorted("input", &[1, 4, 3]) {
            Err(HtmError::UnsortedInput { position, .. }) => assert_eq!(position, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_check_index_bounds() {
        assert!(check_index("cell", 3, 4).is_ok());
        let err = check_index("cell", 4, 4).unwrap_err();
        assert_eq!(err.to_string(), "Invalid cell index 4, expected less than 4");
    }
}
