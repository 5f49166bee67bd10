//! Apical tiebreak temporal memory in Rust.
//!
//! The crate has two layers:
//! - A sparse matrix substrate (`core::sparse_matrix`, `core::sparse_binary_matrix`) with segment
//!   bookkeeping (`core::segment_matrix`) and synaptic connections (`core::connections`) built on it.
//! - The temporal memory itself (`core::temporal_memory`), in a pair variant with external basal input
//!   (`core::pair_memory`) and a sequence variant whose basal input is its own activity
//!   (`core::sequence_memory`).

pub mod core;
pub mod error;
pub mod serialization;

pub use crate::core::connections::{SampleSize, SparseMatrixConnections};
pub use crate::core::pair_memory::ApicalTiebreakPairMemory;
pub use crate::core::random::Random;
pub use crate::core::segment_matrix::{
    RowStore, SegmentMatrixAdapter, SegmentOps, SegmentSparseBinaryMatrix, SegmentSparseMatrix,
};
pub use crate::core::sequence_memory::ApicalTiebreakSequenceMemory;
pub use crate::core::sparse_binary_matrix::SparseBinaryMatrix;
pub use crate::core::sparse_matrix::{DenseMatrix, Operand, SparseMatrix, ThresholdMode};
pub use crate::core::temporal_memory::{ApicalTiebreakTemporalMemory, GrowthCandidates, TemporalMemoryParams};
pub use crate::error::{HtmError, Result};
pub use crate::serialization::Serializable;
