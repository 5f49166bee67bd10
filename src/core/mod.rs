pub mod connections;
pub mod pair_memory;
pub mod random;
pub mod segment_matrix;
pub mod sequence_memory;
pub mod sparse_binary_matrix;
pub mod sparse_matrix;
pub mod temporal_memory;
