//! The `ApicalTiebreakPairMemory` learns associations between a basal and an apical input stream.
//!
//! Both inputs come from outside. Each `compute` first depolarizes cells from the current basal and
//! apical input, then activates cells in the active columns using those predictions.
//!
//! With `basal_input_prepend`, the memory's own previous active cells are prepended to the basal input
//! (and its previous winner cells to the basal growth candidates), the external bits being shifted up
//! by the number of cells.

use serde::{Deserialize, Serialize};
use std::ops::Deref;

use crate::core::connections::SparseMatrixConnections;
use crate::core::temporal_memory::{ApicalTiebreakTemporalMemory, GrowthCandidates, TemporalMemoryParams};
use crate::error::Result;
use crate::serialization::Serializable;

/// Apical tiebreak temporal memory driven by external basal and apical input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApicalTiebreakPairMemory {
    memory: ApicalTiebreakTemporalMemory,
}

impl ApicalTiebreakPairMemory {
    pub fn new(params: TemporalMemoryParams) -> Result<Self> {
        let mut basal_input_size = params.basal_input_size;
        if params.basal_input_prepend {
            basal_input_size += params.number_of_cells();
        }
        Ok(Self {
            memory: ApicalTiebreakTemporalMemory::with_basal_input_size(params, basal_input_size)?,
        })
    }

    /// Runs one time step:
    /// - Validates every input before touching any state.
    /// - Depolarizes cells from `basal_input` and `apical_input`.
    /// - Activates cells in `active_columns`, learning if `learn` is set.
    ///
    /// Growth candidates default to the corresponding input.
    pub fn compute(
        &mut self,
        active_columns: &[u32],
        basal_input: &[u32],
        apical_input: &[u32],
        basal_growth_candidates: GrowthCandidates<'_>,
        apical_growth_candidates: GrowthCandidates<'_>,
        learn: bool,
    ) -> Result<()> {
        let memory = &self.memory;
        let params = memory.params();

        let active_columns = memory.normalize_input("active column", active_columns, params.column_count)?;
        let basal_input = memory.normalize_input("basal input", basal_input, params.basal_input_size)?;
        let apical_input = memory.normalize_input("apical input", apical_input, params.apical_input_size)?;
        let basal_growth = match basal_growth_candidates {
            GrowthCandidates::SameAsInput => basal_input.clone(),
            GrowthCandidates::Explicit(bits) => {
                memory.normalize_input("basal growth candidate", bits, params.basal_input_size)?
            }
        };
        let apical_growth = match apical_growth_candidates {
            GrowthCandidates::SameAsInput => apical_input.clone(),
            GrowthCandidates::Explicit(bits) => {
                memory.normalize_input("apical growth candidate", bits, params.apical_input_size)?
            }
        };

        let (basal_input, basal_growth) = if params.basal_input_prepend {
            let offset = memory.number_of_cells() as u32;
            (
                prepend_cells(memory.active_cells(), &basal_input, offset),
                prepend_cells(memory.winner_cells(), &basal_growth, offset),
            )
        } else {
            (basal_input, basal_growth)
        };

        self.memory.depolarize_cells(&basal_input, &apical_input)?;
        self.memory.activate_cells(
            &active_columns,
            &basal_input,
            &apical_input,
            &basal_growth,
            &apical_growth,
            learn,
        )
    }

    /// Clears all activity. Learned connections are kept.
    pub fn reset(&mut self) {
        self.memory.reset();
    }

    pub fn create_basal_segment(&mut self, cell: u32) -> Result<u32> {
        self.memory.create_basal_segment(cell)
    }

    pub fn create_apical_segment(&mut self, cell: u32) -> Result<u32> {
        self.memory.create_apical_segment(cell)
    }

    pub fn basal_connections_mut(&mut self) -> &mut SparseMatrixConnections {
        self.memory.basal_connections_mut()
    }

    pub fn apical_connections_mut(&mut self) -> &mut SparseMatrixConnections {
        self.memory.apical_connections_mut()
    }
}

impl Deref for ApicalTiebreakPairMemory {
    type Target = ApicalTiebreakTemporalMemory;

    fn deref(&self) -> &ApicalTiebreakTemporalMemory {
        &self.memory
    }
}

impl Serializable for ApicalTiebreakPairMemory {
    fn validate_state(&self) -> Result<()> {
        self.memory.validate_state()
    }
}

/// `cells` followed by `bits` shifted up by `offset`; sorted when both inputs are.
fn prepend_cells(cells: &[u32], bits: &[u32], offset: u32) -> Vec<u32> {
    cells
        .iter()
        .copied()
        .chain(bits.iter().map(|b| b + offset))
        .collect()
}
