//! The `ApicalTiebreakSequenceMemory` learns sequences, optionally disambiguated by apical feedback.
//!
//! Its basal input is its own activity: basal segments connect to the cells that were active in the
//! previous time step and grow toward the previous winner cells. Each `compute` therefore runs in the
//! opposite order to the pair memory:
//! - Activate cells from the predictions made at the end of the previous step.
//! - Depolarize cells from the new active cells and the current apical input, predicting the next step.
//!
//! `predicted_cells` reports the predictions that applied to the current step. `next_predicted_cells`
//! reports those made for the following step.

use serde::{Deserialize, Serialize};
use std::ops::Deref;

use crate::core::connections::SparseMatrixConnections;
use crate::core::temporal_memory::{ApicalTiebreakTemporalMemory, GrowthCandidates, TemporalMemoryParams};
use crate::error::{HtmError, Result};
use crate::serialization::Serializable;

/// Apical tiebreak temporal memory whose basal input is its own previous activity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApicalTiebreakSequenceMemory {
    memory: ApicalTiebreakTemporalMemory,
    prev_apical_input: Vec<u32>,
    prev_apical_growth_candidates: Vec<u32>,
    prev_predicted_cells: Vec<u32>,
}

impl ApicalTiebreakSequenceMemory {
    /// Constructs a sequence memory. `basal_input_size` is ignored: the basal input space is the cells.
    pub fn new(params: TemporalMemoryParams) -> Result<Self> {
        if params.basal_input_prepend {
            return Err(HtmError::InvalidParameter {
                name: "basal_input_prepend",
                message: "only applies to the pair memory".to_string(),
            });
        }
        let basal_input_size = params.number_of_cells();
        Ok(Self {
            memory: ApicalTiebreakTemporalMemory::with_basal_input_size(params, basal_input_size)?,
            prev_apical_input: Vec::new(),
            prev_apical_growth_candidates: Vec::new(),
            prev_predicted_cells: Vec::new(),
        })
    }

    /// Runs one time step:
    /// - Validates every input before touching any state.
    /// - Activates cells in `active_columns`, learning from the previous active and winner cells and
    ///   the previous apical input if `learn` is set.
    /// - Depolarizes cells from the new active cells and `apical_input`.
    pub fn compute(
        &mut self,
        active_columns: &[u32],
        apical_input: &[u32],
        apical_growth_candidates: GrowthCandidates<'_>,
        learn: bool,
    ) -> Result<()> {
        let memory = &self.memory;
        let params = memory.params();

        let active_columns = memory.normalize_input("active column", active_columns, params.column_count)?;
        let apical_input = memory.normalize_input("apical input", apical_input, params.apical_input_size)?;
        let apical_growth = match apical_growth_candidates {
            GrowthCandidates::SameAsInput => apical_input.clone(),
            GrowthCandidates::Explicit(bits) => {
                memory.normalize_input("apical growth candidate", bits, params.apical_input_size)?
            }
        };

        self.prev_predicted_cells = memory.predicted_cells().to_vec();
        let prev_active_cells = memory.active_cells().to_vec();
        let prev_winner_cells = memory.winner_cells().to_vec();

        self.memory.activate_cells(
            &active_columns,
            &prev_active_cells,
            &self.prev_apical_input,
            &prev_winner_cells,
            &self.prev_apical_growth_candidates,
            learn,
        )?;

        let active_cells = self.memory.active_cells().to_vec();
        self.memory.depolarize_cells(&active_cells, &apical_input)?;

        self.prev_apical_input = apical_input;
        self.prev_apical_growth_candidates = apical_growth;
        Ok(())
    }

    /// Clears all activity, including the remembered apical input. Learned connections are kept.
    pub fn reset(&mut self) {
        self.memory.reset();
        self.prev_apical_input.clear();
        self.prev_apical_growth_candidates.clear();
        self.prev_predicted_cells.clear();
    }

    /// Sorted cells that were predicted for the current step.
    #[inline]
    pub fn predicted_cells(&self) -> &[u32] {
        &self.prev_predicted_cells
    }

    /// Sorted cells predicted for the next step.
    #[inline]
    pub fn next_predicted_cells(&self) -> &[u32] {
        self.memory.predicted_cells()
    }

    /// Sorted cells with an active basal segment for the next step.
    #[inline]
    pub fn next_basal_predicted_cells(&self) -> &[u32] {
        self.memory.basal_predicted_cells()
    }

    /// Sorted cells with an active apical segment for the next step.
    #[inline]
    pub fn next_apical_predicted_cells(&self) -> &[u32] {
        self.memory.apical_predicted_cells()
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

impl Deref for ApicalTiebreakSequenceMemory {
    type Target = ApicalTiebreakTemporalMemory;

    fn deref(&self) -> &ApicalTiebreakTemporalMemory {
        &self.memory
    }
}

impl Serializable for ApicalTiebreakSequenceMemory {
    fn validate_state(&self) -> Result<()> {
        self.memory.validate_state()?;
        if self.memory.basal_input_size() != self.memory.number_of_cells() {
            return Err(HtmError::InvalidState(
                "basal connections must span the cell population".to_string(),
            ));
        }
        Ok(())
    }
}
