//! This example trains an Apical Tiebreak Sequence Memory on two sequences that share a middle
//! section, A-B-C-D and X-B-C-Y. Each symbol is a fixed random set of active columns.
//!
//! After a few passes the memory predicts most active columns, and because the context of B-C is
//! carried by different cells, it predicts D after A-B-C and Y after X-B-C. Finally the trained
//! memory is written to bytes, read back, and checked to continue identically.
//!
//! Set `RUST_LOG=apical_htm=debug` to follow the per-step activity.

use anyhow::{ensure, Result};
use apical_htm::{
    ApicalTiebreakSequenceMemory, GrowthCandidates, Random, SegmentOps, Serializable, TemporalMemoryParams,
};
use fxhash::FxHashSet;
use tracing_subscriber::EnvFilter;

const COLUMNS: usize = 256;
const ACTIVE_COLUMNS: usize = 8;
const EPOCHS: usize = 12;

fn encode_symbols(count: usize, rng: &mut Random) -> Vec<Vec<u32>> {
    let columns: Vec<u32> = (0..COLUMNS as u32).collect();
    // Sampling keeps population order, so every symbol is already sorted.
    (0..count).map(|_| rng.sample(&columns, ACTIVE_COLUMNS)).collect()
}

fn columns_of(tm: &ApicalTiebreakSequenceMemory, cells: &[u32]) -> FxHashSet<u32> {
    let cells_per_column = tm.cells_per_column() as u32;
    cells.iter().map(|cell| cell / cells_per_column).collect()
}

fn overlap(predicted: &FxHashSet<u32>, columns: &[u32]) -> usize {
    columns.iter().filter(|c| predicted.contains(c)).count()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let params = TemporalMemoryParams {
        column_count: COLUMNS,
        cells_per_column: 8,
        activation_threshold: 6,
        min_threshold: 4,
        sample_size: Some(ACTIVE_COLUMNS),
        initial_permanence: 0.21,
        connected_permanence: 0.5,
        permanence_increment: 0.1,
        permanence_decrement: 0.1,
        basal_predicted_segment_decrement: 0.01,
        seed: 7,
        ..Default::default()
    };

    println!(
        "Initializing Sequence Memory with {} columns x {} cells...",
        params.column_count, params.cells_per_column
    );
    let mut tm = ApicalTiebreakSequenceMemory::new(params)?;

    let mut rng = Random::new(1);
    let symbols = encode_symbols(6, &mut rng);
    let (a, b, c, d, x, y) = (0, 1, 2, 3, 4, 5);
    let sequences = [[a, b, c, d], [x, b, c, y]];

    println!("Training...");

    for epoch in 0..EPOCHS {
        let mut predicted = 0;
        let mut total = 0;
        for sequence in &sequences {
            for (i, &symbol) in sequence.iter().enumerate() {
                let columns = &symbols[symbol];
                tm.compute(columns, &[], GrowthCandidates::SameAsInput, true)?;
                if i > 0 {
                    predicted += overlap(&columns_of(&tm, tm.predicted_cells()), columns);
                    total += columns.len();
                }
            }
            tm.reset();
        }
        println!(
            "  epoch {:>2}: {:.1}% of active columns predicted",
            epoch + 1,
            100.0 * predicted as f64 / total as f64
        );
    }

    println!("Testing high-order predictions...");

    for (sequence, name) in sequences.iter().zip(["A-B-C", "X-B-C"]) {
        for &symbol in &sequence[..3] {
            tm.compute(&symbols[symbol], &[], GrowthCandidates::SameAsInput, false)?;
        }
        let next = columns_of(&tm, tm.next_predicted_cells());
        println!(
            "  after {}: D {}/{}  Y {}/{}",
            name,
            overlap(&next, &symbols[d]),
            ACTIVE_COLUMNS,
            overlap(&next, &symbols[y]),
            ACTIVE_COLUMNS
        );
        tm.reset();
    }

    println!("Round-tripping through bytes...");

    let bytes = tm.to_bytes()?;
    let mut restored = ApicalTiebreakSequenceMemory::from_bytes(&bytes)?;
    for &symbol in &sequences[0] {
        tm.compute(&symbols[symbol], &[], GrowthCandidates::SameAsInput, true)?;
        restored.compute(&symbols[symbol], &[], GrowthCandidates::SameAsInput, true)?;
        ensure!(tm.active_cells() == restored.active_cells(), "restored memory diverged");
    }
    println!(
        "  {} bytes, {} basal segments, {} synapses; restored copy matches",
        bytes.len(),
        tm.basal_connections().n_segments(),
        tm.basal_connections().n_synapses()
    );

    Ok(())
}
