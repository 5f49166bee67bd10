//! Behavioural scenarios for the apical tiebreak temporal memories.
//!
//! Most scenarios drive the sequence memory through two steps: a first step that activates the
//! context, and a second step whose learning is checked against hand-built segments.
//!
//! Run with: `cargo test --test temporal_memory_scenarios`

use apical_htm::{
    ApicalTiebreakPairMemory, ApicalTiebreakSequenceMemory, GrowthCandidates, HtmError, SegmentOps, Serializable,
    TemporalMemoryParams,
};

const EPSILON: f32 = 1e-6;

fn sequence_params() -> TemporalMemoryParams {
    TemporalMemoryParams {
        column_count: 32,
        cells_per_column: 4,
        activation_threshold: 3,
        initial_permanence: 0.21,
        connected_permanence: 0.50,
        min_threshold: 2,
        sample_size: Some(3),
        permanence_increment: 0.10,
        permanence_decrement: 0.10,
        basal_predicted_segment_decrement: 0.0,
        apical_predicted_segment_decrement: 0.0,
        learn_on_one_cell: false,
        seed: 42,
        ..Default::default()
    }
}

fn step(tm: &mut ApicalTiebreakSequenceMemory, columns: &[u32], learn: bool) {
    tm.compute(columns, &[], GrowthCandidates::SameAsInput, learn).unwrap();
}

/// Creates a basal segment on `cell` with one synapse per `(input, permanence)`.
fn basal_segment(tm: &mut ApicalTiebreakSequenceMemory, cell: u32, synapses: &[(u32, f32)]) -> u32 {
    let segment = tm.create_basal_segment(cell).unwrap();
    for &(input, permanence) in synapses {
        tm.basal_connections_mut().set_permanence(segment, input, permanence).unwrap();
    }
    segment
}

fn permanence(tm: &ApicalTiebreakSequenceMemory, segment: u32, input: u32) -> f32 {
    tm.basal_connections().permanence(segment, input).unwrap()
}

fn assert_near(actual: f32, expected: f32) {
    assert!((actual - expected).abs() < EPSILON, "{actual} is not {expected}");
}

fn presynaptic_inputs(tm: &ApicalTiebreakSequenceMemory, segment: u32) -> Vec<u32> {
    tm.basal_connections()
        .synapses_for_segment(segment)
        .unwrap()
        .into_iter()
        .map(|(input, _)| input)
        .collect()
}

// =============================================================================
// ACTIVATION
// =============================================================================

mod activation {
    use super::*;

    #[test]
    fn test_activate_correctly_predicted_cells() {
        let mut tm = ApicalTiebreakSequenceMemory::new(sequence_params()).unwrap();
        basal_segment(&mut tm, 4, &[(0, 0.5), (1, 0.5), (2, 0.5), (3, 0.5)]);

        step(&mut tm, &[0], true);
        step(&mut tm, &[1], true);

        assert_eq!(tm.predicted_cells(), &[4]);
        assert_eq!(tm.active_cells(), &[4]);
    }

    #[test]
    fn test_burst_unpredicted_columns() {
        let mut tm = ApicalTiebreakSequenceMemory::new(sequence_params()).unwrap();
        step(&mut tm, &[0], true);
        assert_eq!(tm.active_cells(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_repeated_column_bursts_once() {
        let mut tm = ApicalTiebreakPairMemory::new(TemporalMemoryParams {
            basal_input_size: 64,
            ..sequence_params()
        })
        .unwrap();
        tm.compute(&[9, 9], &[], &[], GrowthCandidates::SameAsInput, GrowthCandidates::SameAsInput, true)
            .unwrap();

        assert_eq!(tm.active_cells(), &[36, 37, 38, 39]);
        assert_eq!(tm.winner_cells().len(), 1);
    }

    #[test]
    fn test_zero_active_columns() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            basal_predicted_segment_decrement: 0.02,
            ..sequence_params()
        })
        .unwrap();
        basal_segment(&mut tm, 4, &[(0, 0.5), (1, 0.5), (2, 0.5), (3, 0.5)]);

        step(&mut tm, &[0], true);
        assert!(!tm.active_cells().is_empty());
        assert!(!tm.winner_cells().is_empty());
        assert_eq!(tm.next_predicted_cells(), &[4]);

        step(&mut tm, &[], true);
        assert!(tm.active_cells().is_empty());
        assert!(tm.winner_cells().is_empty());
        assert!(tm.next_predicted_cells().is_empty());
    }

    #[test]
    fn test_predicted_active_cells_are_always_winners() {
        let mut tm = ApicalTiebreakSequenceMemory::new(sequence_params()).unwrap();
        basal_segment(&mut tm, 4, &[(0, 0.5), (1, 0.5), (2, 0.5)]);
        basal_segment(&mut tm, 6, &[(0, 0.5), (1, 0.5), (2, 0.5)]);

        step(&mut tm, &[0], false);
        step(&mut tm, &[1], false);

        assert_eq!(tm.winner_cells(), &[4, 6]);
    }

    #[test]
    fn test_one_winner_cell_per_bursting_column() {
        let mut tm = ApicalTiebreakSequenceMemory::new(sequence_params()).unwrap();
        step(&mut tm, &[0], false);

        let winners = tm.winner_cells();
        assert_eq!(winners.len(), 1);
        assert!(winners[0] < 4);
    }
}

// =============================================================================
// LEARNING
// =============================================================================

mod learning {
    use super::*;

    #[test]
    fn test_reinforce_correctly_active_segments() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            initial_permanence: 0.2,
            sample_size: Some(4),
            permanence_decrement: 0.08,
            basal_predicted_segment_decrement: 0.02,
            ..sequence_params()
        })
        .unwrap();
        let segment = basal_segment(&mut tm, 5, &[(0, 0.5), (1, 0.5), (2, 0.5), (81, 0.5)]);

        step(&mut tm, &[0], true);
        step(&mut tm, &[1], true);

        for input in [0, 1, 2] {
            assert_near(permanence(&tm, segment, input), 0.6);
        }
        assert_near(permanence(&tm, segment, 81), 0.42);
    }

    #[test]
    fn test_reinforce_selected_matching_segment_in_bursting_column() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            permanence_decrement: 0.08,
            ..sequence_params()
        })
        .unwrap();
        let selected = basal_segment(&mut tm, 4, &[(0, 0.3), (1, 0.3), (2, 0.3), (81, 0.3)]);
        let other = basal_segment(&mut tm, 5, &[(0, 0.3), (1, 0.3), (81, 0.3)]);

        step(&mut tm, &[0], true);
        step(&mut tm, &[1], true);

        for input in [0, 1, 2] {
            assert_near(permanence(&tm, selected, input), 0.4);
        }
        assert_near(permanence(&tm, selected, 81), 0.22);

        // Matching but not selected: untouched.
        for input in [0, 1, 81] {
            assert_near(permanence(&tm, other, input), 0.3);
        }
        assert_eq!(tm.winner_cells(), &[4]);
    }

    #[test]
    fn test_no_change_to_matching_segments_in_predicted_active_column() {
        let mut tm = ApicalTiebreakSequenceMemory::new(sequence_params()).unwrap();
        basal_segment(&mut tm, 4, &[(0, 0.5), (1, 0.5), (2, 0.5), (3, 0.5)]);
        let same_cell = basal_segment(&mut tm, 4, &[(0, 0.3), (1, 0.3)]);
        let other_cell = basal_segment(&mut tm, 5, &[(0, 0.3), (1, 0.3)]);

        step(&mut tm, &[0], true);
        step(&mut tm, &[1], true);
        assert_eq!(tm.predicted_cells(), &[4]);

        for segment in [same_cell, other_cell] {
            assert_near(permanence(&tm, segment, 0), 0.3);
            assert_near(permanence(&tm, segment, 1), 0.3);
        }
    }

    #[test]
    fn test_punish_matching_segments_in_inactive_columns() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            initial_permanence: 0.2,
            sample_size: Some(4),
            basal_predicted_segment_decrement: 0.02,
            ..sequence_params()
        })
        .unwrap();
        let active = basal_segment(&mut tm, 42, &[(0, 0.5), (1, 0.5), (2, 0.5), (81, 0.5)]);
        let matching = basal_segment(&mut tm, 43, &[(0, 0.5), (1, 0.5), (81, 0.5)]);

        step(&mut tm, &[0], true);
        step(&mut tm, &[1], true);

        for input in [0, 1, 2] {
            assert_near(permanence(&tm, active, input), 0.48);
        }
        for input in [0, 1] {
            assert_near(permanence(&tm, matching, input), 0.48);
        }
        assert_near(permanence(&tm, active, 81), 0.5);
        assert_near(permanence(&tm, matching, 81), 0.5);
    }

    #[test]
    fn test_destroy_weak_synapse_on_wrong_prediction() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            initial_permanence: 0.2,
            sample_size: Some(4),
            basal_predicted_segment_decrement: 0.02,
            ..sequence_params()
        })
        .unwrap();
        let segment = basal_segment(&mut tm, 5, &[(0, 0.5), (1, 0.5), (2, 0.5), (3, 0.015)]);

        step(&mut tm, &[0], true);
        step(&mut tm, &[2], true);

        assert_eq!(presynaptic_inputs(&tm, segment), vec![0, 1, 2]);
    }

    #[test]
    fn test_destroy_weak_synapse_on_active_reinforce() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            initial_permanence: 0.2,
            sample_size: Some(4),
            basal_predicted_segment_decrement: 0.02,
            ..sequence_params()
        })
        .unwrap();
        let segment = basal_segment(&mut tm, 5, &[(0, 0.5), (1, 0.5), (2, 0.5), (81, 0.09)]);

        step(&mut tm, &[0], true);
        step(&mut tm, &[1], true);

        assert_eq!(permanence(&tm, segment, 81), 0.0);
        assert!(!presynaptic_inputs(&tm, segment).contains(&81));
    }

    #[test]
    fn test_destroy_segments_left_without_synapses() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            initial_permanence: 0.2,
            sample_size: Some(4),
            basal_predicted_segment_decrement: 0.02,
            ..sequence_params()
        })
        .unwrap();
        basal_segment(&mut tm, 5, &[(0, 0.015), (1, 0.015), (2, 0.015), (3, 0.015)]);

        step(&mut tm, &[0], true);
        step(&mut tm, &[2], true);

        assert!(tm.basal_connections().get_segments_for_cell(5).unwrap().is_empty());
    }

    #[test]
    fn test_sample_size_overflow_grows_nothing() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            initial_permanence: 0.2,
            sample_size: Some(4),
            basal_predicted_segment_decrement: 0.02,
            ..sequence_params()
        })
        .unwrap();
        let synapses: Vec<(u32, f32)> = (0..8).map(|input| (input, 0.2)).collect();
        let segment = basal_segment(&mut tm, 8, &synapses);

        step(&mut tm, &[0, 1, 3, 4], true);
        assert_eq!(tm.matching_basal_segments().len(), 1);

        step(&mut tm, &[2], true);
        assert_near(permanence(&tm, segment, 5), 0.3);
        assert_eq!(presynaptic_inputs(&tm, segment).len(), 8);
    }

    #[test]
    fn test_connections_never_change_when_learning_disabled() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            initial_permanence: 0.2,
            sample_size: Some(4),
            basal_predicted_segment_decrement: 0.02,
            ..sequence_params()
        })
        .unwrap();
        basal_segment(&mut tm, 4, &[(0, 0.5), (1, 0.5), (2, 0.5)]);
        basal_segment(&mut tm, 43, &[(0, 0.5), (1, 0.5), (81, 0.5)]);
        let before = tm.basal_connections().clone();

        step(&mut tm, &[0], false);
        step(&mut tm, &[1, 2], false);

        assert_eq!(tm.basal_connections(), &before);
    }

    #[test]
    fn test_learn_on_one_cell_keeps_the_bursting_winner() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            learn_on_one_cell: true,
            ..sequence_params()
        })
        .unwrap();

        step(&mut tm, &[0], true);
        let winner = tm.winner_cells().to_vec();
        step(&mut tm, &[1], true);
        step(&mut tm, &[0], true);

        assert_eq!(tm.winner_cells(), winner.as_slice());
    }

    #[test]
    fn test_reset_forgets_the_bursting_winner() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            learn_on_one_cell: true,
            ..sequence_params()
        })
        .unwrap();

        step(&mut tm, &[0], true);
        let winner = tm.winner_cells()[0];
        // The remembered cell now has more segments than its neighbours.
        tm.create_basal_segment(winner).unwrap();

        step(&mut tm, &[0], false);
        assert_eq!(tm.winner_cells(), &[winner]);

        tm.reset();
        step(&mut tm, &[0], false);
        assert_eq!(tm.winner_cells().len(), 1);
        assert_ne!(tm.winner_cells()[0], winner);
    }

    #[test]
    fn test_learn_on_one_cell_breaks_matching_ties_toward_the_remembered_cell() {
        let with_memory = |learn_on_one_cell: bool| {
            let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
                learn_on_one_cell,
                ..sequence_params()
            })
            .unwrap();
            basal_segment(&mut tm, 5, &[(0, 0.3), (1, 0.3)]);

            // Cell 5 is the only matching cell, so it wins column 1.
            step(&mut tm, &[0], false);
            step(&mut tm, &[1], false);
            assert_eq!(tm.winner_cells(), &[5]);

            // Cell 4 now matches equally well and comes first in cell order.
            basal_segment(&mut tm, 4, &[(0, 0.3), (1, 0.3)]);
            step(&mut tm, &[0], false);
            step(&mut tm, &[1], false);
            tm.winner_cells().to_vec()
        };

        assert_eq!(with_memory(true), vec![5]);
        assert_eq!(with_memory(false), vec![4]);
    }
}

// =============================================================================
// SEGMENT GROWTH
// =============================================================================

mod growth {
    use super::*;

    fn one_cell_per_column(sample_size: usize, activation_threshold: usize) -> TemporalMemoryParams {
        TemporalMemoryParams {
            cells_per_column: 1,
            min_threshold: 1,
            activation_threshold,
            sample_size: Some(sample_size),
            ..sequence_params()
        }
    }

    #[test]
    fn test_no_new_segment_without_winner_cells() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            sample_size: Some(2),
            ..sequence_params()
        })
        .unwrap();

        step(&mut tm, &[], true);
        step(&mut tm, &[0], true);

        assert_eq!(tm.basal_connections().n_segments(), 0);
    }

    #[test]
    fn test_new_segment_grows_to_a_subset_of_winner_cells() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            sample_size: Some(2),
            ..sequence_params()
        })
        .unwrap();

        step(&mut tm, &[0, 1, 2], true);
        let prev_winners = tm.winner_cells().to_vec();
        assert_eq!(prev_winners.len(), 3);

        step(&mut tm, &[4], true);
        let winners = tm.winner_cells();
        assert_eq!(winners.len(), 1);

        let segments = tm.basal_connections().get_segments_for_cell(winners[0]).unwrap();
        assert_eq!(segments.len(), 1);
        let synapses = tm.basal_connections().synapses_for_segment(segments[0]).unwrap();
        assert_eq!(synapses.len(), 2);
        for (input, permanence) in synapses {
            assert_near(permanence, 0.21);
            assert!(prev_winners.contains(&input));
        }
    }

    #[test]
    fn test_new_segment_grows_to_all_winner_cells() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            sample_size: Some(4),
            ..sequence_params()
        })
        .unwrap();

        step(&mut tm, &[0, 1, 2], true);
        let prev_winners = tm.winner_cells().to_vec();

        step(&mut tm, &[4], true);
        let winner = tm.winner_cells()[0];
        let segment = tm.basal_connections().get_segments_for_cell(winner).unwrap()[0];
        assert_eq!(presynaptic_inputs(&tm, segment), prev_winners);
    }

    #[test]
    fn test_no_sample_size_grows_to_every_winner_cell() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            sample_size: None,
            ..sequence_params()
        })
        .unwrap();

        step(&mut tm, &[0, 1, 2, 3, 4], true);
        let prev_winners = tm.winner_cells().to_vec();
        assert_eq!(prev_winners.len(), 5);

        step(&mut tm, &[5], true);
        let winner = tm.winner_cells()[0];
        let segments = tm.basal_connections().get_segments_for_cell(winner).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(presynaptic_inputs(&tm, segments[0]), prev_winners);
    }

    #[test]
    fn test_matching_segment_grows_to_a_subset_of_winner_cells() {
        let mut tm = ApicalTiebreakSequenceMemory::new(one_cell_per_column(3, 3)).unwrap();
        let segment = basal_segment(&mut tm, 4, &[(0, 0.5)]);

        step(&mut tm, &[0, 1, 2, 3], true);
        assert_eq!(tm.winner_cells(), &[0, 1, 2, 3]);
        step(&mut tm, &[4], true);

        let synapses = tm.basal_connections().synapses_for_segment(segment).unwrap();
        assert_eq!(synapses.len(), 3);
        for &(input, permanence) in &synapses[1..] {
            assert_near(permanence, 0.21);
            assert!([1, 2, 3].contains(&input));
        }
    }

    #[test]
    fn test_matching_segment_grows_to_all_winner_cells() {
        let mut tm = ApicalTiebreakSequenceMemory::new(one_cell_per_column(3, 3)).unwrap();
        let segment = basal_segment(&mut tm, 4, &[(0, 0.5)]);

        step(&mut tm, &[0, 1], true);
        assert_eq!(tm.winner_cells(), &[0, 1]);
        step(&mut tm, &[4], true);

        let synapses = tm.basal_connections().synapses_for_segment(segment).unwrap();
        assert_eq!(synapses.len(), 2);
        assert_eq!(synapses[1].0, 1);
        assert_near(synapses[1].1, 0.21);
    }

    #[test]
    fn test_active_segment_grows_by_potential_overlap() {
        let mut tm = ApicalTiebreakSequenceMemory::new(one_cell_per_column(4, 2)).unwrap();
        let segment = basal_segment(&mut tm, 5, &[(0, 0.5), (1, 0.5), (2, 0.2)]);

        step(&mut tm, &[0, 1, 2, 3, 4], true);
        assert_eq!(tm.winner_cells(), &[0, 1, 2, 3, 4]);
        step(&mut tm, &[5], true);

        let synapses = tm.basal_connections().synapses_for_segment(segment).unwrap();
        assert_eq!(synapses.len(), 4);
        assert!([3, 4].contains(&synapses[3].0));
        assert_near(synapses[3].1, 0.21);
    }

    #[test]
    fn test_recycle_weakest_synapse_to_make_room() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            permanence_decrement: 0.02,
            max_synapses_per_segment: 4,
            ..one_cell_per_column(3, 3)
        })
        .unwrap();
        let segment = basal_segment(&mut tm, 4, &[(0, 0.11), (1, 0.20), (31, 0.6)]);

        step(&mut tm, &[1, 2, 3], true);
        assert_eq!(tm.winner_cells(), &[1, 2, 3]);
        step(&mut tm, &[4], true);

        assert_eq!(presynaptic_inputs(&tm, segment), vec![1, 2, 3, 31]);
    }

    #[test]
    fn test_recycle_least_recently_active_segment() {
        let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
            initial_permanence: 0.5,
            min_threshold: 2,
            permanence_decrement: 0.02,
            max_segments_per_cell: 2,
            ..one_cell_per_column(3, 3)
        })
        .unwrap();

        step(&mut tm, &[0, 1, 2], true);
        step(&mut tm, &[9], true);
        assert_eq!(tm.basal_connections().get_segments_for_cell(9).unwrap().len(), 1);
        let oldest = tm.basal_connections().get_segments_for_cell(9).unwrap()[0];
        let old_inputs = presynaptic_inputs(&tm, oldest);
        assert_eq!(old_inputs, vec![0, 1, 2]);

        tm.reset();
        step(&mut tm, &[3, 4, 5], true);
        step(&mut tm, &[9], true);
        assert_eq!(tm.basal_connections().get_segments_for_cell(9).unwrap().len(), 2);

        tm.reset();
        step(&mut tm, &[6, 7, 8], true);
        step(&mut tm, &[9], true);

        let segments = tm.basal_connections().get_segments_for_cell(9).unwrap().to_vec();
        assert_eq!(segments.len(), 2);
        for segment in segments {
            let inputs = presynaptic_inputs(&tm, segment);
            assert!(inputs.iter().all(|input| !old_inputs.contains(input)));
        }
    }

    #[test]
    fn test_add_segment_to_cell_with_fewest_segments() {
        let mut grew_on_cell_1 = false;
        let mut grew_on_cell_2 = false;

        for seed in 0..100 {
            let mut tm = ApicalTiebreakSequenceMemory::new(TemporalMemoryParams {
                initial_permanence: 0.2,
                sample_size: Some(4),
                basal_predicted_segment_decrement: 0.02,
                seed,
                ..sequence_params()
            })
            .unwrap();
            let segment1 = basal_segment(&mut tm, 0, &[(4, 0.5)]);
            let segment2 = basal_segment(&mut tm, 3, &[(5, 0.5)]);

            step(&mut tm, &[1, 2, 3, 4], true);
            step(&mut tm, &[0], true);

            assert_eq!(tm.active_cells(), &[0, 1, 2, 3]);
            let connections = tm.basal_connections();
            assert_eq!(connections.n_segments(), 3);
            assert_eq!(connections.get_segment_counts(&[0, 3]).unwrap(), vec![1, 1]);
            assert_eq!(connections.map_segments_to_synapse_counts(&[segment1, segment2]).unwrap(), vec![1, 1]);

            let on_cell_1 = connections.get_segments_for_cell(1).unwrap();
            let segment = if on_cell_1.is_empty() {
                grew_on_cell_2 = true;
                connections.get_segments_for_cell(2).unwrap()[0]
            } else {
                grew_on_cell_1 = true;
                on_cell_1[0]
            };

            let synapses = connections.synapses_for_segment(segment).unwrap();
            assert_eq!(synapses.len(), 4);
            let mut columns: Vec<u32> = synapses
                .iter()
                .map(|(input, permanence)| {
                    assert_near(*permanence, 0.2);
                    tm.column_for_cell(*input).unwrap()
                })
                .collect();
            columns.sort_unstable();
            assert_eq!(columns, vec![1, 2, 3, 4]);
        }

        assert!(grew_on_cell_1);
        assert!(grew_on_cell_2);
    }
}

// =============================================================================
// PAIR MEMORY
// =============================================================================

mod pair_memory {
    use super::*;

    fn pair_params() -> TemporalMemoryParams {
        TemporalMemoryParams {
            column_count: 16,
            cells_per_column: 4,
            basal_input_size: 64,
            apical_input_size: 64,
            activation_threshold: 3,
            min_threshold: 2,
            initial_permanence: 0.6,
            connected_permanence: 0.5,
            sample_size: Some(4),
            ..Default::default()
        }
    }

    fn two_segment_params() -> TemporalMemoryParams {
        TemporalMemoryParams {
            basal_input_size: 16,
            activation_threshold: 2,
            min_threshold: 1,
            ..pair_params()
        }
    }

    fn two_segment_memory() -> ApicalTiebreakPairMemory {
        two_segment_memory_with(two_segment_params())
    }

    /// Cell 0 listens to bits {1, 2}, cell 1 to bits {3, 4}; both in column 0.
    fn two_segment_memory_with(params: TemporalMemoryParams) -> ApicalTiebreakPairMemory {
        let mut tm = ApicalTiebreakPairMemory::new(params).unwrap();
        for (cell, inputs) in [(0, [1, 2]), (1, [3, 4])] {
            let segment = tm.create_basal_segment(cell).unwrap();
            for input in inputs {
                tm.basal_connections_mut().set_permanence(segment, input, 0.6).unwrap();
            }
        }
        tm
    }

    #[test]
    fn test_basal_input_predicts_one_cell() {
        let mut tm = two_segment_memory();
        tm.compute(&[0], &[1, 2], &[], GrowthCandidates::SameAsInput, GrowthCandidates::SameAsInput, false)
            .unwrap();

        assert_eq!(tm.predicted_cells(), &[0]);
        assert_eq!(tm.active_cells(), &[0]);
        assert_eq!(tm.winner_cells(), &[0]);
    }

    #[test]
    fn test_unmatched_input_bursts_the_column() {
        let mut tm = two_segment_memory();
        tm.compute(&[0], &[9, 9], &[], GrowthCandidates::SameAsInput, GrowthCandidates::SameAsInput, false)
            .unwrap();
        assert_eq!(tm.active_cells(), &[0, 1, 2, 3]);
        assert_eq!(tm.basal_connections().n_segments(), 2);

        let learn_once = || {
            let mut tm = two_segment_memory();
            tm.compute(&[0], &[9, 9], &[], GrowthCandidates::SameAsInput, GrowthCandidates::SameAsInput, true)
                .unwrap();
            tm
        };
        let tm = learn_once();
        assert_eq!(tm.active_cells(), &[0, 1, 2, 3]);
        assert_eq!(tm.basal_connections().n_segments(), 3);

        // The winner is one of the cells without segments, and the same for the same seed.
        let winner = tm.winner_cells()[0];
        assert!(winner == 2 || winner == 3);
        assert_eq!(learn_once().winner_cells(), &[winner]);

        let segment = tm.basal_connections().get_segments_for_cell(winner).unwrap()[0];
        let synapses = tm.basal_connections().synapses_for_segment(segment).unwrap();
        assert_eq!(synapses.len(), 1);
        assert_eq!(synapses[0].0, 9);
    }

    #[test]
    fn test_learns_basal_and_apical_context_together() {
        let mut tm = ApicalTiebreakPairMemory::new(pair_params()).unwrap();
        let (basal, apical) = ([1u32, 2, 3, 4], [10u32, 11, 12, 13]);

        tm.compute(&[5], &basal, &apical, GrowthCandidates::SameAsInput, GrowthCandidates::SameAsInput, true)
            .unwrap();
        let winner = tm.winner_cells()[0];
        assert_eq!(tm.basal_connections().n_segments(), 1);
        assert_eq!(tm.apical_connections().n_segments(), 1);

        tm.compute(&[5], &basal, &apical, GrowthCandidates::SameAsInput, GrowthCandidates::SameAsInput, true)
            .unwrap();
        assert_eq!(tm.basal_predicted_cells(), &[winner]);
        assert_eq!(tm.apical_predicted_cells(), &[winner]);
        assert_eq!(tm.predicted_active_cells(), &[winner]);
        assert_eq!(tm.active_cells(), &[winner]);

        // Without apical support anywhere in the column, basal prediction alone still holds.
        tm.compute(&[5], &basal, &[], GrowthCandidates::SameAsInput, GrowthCandidates::SameAsInput, false)
            .unwrap();
        assert_eq!(tm.predicted_cells(), &[winner]);
        assert!(tm.apical_predicted_cells().is_empty());
    }

    #[test]
    fn test_explicit_growth_candidates() {
        let mut tm = ApicalTiebreakPairMemory::new(pair_params()).unwrap();
        tm.compute(
            &[2],
            &[1, 2, 3, 4],
            &[],
            GrowthCandidates::Explicit(&[7, 8]),
            GrowthCandidates::SameAsInput,
            true,
        )
        .unwrap();

        let winner = tm.winner_cells()[0];
        let segment = tm.basal_connections().get_segments_for_cell(winner).unwrap()[0];
        let inputs: Vec<u32> = tm
            .basal_connections()
            .synapses_for_segment(segment)
            .unwrap()
            .into_iter()
            .map(|(input, _)| input)
            .collect();
        assert_eq!(inputs, vec![7, 8]);
        // No apical input means no apical growth.
        assert_eq!(tm.apical_connections().n_segments(), 0);
    }

    #[test]
    fn test_huge_sample_size_grows_toward_every_candidate() {
        for sample_size in [Some(100), None, Some(u32::MAX as usize + 1), Some(usize::MAX)] {
            let mut tm = two_segment_memory_with(TemporalMemoryParams {
                sample_size,
                ..two_segment_params()
            });
            tm.compute(
                &[0],
                &[1, 2],
                &[],
                GrowthCandidates::Explicit(&[1, 2, 3, 4, 5, 6]),
                GrowthCandidates::SameAsInput,
                true,
            )
            .unwrap();

            assert_eq!(tm.active_cells(), &[0]);
            let segment = tm.basal_connections().get_segments_for_cell(0).unwrap()[0];
            let synapses = tm.basal_connections().synapses_for_segment(segment).unwrap();
            assert_eq!(synapses.len(), 6, "sample size {sample_size:?}");
        }
    }

    #[test]
    fn test_unchecked_inputs_skip_validation() {
        let unchecked = || {
            two_segment_memory_with(TemporalMemoryParams {
                check_inputs: false,
                ..two_segment_params()
            })
        };

        // Duplicates still collapse.
        let mut tm = unchecked();
        tm.compute(&[0], &[1, 1, 2], &[], GrowthCandidates::SameAsInput, GrowthCandidates::SameAsInput, false)
            .unwrap();
        assert_eq!(tm.active_cells(), &[0]);

        // Unsorted input is not rejected up front.
        let mut tm = unchecked();
        tm.compute(&[0], &[2, 1], &[], GrowthCandidates::SameAsInput, GrowthCandidates::SameAsInput, false)
            .unwrap();
        assert_eq!(tm.predicted_cells(), &[0]);

        let mut checked = two_segment_memory();
        let err = checked
            .compute(&[0], &[2, 1], &[], GrowthCandidates::SameAsInput, GrowthCandidates::SameAsInput, false)
            .unwrap_err();
        assert!(matches!(err, HtmError::UnsortedInput { .. }));

        // Out-of-range bits surface from the connections.
        let mut tm = unchecked();
        let err = tm
            .compute(&[0], &[1, 99], &[], GrowthCandidates::SameAsInput, GrowthCandidates::SameAsInput, false)
            .unwrap_err();
        assert!(matches!(err, HtmError::InvalidIndex { index: 99, .. }));
    }

    #[test]
    fn test_out_of_range_growth_candidates_are_rejected() {
        let mut tm = ApicalTiebreakPairMemory::new(pair_params()).unwrap();
        let err = tm
            .compute(&[2], &[], &[], GrowthCandidates::SameAsInput, GrowthCandidates::Explicit(&[64]), true)
            .unwrap_err();
        assert!(matches!(err, HtmError::InvalidIndex { .. }));
    }
}

// =============================================================================
// SERIALIZATION
// =============================================================================

mod serialization {
    use super::*;

    fn trained_memory() -> ApicalTiebreakSequenceMemory {
        let mut tm = ApicalTiebreakSequenceMemory::new(sequence_params()).unwrap();
        for _ in 0..3 {
            for columns in [[0u32, 1, 2, 3], [4, 5, 6, 7], [8, 9, 10, 11]] {
                step(&mut tm, &columns, true);
            }
        }
        tm
    }

    #[test]
    fn test_write_then_read_continues_identically() -> anyhow::Result<()> {
        let mut original = trained_memory();
        let mut buffer = Vec::new();
        original.write(&mut buffer)?;
        let mut restored = ApicalTiebreakSequenceMemory::read(buffer.as_slice())?;
        assert_eq!(restored, original);

        for columns in [[12u32, 13, 14, 15], [0, 1, 2, 3], [16, 17, 18, 19]] {
            step(&mut original, &columns, true);
            step(&mut restored, &columns, true);
            assert_eq!(restored.active_cells(), original.active_cells());
            assert_eq!(restored.winner_cells(), original.winner_cells());
        }
        assert_eq!(restored.to_bytes()?, original.to_bytes()?);
        Ok(())
    }

    #[test]
    fn test_truncated_bytes_are_rejected() {
        let original = trained_memory();
        let bytes = original.to_bytes().unwrap();

        let err = ApicalTiebreakSequenceMemory::from_bytes(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, HtmError::Serialization(_)));
    }

    #[test]
    fn test_failed_restore_keeps_state() {
        let mut tm = trained_memory();
        let before = tm.clone();

        assert!(tm.restore(&[1, 2, 3]).is_err());
        assert_eq!(tm, before);

        let fresh = ApicalTiebreakSequenceMemory::new(sequence_params()).unwrap();
        tm.restore(&fresh.to_bytes().unwrap()).unwrap();
        assert_eq!(tm, fresh);
    }
}
