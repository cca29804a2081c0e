use sparse_clockwork::compute_system::ComputeSystem;
use sparse_clockwork::error::Error;
use sparse_clockwork::helpers::Int2;
use sparse_clockwork::hierarchy::{Hierarchy, InputDesc, LayerDesc};
use sparse_clockwork::learning::{EncodeRule, PredictRule};

fn small_layer(tpu: usize, horizon: usize) -> LayerDesc {
    LayerDesc {
        size: Int2::new(8, 8),
        column_size: 4,
        forward_radius: 4,
        backward_radius: 4,
        ticks_per_update: tpu,
        temporal_horizon: horizon,
    }
}

fn small_input() -> InputDesc {
    InputDesc {
        size: Int2::new(8, 8),
        column_size: 4,
        predict: true,
    }
}

fn make_code(num_columns: usize, column_size: i32, t: usize) -> Vec<i32> {
    (0..num_columns)
        .map(|i| ((i + t) % (column_size * column_size) as usize) as i32)
        .collect()
}

fn assert_valid_code(code: &[i32], num_columns: usize, column_size: i32) {
    assert_eq!(code.len(), num_columns);

    for &ci in code {
        assert!(ci >= 0 && ci < column_size * column_size, "ci={ci} out of range");
    }
}

#[test]
fn test_hierarchy_create_and_step() {
    let mut cs = ComputeSystem::new(2, 0);
    let mut h = Hierarchy::create(&[small_layer(1, 1)], &[small_input()], 1).unwrap();

    assert_eq!(h.get_num_layers(), 1);
    assert_eq!(h.get_num_inputs(), 1);

    for t in 0..3 {
        let input = make_code(4, 4, t);
        h.step(&mut cs, &[&input], true, 0.0, None).unwrap();
    }

    assert_valid_code(h.get_predictions(0), 4, 4);
    assert_valid_code(h.get_hidden_states(0), 4, 4);
}

#[test]
fn test_column_invariant_holds_every_tick() {
    // Two inputs, one input-only, across three layers of mixed rates
    let inputs = [
        small_input(),
        InputDesc {
            size: Int2::new(6, 3),
            column_size: 3,
            predict: false,
        },
    ];
    let layers = [small_layer(1, 2), small_layer(2, 3), small_layer(3, 3)];

    let mut cs = ComputeSystem::new(3, 5);
    let mut h = Hierarchy::create(&layers, &inputs, 9).unwrap();

    for t in 0..24 {
        let a = make_code(4, 4, t);
        let b = make_code(2, 3, t * 7);
        h.step(&mut cs, &[&a, &b], true, 0.0, None).unwrap();

        for l in 0..h.get_num_layers() {
            assert_valid_code(h.get_hidden_states(l), 4, 4);

            for (v, code) in h.get_histories(l).iter().enumerate() {
                let desc = h.get_layer(l).get_visible_layer_desc(v);
                assert_valid_code(code, desc.columns().area(), desc.column_size);
            }
        }

        assert_valid_code(h.get_predictions(0), 4, 4);
    }

    // Overflow history slots and input-only inputs are never predicted
    let bottom = h.get_layer(0);
    assert!(bottom.get_visible_layer(1).get_fb_weights().is_empty());
    assert!(bottom.get_visible_layer(2).get_fb_weights().is_empty());
    assert!(!h.get_layer(1).get_visible_layer_desc(2).predict);
    assert!(h.get_layer(2).get_visible_layer_desc(2).predict);
}

#[test]
fn test_histories_shift_newest_first() {
    let mut cs = ComputeSystem::new(1, 0);
    let mut h = Hierarchy::create(&[small_layer(1, 3)], &[small_input()], 1).unwrap();

    let codes: Vec<Vec<i32>> = (0..3).map(|t| make_code(4, 4, t + 1)).collect();

    for code in &codes {
        h.step(&mut cs, &[code], false, 0.0, None).unwrap();
    }

    let history = h.get_histories(0);
    assert_eq!(history[0], codes[2]);
    assert_eq!(history[1], codes[1]);
    assert_eq!(history[2], codes[0]);
}

#[test]
fn test_hierarchy_is_deterministic_across_worker_counts() {
    let layers = [small_layer(1, 2), small_layer(2, 2)];

    let run = |num_workers: usize| {
        let mut cs = ComputeSystem::new(num_workers, 77);
        let mut h = Hierarchy::create(&layers, &[small_input()], 3).unwrap();
        h.params.layers[1].predict_rule = PredictRule::TemporalDifference;

        for t in 0..40 {
            let input = make_code(4, 4, t % 5);
            h.step(&mut cs, &[&input], true, (t % 3) as f32 - 1.0, None).unwrap();
        }

        h
    };

    let single = run(1);
    assert_eq!(single, run(2));
    assert_eq!(single, run(8));
}

#[test]
fn test_hierarchy_clear_state() {
    let mut cs = ComputeSystem::new(2, 0);
    let mut h = Hierarchy::create(&[small_layer(1, 2), small_layer(2, 2)], &[small_input()], 1).unwrap();

    for t in 0..10 {
        let input = make_code(4, 4, t);
        h.step(&mut cs, &[&input], true, 0.0, None).unwrap();
    }

    let weights = h.get_layer(0).get_visible_layer(0).get_ff_weights().to_vec();

    h.clear_state();

    assert_eq!(h.get_layer(0).get_visible_layer(0).get_ff_weights(), &weights[..]);
    assert!(h.get_hidden_states(1).iter().all(|&ci| ci == 0));
    assert!(h.get_histories(1).iter().flatten().all(|&ci| ci == 0));
    assert_eq!(h.get_ticks(1), h.get_ticks_per_update(1) - 1);

    // Should still be able to step after clearing state
    let input = make_code(4, 4, 0);
    h.step(&mut cs, &[&input], true, 0.0, None).unwrap();
    assert!(h.get_update(1));
}

#[test]
fn test_top_feedback_reaches_top_layer() {
    let mut cs = ComputeSystem::new(2, 0);
    let mut h = Hierarchy::create(&[small_layer(1, 1), small_layer(1, 1)], &[small_input()], 1).unwrap();

    let input = make_code(4, 4, 0);
    let goal = vec![5, 6, 7, 8];

    h.step(&mut cs, &[&input], true, 0.0, Some(goal.as_slice())).unwrap();
    assert_eq!(h.get_layer(1).get_feedback_cis(1), &goal[..]);

    // Without it the top layer feeds back its own code
    h.step(&mut cs, &[&input], true, 0.0, None).unwrap();
    assert_eq!(h.get_layer(1).get_feedback_cis(1), h.get_hidden_states(1));

    // Lower layers take the aligned prediction of the layer above
    assert_eq!(h.get_layer(0).get_feedback_cis(1), h.get_layer_predictions(1, 0));
}

#[test]
fn test_reward_driven_layer_bounds_replay() {
    let mut cs = ComputeSystem::new(2, 4);
    let mut h = Hierarchy::create(&[small_layer(1, 1)], &[small_input()], 1).unwrap();

    h.params.layers[0].predict_rule = PredictRule::TemporalDifference;
    h.params.layers[0].td.max_replay_samples = 8;

    for t in 0..30 {
        let input = make_code(4, 4, t % 3);
        h.step(&mut cs, &[&input], true, 1.0, None).unwrap();

        assert_valid_code(h.get_predictions(0), 4, 4);
    }

    let layer = h.get_layer(0);
    assert_eq!(layer.get_replay_len(), 8);
    assert_eq!(layer.get_visible_layer(0).get_traces().len(), layer.get_visible_layer(0).get_fb_weights().len());
}

#[test]
fn test_hebbian_layers_learn_constant_input() {
    let mut cs = ComputeSystem::new(2, 0);
    let mut h = Hierarchy::create(&[small_layer(1, 1), small_layer(1, 1)], &[small_input()], 2).unwrap();

    for p in &mut h.params.layers {
        p.encode_rule = EncodeRule::Hebbian;
        p.predict_rule = PredictRule::Hebbian;
    }

    let input = make_code(4, 4, 6);

    for _ in 0..30 {
        h.step(&mut cs, &[&input], true, 0.0, None).unwrap();
    }

    assert_eq!(h.get_predictions(0), &input[..]);
}

#[test]
fn test_invalid_descriptors_are_rejected() {
    let input = small_input();

    // Grid not divisible by column size
    let mut bad = small_layer(1, 1);
    bad.size = Int2::new(9, 8);
    assert!(matches!(Hierarchy::create(&[bad], &[input.clone()], 0), Err(Error::InvalidConfig(_))));

    // Horizon shorter than the update period
    let layers = [small_layer(1, 1), small_layer(3, 2)];
    assert!(matches!(Hierarchy::create(&layers, &[input.clone()], 0), Err(Error::InvalidConfig(_))));

    // No layers, no inputs
    assert!(matches!(Hierarchy::create(&[], &[input.clone()], 0), Err(Error::InvalidConfig(_))));
    assert!(matches!(Hierarchy::create(&[small_layer(1, 1)], &[], 0), Err(Error::InvalidConfig(_))));

    // Zero column size
    let mut bad_input = input;
    bad_input.column_size = 0;
    assert!(matches!(
        Hierarchy::create(&[small_layer(1, 1)], &[bad_input], 0),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_invalid_inputs_are_rejected() {
    let mut cs = ComputeSystem::new(1, 0);
    let mut h = Hierarchy::create(&[small_layer(1, 1)], &[small_input()], 1).unwrap();

    let good = make_code(4, 4, 0);

    assert!(matches!(h.step(&mut cs, &[], true, 0.0, None), Err(Error::InvalidInput(_))));
    assert!(matches!(h.step(&mut cs, &[&good[..3]], true, 0.0, None), Err(Error::InvalidInput(_))));
    assert!(matches!(h.step(&mut cs, &[&[0, 1, 2, 16]], true, 0.0, None), Err(Error::InvalidInput(_))));
    assert!(matches!(h.step(&mut cs, &[&[0, -1, 2, 3]], true, 0.0, None), Err(Error::InvalidInput(_))));
    assert!(matches!(
        h.step(&mut cs, &[&good], true, 0.0, Some(&[0, 1][..])),
        Err(Error::InvalidInput(_))
    ));

    h.params.layers.clear();
    assert!(matches!(h.step(&mut cs, &[&good], true, 0.0, None), Err(Error::InvalidConfig(_))));
}
