// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use approx::assert_abs_diff_eq;
use vp_nn::{
    elu, CausalGainKernel, Conditioning, HistoryStateGainModulator, Modulator, ModulatorConfig,
    Parameterized, Positivity, Tensor,
};

fn with_rank(rank: &Tensor) -> Conditioning<'_> {
    Conditioning {
        rank_id: Some(rank),
        ..Default::default()
    }
}

#[test]
fn gain_only_scenario_reads_ranks_up_to_the_current_one() {
    let config = ModulatorConfig {
        include_gain: true,
        ..ModulatorConfig::disabled()
    };
    let mut modulator = HistoryStateGainModulator::new("m", 3, 5, &config, Some(42)).unwrap();
    assert_eq!(modulator.positivity(), Positivity::Guaranteed);
    let own_gain = Tensor::from_vec(1, 5, vec![0.3, -0.2, 0.5, 9.0, -9.0]).unwrap();
    modulator.own_gain_mut().unwrap().load_value(&own_gain).unwrap();

    let x = Tensor::from_vec(1, 3, vec![0.0, 1.0, -1.0]).unwrap();
    let rank = Tensor::from_vec(1, 1, vec![2.0]).unwrap();
    let out = modulator.forward(&x, &with_rank(&rank)).unwrap();

    let taps = CausalGainKernel::new(30.0).unwrap();
    let taps = taps.taps();
    // slot s receives tap 100 + (2 - s) for s <= 2 and nothing for later slots
    let z = 0.3 * taps[102] - 0.2 * taps[101] + 0.5 * taps[100];
    let gain = elu(z) + 1.0;
    for (n, &xn) in x.data().iter().enumerate() {
        assert_abs_diff_eq!(out.data()[n], (elu(xn) + 1.0) * gain, epsilon = 1e-6);
    }
}

#[test]
fn smoothing_leaves_earlier_slots_untouched_by_later_ranks() {
    let kernel = CausalGainKernel::new(30.0).unwrap();
    for t in 0..6 {
        let mut one_hot = vec![0.0f32; 6];
        one_hot[t] = 1.0;
        let smooth = kernel.smooth(&one_hot);
        for (slot, &value) in smooth.iter().enumerate() {
            if slot > t {
                assert_eq!(value, 0.0, "rank {t} leaked into later slot {slot}");
            } else {
                assert!(value > 0.0);
            }
        }
    }
}

#[test]
fn per_neuron_adjustment_with_zero_coupling_offset_matches_formula() {
    let config = ModulatorConfig {
        include_gain: true,
        per_neuron_gain_adjust: true,
        ..ModulatorConfig::disabled()
    };
    let modulator = HistoryStateGainModulator::new("m", 3, 4, &config, Some(7)).unwrap();
    let x = Tensor::from_vec(1, 3, vec![0.2, 0.4, 0.8]).unwrap();
    let rank = Tensor::from_vec(1, 1, vec![3.0]).unwrap();
    let out = modulator.forward(&x, &with_rank(&rank)).unwrap();

    let own = modulator.own_gain().unwrap().value().data();
    let taps = modulator.gain_kernel().unwrap().taps();
    let z: f32 = (0..=3).map(|s| own[s] * taps[100 + 3 - s]).sum();
    let g = elu(z) + 1.0;
    let coupling = modulator.gain_coupling().unwrap().value().data();
    for n in 0..3 {
        let c = elu(coupling[n]) + 1.0;
        let adjusted = elu(c * (g - 1.0)) + 1.0;
        assert_abs_diff_eq!(out.data()[n], (elu(x.data()[n]) + 1.0) * adjusted, epsilon = 1e-6);
    }
}

#[test]
fn regularizer_is_additive_over_terms() {
    let full = ModulatorConfig {
        include_history: true,
        nr_history: 4,
        behav_state: true,
        nr_behav_state: 3,
        include_gain: true,
        gain_kernel_std: 30.0,
        diff_reg: 2.0,
        per_neuron_gain_adjust: true,
        gain_adjust_alpha: 0.3,
        alpha_behav: 0.7,
        alpha_hist: 0.11,
    };
    let singles = [
        ModulatorConfig {
            include_gain: true,
            diff_reg: full.diff_reg,
            ..ModulatorConfig::disabled()
        },
        ModulatorConfig {
            per_neuron_gain_adjust: true,
            gain_adjust_alpha: full.gain_adjust_alpha,
            ..ModulatorConfig::disabled()
        },
        ModulatorConfig {
            include_history: true,
            nr_history: full.nr_history,
            alpha_hist: full.alpha_hist,
            ..ModulatorConfig::disabled()
        },
        ModulatorConfig {
            behav_state: true,
            nr_behav_state: full.nr_behav_state,
            alpha_behav: full.alpha_behav,
            ..ModulatorConfig::disabled()
        },
    ];
    let build = |config: &ModulatorConfig| {
        HistoryStateGainModulator::new("m", 5, 9, config, Some(3)).unwrap()
    };
    let total = build(&full).regularizer().unwrap();
    let parts: Vec<f32> = singles
        .iter()
        .map(|config| build(config).regularizer().unwrap())
        .collect();
    assert!(parts.iter().all(|&p| p > 0.0));
    assert_abs_diff_eq!(total, parts.iter().sum::<f32>(), epsilon = 1e-4);

    let silent = ModulatorConfig {
        diff_reg: 0.0,
        gain_adjust_alpha: 0.0,
        alpha_behav: 0.0,
        alpha_hist: 0.0,
        ..full
    };
    assert_eq!(build(&silent).regularizer().unwrap(), 0.0);
    assert!(build(&silent).parameter_count().unwrap() > 0);
}

#[test]
fn seeded_construction_is_reproducible() {
    let config = ModulatorConfig {
        include_gain: true,
        ..ModulatorConfig::default()
    };
    let a = HistoryStateGainModulator::new("m", 4, 6, &config, Some(9)).unwrap();
    let b = HistoryStateGainModulator::new("m", 4, 6, &config, Some(9)).unwrap();
    assert_eq!(a.state_dict().unwrap(), b.state_dict().unwrap());
    let bound = (1.0f32 / 6.0).sqrt();
    assert!(a
        .own_gain()
        .unwrap()
        .value()
        .data()
        .iter()
        .all(|g| g.abs() <= bound));
}
