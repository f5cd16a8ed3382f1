// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::kernel::CausalGainKernel;
use super::{
    accumulate_l1, ensure_shape, Conditioning, ConditioningMode, ConditioningRequirements,
    Modulator, Positivity,
};
use crate::config::ModulatorConfig;
use crate::layers::Linear;
use crate::module::{Module, Parameter, Parameterized};
use crate::{elu, elu_grad, PureResult, Tensor, TensorError};

/// Learned trial gain: one scalar per temporal trial slot, read through the
/// causal smoothing kernel.
#[derive(Debug)]
struct TrialGain {
    own_gain: Parameter,
    kernel: CausalGainKernel,
    diff_reg: f32,
}

/// Per-neuron modulation of the trial gain, `elu(coupling · (g - 1)) + 1`.
#[derive(Debug)]
struct GainCoupling {
    coupling: Parameter,
    offset: Parameter,
    alpha: f32,
}

#[derive(Debug)]
struct HistoryFilter {
    weights: Parameter,
    bias: Parameter,
    lags: usize,
    alpha: f32,
}

#[derive(Debug)]
struct StateEncoder {
    linear: Linear,
    dims: usize,
    alpha: f32,
}

/// Intermediate values of one forward pass, recomputed by `backward`.
struct Trace {
    /// Corrected activation before the positivity transform.
    pre: Tensor,
    /// `state_encoder(state)` when a state was supplied.
    state_mod: Option<Tensor>,
    positive: Tensor,
    gain: Option<GainTrace>,
}

struct GainTrace {
    support: Vec<Vec<(usize, f32)>>,
    /// Per-sample pre-activation `smooth(one_hot) · own_gain`.
    z: Vec<f32>,
    /// `elu(z) + 1`.
    g: Vec<f32>,
    /// Per-neuron `gain_coupling + coupling_offset`.
    coupling_pre: Option<Vec<f32>>,
}

/// History, behavioral-state and trial-gain adjustment of readout activations.
///
/// Per sample and neuron the stage computes
///
/// ```text
/// pre = x + (Σ_l W[n,l]·history[n,l] + b[n]) + elu(state_encoder(state))[n]
/// y   = (elu(pre) + 1) · gain
/// ```
///
/// where each term only exists when its toggle is enabled, and `gain` is the
/// smoothed trial gain of the sample's `rank_id` (optionally adjusted per
/// neuron). Missing `history` keeps the bias, missing `state` contributes zero
/// and missing `rank_id` skips the gain.
#[derive(Debug)]
pub struct HistoryStateGainModulator {
    nr_neurons: usize,
    nr_trials: usize,
    history: Option<HistoryFilter>,
    state: Option<StateEncoder>,
    gain: Option<TrialGain>,
    coupling: Option<GainCoupling>,
}

impl HistoryStateGainModulator {
    pub fn new(
        name: &str,
        nr_neurons: usize,
        nr_trials: usize,
        config: &ModulatorConfig,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if nr_neurons == 0 || nr_trials == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: nr_neurons,
                cols: nr_trials,
            });
        }
        let uniform = |rows: usize, cols: usize, fan: usize, label: String| {
            let bound = (1.0 / fan as f32).sqrt();
            Tensor::random_uniform(rows, cols, -bound, bound, seed, &label)
                .map(|value| Parameter::new(label, value))
        };

        let gain = if config.include_gain {
            Some(TrialGain {
                own_gain: uniform(1, nr_trials, nr_trials, format!("{name}::own_gain"))?,
                kernel: CausalGainKernel::new(config.gain_kernel_std)?,
                diff_reg: config.diff_reg,
            })
        } else {
            None
        };
        let coupling = if config.per_neuron_gain_adjust {
            Some(GainCoupling {
                coupling: uniform(1, nr_neurons, nr_neurons, format!("{name}::gain_coupling"))?,
                offset: Parameter::new(format!("{name}::coupling_offset"), Tensor::zeros(1, 1)?),
                alpha: config.gain_adjust_alpha,
            })
        } else {
            None
        };
        let history = if config.include_history {
            let lags = config.nr_history;
            if lags == 0 {
                return Err(TensorError::InvalidDimensions {
                    rows: nr_neurons,
                    cols: lags,
                });
            }
            Some(HistoryFilter {
                weights: uniform(nr_neurons, lags, lags, format!("{name}::history_weights"))?,
                bias: uniform(1, nr_neurons, lags, format!("{name}::history_bias"))?,
                lags,
                alpha: config.alpha_hist,
            })
        } else {
            None
        };
        let state = if config.behav_state {
            Some(StateEncoder {
                linear: Linear::new(
                    format!("{name}::state_encoder"),
                    config.nr_behav_state,
                    nr_neurons,
                    seed,
                )?,
                dims: config.nr_behav_state,
                alpha: config.alpha_behav,
            })
        } else {
            None
        };

        Ok(Self {
            nr_neurons,
            nr_trials,
            history,
            state,
            gain,
            coupling,
        })
    }

    pub fn nr_neurons(&self) -> usize {
        self.nr_neurons
    }

    pub fn nr_trials(&self) -> usize {
        self.nr_trials
    }

    pub fn nr_history(&self) -> Option<usize> {
        self.history.as_ref().map(|h| h.lags)
    }

    pub fn nr_behav_state(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.dims)
    }

    pub fn own_gain(&self) -> Option<&Parameter> {
        self.gain.as_ref().map(|g| &g.own_gain)
    }

    pub fn own_gain_mut(&mut self) -> Option<&mut Parameter> {
        self.gain.as_mut().map(|g| &mut g.own_gain)
    }

    pub fn gain_kernel(&self) -> Option<&CausalGainKernel> {
        self.gain.as_ref().map(|g| &g.kernel)
    }

    pub fn history_weights(&self) -> Option<&Parameter> {
        self.history.as_ref().map(|h| &h.weights)
    }

    pub fn history_bias(&self) -> Option<&Parameter> {
        self.history.as_ref().map(|h| &h.bias)
    }

    pub fn gain_coupling(&self) -> Option<&Parameter> {
        self.coupling.as_ref().map(|c| &c.coupling)
    }

    pub fn state_encoder(&self) -> Option<&Linear> {
        self.state.as_ref().map(|s| &s.linear)
    }

    fn ranks(&self, rank_id: &Tensor, batch: usize) -> PureResult<Vec<usize>> {
        ensure_shape("rank_id", rank_id, batch, 1)?;
        rank_id
            .data()
            .iter()
            .map(|&value| {
                let index = value.floor();
                if !value.is_finite() || index < 0.0 || index as usize >= self.nr_trials {
                    return Err(TensorError::IndexOutOfRange {
                        label: "rank_id",
                        index: if value.is_finite() { index as i64 } else { -1 },
                        len: self.nr_trials,
                    });
                }
                Ok(index as usize)
            })
            .collect()
    }

    fn trace(&self, x: &Tensor, conditioning: &Conditioning<'_>) -> PureResult<Trace> {
        let (batch, neurons) = x.shape();
        if neurons != self.nr_neurons {
            return Err(TensorError::ShapeMismatch {
                left: x.shape(),
                right: (batch, self.nr_neurons),
            });
        }
        let mut pre = x.clone();

        if let Some(filter) = &self.history {
            let bias = filter.bias.value().data();
            if let Some(history) = conditioning.history {
                ensure_shape("history", history, batch, neurons * filter.lags)?;
                let weights = filter.weights.value().data();
                let out = pre.data_mut();
                for b in 0..batch {
                    let row = history.row(b)?;
                    for n in 0..neurons {
                        let lagged = &row[n * filter.lags..(n + 1) * filter.lags];
                        let w = &weights[n * filter.lags..(n + 1) * filter.lags];
                        let filtered: f32 = lagged.iter().zip(w).map(|(h, w)| h * w).sum();
                        out[b * neurons + n] += filtered;
                    }
                }
            }
            pre.add_row_inplace(bias)?;
        }

        let mut state_mod = None;
        if let Some(encoder) = &self.state {
            if let Some(state) = conditioning.state {
                ensure_shape("state", state, batch, encoder.dims)?;
                let projected = encoder.linear.forward(state)?;
                pre.add_scaled(&projected.map(elu), 1.0)?;
                state_mod = Some(projected);
            }
        }

        let positive = pre.map(|v| elu(v) + 1.0);

        let gain = match (&self.gain, conditioning.rank_id) {
            (Some(trial_gain), Some(rank_id)) => {
                let ranks = self.ranks(rank_id, batch)?;
                let own_gain = trial_gain.own_gain.value().data();
                let support: Vec<Vec<(usize, f32)>> = ranks
                    .iter()
                    .map(|&rank| trial_gain.kernel.one_hot_support(rank, self.nr_trials))
                    .collect();
                let z: Vec<f32> = support
                    .iter()
                    .map(|taps| taps.iter().map(|&(slot, w)| w * own_gain[slot]).sum())
                    .collect();
                let g = z.iter().map(|&z| elu(z) + 1.0).collect();
                let coupling_pre = self.coupling.as_ref().map(|c| {
                    let offset = c.offset.value().data()[0];
                    c.coupling.value().data().iter().map(|v| v + offset).collect()
                });
                Some(GainTrace {
                    support,
                    z,
                    g,
                    coupling_pre,
                })
            }
            _ => None,
        };

        Ok(Trace {
            pre,
            state_mod,
            positive,
            gain,
        })
    }

    fn output(&self, trace: &Trace) -> PureResult<Tensor> {
        let Some(gain) = &trace.gain else {
            return Ok(trace.positive.clone());
        };
        let (batch, neurons) = trace.positive.shape();
        let p = trace.positive.data();
        Tensor::from_fn(batch, neurons, |b, n| {
            let g = gain.g[b];
            let factor = match &gain.coupling_pre {
                Some(u) => elu((elu(u[n]) + 1.0) * (g - 1.0)) + 1.0,
                None => g,
            };
            p[b * neurons + n] * factor
        })
    }
}

impl Parameterized for HistoryStateGainModulator {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        if let Some(gain) = &self.gain {
            visitor(&gain.own_gain)?;
        }
        if let Some(coupling) = &self.coupling {
            visitor(&coupling.coupling)?;
            visitor(&coupling.offset)?;
        }
        if let Some(history) = &self.history {
            visitor(&history.weights)?;
            visitor(&history.bias)?;
        }
        if let Some(state) = &self.state {
            state.linear.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        if let Some(gain) = &mut self.gain {
            visitor(&mut gain.own_gain)?;
        }
        if let Some(coupling) = &mut self.coupling {
            visitor(&mut coupling.coupling)?;
            visitor(&mut coupling.offset)?;
        }
        if let Some(history) = &mut self.history {
            visitor(&mut history.weights)?;
            visitor(&mut history.bias)?;
        }
        if let Some(state) = &mut self.state {
            state.linear.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

impl Modulator for HistoryStateGainModulator {
    fn mode(&self) -> ConditioningMode {
        ConditioningMode::HistoryStateGain
    }

    fn positivity(&self) -> Positivity {
        Positivity::Guaranteed
    }

    fn requirements(&self) -> ConditioningRequirements {
        ConditioningRequirements {
            behavior: false,
            history: self.history.is_some(),
            state: self.state.is_some(),
            rank_id: self.gain.is_some(),
        }
    }

    fn forward(&self, x: &Tensor, conditioning: &Conditioning<'_>) -> PureResult<Tensor> {
        let trace = self.trace(x, conditioning)?;
        self.output(&trace)
    }

    fn backward(
        &mut self,
        x: &Tensor,
        conditioning: &Conditioning<'_>,
        grad_output: &Tensor,
    ) -> PureResult<Tensor> {
        let trace = self.trace(x, conditioning)?;
        let (batch, neurons) = x.shape();
        if grad_output.shape() != (batch, neurons) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, neurons),
            });
        }
        let gy = grad_output.data();
        let p = trace.positive.data();

        // Gain stage: y = p · factor(g).
        let grad_positive = match &trace.gain {
            None => grad_output.clone(),
            Some(gain) => {
                let mut grad_p = vec![0.0f32; batch * neurons];
                let mut grad_g = vec![0.0f32; batch];
                match &gain.coupling_pre {
                    Some(u) => {
                        let c: Vec<f32> = u.iter().map(|&u| elu(u) + 1.0).collect();
                        let mut grad_c = vec![0.0f32; neurons];
                        for b in 0..batch {
                            let shifted = gain.g[b] - 1.0;
                            for n in 0..neurons {
                                let i = b * neurons + n;
                                let v = c[n] * shifted;
                                let a = elu(v) + 1.0;
                                grad_p[i] = gy[i] * a;
                                let grad_v = gy[i] * p[i] * elu_grad(v);
                                grad_c[n] += grad_v * shifted;
                                grad_g[b] += grad_v * c[n];
                            }
                        }
                        let grad_u: Vec<f32> = grad_c
                            .iter()
                            .zip(u)
                            .map(|(gc, &u)| gc * elu_grad(u))
                            .collect();
                        let grad_offset: f32 = grad_u.iter().sum();
                        if let Some(coupling) = &mut self.coupling {
                            coupling
                                .coupling
                                .accumulate_euclidean(&Tensor::from_vec(1, neurons, grad_u)?)?;
                            coupling
                                .offset
                                .accumulate_euclidean(&Tensor::from_vec(1, 1, vec![grad_offset])?)?;
                        }
                    }
                    None => {
                        for b in 0..batch {
                            for n in 0..neurons {
                                let i = b * neurons + n;
                                grad_p[i] = gy[i] * gain.g[b];
                                grad_g[b] += gy[i] * p[i];
                            }
                        }
                    }
                }
                if let Some(trial_gain) = &mut self.gain {
                    let mut grad_own = vec![0.0f32; self.nr_trials];
                    for b in 0..batch {
                        let grad_z = grad_g[b] * elu_grad(gain.z[b]);
                        for &(slot, w) in &gain.support[b] {
                            grad_own[slot] += grad_z * w;
                        }
                    }
                    trial_gain
                        .own_gain
                        .accumulate_euclidean(&Tensor::from_vec(1, self.nr_trials, grad_own)?)?;
                }
                Tensor::from_vec(batch, neurons, grad_p)?
            }
        };

        // Positivity transform: positive = elu(pre) + 1.
        let grad_pre = Tensor::from_vec(
            batch,
            neurons,
            grad_positive
                .data()
                .iter()
                .zip(trace.pre.data())
                .map(|(g, &pre)| g * elu_grad(pre))
                .collect(),
        )?;

        if let Some(filter) = &mut self.history {
            let bias_grad = grad_pre.sum_axis0();
            filter
                .bias
                .accumulate_euclidean(&Tensor::from_vec(1, neurons, bias_grad)?)?;
            if let Some(history) = conditioning.history {
                let lags = filter.lags;
                let mut grad_w = vec![0.0f32; neurons * lags];
                for b in 0..batch {
                    let row = history.row(b)?;
                    for n in 0..neurons {
                        let g = grad_pre.data()[b * neurons + n];
                        for l in 0..lags {
                            grad_w[n * lags + l] += g * row[n * lags + l];
                        }
                    }
                }
                filter
                    .weights
                    .accumulate_euclidean(&Tensor::from_vec(neurons, lags, grad_w)?)?;
            }
        }

        if let (Some(encoder), Some(state), Some(state_mod)) =
            (&mut self.state, conditioning.state, &trace.state_mod)
        {
            let grad_mod = Tensor::from_vec(
                batch,
                neurons,
                grad_pre
                    .data()
                    .iter()
                    .zip(state_mod.data())
                    .map(|(g, &m)| g * elu_grad(m))
                    .collect(),
            )?;
            encoder.linear.backward(state, &grad_mod)?;
        }

        Ok(grad_pre)
    }

    /// Sum of the enabled penalties whose weight is positive.
    fn regularizer(&self) -> PureResult<f32> {
        let mut total = 0.0f32;
        if let Some(gain) = self.gain.as_ref().filter(|g| g.diff_reg > 0.0) {
            let values = gain.own_gain.value().data();
            let smooth: f32 = values.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();
            total += gain.diff_reg * smooth;
        }
        if let Some(coupling) = self.coupling.as_ref().filter(|c| c.alpha > 0.0) {
            total += coupling.alpha * coupling.coupling.value().abs_sum();
        }
        if let Some(history) = self.history.as_ref().filter(|h| h.alpha > 0.0) {
            total += history.alpha * history.weights.value().abs_sum();
        }
        if let Some(state) = self.state.as_ref().filter(|s| s.alpha > 0.0) {
            total += state.alpha * state.linear.weight().value().abs_sum();
        }
        Ok(total)
    }

    fn backward_regularizer(&mut self, weight: f32) -> PureResult<()> {
        if weight == 0.0 {
            return Ok(());
        }
        if let Some(gain) = self.gain.as_mut().filter(|g| g.diff_reg > 0.0) {
            let values = gain.own_gain.value().data();
            let len = values.len();
            let scale = 2.0 * gain.diff_reg * weight;
            let grad: Vec<f32> = (0..len)
                .map(|i| {
                    let mut g = 0.0;
                    if i > 0 {
                        g += values[i] - values[i - 1];
                    }
                    if i + 1 < len {
                        g -= values[i + 1] - values[i];
                    }
                    scale * g
                })
                .collect();
            gain.own_gain
                .accumulate_euclidean(&Tensor::from_vec(1, len, grad)?)?;
        }
        if let Some(coupling) = self.coupling.as_mut().filter(|c| c.alpha > 0.0) {
            let scale = coupling.alpha * weight;
            accumulate_l1(&mut coupling.coupling, scale)?;
        }
        if let Some(history) = self.history.as_mut().filter(|h| h.alpha > 0.0) {
            let scale = history.alpha * weight;
            accumulate_l1(&mut history.weights, scale)?;
        }
        if let Some(state) = self.state.as_mut().filter(|s| s.alpha > 0.0) {
            let scale = state.alpha * weight;
            accumulate_l1(state.linear.weight_mut(), scale)?;
        }
        Ok(())
    }
}
