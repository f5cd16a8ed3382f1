// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Gaze-dependent shifters producing the readout's 2-D location offset.

use crate::config::ShifterConfig;
use crate::layers::{Linear, Sequential, Tanh};
use crate::module::{Module, Parameter, Parameterized};
use crate::{PureResult, Tensor, TensorError};
use std::collections::BTreeMap;

/// Maps `pupil_center` `(batch, 2)` (and optionally `trial_idx` `(batch, 1)`)
/// to a `(batch, 2)` shift.
pub trait Shifter: Parameterized {
    fn forward(&self, pupil_center: &Tensor, trial_idx: Option<&Tensor>) -> PureResult<Tensor>;

    /// Accumulates parameter gradients. Gaze inputs are data, so nothing is returned.
    fn backward(
        &mut self,
        pupil_center: &Tensor,
        trial_idx: Option<&Tensor>,
        grad_output: &Tensor,
    ) -> PureResult<()>;

    fn regularizer(&self) -> PureResult<f32> {
        Ok(0.0)
    }

    fn backward_regularizer(&mut self, _weight: f32) -> PureResult<()> {
        Ok(())
    }
}

/// Tanh MLP shifter: every linear layer, including the output, is followed by a tanh.
#[derive(Debug)]
pub struct MlpShifter {
    net: Sequential,
    uses_trial_idx: bool,
    gamma_shifter: f32,
}

impl MlpShifter {
    pub fn new(name: &str, config: &ShifterConfig, seed: Option<u64>) -> PureResult<Self> {
        if config.layers == 0 {
            return Err(TensorError::InvalidValue {
                label: "shifter needs at least one layer",
            });
        }
        let mut net = Sequential::new();
        let mut width = if config.use_trial_idx { 3 } else { 2 };
        for layer in 0..config.layers {
            let out = if layer + 1 == config.layers {
                2
            } else {
                config.hidden_channels
            };
            net.push(Linear::new(format!("{name}::layer{layer}"), width, out, seed)?);
            net.push(Tanh::default());
            width = out;
        }
        Ok(Self {
            net,
            uses_trial_idx: config.use_trial_idx,
            gamma_shifter: config.gamma_shifter,
        })
    }

    fn input(&self, pupil_center: &Tensor, trial_idx: Option<&Tensor>) -> PureResult<Tensor> {
        let (batch, cols) = pupil_center.shape();
        if cols != 2 {
            return Err(TensorError::ShapeMismatch {
                left: pupil_center.shape(),
                right: (batch, 2),
            });
        }
        if !self.uses_trial_idx {
            return Ok(pupil_center.clone());
        }
        let trial_idx = trial_idx.ok_or(TensorError::MissingInput { label: "trial_idx" })?;
        if trial_idx.shape() != (batch, 1) {
            return Err(TensorError::ShapeMismatch {
                left: trial_idx.shape(),
                right: (batch, 1),
            });
        }
        Tensor::from_fn(batch, 3, |r, c| {
            if c < 2 {
                pupil_center.data()[r * 2 + c]
            } else {
                trial_idx.data()[r]
            }
        })
    }

    fn is_weight(param: &Parameter) -> bool {
        param.name().ends_with("::weight")
    }
}

impl Parameterized for MlpShifter {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.net.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.net.visit_parameters_mut(visitor)
    }
}

impl Shifter for MlpShifter {
    fn forward(&self, pupil_center: &Tensor, trial_idx: Option<&Tensor>) -> PureResult<Tensor> {
        self.net.forward(&self.input(pupil_center, trial_idx)?)
    }

    fn backward(
        &mut self,
        pupil_center: &Tensor,
        trial_idx: Option<&Tensor>,
        grad_output: &Tensor,
    ) -> PureResult<()> {
        let input = self.input(pupil_center, trial_idx)?;
        self.net.backward(&input, grad_output)?;
        Ok(())
    }

    /// `gamma_shifter · Σ w²` over the linear weights (biases excluded).
    fn regularizer(&self) -> PureResult<f32> {
        if self.gamma_shifter == 0.0 {
            return Ok(0.0);
        }
        let mut total = 0.0f32;
        self.net.visit_parameters(&mut |param| {
            if Self::is_weight(param) {
                total += param.value().squared_l2_norm();
            }
            Ok(())
        })?;
        Ok(self.gamma_shifter * total)
    }

    fn backward_regularizer(&mut self, weight: f32) -> PureResult<()> {
        if self.gamma_shifter == 0.0 || weight == 0.0 {
            return Ok(());
        }
        let scale = 2.0 * self.gamma_shifter * weight;
        self.net.visit_parameters_mut(&mut |param| {
            if Self::is_weight(param) {
                let grad = param.value().scale(scale)?;
                param.accumulate_euclidean(&grad)?;
            }
            Ok(())
        })
    }
}

/// Shifters keyed by data key.
#[derive(Default)]
pub struct MultiShifter {
    sessions: BTreeMap<String, Box<dyn Shifter>>,
}

impl core::fmt::Debug for MultiShifter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MultiShifter")
            .field("keys", &self.sessions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MultiShifter {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`MlpShifter`] per data key, all built from `config`.
    pub fn build<'a>(
        keys: impl IntoIterator<Item = &'a str>,
        config: &ShifterConfig,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let mut multi = Self::new();
        for key in keys {
            let shifter = MlpShifter::new(&format!("shifter::{key}"), config, seed)?;
            multi.insert(key, shifter);
        }
        Ok(multi)
    }

    pub fn insert<S>(&mut self, data_key: impl Into<String>, shifter: S)
    where
        S: Shifter + 'static,
    {
        self.sessions.insert(data_key.into(), Box::new(shifter));
    }

    pub fn contains(&self, data_key: &str) -> bool {
        self.sessions.contains_key(data_key)
    }

    pub fn get(&self, data_key: &str) -> Option<&dyn Shifter> {
        self.sessions.get(data_key).map(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, data_key: &str) -> Option<&mut (dyn Shifter + 'static)> {
        self.sessions.get_mut(data_key).map(|s| s.as_mut())
    }

    fn unknown(data_key: &str) -> TensorError {
        TensorError::UnknownDataKey {
            key: data_key.to_string(),
        }
    }

    /// Penalty of the shifter registered under `data_key`.
    pub fn regularizer(&self, data_key: &str) -> PureResult<f32> {
        self.get(data_key)
            .ok_or_else(|| Self::unknown(data_key))?
            .regularizer()
    }

    pub fn backward_regularizer(&mut self, data_key: &str, weight: f32) -> PureResult<()> {
        self.get_mut(data_key)
            .ok_or_else(|| Self::unknown(data_key))?
            .backward_regularizer(weight)
    }
}

impl Parameterized for MultiShifter {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for shifter in self.sessions.values() {
            shifter.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for shifter in self.sessions.values_mut() {
            shifter.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn config(gamma: f32, use_trial_idx: bool) -> ShifterConfig {
        ShifterConfig {
            hidden_channels: 4,
            layers: 2,
            gamma_shifter: gamma,
            use_trial_idx,
        }
    }

    #[test]
    fn output_is_bounded_two_vector() {
        let shifter = MlpShifter::new("s", &config(0.0, false), Some(3)).unwrap();
        let pupil = Tensor::from_vec(3, 2, vec![10.0, -4.0, 0.0, 0.0, 2.0, 1.0]).unwrap();
        let shift = shifter.forward(&pupil, None).unwrap();
        assert_eq!(shift.shape(), (3, 2));
        assert!(shift.data().iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn trial_idx_is_required_when_configured() {
        let shifter = MlpShifter::new("s", &config(0.0, true), Some(3)).unwrap();
        let pupil = Tensor::zeros(2, 2).unwrap();
        assert!(matches!(
            shifter.forward(&pupil, None),
            Err(TensorError::MissingInput { label: "trial_idx" })
        ));
        let trial_idx = Tensor::from_vec(2, 1, vec![0.0, 1.0]).unwrap();
        assert_eq!(
            shifter.forward(&pupil, Some(&trial_idx)).unwrap().shape(),
            (2, 2)
        );
    }

    #[test]
    fn l2_penalty_gradient_is_twice_scaled_weight() {
        let mut shifter = MlpShifter::new("s", &config(0.25, false), Some(3)).unwrap();
        let mut expected = 0.0;
        shifter
            .visit_parameters(&mut |p| {
                if p.name().ends_with("::weight") {
                    expected += p.value().squared_l2_norm();
                }
                Ok(())
            })
            .unwrap();
        assert_abs_diff_eq!(shifter.regularizer().unwrap(), 0.25 * expected, epsilon = 1e-6);

        shifter.backward_regularizer(2.0).unwrap();
        shifter
            .visit_parameters(&mut |p| {
                match p.gradient() {
                    Some(grad) => {
                        for (g, w) in grad.data().iter().zip(p.value().data()) {
                            assert_abs_diff_eq!(*g, 2.0 * 0.25 * 2.0 * w, epsilon = 1e-6);
                        }
                    }
                    None => assert!(p.name().ends_with("::bias")),
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn multi_shifter_dispatches_by_key() {
        let multi = MultiShifter::build(["a"], &config(1.0, false), Some(9)).unwrap();
        assert!(multi.contains("a"));
        assert!(multi.get("b").is_none());
        assert!(matches!(
            multi.regularizer("b"),
            Err(TensorError::UnknownDataKey { .. })
        ));
        assert!(multi.regularizer("a").unwrap() > 0.0);
    }
}
