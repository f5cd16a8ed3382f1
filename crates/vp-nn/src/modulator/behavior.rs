// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{
    accumulate_l1, ensure_shape, Conditioning, ConditioningMode, ConditioningRequirements,
    Modulator, Positivity,
};
use crate::layers::Linear;
use crate::module::{Module, Parameter, Parameterized};
use crate::{elu, elu_grad, PureResult, Tensor, TensorError};

/// Behavior-driven multiplicative gain `x · (elu(W·behavior + b) + 1)`.
///
/// The readout activation passes through unchanged in sign, so the encoder
/// still closes this stage with its own positivity transform.
#[derive(Debug)]
pub struct BehaviorGainModulator {
    encoder: Linear,
    alpha_behav: f32,
}

impl BehaviorGainModulator {
    pub fn new(
        name: &str,
        behavior_dims: usize,
        nr_neurons: usize,
        alpha_behav: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        Ok(Self {
            encoder: Linear::new(format!("{name}::behavior_encoder"), behavior_dims, nr_neurons, seed)?,
            alpha_behav,
        })
    }

    pub fn encoder(&self) -> &Linear {
        &self.encoder
    }

    fn behavior<'a>(&self, x: &Tensor, conditioning: &Conditioning<'a>) -> PureResult<&'a Tensor> {
        let behavior = conditioning
            .behavior
            .ok_or(TensorError::MissingInput { label: "behavior" })?;
        ensure_shape("behavior", behavior, x.shape().0, self.encoder.input_dim())?;
        if x.shape().1 != self.encoder.output_dim() {
            return Err(TensorError::ShapeMismatch {
                left: x.shape(),
                right: (x.shape().0, self.encoder.output_dim()),
            });
        }
        Ok(behavior)
    }
}

impl Parameterized for BehaviorGainModulator {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.encoder.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.encoder.visit_parameters_mut(visitor)
    }
}

impl Modulator for BehaviorGainModulator {
    fn mode(&self) -> ConditioningMode {
        ConditioningMode::BehaviorOnly
    }

    fn positivity(&self) -> Positivity {
        Positivity::Unbounded
    }

    fn requirements(&self) -> ConditioningRequirements {
        ConditioningRequirements {
            behavior: true,
            ..Default::default()
        }
    }

    fn behavior_dims(&self) -> Option<usize> {
        Some(self.encoder.input_dim())
    }

    fn forward(&self, x: &Tensor, conditioning: &Conditioning<'_>) -> PureResult<Tensor> {
        let behavior = self.behavior(x, conditioning)?;
        let gain = self.encoder.forward(behavior)?.map(|v| elu(v) + 1.0);
        x.hadamard(&gain)
    }

    fn backward(
        &mut self,
        x: &Tensor,
        conditioning: &Conditioning<'_>,
        grad_output: &Tensor,
    ) -> PureResult<Tensor> {
        let behavior = self.behavior(x, conditioning)?;
        let projected = self.encoder.forward(behavior)?;
        let gain = projected.map(|v| elu(v) + 1.0);
        let grad_x = grad_output.hadamard(&gain)?;
        let grad_gain = grad_output.hadamard(x)?;
        let (rows, cols) = projected.shape();
        let grad_projected = Tensor::from_vec(
            rows,
            cols,
            grad_gain
                .data()
                .iter()
                .zip(projected.data())
                .map(|(g, &v)| g * elu_grad(v))
                .collect(),
        )?;
        self.encoder.backward(behavior, &grad_projected)?;
        Ok(grad_x)
    }

    /// `alpha_behav · Σ|W|`, bias excluded.
    fn regularizer(&self) -> PureResult<f32> {
        if self.alpha_behav > 0.0 {
            Ok(self.alpha_behav * self.encoder.weight().value().abs_sum())
        } else {
            Ok(0.0)
        }
    }

    fn backward_regularizer(&mut self, weight: f32) -> PureResult<()> {
        if self.alpha_behav > 0.0 && weight != 0.0 {
            accumulate_l1(self.encoder.weight_mut(), self.alpha_behav * weight)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn zero_behavior_leaves_bias_gain() {
        let module = BehaviorGainModulator::new("b", 3, 2, 0.0, Some(1)).unwrap();
        let x = Tensor::from_vec(1, 2, vec![2.0, -1.0]).unwrap();
        let behavior = Tensor::zeros(1, 3).unwrap();
        let cond = Conditioning {
            behavior: Some(&behavior),
            ..Default::default()
        };
        let out = module.forward(&x, &cond).unwrap();
        let bias = module.encoder().bias().value().data();
        assert_abs_diff_eq!(out.data()[0], 2.0 * (elu(bias[0]) + 1.0), epsilon = 1e-6);
        assert_abs_diff_eq!(out.data()[1], -(elu(bias[1]) + 1.0), epsilon = 1e-6);
        assert_eq!(module.positivity(), Positivity::Unbounded);
    }

    #[test]
    fn requires_behavior() {
        let module = BehaviorGainModulator::new("b", 3, 2, 0.0, Some(1)).unwrap();
        let x = Tensor::zeros(1, 2).unwrap();
        assert!(matches!(
            module.forward(&x, &Conditioning::default()),
            Err(TensorError::MissingInput { label: "behavior" })
        ));
        assert!(module.requirements().behavior);
        assert_eq!(module.behavior_dims(), Some(3));
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut module = BehaviorGainModulator::new("b", 2, 3, 0.0, Some(4)).unwrap();
        let x = Tensor::from_vec(2, 3, vec![0.5, -1.0, 2.0, 1.5, 0.1, -0.7]).unwrap();
        let behavior = Tensor::from_vec(2, 2, vec![0.3, -2.0, 1.0, 0.4]).unwrap();
        let cond = Conditioning {
            behavior: Some(&behavior),
            ..Default::default()
        };
        let probe = Tensor::full(2, 3, 1.0).unwrap();
        module.backward(&x, &cond, &probe).unwrap();
        let grad = module.encoder().weight().gradient().unwrap().clone();
        let weight = module.encoder().weight().value().clone();
        let eps = 1e-2;
        for i in 0..weight.len() {
            let mut plus = weight.clone();
            plus.data_mut()[i] += eps;
            module.encoder.weight_mut().load_value(&plus).unwrap();
            let up = module.forward(&x, &cond).unwrap().sum();
            let mut minus = weight.clone();
            minus.data_mut()[i] -= eps;
            module.encoder.weight_mut().load_value(&minus).unwrap();
            let down = module.forward(&x, &cond).unwrap().sum();
            assert_abs_diff_eq!(grad.data()[i], (up - down) / (2.0 * eps), epsilon = 1e-2);
        }
    }

    #[test]
    fn l1_penalty_skips_bias() {
        let mut module = BehaviorGainModulator::new("b", 2, 2, 0.5, Some(2)).unwrap();
        let expected = 0.5 * module.encoder().weight().value().abs_sum();
        assert_abs_diff_eq!(module.regularizer().unwrap(), expected, epsilon = 1e-6);
        module.backward_regularizer(1.0).unwrap();
        assert!(module.encoder().bias().gradient().is_none());
        assert!(module
            .encoder()
            .weight()
            .gradient()
            .unwrap()
            .data()
            .iter()
            .all(|g| g.abs() == 0.5));
    }
}
