// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::Loss;
use crate::{PureResult, Tensor, TensorError};

/// Poisson negative log-likelihood without the `ln(target!)` constant:
/// `Σ (rate - target · ln(rate + eps))`.
#[derive(Debug, Clone, Copy)]
pub struct PoissonLoss {
    eps: f32,
    average: bool,
}

impl Default for PoissonLoss {
    fn default() -> Self {
        Self {
            eps: 1e-12,
            average: false,
        }
    }
}

impl PoissonLoss {
    pub fn new(eps: f32, average: bool) -> Self {
        Self { eps, average }
    }

    /// Mean instead of sum over every element.
    pub fn averaged() -> Self {
        Self {
            average: true,
            ..Self::default()
        }
    }

    fn check(prediction: &Tensor, target: &Tensor) -> PureResult<()> {
        if prediction.shape() != target.shape() {
            return Err(TensorError::ShapeMismatch {
                left: prediction.shape(),
                right: target.shape(),
            });
        }
        Ok(())
    }

    fn normaliser(&self, len: usize) -> f32 {
        if self.average {
            1.0 / len as f32
        } else {
            1.0
        }
    }
}

impl Loss for PoissonLoss {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        Self::check(prediction, target)?;
        let sum: f32 = prediction
            .data()
            .iter()
            .zip(target.data())
            .map(|(rate, obs)| rate - obs * (rate + self.eps).ln())
            .sum();
        let value = sum * self.normaliser(prediction.len());
        if !value.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "poisson_loss",
                value,
            });
        }
        Tensor::from_vec(1, 1, vec![value])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        Self::check(prediction, target)?;
        let (rows, cols) = prediction.shape();
        let scale = self.normaliser(prediction.len());
        let data = prediction
            .data()
            .iter()
            .zip(target.data())
            .map(|(rate, obs)| scale * (1.0 - obs / (rate + self.eps)))
            .collect();
        Tensor::from_vec(rows, cols, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn minimum_sits_at_the_target() {
        let mut loss = PoissonLoss::default();
        let target = Tensor::from_vec(1, 3, vec![0.5, 2.0, 4.0]).unwrap();
        let grad = loss.backward(&target, &target).unwrap();
        assert!(grad.data().iter().all(|g| g.abs() < 1e-6));

        let low = Tensor::from_vec(1, 3, vec![0.25, 1.0, 2.0]).unwrap();
        let at = loss.forward(&target, &target).unwrap().data()[0];
        let below = loss.forward(&low, &target).unwrap().data()[0];
        assert!(below > at);
    }

    #[test]
    fn averaging_divides_value_and_gradient() {
        let prediction = Tensor::from_vec(2, 2, vec![1.0, 2.0, 0.5, 3.0]).unwrap();
        let target = Tensor::from_vec(2, 2, vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let summed = PoissonLoss::default().forward(&prediction, &target).unwrap();
        let mean = PoissonLoss::averaged().forward(&prediction, &target).unwrap();
        assert_abs_diff_eq!(mean.data()[0] * 4.0, summed.data()[0], epsilon = 1e-5);

        let g_sum = PoissonLoss::default().backward(&prediction, &target).unwrap();
        let g_mean = PoissonLoss::averaged().backward(&prediction, &target).unwrap();
        for (s, m) in g_sum.data().iter().zip(g_mean.data()) {
            assert_abs_diff_eq!(*s, m * 4.0, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(g_sum.data()[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn rejects_shape_mismatch() {
        let mut loss = PoissonLoss::default();
        let a = Tensor::zeros(1, 2).unwrap();
        let b = Tensor::zeros(2, 1).unwrap();
        assert!(loss.forward(&a, &b).is_err());
    }
}
