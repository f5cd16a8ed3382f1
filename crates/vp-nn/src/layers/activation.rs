// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter, Parameterized};
use crate::{elu, elu_grad, PureResult, Tensor, TensorError};

fn ensure_same_shape(input: &Tensor, grad_output: &Tensor) -> PureResult<()> {
    if input.shape() != grad_output.shape() {
        return Err(TensorError::ShapeMismatch {
            left: input.shape(),
            right: grad_output.shape(),
        });
    }
    Ok(())
}

/// Firing-rate non-linearity `elu(x + offset) + 1`.
///
/// The range is `(0, ∞)` and `offset` shifts the rate floor. The layer is
/// stateless and therefore does not participate in parameter visits.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct EluPlusOne {
    offset: f32,
}

impl EluPlusOne {
    pub fn new(offset: f32) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> f32 {
        self.offset
    }
}

impl Parameterized for EluPlusOne {
    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

impl Module for EluPlusOne {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let offset = self.offset;
        Ok(input.map(|v| elu(v + offset) + 1.0))
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        ensure_same_shape(input, grad_output)?;
        let (rows, cols) = input.shape();
        let data = input
            .data()
            .iter()
            .zip(grad_output.data())
            .map(|(x, g)| elu_grad(x + self.offset) * g)
            .collect();
        Tensor::from_vec(rows, cols, data)
    }
}

/// Scaled hyperbolic tangent `tanh(slope · x)`.
#[derive(Debug, Clone, Copy)]
pub struct Tanh {
    slope: f32,
}

impl Default for Tanh {
    fn default() -> Self {
        Self { slope: 1.0 }
    }
}

impl Tanh {
    pub fn new(slope: f32) -> Self {
        Self { slope }
    }
}

impl Parameterized for Tanh {
    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

impl Module for Tanh {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let slope = self.slope;
        Ok(input.map(|v| (slope * v).tanh()))
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        ensure_same_shape(input, grad_output)?;
        let (rows, cols) = input.shape();
        let data = input
            .data()
            .iter()
            .zip(grad_output.data())
            .map(|(x, g)| {
                let activation = (self.slope * x).tanh();
                self.slope * (1.0 - activation * activation) * g
            })
            .collect();
        Tensor::from_vec(rows, cols, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elu_plus_one_maps_zero_to_one() {
        let layer = EluPlusOne::new(0.0);
        let input = Tensor::zeros(2, 3).unwrap();
        let output = layer.forward(&input).unwrap();
        assert!(output.data().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn elu_plus_one_is_positive_and_offset_shifts_floor() {
        let input = Tensor::from_vec(1, 4, vec![-8.0, -1.0, 0.0, 2.5]).unwrap();
        let plain = EluPlusOne::new(0.0).forward(&input).unwrap();
        assert!(plain.min_value() > 0.0);
        assert_eq!(plain.data()[3], 3.5);

        let shifted = EluPlusOne::new(1.0).forward(&input).unwrap();
        assert_eq!(shifted.data()[2], 2.0);
    }

    #[test]
    fn elu_plus_one_backward_uses_shifted_input() {
        let mut layer = EluPlusOne::new(-1.0);
        let input = Tensor::from_vec(1, 2, vec![0.5, 3.0]).unwrap();
        let grad = Tensor::from_vec(1, 2, vec![2.0, 2.0]).unwrap();
        let out = layer.backward(&input, &grad).unwrap();
        assert!((out.data()[0] - 2.0 * (-0.5f32).exp()).abs() < 1e-6);
        assert_eq!(out.data()[1], 2.0);
    }

    #[test]
    fn tanh_backward_respects_chain_rule() {
        let mut layer = Tanh::new(1.25);
        let input = Tensor::from_vec(1, 3, vec![-0.4, 0.0, 0.6]).unwrap();
        let grad_output = Tensor::from_vec(1, 3, vec![0.3, -0.1, 0.7]).unwrap();
        let grad_input = layer.backward(&input, &grad_output).unwrap();
        let expected: Vec<f32> = input
            .data()
            .iter()
            .zip(grad_output.data())
            .map(|(x, g)| {
                let activation = (1.25 * *x).tanh();
                1.25 * (1.0 - activation * activation) * g
            })
            .collect();
        assert_eq!(grad_input.data(), expected.as_slice());
    }
}
