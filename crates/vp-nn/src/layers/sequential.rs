// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter, Parameterized};
use crate::{PureResult, Tensor};

/// Sequential container that mirrors `nn.Sequential`.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl core::fmt::Debug for Sequential {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Sequential(num_layers={})", self.layers.len())
    }
}

impl Sequential {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Appends a new layer to the sequence.
    pub fn push<M>(&mut self, layer: M)
    where
        M: Module + 'static,
    {
        self.layers.push(Box::new(layer));
    }

    /// Builder-style variant of [`Sequential::push`].
    pub fn with<M>(mut self, layer: M) -> Self
    where
        M: Module + 'static,
    {
        self.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Parameterized for Sequential {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.layers
            .iter()
            .try_fold(input.clone(), |activation, layer| layer.forward(&activation))
    }

    /// Recomputes the stage inputs, then walks the stages in reverse.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let mut stage_inputs = Vec::with_capacity(self.layers.len());
        let mut activation = input.clone();
        for layer in &self.layers {
            let next = layer.forward(&activation)?;
            stage_inputs.push(activation);
            activation = next;
        }
        self.layers
            .iter_mut()
            .zip(&stage_inputs)
            .rev()
            .try_fold(grad_output.clone(), |grad, (layer, stage_input)| {
                layer.backward(stage_input, &grad)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Linear, Tanh};
    use approx::assert_abs_diff_eq;

    fn shifter_like() -> Sequential {
        Sequential::new()
            .with(Linear::new("l0", 2, 3, Some(1)).unwrap())
            .with(Tanh::default())
            .with(Linear::new("l1", 3, 2, Some(2)).unwrap())
            .with(Tanh::default())
    }

    #[test]
    fn empty_container_is_identity() {
        let mut seq = Sequential::new();
        let x = Tensor::from_vec(1, 2, vec![0.3, -0.7]).unwrap();
        assert!(seq.is_empty());
        assert_eq!(seq.forward(&x).unwrap(), x);
        assert_eq!(seq.backward(&x, &x).unwrap(), x);
    }

    #[test]
    fn input_gradient_matches_finite_differences() {
        let mut seq = shifter_like();
        assert_eq!(seq.len(), 4);
        let x = Tensor::from_vec(1, 2, vec![0.4, -0.2]).unwrap();
        // objective: sum of outputs
        let ones = Tensor::full(1, 2, 1.0).unwrap();
        let grad = seq.backward(&x, &ones).unwrap();
        let eps = 1e-3;
        for i in 0..2 {
            let mut plus = x.clone();
            plus.data_mut()[i] += eps;
            let mut minus = x.clone();
            minus.data_mut()[i] -= eps;
            let numeric =
                (seq.forward(&plus).unwrap().sum() - seq.forward(&minus).unwrap().sum()) / (2.0 * eps);
            assert_abs_diff_eq!(grad.data()[i], numeric, epsilon = 1e-3);
        }
        assert_eq!(seq.parameter_count().unwrap(), 2 * 3 + 3 + 3 * 2 + 2);
        assert!(seq.state_dict().unwrap().contains_key("l1::bias"));
    }
}
