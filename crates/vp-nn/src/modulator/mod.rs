// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Post-readout modulation stages.
//!
//! A modulator receives the readout activations `(batch, neurons)` together
//! with whatever side channels its [`ConditioningMode`] consumes and returns an
//! adjusted activation of the same shape. Every modulator declares whether its
//! output is already strictly positive through [`Positivity`]; the encoder
//! closes `Unbounded` modulators with `elu(x + offset) + 1`.

pub mod behavior;
pub mod history_state_gain;
pub mod kernel;

pub use behavior::BehaviorGainModulator;
pub use history_state_gain::HistoryStateGainModulator;
pub use kernel::{CausalGainKernel, GAIN_KERNEL_TAPS};

use crate::module::Parameterized;
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};

/// Which side channels a modulation stage consumes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditioningMode {
    /// `modulator(x, behavior)`.
    BehaviorOnly,
    /// `modulator(x, history, state, rank_id)`.
    #[default]
    HistoryStateGain,
}

impl ConditioningMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditioningMode::BehaviorOnly => "behavior_only",
            ConditioningMode::HistoryStateGain => "history_state_gain",
        }
    }
}

/// Output range a modulator promises.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Positivity {
    /// Every output element is `> 0`; nothing else runs after the modulator.
    Guaranteed,
    /// The encoder applies its own positivity transform afterwards.
    Unbounded,
}

/// Side channels handed to a modulator. Absent channels are `None`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Conditioning<'a> {
    pub behavior: Option<&'a Tensor>,
    /// `(batch, neurons * lags)`, neuron-major.
    pub history: Option<&'a Tensor>,
    pub state: Option<&'a Tensor>,
    /// `(batch, 1)` integral trial ranks.
    pub rank_id: Option<&'a Tensor>,
}

/// Inputs a modulator consumes given its enabled terms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConditioningRequirements {
    pub behavior: bool,
    pub history: bool,
    pub state: bool,
    pub rank_id: bool,
}

impl ConditioningRequirements {
    /// First required channel missing from `conditioning`.
    pub fn first_missing(&self, conditioning: &Conditioning<'_>) -> Option<&'static str> {
        [
            (self.behavior, conditioning.behavior.is_some(), "behavior"),
            (self.history, conditioning.history.is_some(), "history"),
            (self.state, conditioning.state.is_some(), "state"),
            (self.rank_id, conditioning.rank_id.is_some(), "rank_id"),
        ]
        .into_iter()
        .find(|(required, present, _)| *required && !*present)
        .map(|(_, _, label)| label)
    }
}

/// Differentiable post-readout stage for one data key.
pub trait Modulator: Parameterized {
    fn mode(&self) -> ConditioningMode;

    fn positivity(&self) -> Positivity;

    fn requirements(&self) -> ConditioningRequirements;

    /// Width of the behavior vector when the modulator consumes one.
    fn behavior_dims(&self) -> Option<usize> {
        None
    }

    fn forward(&self, x: &Tensor, conditioning: &Conditioning<'_>) -> PureResult<Tensor>;

    /// Accumulates parameter gradients and returns `∂L/∂x`.
    fn backward(
        &mut self,
        x: &Tensor,
        conditioning: &Conditioning<'_>,
        grad_output: &Tensor,
    ) -> PureResult<Tensor>;

    fn regularizer(&self) -> PureResult<f32>;

    /// Accumulates `weight · ∂regularizer/∂θ`.
    fn backward_regularizer(&mut self, weight: f32) -> PureResult<()>;
}

pub(crate) fn ensure_shape(
    label: &'static str,
    tensor: &Tensor,
    rows: usize,
    cols: usize,
) -> PureResult<()> {
    if tensor.shape() != (rows, cols) {
        tracing::debug!(label, got = ?tensor.shape(), "conditioning tensor has the wrong shape");
        return Err(TensorError::ShapeMismatch {
            left: tensor.shape(),
            right: (rows, cols),
        });
    }
    Ok(())
}

/// Accumulates `scale · sign(w)` into `param`, the gradient of `scale · Σ|w|`.
pub(crate) fn accumulate_l1(param: &mut crate::module::Parameter, scale: f32) -> PureResult<()> {
    let grad = param.value().map(|w| {
        if w > 0.0 {
            scale
        } else if w < 0.0 {
            -scale
        } else {
            0.0
        }
    });
    param.accumulate_euclidean(&grad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_first_missing_channel() {
        let requirements = ConditioningRequirements {
            history: true,
            rank_id: true,
            ..Default::default()
        };
        let history = Tensor::zeros(1, 2).unwrap();
        let conditioning = Conditioning {
            history: Some(&history),
            ..Default::default()
        };
        assert_eq!(requirements.first_missing(&conditioning), Some("rank_id"));
        assert_eq!(
            ConditioningRequirements::default().first_missing(&Conditioning::default()),
            None
        );
    }
}
