// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Causal history-of-activity regressors.
//!
//! Activity is `(trials, neurons)` sorted by time. Only trials whose responses
//! are available during training (train and validation tiers) ever enter a
//! history window; test trials are skipped so their targets never leak into the
//! regressor of later trials.

use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialTier {
    Train,
    Validation,
    Test,
    FinalTest,
}

impl TrialTier {
    /// Whether the recorded response of this trial may feed later regressors.
    pub fn is_available(self) -> bool {
        matches!(self, TrialTier::Train | TrialTier::Validation)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrialTier::Train => "train",
            TrialTier::Validation => "validation",
            TrialTier::Test => "test",
            TrialTier::FinalTest => "final_test",
        }
    }
}

/// Numeric tier codes as stored next to the recordings (`0..=3`).
impl TryFrom<u8> for TrialTier {
    type Error = TensorError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(TrialTier::Train),
            1 => Ok(TrialTier::Validation),
            2 => Ok(TrialTier::Test),
            3 => Ok(TrialTier::FinalTest),
            other => Err(TensorError::IndexOutOfRange {
                label: "trial_tier",
                index: i64::from(other),
                len: 4,
            }),
        }
    }
}

impl FromStr for TrialTier {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(TrialTier::Train),
            "validation" => Ok(TrialTier::Validation),
            "test" => Ok(TrialTier::Test),
            "final_test" => Ok(TrialTier::FinalTest),
            _ => Err(TensorError::InvalidValue {
                label: "unknown trial tier",
            }),
        }
    }
}

fn check_tiers(activity: &Tensor, tiers: &[TrialTier]) -> PureResult<()> {
    let (trials, _) = activity.shape();
    if tiers.len() != trials {
        return Err(TensorError::DataLength {
            expected: trials,
            got: tiers.len(),
        });
    }
    Ok(())
}

/// Mean activity over the last `lag` available trials preceding each trial.
///
/// The window starts out filled with zeros and always divides by `lag`, so the
/// first trials see a diluted mean. Trial `i` is admitted to the window only
/// after its own row has been written.
pub fn recurrent_history(
    activity: &Tensor,
    tiers: &[TrialTier],
    lag: usize,
) -> PureResult<Tensor> {
    if lag == 0 {
        return Err(TensorError::InvalidValue {
            label: "history lag must be positive",
        });
    }
    check_tiers(activity, tiers)?;
    let (trials, neurons) = activity.shape();
    let mut window: VecDeque<usize> = VecDeque::with_capacity(lag + 1);
    let mut history = Tensor::zeros(trials, neurons)?;
    let scale = 1.0 / lag as f32;
    {
        let out = history.data_mut();
        for (trial, tier) in tiers.iter().enumerate() {
            let row = &mut out[trial * neurons..(trial + 1) * neurons];
            for &past in &window {
                for (acc, value) in row.iter_mut().zip(activity.row(past)?) {
                    *acc += value * scale;
                }
            }
            if tier.is_available() {
                window.push_back(trial);
                if window.len() > lag {
                    window.pop_front();
                }
            }
        }
    }
    debug!(trials, neurons, lag, "built recurrent history regressor");
    Ok(history)
}

/// Stacks one [`recurrent_history`] per lag into `(trials, neurons * lags.len())`
/// with column `n * lags.len() + l` holding lag `lags[l]` of neuron `n`.
pub fn history_lags(
    activity: &Tensor,
    tiers: &[TrialTier],
    lags: &[usize],
) -> PureResult<Tensor> {
    if lags.is_empty() {
        return Err(TensorError::EmptyInput("history_lags"));
    }
    let (trials, neurons) = activity.shape();
    let per_lag = lags
        .iter()
        .map(|&lag| recurrent_history(activity, tiers, lag))
        .collect::<PureResult<Vec<_>>>()?;
    let width = lags.len();
    Tensor::from_fn(trials, neurons * width, |trial, col| {
        let (neuron, lag) = (col / width, col % width);
        per_lag[lag].data()[trial * neurons + neuron]
    })
}

/// Moves time-sorted rows back to storage order: row `i` lands at `trial_id[i]`.
pub fn reorder_by_trial_id(sorted: &Tensor, trial_id: &[usize]) -> PureResult<Tensor> {
    let (trials, cols) = sorted.shape();
    if trial_id.len() != trials {
        return Err(TensorError::DataLength {
            expected: trials,
            got: trial_id.len(),
        });
    }
    let mut seen = vec![false; trials];
    for &id in trial_id {
        if id >= trials {
            return Err(TensorError::IndexOutOfRange {
                label: "trial_id",
                index: id as i64,
                len: trials,
            });
        }
        if std::mem::replace(&mut seen[id], true) {
            return Err(TensorError::InvalidValue {
                label: "trial_id must be a permutation",
            });
        }
    }
    let mut out = Tensor::zeros(trials, cols)?;
    {
        let data = out.data_mut();
        for (i, &id) in trial_id.iter().enumerate() {
            data[id * cols..(id + 1) * cols].copy_from_slice(sorted.row(i)?);
        }
    }
    Ok(out)
}
