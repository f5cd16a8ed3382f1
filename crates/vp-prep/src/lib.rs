// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Deterministic helpers that turn recorded sessions into the side inputs the
//! modulator consumes: temporal trial ranks (`rank_id`) and causal
//! history-of-activity regressors (`history`).

pub mod history;
pub mod ranks;

pub use history::{history_lags, recurrent_history, reorder_by_trial_id, TrialTier};
pub use ranks::{rank_tensor, trial_order, trial_ranks};
pub use vp_tensor::{PureResult, Tensor, TensorError};
