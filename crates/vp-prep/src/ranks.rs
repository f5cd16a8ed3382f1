// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor, TensorError};

/// Storage indices in chronological order. Ties keep their storage order.
pub fn trial_order<T: Ord>(timestamps: &[T]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..timestamps.len()).collect();
    order.sort_by(|&a, &b| timestamps[a].cmp(&timestamps[b]));
    order
}

/// Position in time of every stored trial, i.e. the inverse of [`trial_order`].
pub fn trial_ranks<T: Ord>(timestamps: &[T]) -> Vec<usize> {
    let order = trial_order(timestamps);
    let mut ranks = vec![0usize; order.len()];
    for (rank, &stored) in order.iter().enumerate() {
        ranks[stored] = rank;
    }
    ranks
}

/// Packs ranks into the `(trials, 1)` column the gain modulator reads as `rank_id`.
pub fn rank_tensor(ranks: &[usize]) -> PureResult<Tensor> {
    if ranks.is_empty() {
        return Err(TensorError::EmptyInput("rank_tensor"));
    }
    Tensor::from_vec(ranks.len(), 1, ranks.iter().map(|&r| r as f32).collect())
}
