// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, TensorError};

/// Number of taps of the trial-gain smoothing kernel.
pub const GAIN_KERNEL_TAPS: usize = 201;

const CENTER: usize = GAIN_KERNEL_TAPS / 2;

/// Half-Gaussian kernel smoothing one-hot trial ranks along the trial axis.
///
/// Taps `0..CENTER` are zero, so when applied as a same-padded
/// cross-correlation a rank `r` only reaches trial slots `r-CENTER..=r`. The
/// taps are fixed at construction and never touched afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct CausalGainKernel {
    taps: Vec<f32>,
    std: f32,
}

impl CausalGainKernel {
    pub fn new(std: f32) -> PureResult<Self> {
        if !(std.is_finite() && std > 0.0) {
            return Err(TensorError::NonFiniteValue {
                label: "gain_kernel_std",
                value: std,
            });
        }
        let mut taps: Vec<f32> = (0..GAIN_KERNEL_TAPS)
            .map(|n| {
                if n < CENTER {
                    0.0
                } else {
                    let z = (n as f32 - CENTER as f32) / std;
                    (-0.5 * z * z).exp()
                }
            })
            .collect();
        let total: f32 = taps.iter().sum();
        for tap in &mut taps {
            *tap /= total;
        }
        Ok(Self { taps, std })
    }

    pub fn taps(&self) -> &[f32] {
        &self.taps
    }

    pub fn std(&self) -> f32 {
        self.std
    }

    /// Same-padded cross-correlation of `signal` with the kernel.
    pub fn smooth(&self, signal: &[f32]) -> Vec<f32> {
        let len = signal.len() as isize;
        (0..len)
            .map(|i| {
                let mut acc = 0.0f32;
                for (k, &w) in self.taps.iter().enumerate().skip(CENTER) {
                    let j = i + k as isize - CENTER as isize;
                    if j >= len {
                        break;
                    }
                    acc += w * signal[j as usize];
                }
                acc
            })
            .collect()
    }

    /// Smoothed one-hot of `rank` over `nr_trials` slots as `(slot, weight)` pairs.
    ///
    /// Equivalent to `smooth(one_hot(rank))` restricted to its non-zero support.
    pub fn one_hot_support(&self, rank: usize, nr_trials: usize) -> Vec<(usize, f32)> {
        let first = rank.saturating_sub(CENTER);
        (first..=rank.min(nr_trials.saturating_sub(1)))
            .map(|slot| (slot, self.taps[rank - slot + CENTER]))
            .collect()
    }
}
