// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Shared feature extractor ("core") seam.
//!
//! Cores map flattened stimulus batches `(batch, channels*height*width)` to
//! flattened feature maps. Their internal architecture is up to the caller;
//! the encoder only needs the differentiable forward/backward pair and a
//! penalty.

use crate::layers::{Linear, Sequential};
use crate::module::Module;
use crate::PureResult;

/// Feature extractor shared across data keys.
pub trait FeatureCore: Module {
    /// Penalty added to the training loss. Defaults to zero.
    fn regularizer(&self) -> PureResult<f32> {
        Ok(0.0)
    }

    /// Accumulates `weight · ∂regularizer/∂θ` into the core's parameters.
    fn backward_regularizer(&mut self, _weight: f32) -> PureResult<()> {
        Ok(())
    }
}

impl FeatureCore for Sequential {}

impl FeatureCore for Linear {}
