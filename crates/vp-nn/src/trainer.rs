// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::encoder::{EncoderBatch, FiringRateEncoder};
use crate::feature_core::FeatureCore;
use crate::loss::Loss;
use crate::module::Parameterized;
use crate::readout::{Readout, Reduction};
use crate::{PureResult, Tensor};
use tracing::debug;

/// Values reported by one optimisation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    pub loss: f32,
    pub regularizer: f32,
}

impl StepStats {
    pub fn total(&self) -> f32 {
        self.loss + self.regularizer
    }
}

/// Plain SGD over `loss + regularizer_weight · regularizer`.
#[derive(Debug, Clone, Copy)]
pub struct EncoderTrainer {
    learning_rate: f32,
    reduction: Reduction,
    average: Option<bool>,
    detach_core: bool,
    regularizer_weight: f32,
}

impl EncoderTrainer {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            reduction: Reduction::Sum,
            average: None,
            detach_core: false,
            regularizer_weight: 1.0,
        }
    }

    pub fn with_reduction(mut self, reduction: Reduction, average: Option<bool>) -> Self {
        self.reduction = reduction;
        self.average = average;
        self
    }

    /// Freezes the core: neither the loss nor its penalty reach its parameters.
    pub fn with_detached_core(mut self, detach_core: bool) -> Self {
        self.detach_core = detach_core;
        self
    }

    pub fn with_regularizer_weight(mut self, weight: f32) -> Self {
        self.regularizer_weight = weight;
        self
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Clears accumulated gradients.
    pub fn zero<C: FeatureCore, R: Readout>(
        &self,
        encoder: &mut FiringRateEncoder<C, R>,
    ) -> PureResult<()> {
        encoder.zero_accumulators()
    }

    /// Loss and penalty for `batch` without touching any parameter.
    pub fn evaluate<C: FeatureCore, R: Readout, L: Loss>(
        &self,
        encoder: &FiringRateEncoder<C, R>,
        data_key: &str,
        batch: &EncoderBatch,
        targets: &Tensor,
        loss: &mut L,
    ) -> PureResult<StepStats> {
        let prediction = encoder.forward(data_key, batch)?;
        let value = loss.forward(&prediction, targets)?.data()[0];
        let regularizer = encoder.regularizer(
            data_key,
            self.reduction,
            self.average,
            self.detach_core,
        )?;
        Ok(StepStats {
            loss: value,
            regularizer: self.regularizer_weight * regularizer,
        })
    }

    /// One forward/backward/update cycle on `batch`.
    pub fn step<C: FeatureCore, R: Readout, L: Loss>(
        &self,
        encoder: &mut FiringRateEncoder<C, R>,
        data_key: &str,
        batch: &EncoderBatch,
        targets: &Tensor,
        loss: &mut L,
    ) -> PureResult<StepStats> {
        self.zero(encoder)?;
        let batch_view;
        let batch = if batch.detach_core == self.detach_core {
            batch
        } else {
            batch_view = batch.clone().detach_core(self.detach_core);
            &batch_view
        };

        let prediction = encoder.forward(data_key, batch)?;
        let value = loss.forward(&prediction, targets)?.data()[0];
        let grad = loss.backward(&prediction, targets)?;
        encoder.backward(data_key, batch, &grad)?;

        let regularizer = encoder.regularizer(
            data_key,
            self.reduction,
            self.average,
            self.detach_core,
        )?;
        encoder.backward_regularizer(
            data_key,
            self.reduction,
            self.average,
            self.detach_core,
            self.regularizer_weight,
        )?;
        encoder.apply_step(self.learning_rate)?;

        let stats = StepStats {
            loss: value,
            regularizer: self.regularizer_weight * regularizer,
        };
        debug!(
            data_key,
            loss = stats.loss,
            regularizer = stats.regularizer,
            "encoder step"
        );
        Ok(stats)
    }
}
