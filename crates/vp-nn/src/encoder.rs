// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Firing-rate encoder: core → readout (optionally shifted) → modulator →
//! positive firing rate.
//!
//! One encoder type covers both conditioning profiles. The
//! [`ConditioningMode`] fixes which side channels the modulators receive and
//! the [`MissingInputPolicy`] decides whether an absent input raises or is
//! replaced by a neutral value.

use crate::config::{EncoderConfig, MissingInputPolicy, ModelConfig};
use crate::feature_core::FeatureCore;
use crate::layers::EluPlusOne;
use crate::modulator::{
    Conditioning, ConditioningMode, HistoryStateGainModulator, Modulator, Positivity,
};
use crate::module::{Module, Parameter, Parameterized};
use crate::readout::{MultiReadout, Readout, Reduction};
use crate::shifter::MultiShifter;
use crate::{PureResult, Tensor, TensorError};
use std::collections::BTreeMap;
use tracing::debug;

/// One batch of encoder inputs. Only `inputs` is mandatory.
#[derive(Clone, Debug)]
pub struct EncoderBatch {
    /// `(batch, channels*height*width)` stimulus.
    pub inputs: Tensor,
    pub targets: Option<Tensor>,
    pub behavior: Option<Tensor>,
    pub pupil_center: Option<Tensor>,
    pub trial_idx: Option<Tensor>,
    /// Explicit readout shift, used when no shifter is configured.
    pub shift: Option<Tensor>,
    pub history: Option<Tensor>,
    pub state: Option<Tensor>,
    pub rank_id: Option<Tensor>,
    /// Stop the backward pass before the core.
    pub detach_core: bool,
}

impl EncoderBatch {
    pub fn new(inputs: Tensor) -> Self {
        Self {
            inputs,
            targets: None,
            behavior: None,
            pupil_center: None,
            trial_idx: None,
            shift: None,
            history: None,
            state: None,
            rank_id: None,
            detach_core: false,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.inputs.shape().0
    }

    pub fn with_targets(mut self, targets: Tensor) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn with_behavior(mut self, behavior: Tensor) -> Self {
        self.behavior = Some(behavior);
        self
    }

    pub fn with_pupil_center(mut self, pupil_center: Tensor) -> Self {
        self.pupil_center = Some(pupil_center);
        self
    }

    pub fn with_trial_idx(mut self, trial_idx: Tensor) -> Self {
        self.trial_idx = Some(trial_idx);
        self
    }

    pub fn with_shift(mut self, shift: Tensor) -> Self {
        self.shift = Some(shift);
        self
    }

    pub fn with_history(mut self, history: Tensor) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_state(mut self, state: Tensor) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_rank_id(mut self, rank_id: Tensor) -> Self {
        self.rank_id = Some(rank_id);
        self
    }

    pub fn detach_core(mut self, detach: bool) -> Self {
        self.detach_core = detach;
        self
    }
}

/// Dataset description used by [`FiringRateEncoder::from_config`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSpec {
    pub data_key: String,
    pub neurons: usize,
    /// Total trial count, sizing the modulator's trial gain.
    pub nr_trials: usize,
}

impl SessionSpec {
    pub fn new(data_key: impl Into<String>, neurons: usize, nr_trials: usize) -> Self {
        Self {
            data_key: data_key.into(),
            neurons,
            nr_trials,
        }
    }
}

/// Activations of one forward pass, kept for the backward pass.
struct Pass {
    features: Tensor,
    shift: Option<Tensor>,
    /// The shift was computed by the shifter from `pupil_center`.
    shifted_by_gaze: bool,
    readout: Tensor,
    /// Zero behavior substituted for a missing one.
    behavior_fill: Option<Tensor>,
    /// Modulator output before the encoder's own positivity transform.
    modulated: Option<Tensor>,
    output: Tensor,
}

/// Core, keyed readout, optional keyed shifter and keyed modulators.
pub struct FiringRateEncoder<C, R> {
    core: C,
    readout: R,
    shifter: Option<MultiShifter>,
    modulators: BTreeMap<String, Box<dyn Modulator>>,
    positivity: EluPlusOne,
    config: EncoderConfig,
}

impl<C, R> core::fmt::Debug for FiringRateEncoder<C, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FiringRateEncoder")
            .field("config", &self.config)
            .field("shifter", &self.shifter)
            .field("modulators", &self.modulators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<C: FeatureCore, R: Readout> FiringRateEncoder<C, R> {
    pub fn new(core: C, readout: R, config: EncoderConfig) -> Self {
        Self {
            core,
            readout,
            shifter: None,
            modulators: BTreeMap::new(),
            positivity: EluPlusOne::new(config.elu_offset),
            config,
        }
    }

    pub fn with_shifter(mut self, shifter: MultiShifter) -> Self {
        self.shifter = Some(shifter);
        self
    }

    pub fn with_modulator<M>(mut self, data_key: impl Into<String>, modulator: M) -> PureResult<Self>
    where
        M: Modulator + 'static,
    {
        self.insert_modulator(data_key, modulator)?;
        Ok(self)
    }

    /// Registers `modulator` for `data_key`; its mode must match the encoder's.
    pub fn insert_modulator<M>(&mut self, data_key: impl Into<String>, modulator: M) -> PureResult<()>
    where
        M: Modulator + 'static,
    {
        if modulator.mode() != self.config.mode {
            return Err(TensorError::ModeMismatch {
                expected: self.config.mode.as_str(),
                got: modulator.mode().as_str(),
            });
        }
        self.modulators.insert(data_key.into(), Box::new(modulator));
        Ok(())
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn mode(&self) -> ConditioningMode {
        self.config.mode
    }

    pub fn core(&self) -> &C {
        &self.core
    }

    pub fn readout(&self) -> &R {
        &self.readout
    }

    pub fn shifter(&self) -> Option<&MultiShifter> {
        self.shifter.as_ref()
    }

    pub fn modulator(&self, data_key: &str) -> Option<&dyn Modulator> {
        self.modulators.get(data_key).map(|m| m.as_ref())
    }

    fn unknown(data_key: &str) -> TensorError {
        TensorError::UnknownDataKey {
            key: data_key.to_string(),
        }
    }

    fn has_modulator(&self) -> bool {
        !self.modulators.is_empty()
    }

    fn resolve_shift(
        &self,
        data_key: &str,
        batch: &EncoderBatch,
    ) -> PureResult<(Option<Tensor>, bool)> {
        let Some(shifters) = &self.shifter else {
            return Ok((batch.shift.clone(), false));
        };
        let shifter = shifters.get(data_key).ok_or_else(|| Self::unknown(data_key))?;
        match &batch.pupil_center {
            Some(pupil_center) => Ok((
                Some(shifter.forward(pupil_center, batch.trial_idx.as_ref())?),
                true,
            )),
            None => match self.config.on_missing_input {
                MissingInputPolicy::Fail => Err(TensorError::MissingInput {
                    label: "pupil_center",
                }),
                MissingInputPolicy::ZeroFill => {
                    debug!(data_key, "pupil_center missing; using a zero shift");
                    Ok((Some(Tensor::zeros(1, 2)?), false))
                }
            },
        }
    }

    /// Checks the modulator's required inputs and zero-fills behavior if allowed.
    fn behavior_fill(
        &self,
        data_key: &str,
        modulator: &dyn Modulator,
        batch: &EncoderBatch,
    ) -> PureResult<Option<Tensor>> {
        let conditioning = self.conditioning(batch, None);
        let Some(label) = modulator.requirements().first_missing(&conditioning) else {
            return Ok(None);
        };
        match self.config.on_missing_input {
            MissingInputPolicy::Fail => Err(TensorError::MissingInput { label }),
            MissingInputPolicy::ZeroFill => {
                debug!(data_key, input = label, "conditioning input missing; substituting zeros");
                match (conditioning.behavior, modulator.behavior_dims()) {
                    (None, Some(dims)) => Ok(Some(Tensor::zeros(batch.batch_size(), dims)?)),
                    _ => Ok(None),
                }
            }
        }
    }

    /// Side channels routed to the modulator under the encoder's mode.
    fn conditioning<'a>(
        &self,
        batch: &'a EncoderBatch,
        behavior_fill: Option<&'a Tensor>,
    ) -> Conditioning<'a> {
        match self.config.mode {
            ConditioningMode::BehaviorOnly => Conditioning {
                behavior: batch.behavior.as_ref().or(behavior_fill),
                ..Default::default()
            },
            ConditioningMode::HistoryStateGain => Conditioning {
                behavior: None,
                history: batch.history.as_ref(),
                state: batch.state.as_ref(),
                rank_id: batch.rank_id.as_ref(),
            },
        }
    }

    fn run(&self, data_key: &str, batch: &EncoderBatch) -> PureResult<Pass> {
        let features = self.core.forward(&batch.inputs)?;
        let (shift, shifted_by_gaze) = self.resolve_shift(data_key, batch)?;
        let readout = self.readout.forward(&features, data_key, shift.as_ref())?;

        let (behavior_fill, modulated, output) = if self.has_modulator() {
            let modulator = self.modulator(data_key).ok_or_else(|| Self::unknown(data_key))?;
            let behavior_fill = self.behavior_fill(data_key, modulator, batch)?;
            let conditioning = self.conditioning(batch, behavior_fill.as_ref());
            let modulated = modulator.forward(&readout, &conditioning)?;
            match modulator.positivity() {
                Positivity::Guaranteed => (behavior_fill, None, modulated),
                Positivity::Unbounded => {
                    let output = self.positivity.forward(&modulated)?;
                    (behavior_fill, Some(modulated), output)
                }
            }
        } else {
            (None, None, self.positivity.forward(&readout)?)
        };

        Ok(Pass {
            features,
            shift,
            shifted_by_gaze,
            readout,
            behavior_fill,
            modulated,
            output,
        })
    }

    /// Predicted firing rates `(batch, neurons(data_key))`, every element `> 0`.
    pub fn forward(&self, data_key: &str, batch: &EncoderBatch) -> PureResult<Tensor> {
        Ok(self.run(data_key, batch)?.output)
    }

    /// Backpropagates `grad_output` (`∂L/∂output`) into every stage's
    /// accumulators. The core is skipped when `batch.detach_core` is set.
    pub fn backward(
        &mut self,
        data_key: &str,
        batch: &EncoderBatch,
        grad_output: &Tensor,
    ) -> PureResult<()> {
        let pass = self.run(data_key, batch)?;
        if grad_output.shape() != pass.output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: pass.output.shape(),
            });
        }
        let mut positivity = self.positivity;
        let conditioning = self.conditioning(batch, pass.behavior_fill.as_ref());

        let grad_readout = match self.modulators.get_mut(data_key) {
            Some(modulator) => {
                let grad_modulated = match &pass.modulated {
                    Some(modulated) => positivity.backward(modulated, grad_output)?,
                    None => grad_output.clone(),
                };
                modulator.backward(&pass.readout, &conditioning, &grad_modulated)?
            }
            None => positivity.backward(&pass.readout, grad_output)?,
        };

        let grads = self.readout.backward(
            &pass.features,
            data_key,
            pass.shift.as_ref(),
            &grad_readout,
        )?;

        if let (true, Some(grad_shift), Some(pupil_center)) = (
            pass.shifted_by_gaze,
            grads.shift.as_ref(),
            batch.pupil_center.as_ref(),
        ) {
            if let Some(shifter) = self.shifter.as_mut().and_then(|s| s.get_mut(data_key)) {
                shifter.backward(pupil_center, batch.trial_idx.as_ref(), grad_shift)?;
            }
        }

        if !batch.detach_core {
            self.core.backward(&batch.inputs, &grads.features)?;
        }
        Ok(())
    }

    /// Sum of the core, readout, shifter and modulator penalties for `data_key`.
    ///
    /// `detach_core` only affects [`FiringRateEncoder::backward_regularizer`]; the
    /// core penalty still counts towards the value.
    pub fn regularizer(
        &self,
        data_key: &str,
        reduction: Reduction,
        average: Option<bool>,
        _detach_core: bool,
    ) -> PureResult<f32> {
        let mut total = self.core.regularizer()?;
        total += self.readout.regularizer(data_key, reduction, average)?;
        if let Some(shifter) = &self.shifter {
            total += shifter.regularizer(data_key)?;
        }
        if self.has_modulator() {
            total += self
                .modulator(data_key)
                .ok_or_else(|| Self::unknown(data_key))?
                .regularizer()?;
        }
        Ok(total)
    }

    /// Accumulates `weight · ∂regularizer/∂θ` into every stage for `data_key`.
    pub fn backward_regularizer(
        &mut self,
        data_key: &str,
        reduction: Reduction,
        average: Option<bool>,
        detach_core: bool,
        weight: f32,
    ) -> PureResult<()> {
        if !detach_core {
            self.core.backward_regularizer(weight)?;
        }
        self.readout
            .backward_regularizer(data_key, reduction, average, weight)?;
        if let Some(shifter) = &mut self.shifter {
            shifter.backward_regularizer(data_key, weight)?;
        }
        if !self.modulators.is_empty() {
            self.modulators
                .get_mut(data_key)
                .ok_or_else(|| Self::unknown(data_key))?
                .backward_regularizer(weight)?;
        }
        Ok(())
    }
}

impl<C: FeatureCore> FiringRateEncoder<C, MultiReadout> {
    /// Assembles readouts, shifters and history/state/gain modulators for
    /// `sessions` from a [`ModelConfig`]. `feature_shape` is the core's output
    /// `(channels, height, width)`.
    pub fn from_config(
        core: C,
        feature_shape: (usize, usize, usize),
        sessions: &[SessionSpec],
        config: &ModelConfig,
    ) -> PureResult<Self> {
        let seed = config.seed;
        let readout = MultiReadout::build(
            feature_shape,
            sessions.iter().map(|s| (s.data_key.as_str(), s.neurons)),
            &config.readout,
            seed,
        )?;
        let mut encoder = Self::new(core, readout, config.encoder);
        if let Some(shifter) = &config.shifter {
            encoder.shifter = Some(MultiShifter::build(
                sessions.iter().map(|s| s.data_key.as_str()),
                shifter,
                seed,
            )?);
        }
        if let Some(modulator) = &config.modulator {
            for session in sessions {
                let module = HistoryStateGainModulator::new(
                    &format!("modulator::{}", session.data_key),
                    session.neurons,
                    session.nr_trials,
                    modulator,
                    seed,
                )?;
                encoder.insert_modulator(session.data_key.clone(), module)?;
            }
        }
        debug!(
            sessions = sessions.len(),
            shifter = encoder.shifter.is_some(),
            modulator = encoder.has_modulator(),
            "encoder assembled from config"
        );
        Ok(encoder)
    }
}

impl<C: FeatureCore, R: Readout> Parameterized for FiringRateEncoder<C, R> {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.core.visit_parameters(visitor)?;
        self.readout.visit_parameters(visitor)?;
        if let Some(shifter) = &self.shifter {
            shifter.visit_parameters(visitor)?;
        }
        for modulator in self.modulators.values() {
            modulator.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.core.visit_parameters_mut(visitor)?;
        self.readout.visit_parameters_mut(visitor)?;
        if let Some(shifter) = &mut self.shifter {
            shifter.visit_parameters_mut(visitor)?;
        }
        for modulator in self.modulators.values_mut() {
            modulator.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}
