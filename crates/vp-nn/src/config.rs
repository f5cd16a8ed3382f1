// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Serializable model configuration.
//!
//! Every struct deserializes with `#[serde(default)]`, so a layered config only
//! needs to name the fields it changes. The whole tree lives under the `model`
//! section of a [`LayeredConfig`].

use crate::modulator::ConditioningMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vp_config::{ConfigLayering, LayeredConfig, LayeredConfigError};

/// What the encoder does when a configured stage lacks one of its inputs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingInputPolicy {
    /// Raise [`crate::TensorError::MissingInput`].
    #[default]
    Fail,
    /// Substitute a neutral (zero) input and log the substitution.
    ZeroFill,
}

/// Encoder-level switches.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Shift applied inside `elu(x + elu_offset) + 1`.
    pub elu_offset: f32,
    pub mode: ConditioningMode,
    pub on_missing_input: MissingInputPolicy,
}

impl EncoderConfig {
    /// Behavior-only conditioning that raises on missing inputs.
    pub fn strict() -> Self {
        Self {
            elu_offset: 0.0,
            mode: ConditioningMode::BehaviorOnly,
            on_missing_input: MissingInputPolicy::Fail,
        }
    }

    /// History/state/gain conditioning that zero-fills missing inputs.
    pub fn lenient() -> Self {
        Self {
            elu_offset: 0.0,
            mode: ConditioningMode::HistoryStateGain,
            on_missing_input: MissingInputPolicy::ZeroFill,
        }
    }

    pub fn with_elu_offset(mut self, elu_offset: f32) -> Self {
        self.elu_offset = elu_offset;
        self
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::lenient()
    }
}

/// Toggles and penalties of [`crate::modulator::HistoryStateGainModulator`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulatorConfig {
    pub include_history: bool,
    pub nr_history: usize,
    pub behav_state: bool,
    pub nr_behav_state: usize,
    pub include_gain: bool,
    pub gain_kernel_std: f32,
    /// Weight of the squared successive-difference penalty on `own_gain`.
    pub diff_reg: f32,
    pub per_neuron_gain_adjust: bool,
    pub gain_adjust_alpha: f32,
    pub alpha_behav: f32,
    pub alpha_hist: f32,
}

impl Default for ModulatorConfig {
    fn default() -> Self {
        Self {
            include_history: true,
            nr_history: 5,
            behav_state: false,
            nr_behav_state: 10,
            include_gain: false,
            gain_kernel_std: 30.0,
            diff_reg: 1000.0,
            per_neuron_gain_adjust: false,
            gain_adjust_alpha: 0.0,
            alpha_behav: 0.0,
            alpha_hist: 0.0,
        }
    }
}

impl ModulatorConfig {
    /// Every term disabled; enable the ones a test or experiment needs.
    pub fn disabled() -> Self {
        Self {
            include_history: false,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShifterConfig {
    pub hidden_channels: usize,
    pub layers: usize,
    pub gamma_shifter: f32,
    /// Concatenate `trial_idx` to the gaze input.
    pub use_trial_idx: bool,
}

impl Default for ShifterConfig {
    fn default() -> Self {
        Self {
            hidden_channels: 5,
            layers: 3,
            gamma_shifter: 0.0,
            use_trial_idx: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadoutConfig {
    /// Initial readout positions are drawn from `±init_mu_range`.
    pub init_mu_range: f32,
    pub gamma_readout: f32,
}

impl Default for ReadoutConfig {
    fn default() -> Self {
        Self {
            init_mu_range: 0.3,
            gamma_readout: 0.0076,
        }
    }
}

/// Complete model description loaded from the `model` section.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub encoder: EncoderConfig,
    pub readout: ReadoutConfig,
    pub shifter: Option<ShifterConfig>,
    pub modulator: Option<ModulatorConfig>,
    /// Explicit initialisation seed; falls back to the determinism config.
    pub seed: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ModelConfigError {
    #[error(transparent)]
    Layered(#[from] LayeredConfigError),
    #[error("failed to decode the model section: {0}")]
    Section(#[from] serde_json::Error),
    #[error("invalid model configuration: {0}")]
    Invalid(String),
}

impl ModelConfig {
    pub const SECTION: &'static str = "model";

    /// Loads the environment-discovered layers and decodes the `model` section.
    pub fn discover() -> Result<Self, ModelConfigError> {
        let layered = LayeredConfig::load(ConfigLayering::discover())?;
        Self::from_layered(&layered)
    }

    /// Decodes the `model` section, falling back to defaults when it is absent.
    pub fn from_layered(layered: &LayeredConfig) -> Result<Self, ModelConfigError> {
        let config: ModelConfig = layered.section(&[Self::SECTION])?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ModelConfigError> {
        if let Some(modulator) = &self.modulator {
            if modulator.include_history && modulator.nr_history == 0 {
                return Err(ModelConfigError::Invalid(
                    "nr_history must be positive when include_history is set".into(),
                ));
            }
            if modulator.behav_state && modulator.nr_behav_state == 0 {
                return Err(ModelConfigError::Invalid(
                    "nr_behav_state must be positive when behav_state is set".into(),
                ));
            }
            if modulator.include_gain && !(modulator.gain_kernel_std > 0.0) {
                return Err(ModelConfigError::Invalid(
                    "gain_kernel_std must be positive".into(),
                ));
            }
            if self.encoder.mode != ConditioningMode::HistoryStateGain {
                return Err(ModelConfigError::Invalid(format!(
                    "history/state/gain modulator requires mode {}, got {}",
                    ConditioningMode::HistoryStateGain.as_str(),
                    self.encoder.mode.as_str()
                )));
            }
        }
        if let Some(shifter) = &self.shifter {
            if shifter.layers == 0 {
                return Err(ModelConfigError::Invalid(
                    "shifter needs at least one layer".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_modulator_constructor() {
        let config = ModulatorConfig::default();
        assert!(config.include_history && !config.include_gain);
        assert_eq!(config.nr_history, 5);
        assert_eq!(config.diff_reg, 1000.0);
        assert_eq!(config.gain_kernel_std, 30.0);
    }

    #[test]
    fn section_fills_missing_fields_with_defaults() {
        let layered = LayeredConfig::from_value(json!({
            "model": {
                "encoder": { "elu_offset": -1.0, "on_missing_input": "zero_fill" },
                "modulator": { "include_gain": true, "diff_reg": 10.0 }
            }
        }));
        let config = ModelConfig::from_layered(&layered).unwrap();
        assert_eq!(config.encoder.elu_offset, -1.0);
        assert_eq!(config.encoder.mode, ConditioningMode::HistoryStateGain);
        assert_eq!(
            config.encoder.on_missing_input,
            MissingInputPolicy::ZeroFill
        );
        let modulator = config.modulator.unwrap();
        assert!(modulator.include_gain && modulator.include_history);
        assert_eq!(modulator.diff_reg, 10.0);
        assert!(config.shifter.is_none());
    }

    #[test]
    fn rejects_modulator_in_behavior_mode() {
        let layered = LayeredConfig::from_value(json!({
            "model": {
                "encoder": { "mode": "behavior_only" },
                "modulator": {}
            }
        }));
        assert!(matches!(
            ModelConfig::from_layered(&layered),
            Err(ModelConfigError::Invalid(_))
        ));
    }

    #[test]
    fn missing_section_yields_defaults() {
        let layered = LayeredConfig::from_value(json!({ "other": 1 }));
        assert_eq!(
            ModelConfig::from_layered(&layered).unwrap(),
            ModelConfig::default()
        );
    }
}
