// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Neural encoding models predicting per-neuron firing rates.
//!
//! A [`FiringRateEncoder`] chains a shared [`FeatureCore`], a keyed
//! [`Readout`], an optional keyed gaze [`Shifter`](shifter::Shifter) and an
//! optional keyed [`Modulator`], and guarantees strictly positive output.
//! Every stage carries an explicit backward pass so the whole graph trains
//! end-to-end with [`EncoderTrainer`].

pub mod config;
pub mod encoder;
pub mod feature_core;
pub mod io;
pub mod layers;
pub mod loss;
pub mod modulator;
pub mod module;
pub mod readout;
pub mod shifter;
pub mod trainer;

pub use config::{
    EncoderConfig, MissingInputPolicy, ModelConfig, ModelConfigError, ModulatorConfig,
    ReadoutConfig, ShifterConfig,
};
pub use encoder::{EncoderBatch, FiringRateEncoder, SessionSpec};
pub use feature_core::FeatureCore;
pub use io::{load, load_state_dict, save, save_state_dict, SnapshotFormat};
pub use layers::{EluPlusOne, Linear, Sequential, Tanh};
pub use loss::{Loss, PoissonLoss};
pub use modulator::{
    BehaviorGainModulator, CausalGainKernel, Conditioning, ConditioningMode,
    ConditioningRequirements, HistoryStateGainModulator, Modulator, Positivity,
};
pub use module::{Module, Parameter, Parameterized};
pub use readout::{MultiReadout, PointReadout, Readout, ReadoutGradients, Reduction};
pub use shifter::{MlpShifter, MultiShifter, Shifter};
pub use trainer::{EncoderTrainer, StepStats};

pub use vp_tensor::{elu, elu_grad, PureResult, Tensor, TensorError};
