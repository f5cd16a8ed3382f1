// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-dataset readouts from a shared feature map to per-neuron activations.

use crate::config::ReadoutConfig;
use crate::module::{Parameter, Parameterized};
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// How a per-element penalty collapses into a scalar.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    #[default]
    Sum,
    Mean,
}

impl Reduction {
    /// Applies the legacy `average` flag, which wins over `self` when set.
    pub fn resolve(self, average: Option<bool>) -> Reduction {
        match average {
            Some(average) => {
                warn!(average, "`average` is deprecated; pass a reduction instead");
                if average {
                    Reduction::Mean
                } else {
                    Reduction::Sum
                }
            }
            None => self,
        }
    }

    /// Factor mapping a sum over `count` elements onto this reduction.
    pub fn factor(self, count: usize) -> f32 {
        match self {
            Reduction::Sum => 1.0,
            Reduction::Mean => 1.0 / count.max(1) as f32,
        }
    }
}

/// Gradients produced by a readout backward pass.
#[derive(Clone, Debug)]
pub struct ReadoutGradients {
    pub features: Tensor,
    /// Present whenever a shift was supplied; shaped like that shift.
    pub shift: Option<Tensor>,
}

/// Keyed readout consumed by the encoder.
pub trait Readout: Parameterized {
    /// Number of neurons read out for `data_key`.
    fn neurons(&self, data_key: &str) -> PureResult<usize>;

    /// Maps `(batch, features)` to `(batch, neurons)`. `shift` is `(batch, 2)`
    /// or a broadcast `(1, 2)` offset of the sampling location.
    fn forward(&self, features: &Tensor, data_key: &str, shift: Option<&Tensor>)
        -> PureResult<Tensor>;

    fn backward(
        &mut self,
        features: &Tensor,
        data_key: &str,
        shift: Option<&Tensor>,
        grad_output: &Tensor,
    ) -> PureResult<ReadoutGradients>;

    fn regularizer(
        &self,
        data_key: &str,
        reduction: Reduction,
        average: Option<bool>,
    ) -> PureResult<f32>;

    /// Accumulates `weight · ∂regularizer/∂θ` for `data_key`.
    fn backward_regularizer(
        &mut self,
        data_key: &str,
        reduction: Reduction,
        average: Option<bool>,
        weight: f32,
    ) -> PureResult<()>;
}

/// Bilinear sample footprint of one neuron for one batch row.
#[derive(Clone, Copy, Debug)]
struct Footprint {
    x0: usize,
    x1: usize,
    y0: usize,
    y1: usize,
    fx: f32,
    fy: f32,
    /// `∂pixel/∂position` per axis; zero where the position is clamped.
    dx: f32,
    dy: f32,
}

impl Footprint {
    fn locate(position: [f32; 2], width: usize, height: usize) -> Self {
        let (x0, x1, fx, dx) = Self::axis(position[0], width);
        let (y0, y1, fy, dy) = Self::axis(position[1], height);
        Footprint {
            x0,
            x1,
            y0,
            y1,
            fx,
            fy,
            dx,
            dy,
        }
    }

    fn axis(position: f32, extent: usize) -> (usize, usize, f32, f32) {
        let span = (extent - 1) as f32;
        let inside = (-1.0..=1.0).contains(&position);
        let clamped = position.clamp(-1.0, 1.0);
        let pixel = (clamped + 1.0) * 0.5 * span;
        let lower = (pixel.floor() as usize).min(extent - 1);
        let upper = (lower + 1).min(extent - 1);
        let frac = pixel - lower as f32;
        let slope = if inside { 0.5 * span } else { 0.0 };
        (lower, upper, frac, slope)
    }
}

/// Point readout: each neuron samples the feature map at one learned location
/// (plus an optional shift) and linearly combines the channels there.
#[derive(Debug)]
pub struct PointReadout {
    channels: usize,
    height: usize,
    width: usize,
    mu: Parameter,
    features: Parameter,
    bias: Parameter,
    gamma_readout: f32,
}

impl PointReadout {
    pub fn new(
        name: impl Into<String>,
        (channels, height, width): (usize, usize, usize),
        neurons: usize,
        config: &ReadoutConfig,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if channels == 0 || height == 0 || width == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: channels,
                cols: height * width,
            });
        }
        if neurons == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: neurons,
                cols: channels,
            });
        }
        if !(config.init_mu_range > 0.0 && config.init_mu_range <= 1.0) {
            return Err(TensorError::InvalidValue {
                label: "init_mu_range must lie in (0, 1]",
            });
        }
        let name = name.into();
        let mu_name = format!("{name}::mu");
        let mu = Tensor::random_uniform(
            neurons,
            2,
            -config.init_mu_range,
            config.init_mu_range,
            seed,
            &mu_name,
        )?;
        let features = Tensor::full(neurons, channels, 1.0 / channels as f32)?;
        Ok(Self {
            channels,
            height,
            width,
            mu: Parameter::new(mu_name, mu),
            features: Parameter::new(format!("{name}::features"), features),
            bias: Parameter::new(format!("{name}::bias"), Tensor::zeros(1, neurons)?),
            gamma_readout: config.gamma_readout,
        })
    }

    pub fn neurons(&self) -> usize {
        self.mu.value().shape().0
    }

    pub fn mu(&self) -> &Parameter {
        &self.mu
    }

    pub fn features(&self) -> &Parameter {
        &self.features
    }

    fn map_size(&self) -> usize {
        self.height * self.width
    }

    fn check_inputs(&self, features: &Tensor, shift: Option<&Tensor>) -> PureResult<()> {
        let expected = self.channels * self.map_size();
        if features.shape().1 != expected {
            return Err(TensorError::ShapeMismatch {
                left: features.shape(),
                right: (features.shape().0, expected),
            });
        }
        if let Some(shift) = shift {
            let (rows, cols) = shift.shape();
            if cols != 2 || (rows != 1 && rows != features.shape().0) {
                return Err(TensorError::ShapeMismatch {
                    left: shift.shape(),
                    right: (features.shape().0, 2),
                });
            }
        }
        Ok(())
    }

    fn position(&self, neuron: usize, batch: usize, shift: Option<&Tensor>) -> [f32; 2] {
        let mu = self.mu.value().data();
        let mut position = [mu[neuron * 2], mu[neuron * 2 + 1]];
        if let Some(shift) = shift {
            let row = if shift.shape().0 == 1 { 0 } else { batch };
            position[0] += shift.data()[row * 2];
            position[1] += shift.data()[row * 2 + 1];
        }
        position
    }

    fn pixel(&self, row: &[f32], channel: usize, y: usize, x: usize) -> f32 {
        row[channel * self.map_size() + y * self.width + x]
    }

    fn sample(&self, row: &[f32], channel: usize, fp: &Footprint) -> f32 {
        let top = (1.0 - fp.fx) * self.pixel(row, channel, fp.y0, fp.x0)
            + fp.fx * self.pixel(row, channel, fp.y0, fp.x1);
        let bottom = (1.0 - fp.fx) * self.pixel(row, channel, fp.y1, fp.x0)
            + fp.fx * self.pixel(row, channel, fp.y1, fp.x1);
        (1.0 - fp.fy) * top + fp.fy * bottom
    }

    fn forward_session(&self, features: &Tensor, shift: Option<&Tensor>) -> PureResult<Tensor> {
        self.check_inputs(features, shift)?;
        let batch = features.shape().0;
        let neurons = self.neurons();
        let weights = self.features.value().data();
        let bias = self.bias.value().data();
        let mut out = Vec::with_capacity(batch * neurons);
        for b in 0..batch {
            let row = features.row(b)?;
            for n in 0..neurons {
                let fp = Footprint::locate(self.position(n, b, shift), self.width, self.height);
                let mut acc = bias[n];
                for c in 0..self.channels {
                    acc += weights[n * self.channels + c] * self.sample(row, c, &fp);
                }
                out.push(acc);
            }
        }
        Tensor::from_vec(batch, neurons, out)
    }

    fn backward_session(
        &mut self,
        features: &Tensor,
        shift: Option<&Tensor>,
        grad_output: &Tensor,
    ) -> PureResult<ReadoutGradients> {
        self.check_inputs(features, shift)?;
        let (batch, cols) = features.shape();
        let neurons = self.neurons();
        if grad_output.shape() != (batch, neurons) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, neurons),
            });
        }
        let map = self.map_size();
        let mut grad_features = vec![0.0f32; batch * cols];
        let mut grad_weights = vec![0.0f32; neurons * self.channels];
        let mut grad_mu = vec![0.0f32; neurons * 2];
        let mut grad_shift = shift.map(|s| vec![0.0f32; s.len()]);
        {
            let weights = self.features.value().data();
            for b in 0..batch {
                let row = features.row(b)?;
                let grad_row = &mut grad_features[b * cols..(b + 1) * cols];
                for n in 0..neurons {
                    let g = grad_output.data()[b * neurons + n];
                    if g == 0.0 {
                        continue;
                    }
                    let fp =
                        Footprint::locate(self.position(n, b, shift), self.width, self.height);
                    let corners = [
                        (fp.y0, fp.x0, (1.0 - fp.fy) * (1.0 - fp.fx)),
                        (fp.y0, fp.x1, (1.0 - fp.fy) * fp.fx),
                        (fp.y1, fp.x0, fp.fy * (1.0 - fp.fx)),
                        (fp.y1, fp.x1, fp.fy * fp.fx),
                    ];
                    let mut d_px = 0.0f32;
                    let mut d_py = 0.0f32;
                    for c in 0..self.channels {
                        let w = weights[n * self.channels + c];
                        grad_weights[n * self.channels + c] += g * self.sample(row, c, &fp);
                        for &(y, x, coef) in &corners {
                            grad_row[c * map + y * self.width + x] += g * w * coef;
                        }
                        let p00 = self.pixel(row, c, fp.y0, fp.x0);
                        let p01 = self.pixel(row, c, fp.y0, fp.x1);
                        let p10 = self.pixel(row, c, fp.y1, fp.x0);
                        let p11 = self.pixel(row, c, fp.y1, fp.x1);
                        d_px += w * ((1.0 - fp.fy) * (p01 - p00) + fp.fy * (p11 - p10));
                        d_py += w * ((1.0 - fp.fx) * (p10 - p00) + fp.fx * (p11 - p01));
                    }
                    let d_pos = [g * d_px * fp.dx, g * d_py * fp.dy];
                    grad_mu[n * 2] += d_pos[0];
                    grad_mu[n * 2 + 1] += d_pos[1];
                    if let (Some(grad_shift), Some(shift)) = (grad_shift.as_mut(), shift) {
                        let r = if shift.shape().0 == 1 { 0 } else { b };
                        grad_shift[r * 2] += d_pos[0];
                        grad_shift[r * 2 + 1] += d_pos[1];
                    }
                }
            }
        }
        self.features
            .accumulate_euclidean(&Tensor::from_vec(neurons, self.channels, grad_weights)?)?;
        self.mu
            .accumulate_euclidean(&Tensor::from_vec(neurons, 2, grad_mu)?)?;
        let grad_bias = grad_output.sum_axis0();
        self.bias
            .accumulate_euclidean(&Tensor::from_vec(1, neurons, grad_bias)?)?;

        let shift = match (grad_shift, shift) {
            (Some(data), Some(shift)) => Some(Tensor::from_vec(shift.shape().0, 2, data)?),
            _ => None,
        };
        Ok(ReadoutGradients {
            features: Tensor::from_vec(batch, cols, grad_features)?,
            shift,
        })
    }

    /// `gamma_readout` times the reduced L1 norm of the channel weights.
    pub fn regularizer(&self, reduction: Reduction) -> f32 {
        let weights = self.features.value();
        self.gamma_readout * weights.abs_sum() * reduction.factor(weights.len())
    }

    fn backward_regularizer(&mut self, reduction: Reduction, weight: f32) -> PureResult<()> {
        if self.gamma_readout == 0.0 || weight == 0.0 {
            return Ok(());
        }
        let values = self.features.value();
        let scale = weight * self.gamma_readout * reduction.factor(values.len());
        let grad = values.map(|w| scale * w.signum() * (w != 0.0) as u8 as f32);
        self.features.accumulate_euclidean(&grad)
    }
}

impl Parameterized for PointReadout {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.mu)?;
        visitor(&self.features)?;
        visitor(&self.bias)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.mu)?;
        visitor(&mut self.features)?;
        visitor(&mut self.bias)
    }
}

/// Point readouts keyed by data key.
#[derive(Debug, Default)]
pub struct MultiReadout {
    sessions: BTreeMap<String, PointReadout>,
}

impl MultiReadout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one readout per `(data_key, neurons)` over a shared feature map shape.
    pub fn build<'a>(
        feature_shape: (usize, usize, usize),
        neurons: impl IntoIterator<Item = (&'a str, usize)>,
        config: &ReadoutConfig,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let mut multi = Self::new();
        for (key, count) in neurons {
            let readout = PointReadout::new(
                format!("readout::{key}"),
                feature_shape,
                count,
                config,
                seed,
            )?;
            multi.insert(key, readout);
        }
        Ok(multi)
    }

    pub fn insert(&mut self, data_key: impl Into<String>, readout: PointReadout) {
        self.sessions.insert(data_key.into(), readout);
    }

    pub fn get(&self, data_key: &str) -> PureResult<&PointReadout> {
        self.sessions
            .get(data_key)
            .ok_or_else(|| TensorError::UnknownDataKey {
                key: data_key.to_string(),
            })
    }

    fn get_mut(&mut self, data_key: &str) -> PureResult<&mut PointReadout> {
        self.sessions
            .get_mut(data_key)
            .ok_or_else(|| TensorError::UnknownDataKey {
                key: data_key.to_string(),
            })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(String::as_str)
    }
}

impl Parameterized for MultiReadout {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for readout in self.sessions.values() {
            readout.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for readout in self.sessions.values_mut() {
            readout.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

impl Readout for MultiReadout {
    fn neurons(&self, data_key: &str) -> PureResult<usize> {
        Ok(self.get(data_key)?.neurons())
    }

    fn forward(
        &self,
        features: &Tensor,
        data_key: &str,
        shift: Option<&Tensor>,
    ) -> PureResult<Tensor> {
        self.get(data_key)?.forward_session(features, shift)
    }

    fn backward(
        &mut self,
        features: &Tensor,
        data_key: &str,
        shift: Option<&Tensor>,
        grad_output: &Tensor,
    ) -> PureResult<ReadoutGradients> {
        self.get_mut(data_key)?
            .backward_session(features, shift, grad_output)
    }

    fn regularizer(
        &self,
        data_key: &str,
        reduction: Reduction,
        average: Option<bool>,
    ) -> PureResult<f32> {
        Ok(self.get(data_key)?.regularizer(reduction.resolve(average)))
    }

    fn backward_regularizer(
        &mut self,
        data_key: &str,
        reduction: Reduction,
        average: Option<bool>,
        weight: f32,
    ) -> PureResult<()> {
        let reduction = reduction.resolve(average);
        self.get_mut(data_key)?.backward_regularizer(reduction, weight)
    }
}
