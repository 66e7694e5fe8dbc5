//! # Modulated / Demodulated Convolution
//!
//! Style-based convolution: a per-sample style vector scales the input
//! channels of a shared kernel, and demodulation rescales every output
//! channel back to unit expected variance.
//!
//! ```text
//! s      = A · w + b                         (affine, b initialised to 1)
//! w'     = s_i · w_{o,i,k}                   (modulation)
//! w''    = w' / sqrt(Σ_{i,k} w'^2 + ε)       (demodulation, ε = 1e-8)
//! ```
//!
//! Each sample of a batch gets its own kernel. Two evaluation strategies
//! produce the same result:
//!
//! - [`ConvStrategy::PerSample`]: loop over the batch, one convolution each.
//! - [`ConvStrategy::Grouped`]: fold the batch into the channel axis and run
//!   a single grouped convolution with `groups = batch`.

use candle_core::{IndexOp, Tensor};
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::GtnError;
use crate::functional::conv2d_same;
use crate::GtnResult;

pub const DEMOD_EPS: f64 = 1e-8;

/// How per-sample kernels are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvStrategy {
    PerSample,
    Grouped,
}

/// Shape of a modulated convolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModConvConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Odd square kernel size
    pub kernel_size: usize,
    /// Width of the latent `w` the styles are computed from
    pub latent_dim: usize,
    pub demodulate: bool,
    pub strategy: ConvStrategy,
}

impl ModConvConfig {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize, latent_dim: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            latent_dim,
            demodulate: true,
            strategy: ConvStrategy::Grouped,
        }
    }
}

/// Modulated convolution layer
#[derive(Debug, Clone)]
pub struct ModulatedConv2d {
    /// `(O, I, k, k)`
    weight: Tensor,
    /// `(O)`
    bias: Tensor,
    /// `(I, latent_dim)`
    affine_weight: Tensor,
    /// `(I)`
    affine_bias: Tensor,
    config: ModConvConfig,
}

impl ModulatedConv2d {
    pub fn new(config: ModConvConfig, vb: VarBuilder) -> GtnResult<Self> {
        let ModConvConfig {
            in_channels: i,
            out_channels: o,
            kernel_size: k,
            latent_dim,
            ..
        } = config;
        if k % 2 == 0 || i == 0 || o == 0 || latent_dim == 0 {
            return Err(GtnError::InvalidConfig(format!(
                "modulated conv needs non-zero channels and an odd kernel, got {}->{} k={}",
                i, o, k
            )));
        }
        let weight = vb.get_with_hints((o, i, k, k), "weight", Init::Randn { mean: 0.0, stdev: 1.0 })?;
        let bias = vb.get_with_hints(o, "bias", Init::Const(0.0))?;
        let affine_weight = vb.get_with_hints(
            (i, latent_dim),
            "affine.weight",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0 / (latent_dim as f64).sqrt(),
            },
        )?;
        let affine_bias = vb.get_with_hints(i, "affine.bias", Init::Const(1.0))?;
        Ok(Self {
            weight,
            bias,
            affine_weight,
            affine_bias,
            config,
        })
    }

    pub fn config(&self) -> &ModConvConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Per-sample styles `(B, I)` from latents `(B, latent_dim)`
    pub fn styles(&self, w: &Tensor) -> GtnResult<Tensor> {
        Ok(w.matmul(&self.affine_weight.t()?)?.broadcast_add(&self.affine_bias)?)
    }

    /// Per-sample kernels `(B, O, I, k, k)`, demodulated if configured
    pub fn sample_kernels(&self, styles: &Tensor) -> GtnResult<Tensor> {
        let modulated = modulate_weights(&self.weight, styles)?;
        if self.config.demodulate {
            demodulate_weights(&modulated)
        } else {
            Ok(modulated)
        }
    }

    /// Convolve `x (B, I, H, W)` under latents `w (B, latent_dim)`
    pub fn forward(&self, x: &Tensor, w: &Tensor) -> GtnResult<Tensor> {
        self.forward_with(x, w, self.config.strategy)
    }

    pub fn forward_with(&self, x: &Tensor, w: &Tensor, strategy: ConvStrategy) -> GtnResult<Tensor> {
        let (b, c, _, _) = x.dims4()?;
        if c != self.config.in_channels {
            return Err(GtnError::DimensionMismatch {
                expected: self.config.in_channels,
                got: c,
            });
        }
        if w.dim(0)? != b {
            return Err(GtnError::DimensionMismatch {
                expected: b,
                got: w.dim(0)?,
            });
        }
        let kernels = self.sample_kernels(&self.styles(w)?)?;
        match strategy {
            ConvStrategy::PerSample => forward_per_sample(x, &kernels, &self.bias),
            ConvStrategy::Grouped => forward_grouped(x, &kernels, &self.bias),
        }
    }
}

/// `w'_{b,o,i,k} = s_{b,i} · w_{o,i,k}`
pub fn modulate_weights(weight: &Tensor, styles: &Tensor) -> GtnResult<Tensor> {
    let (_, i, _, _) = weight.dims4()?;
    let (b, si) = styles.dims2()?;
    if si != i {
        return Err(GtnError::DimensionMismatch { expected: i, got: si });
    }
    Ok(weight
        .unsqueeze(0)?
        .broadcast_mul(&styles.reshape((b, 1, i, 1, 1))?)?)
}

/// `sqrt(Σ_{i,k} w'^2 + ε)` per sample and output channel, shape `(B, O)`
pub fn demodulation_denominator(modulated: &Tensor) -> GtnResult<Tensor> {
    Ok(modulated.sqr()?.sum((2, 3, 4))?.affine(1.0, DEMOD_EPS)?.sqrt()?)
}

/// Divide every output channel by its demodulation denominator
pub fn demodulate_weights(modulated: &Tensor) -> GtnResult<Tensor> {
    let (b, o, _, _, _) = modulated.dims5()?;
    let denom = demodulation_denominator(modulated)?.reshape((b, o, 1, 1, 1))?;
    Ok(modulated.broadcast_div(&denom)?)
}

/// One convolution per sample
pub fn forward_per_sample(x: &Tensor, kernels: &Tensor, bias: &Tensor) -> GtnResult<Tensor> {
    let b = x.dim(0)?;
    let mut outputs = Vec::with_capacity(b);
    for n in 0..b {
        outputs.push(conv2d_same(&x.i(n..n + 1)?, &kernels.i(n)?, bias)?);
    }
    Ok(Tensor::cat(&outputs, 0)?)
}

/// Single grouped convolution with the batch folded into the channels
pub fn forward_grouped(x: &Tensor, kernels: &Tensor, bias: &Tensor) -> GtnResult<Tensor> {
    let (b, i, h, w) = x.dims4()?;
    let (_, o, _, k, _) = kernels.dims5()?;
    let x = x.reshape((1, b * i, h, w))?;
    let kernels = kernels.reshape((b * o, i, k, k))?;
    let y = x.conv2d(&kernels, k / 2, 1, 1, b)?;
    Ok(y.reshape((b, o, h, w))?
        .broadcast_add(&bias.reshape((1, o, 1, 1))?)?)
}
