//! # Style-Based Generator Components
//!
//! - [`modconv`]: modulated / demodulated convolution with per-sample and
//!   grouped evaluation.
//! - [`path_length`]: path-length regularization with a running average.
//!
//! [`SynthesisNetwork`] strings a few modulated convolutions together into a
//! small latent-to-image generator, enough to drive both pieces end to end.

pub mod modconv;
pub mod path_length;

pub use modconv::{
    demodulate_weights, demodulation_denominator, forward_grouped, forward_per_sample,
    modulate_weights, ConvStrategy, ModConvConfig, ModulatedConv2d, DEMOD_EPS,
};
pub use path_length::{PathLengthPenalty, PathLengthRegularizer};

use candle_core::Tensor;
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::GtnError;
use crate::functional::{leaky_relu, upsample2x};
use crate::GtnResult;

/// Shape of a [`SynthesisNetwork`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub latent_dim: usize,
    /// Feature channels of every hidden layer
    pub channels: usize,
    /// Side of the learned constant input; the output is twice this size
    pub base_size: usize,
    pub out_channels: usize,
    pub leaky_slope: f64,
    pub strategy: ConvStrategy,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            latent_dim: 32,
            channels: 16,
            base_size: 4,
            out_channels: 1,
            leaky_slope: 0.2,
            // the im2col path keeps second-order gradients available
            strategy: ConvStrategy::PerSample,
        }
    }
}

/// Learned constant → modconv → up2 → modconv → to-image modconv
#[derive(Debug, Clone)]
pub struct SynthesisNetwork {
    constant: Tensor,
    conv0: ModulatedConv2d,
    conv1: ModulatedConv2d,
    to_image: ModulatedConv2d,
    config: SynthesisConfig,
}

impl SynthesisNetwork {
    pub fn new(config: SynthesisConfig, vb: VarBuilder) -> GtnResult<Self> {
        if config.base_size == 0 {
            return Err(GtnError::InvalidConfig("base_size must be non-zero".to_string()));
        }
        let c = config.channels;
        let layer = |i, o, k, demodulate| ModConvConfig {
            demodulate,
            strategy: config.strategy,
            ..ModConvConfig::new(i, o, k, config.latent_dim)
        };
        let constant = vb.get_with_hints(
            (1, c, config.base_size, config.base_size),
            "constant",
            Init::Randn { mean: 0.0, stdev: 1.0 },
        )?;
        let conv0 = ModulatedConv2d::new(layer(c, c, 3, true), vb.pp("conv0"))?;
        let conv1 = ModulatedConv2d::new(layer(c, c, 3, true), vb.pp("conv1"))?;
        let to_image = ModulatedConv2d::new(layer(c, config.out_channels, 1, false), vb.pp("to_image"))?;
        Ok(Self {
            constant,
            conv0,
            conv1,
            to_image,
            config,
        })
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Images `(B, out_channels, 2·base, 2·base)` for latents `(B, latent_dim)`
    pub fn forward(&self, w: &Tensor) -> GtnResult<Tensor> {
        let b = w.dim(0)?;
        let (_, c, s, _) = self.constant.dims4()?;
        let x = self.constant.broadcast_as((b, c, s, s))?;
        let x = leaky_relu(&self.conv0.forward(&x, w)?, self.config.leaky_slope)?;
        let x = upsample2x(&x)?;
        let x = leaky_relu(&self.conv1.forward(&x, w)?, self.config.leaky_slope)?;
        self.to_image.forward(&x, w)
    }
}
