//! # Path-Length Regularization
//!
//! Encourages a fixed-size step in latent space to produce a fixed-magnitude
//! change in the image, whatever the direction:
//!
//! ```text
//! y      ~ N(0, 1) / sqrt(H · W)
//! J^T y  = ∇_w Σ g(w) · y
//! len_b  = ||(J^T y)_b||₂
//! a      ← a + decay · (mean(len) − a)
//! P      = mean((len − a)²)
//! ```
//!
//! `P` stays differentiable w.r.t. the generator parameters, so it can be
//! added to the generator loss. With a lazy interval `every = N` the penalty
//! is only computed on every N-th call and scaled by N.

use candle_core::{Tensor, Var};
use rand::rngs::StdRng;

use crate::error::GtnError;
use crate::params::{enable_higher_order_grads, normal_tensor};
use crate::GtnResult;

pub const DEFAULT_DECAY: f64 = 0.01;

/// One evaluated penalty
#[derive(Debug, Clone)]
pub struct PathLengthPenalty {
    /// Scalar penalty, already scaled by the lazy interval
    pub penalty: Tensor,
    /// Per-sample path lengths `(B)`
    pub lengths: Tensor,
    /// Batch mean of the path lengths
    pub mean_length: f64,
    /// Running average after this call
    pub running_mean: f64,
}

/// Path-length regulariser with its running average
#[derive(Debug, Clone)]
pub struct PathLengthRegularizer {
    decay: f64,
    every: usize,
    running_mean: f64,
    calls: usize,
}

impl Default for PathLengthRegularizer {
    fn default() -> Self {
        Self {
            decay: DEFAULT_DECAY,
            every: 1,
            running_mean: 0.0,
            calls: 0,
        }
    }
}

impl PathLengthRegularizer {
    pub fn new(decay: f64, every: usize) -> GtnResult<Self> {
        if !(0.0..=1.0).contains(&decay) {
            return Err(GtnError::InvalidConfig(format!(
                "path-length decay must be in [0, 1], got {}",
                decay
            )));
        }
        if every == 0 {
            return Err(GtnError::InvalidConfig(
                "path-length interval must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            decay,
            every,
            ..Self::default()
        })
    }

    pub fn running_mean(&self) -> f64 {
        self.running_mean
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Whether the next call of [`Self::penalty`] will evaluate
    pub fn is_due(&self) -> bool {
        self.calls % self.every == 0
    }

    /// Evaluate the penalty of `generator` at latents `w (B, latent_dim)`.
    ///
    /// Returns `None` on calls skipped by the lazy interval. The generator
    /// must map `(B, latent_dim)` to images `(B, C, H, W)`.
    pub fn penalty<F>(
        &mut self,
        w: &Tensor,
        generator: F,
        rng: &mut StdRng,
    ) -> GtnResult<Option<PathLengthPenalty>>
    where
        F: FnOnce(&Tensor) -> GtnResult<Tensor>,
    {
        let due = self.is_due();
        self.calls += 1;
        if !due {
            return Ok(None);
        }
        enable_higher_order_grads();

        let probe = Var::zeros(w.shape(), w.dtype(), w.device())?;
        let w_probed = w.detach().broadcast_add(probe.as_tensor())?;
        let images = generator(&w_probed)?;
        let (_, _, h, width) = images.dims4()?;

        let y = normal_tensor(rng, images.shape().clone(), 1.0 / ((h * width) as f64).sqrt(), images.device())?;
        let projected = (images * y)?.sum_all()?;
        let grads = projected.backward()?;
        let jty = match grads.get(probe.as_tensor()) {
            Some(g) => g.clone(),
            None => probe.as_tensor().zeros_like()?,
        };

        let lengths = jty.sqr()?.sum(1)?.sqrt()?;
        let mean_length: f32 = lengths.mean_all()?.to_scalar()?;
        let mean_length = mean_length as f64;
        if !mean_length.is_finite() {
            return Err(GtnError::divergence("path length", self.calls - 1, mean_length));
        }

        let previous = self.running_mean;
        self.running_mean = previous + self.decay * (mean_length - previous);

        let penalty = lengths
            .affine(1.0, -self.running_mean)?
            .sqr()?
            .mean_all()?
            .affine(self.every as f64, 0.0)?;

        log::debug!(
            "path length: mean {:.4}, running {:.4}",
            mean_length,
            self.running_mean
        );

        Ok(Some(PathLengthPenalty {
            penalty,
            lengths,
            mean_length,
            running_mean: self.running_mean,
        }))
    }
}
