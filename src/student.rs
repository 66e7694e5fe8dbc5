//! # Student (Learner) Network
//!
//! A small two-stage convolutional classifier whose channel widths are drawn
//! per instance. The network holds no weights of its own: [`Student::forward`]
//! runs on whatever [`ParamSnapshot`] it is given, which is what lets the
//! inner loop replay it on every snapshot of an unrolled trajectory.

use candle_core::{Device, IndexOp, Tensor};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::config::{GtnConfig, StudentConfig};
use crate::data::ImageDataset;
use crate::error::GtnError;
use crate::functional::{
    batch_norm, conv2d_same, correct_predictions, cross_entropy_one_hot, leaky_relu, linear,
    max_pool2x2,
};
use crate::params::{constant_tensor, fan_in_uniform, ParamSnapshot};
use crate::GtnResult;

/// Concrete channel widths of one student
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StudentArch {
    pub conv1: usize,
    pub conv2: usize,
}

impl std::fmt::Display for StudentArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conv1={} conv2={}", self.conv1, self.conv2)
    }
}

/// Classifier description: architecture plus fixed input/output sizes
#[derive(Debug, Clone)]
pub struct Student {
    arch: StudentArch,
    image_size: usize,
    num_classes: usize,
    leaky_slope: f64,
    bn_eps: f64,
}

impl Student {
    pub fn new(arch: StudentArch, config: &GtnConfig) -> GtnResult<Self> {
        if arch.conv1 == 0 || arch.conv2 == 0 {
            return Err(GtnError::InvalidConfig(format!(
                "student widths must be non-zero, got {}",
                arch
            )));
        }
        Ok(Self {
            arch,
            image_size: config.image_size,
            num_classes: config.num_classes,
            leaky_slope: config.student.leaky_slope,
            bn_eps: config.student.bn_eps,
        })
    }

    /// Draw widths from the configured [`StudentConfig`] ranges
    pub fn sample(config: &GtnConfig, rng: &mut StdRng) -> GtnResult<Self> {
        Self::sample_with(&config.student, config, rng)
    }

    /// Draw widths from explicit width specs
    pub fn sample_with(
        widths: &StudentConfig,
        config: &GtnConfig,
        rng: &mut StdRng,
    ) -> GtnResult<Self> {
        let arch = StudentArch {
            conv1: widths.conv1.sample(rng)?,
            conv2: widths.conv2.sample(rng)?,
        };
        Self::new(arch, config)
    }

    pub fn arch(&self) -> StudentArch {
        self.arch
    }

    fn flat_features(&self) -> usize {
        let side = self.image_size / 4;
        self.arch.conv2 * side * side
    }

    /// Fresh, untrained parameters
    pub fn init_params(&self, rng: &mut StdRng, device: &Device) -> GtnResult<ParamSnapshot> {
        let (c1, c2) = (self.arch.conv1, self.arch.conv2);
        let flat = self.flat_features();
        Ok(ParamSnapshot::new()
            .with("conv1.weight", fan_in_uniform(rng, (c1, 1, 3, 3), 9, device)?)
            .with("conv1.bias", fan_in_uniform(rng, c1, 9, device)?)
            .with("bn1.weight", constant_tensor(c1, 1.0, device)?)
            .with("bn1.bias", constant_tensor(c1, 0.0, device)?)
            .with("conv2.weight", fan_in_uniform(rng, (c2, c1, 3, 3), c1 * 9, device)?)
            .with("conv2.bias", fan_in_uniform(rng, c2, c1 * 9, device)?)
            .with("bn2.weight", constant_tensor(c2, 1.0, device)?)
            .with("bn2.bias", constant_tensor(c2, 0.0, device)?)
            .with("fc.weight", fan_in_uniform(rng, (self.num_classes, flat), flat, device)?)
            .with("fc.bias", fan_in_uniform(rng, self.num_classes, flat, device)?))
    }

    /// Class logits `(B, num_classes)` for images `(B, 1, H, W)`
    pub fn forward(&self, params: &ParamSnapshot, images: &Tensor) -> GtnResult<Tensor> {
        let (_, _, h, w) = images.dims4()?;
        if h != self.image_size || w != self.image_size {
            return Err(GtnError::DimensionMismatch {
                expected: self.image_size,
                got: h.max(w),
            });
        }
        let slope = self.leaky_slope;
        let eps = self.bn_eps;

        let x = conv2d_same(images, params.get("conv1.weight")?, params.get("conv1.bias")?)?;
        let x = max_pool2x2(&leaky_relu(&x, slope)?)?;
        let x = batch_norm(&x, params.get("bn1.weight")?, params.get("bn1.bias")?, eps)?;

        let x = conv2d_same(&x, params.get("conv2.weight")?, params.get("conv2.bias")?)?;
        let x = max_pool2x2(&leaky_relu(&x, slope)?)?;
        let x = batch_norm(&x, params.get("bn2.weight")?, params.get("bn2.bias")?, eps)?;

        let x = x.flatten_from(1)?;
        linear(&x, params.get("fc.weight")?, params.get("fc.bias")?)
    }

    /// Mean cross-entropy against one-hot targets
    pub fn loss(&self, params: &ParamSnapshot, images: &Tensor, one_hot: &Tensor) -> GtnResult<Tensor> {
        cross_entropy_one_hot(&self.forward(params, images)?, one_hot)
    }

    /// Accuracy on one labelled batch
    pub fn batch_accuracy(&self, params: &ParamSnapshot, images: &Tensor, labels: &Tensor) -> GtnResult<f64> {
        let n = images.dim(0)?;
        if n == 0 {
            return Ok(0.0);
        }
        let logits = self.forward(params, images)?;
        Ok(correct_predictions(&logits, labels)? as f64 / n as f64)
    }

    /// Accuracy over a whole dataset, evaluated in chunks of `chunk` rows.
    ///
    /// Batch statistics are used for normalisation, so a trailing chunk of a
    /// single row is folded into the previous one.
    pub fn evaluate(&self, params: &ParamSnapshot, dataset: &ImageDataset, chunk: usize) -> GtnResult<f64> {
        let n = dataset.len();
        if n == 0 {
            return Err(GtnError::DataExhausted("cannot evaluate on an empty dataset".to_string()));
        }
        let chunk = chunk.max(2);
        let params = params.detach();
        let mut correct = 0usize;
        let mut start = 0;
        while start < n {
            let mut end = (start + chunk).min(n);
            if n - end == 1 {
                end = n;
            }
            let images = dataset.images().i(start..end)?;
            let labels = dataset.labels().i(start..end)?;
            let logits = self.forward(&params, &images)?;
            correct += correct_predictions(&logits, &labels)?;
            start = end;
        }
        Ok(correct as f64 / n as f64)
    }
}
