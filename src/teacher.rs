//! # Teacher (Generator) Network
//!
//! Maps `(noise, one-hot label)` to a single-channel image normalised like the
//! real data:
//!
//! ```text
//! [noise | label] → FC → LeakyReLU → BN
//!                 → FC → LeakyReLU → reshape (C, H/4, W/4) → BN
//!                 → up2 → conv3x3 → LeakyReLU → BN
//!                 → up2 → conv3x3 → tanh → [0, 1] → (x - mean) / std
//! ```
//!
//! The teacher also owns the two learnable scalars of the student optimiser
//! (learning rate and momentum). All of them are candle [`Var`]s registered in
//! one [`VarMap`] so the outer optimiser can step them together.

use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use rand::rngs::StdRng;

use crate::config::GtnConfig;
use crate::error::GtnError;
use crate::functional::{batch_norm, conv2d_same, leaky_relu, linear, upsample2x};
use crate::params::{constant_tensor, fan_in_uniform};
use crate::GtnResult;

pub const INNER_LR: &str = "inner_lr";
pub const INNER_MOMENTUM: &str = "inner_momentum";

/// Generator network plus the learnable student-optimiser scalars
pub struct Teacher {
    varmap: VarMap,
    fc1_w: Tensor,
    fc1_b: Tensor,
    bn1_g: Tensor,
    bn1_b: Tensor,
    fc2_w: Tensor,
    fc2_b: Tensor,
    bn2_g: Tensor,
    bn2_b: Tensor,
    conv1_w: Tensor,
    conv1_b: Tensor,
    bn3_g: Tensor,
    bn3_b: Tensor,
    conv2_w: Tensor,
    conv2_b: Tensor,
    inner_lr: Var,
    inner_momentum: Var,
    channels: usize,
    base_size: usize,
    leaky_slope: f64,
    bn_eps: f64,
    data_mean: f64,
    data_std: f64,
}

/// Register a seeded tensor as a named variable
fn register(varmap: &VarMap, name: &str, init: Tensor) -> GtnResult<Var> {
    let var = Var::from_tensor(&init)?;
    varmap
        .data()
        .lock()
        .map_err(|e| GtnError::ComputationError(e.to_string()))?
        .insert(name.to_string(), var.clone());
    Ok(var)
}

impl Teacher {
    /// Build a freshly initialised teacher
    pub fn new(config: &GtnConfig, rng: &mut StdRng, device: &Device) -> GtnResult<Self> {
        let varmap = VarMap::new();
        let t = &config.teacher;
        let input = config.noise_width + config.num_classes;
        let base_size = config.image_size / 4;
        let fc2_out = t.channels * base_size * base_size;
        let mid_channels = (t.channels / 2).max(1);

        let reg = |name: &str, init: Tensor| -> GtnResult<Tensor> {
            Ok(register(&varmap, name, init)?.as_tensor().clone())
        };

        let fc1_w = reg("fc1.weight", fan_in_uniform(rng, (t.hidden, input), input, device)?)?;
        let fc1_b = reg("fc1.bias", fan_in_uniform(rng, t.hidden, input, device)?)?;
        let bn1_g = reg("bn1.weight", constant_tensor(t.hidden, 1.0, device)?)?;
        let bn1_b = reg("bn1.bias", constant_tensor(t.hidden, 0.0, device)?)?;

        let fc2_w = reg("fc2.weight", fan_in_uniform(rng, (fc2_out, t.hidden), t.hidden, device)?)?;
        let fc2_b = reg("fc2.bias", fan_in_uniform(rng, fc2_out, t.hidden, device)?)?;
        let bn2_g = reg("bn2.weight", constant_tensor(t.channels, 1.0, device)?)?;
        let bn2_b = reg("bn2.bias", constant_tensor(t.channels, 0.0, device)?)?;

        let fan = t.channels * 9;
        let conv1_w = reg(
            "conv1.weight",
            fan_in_uniform(rng, (mid_channels, t.channels, 3, 3), fan, device)?,
        )?;
        let conv1_b = reg("conv1.bias", fan_in_uniform(rng, mid_channels, fan, device)?)?;
        let bn3_g = reg("bn3.weight", constant_tensor(mid_channels, 1.0, device)?)?;
        let bn3_b = reg("bn3.bias", constant_tensor(mid_channels, 0.0, device)?)?;

        let fan = mid_channels * 9;
        let conv2_w = reg("conv2.weight", fan_in_uniform(rng, (1, mid_channels, 3, 3), fan, device)?)?;
        let conv2_b = reg("conv2.bias", fan_in_uniform(rng, 1, fan, device)?)?;

        let inner_lr = register(
            &varmap,
            INNER_LR,
            constant_tensor(1, config.initial_inner_lr, device)?,
        )?;
        let inner_momentum = register(
            &varmap,
            INNER_MOMENTUM,
            constant_tensor(1, config.initial_inner_momentum, device)?,
        )?;

        log::debug!(
            "Teacher initialised: {} tensors, base map {}x{}x{}",
            varmap.all_vars().len(),
            t.channels,
            base_size,
            base_size
        );

        Ok(Self {
            varmap,
            fc1_w,
            fc1_b,
            bn1_g,
            bn1_b,
            fc2_w,
            fc2_b,
            bn2_g,
            bn2_b,
            conv1_w,
            conv1_b,
            bn3_g,
            bn3_b,
            conv2_w,
            conv2_b,
            inner_lr,
            inner_momentum,
            channels: t.channels,
            base_size,
            leaky_slope: t.leaky_slope,
            bn_eps: t.bn_eps,
            data_mean: config.data_mean,
            data_std: config.data_std,
        })
    }

    /// Synthesize a batch of images `(B, 1, H, W)`
    pub fn forward(&self, noise: &Tensor, one_hot: &Tensor) -> GtnResult<Tensor> {
        let batch = noise.dim(0)?;
        if one_hot.dim(0)? != batch {
            return Err(GtnError::DimensionMismatch {
                expected: batch,
                got: one_hot.dim(0)?,
            });
        }
        let slope = self.leaky_slope;
        let eps = self.bn_eps;

        let x = Tensor::cat(&[noise, one_hot], 1)?;
        let x = leaky_relu(&linear(&x, &self.fc1_w, &self.fc1_b)?, slope)?;
        let x = batch_norm(&x, &self.bn1_g, &self.bn1_b, eps)?;

        let x = leaky_relu(&linear(&x, &self.fc2_w, &self.fc2_b)?, slope)?;
        let x = x.reshape((batch, self.channels, self.base_size, self.base_size))?;
        let x = batch_norm(&x, &self.bn2_g, &self.bn2_b, eps)?;

        let x = conv2d_same(&upsample2x(&x)?, &self.conv1_w, &self.conv1_b)?;
        let x = batch_norm(&leaky_relu(&x, slope)?, &self.bn3_g, &self.bn3_b, eps)?;

        let x = conv2d_same(&upsample2x(&x)?, &self.conv2_w, &self.conv2_b)?;
        // tanh in [-1, 1] -> [0, 1] -> real-data normalisation
        let scale = 0.5 / self.data_std;
        let shift = (0.5 - self.data_mean) / self.data_std;
        Ok(x.tanh()?.affine(scale, shift)?)
    }

    /// Learnable student learning rate, shape `(1)`
    pub fn inner_lr(&self) -> &Tensor {
        self.inner_lr.as_tensor()
    }

    /// Learnable student momentum, shape `(1)`
    pub fn inner_momentum(&self) -> &Tensor {
        self.inner_momentum.as_tensor()
    }

    /// Current `(learning rate, momentum)` values
    pub fn inner_hyper_values(&self) -> GtnResult<(f32, f32)> {
        let lr: Vec<f32> = self.inner_lr.as_tensor().to_vec1()?;
        let momentum: Vec<f32> = self.inner_momentum.as_tensor().to_vec1()?;
        Ok((lr[0], momentum[0]))
    }

    /// Overwrite the student learning rate
    pub fn set_inner_lr(&self, value: f64) -> GtnResult<()> {
        let t = constant_tensor(1, value, self.inner_lr.device())?;
        self.inner_lr.set(&t)?;
        Ok(())
    }

    /// All variables sorted by name
    pub fn named_vars(&self) -> GtnResult<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| GtnError::ComputationError(e.to_string()))?;
        let mut vars: Vec<(String, Var)> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    pub fn all_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Number of scalar parameters
    pub fn num_parameters(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curriculum::cyclic_labels;
    use crate::functional::one_hot;
    use crate::params::normal_tensor;
    use rand::SeedableRng;

    fn tiny_teacher() -> (Teacher, GtnConfig) {
        let config = GtnConfig::tiny();
        let mut rng = StdRng::seed_from_u64(0);
        (Teacher::new(&config, &mut rng, &Device::Cpu).unwrap(), config)
    }

    #[test]
    fn test_output_shape() {
        let (teacher, config) = tiny_teacher();
        let mut rng = StdRng::seed_from_u64(1);
        let noise = normal_tensor(&mut rng, (config.batch_size, config.noise_width), 1.0, &Device::Cpu).unwrap();
        let labels = one_hot(&cyclic_labels(config.batch_size, 10), 10, &Device::Cpu).unwrap();
        let images = teacher.forward(&noise, &labels).unwrap();
        assert_eq!(images.dims(), &[config.batch_size, 1, 8, 8]);
    }

    #[test]
    fn test_output_range_matches_normalisation() {
        let (teacher, config) = tiny_teacher();
        let mut rng = StdRng::seed_from_u64(2);
        let noise = normal_tensor(&mut rng, (config.batch_size, config.noise_width), 1.0, &Device::Cpu).unwrap();
        let labels = one_hot(&cyclic_labels(config.batch_size, 10), 10, &Device::Cpu).unwrap();
        let images = teacher.forward(&noise, &labels).unwrap();

        let lo = ((0.0 - config.data_mean) / config.data_std) as f32 - 1e-4;
        let hi = ((1.0 - config.data_mean) / config.data_std) as f32 + 1e-4;
        let values: Vec<f32> = images.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| *v >= lo && *v <= hi));
    }

    #[test]
    fn test_forward_is_deterministic() {
        let (teacher, config) = tiny_teacher();
        let mut rng = StdRng::seed_from_u64(3);
        let noise = normal_tensor(&mut rng, (config.batch_size, config.noise_width), 1.0, &Device::Cpu).unwrap();
        let labels = one_hot(&cyclic_labels(config.batch_size, 10), 10, &Device::Cpu).unwrap();
        let a = teacher.forward(&noise, &labels).unwrap();
        let b = teacher.forward(&noise, &labels).unwrap();
        let diff: f32 = (a - b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_inner_hyper_initial_values() {
        let (teacher, config) = tiny_teacher();
        let (lr, momentum) = teacher.inner_hyper_values().unwrap();
        assert!((lr as f64 - config.initial_inner_lr).abs() < 1e-6);
        assert!((momentum as f64 - config.initial_inner_momentum).abs() < 1e-6);

        teacher.set_inner_lr(0.0).unwrap();
        assert_eq!(teacher.inner_hyper_values().unwrap().0, 0.0);
    }

    #[test]
    fn test_named_vars_cover_all_layers() {
        let (teacher, _) = tiny_teacher();
        let names: Vec<String> = teacher.named_vars().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names.len(), 16);
        assert!(names.contains(&INNER_LR.to_string()));
        assert!(names.contains(&"conv2.weight".to_string()));
    }

    #[test]
    fn test_label_batch_mismatch() {
        let (teacher, config) = tiny_teacher();
        let noise = Tensor::zeros((config.batch_size, config.noise_width), candle_core::DType::F32, &Device::Cpu).unwrap();
        let labels = one_hot(&[0, 1], 10, &Device::Cpu).unwrap();
        assert!(teacher.forward(&noise, &labels).is_err());
    }
}
