//! # Synthetic Curriculum
//!
//! Decides what the teacher is asked to draw at each inner step: the noise
//! rows (freshly sampled, or a learnable `(K, B, noise_width)` tensor) and the
//! label of every row.
//!
//! Labels follow `row % num_classes`. With [`LabelSchedule::Cyclic`] the same
//! order is reused at every step of every outer iteration, which is what lets
//! a learned curriculum specialise noise rows per class.

use candle_core::{Device, IndexOp, Tensor, Var};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::config::{GtnConfig, LabelSchedule};
use crate::functional::one_hot;
use crate::params::normal_tensor;
use crate::GtnResult;

/// Where the noise of each inner step comes from
#[derive(Debug)]
pub enum NoiseSource {
    /// Fresh standard-normal noise for every step
    Sampled,
    /// One learnable noise batch per step, shape `(K, B, noise_width)`
    Learned(Var),
}

/// Noise and label plan for one unrolled inner loop
#[derive(Debug)]
pub struct Curriculum {
    source: NoiseSource,
    schedule: LabelSchedule,
    labels: Vec<u32>,
    one_hot: Tensor,
    batch_size: usize,
    noise_width: usize,
    num_classes: usize,
    device: Device,
}

/// Cyclic label order `0, 1, .., K-1, 0, 1, ..`
pub fn cyclic_labels(batch_size: usize, num_classes: usize) -> Vec<u32> {
    (0..batch_size).map(|i| (i % num_classes) as u32).collect()
}

impl Curriculum {
    pub fn new(config: &GtnConfig, rng: &mut StdRng, device: &Device) -> GtnResult<Self> {
        let source = if config.learned_curriculum {
            let init = normal_tensor(
                rng,
                (config.inner_steps.max(1), config.batch_size, config.noise_width),
                1.0,
                device,
            )?;
            NoiseSource::Learned(Var::from_tensor(&init)?)
        } else {
            NoiseSource::Sampled
        };

        let labels = cyclic_labels(config.batch_size, config.num_classes);
        let one_hot = one_hot(&labels, config.num_classes, device)?;

        Ok(Self {
            source,
            schedule: config.label_schedule,
            labels,
            one_hot,
            batch_size: config.batch_size,
            noise_width: config.noise_width,
            num_classes: config.num_classes,
            device: device.clone(),
        })
    }

    /// Noise rows for inner step `step`
    pub fn noise(&self, step: usize, rng: &mut StdRng) -> GtnResult<Tensor> {
        match &self.source {
            NoiseSource::Sampled => {
                normal_tensor(rng, (self.batch_size, self.noise_width), 1.0, &self.device)
            }
            NoiseSource::Learned(var) => {
                let steps = var.as_tensor().dim(0)?;
                Ok(var.as_tensor().i(step % steps)?)
            }
        }
    }

    /// Row labels shared by every inner step
    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// One-hot encoding of [`Self::labels`]
    pub fn one_hot(&self) -> &Tensor {
        &self.one_hot
    }

    /// Prepare the labels for a new outer iteration
    pub fn begin_iteration(&mut self, rng: &mut StdRng) -> GtnResult<()> {
        if self.schedule == LabelSchedule::Shuffled {
            self.labels.shuffle(rng);
            self.one_hot = one_hot(&self.labels, self.num_classes, &self.device)?;
        }
        Ok(())
    }

    /// The learnable noise tensor, if any
    pub fn var(&self) -> Option<&Var> {
        match &self.source {
            NoiseSource::Learned(var) => Some(var),
            NoiseSource::Sampled => None,
        }
    }

    pub fn is_learned(&self) -> bool {
        matches!(self.source, NoiseSource::Learned(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_cyclic_labels() {
        assert_eq!(cyclic_labels(5, 3), vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_learned_noise_is_stable_per_step() {
        let config = GtnConfig::tiny();
        let mut rng = StdRng::seed_from_u64(0);
        let curriculum = Curriculum::new(&config, &mut rng, &Device::Cpu).unwrap();
        assert!(curriculum.is_learned());

        let a = curriculum.noise(1, &mut rng).unwrap();
        let b = curriculum.noise(1, &mut rng).unwrap();
        assert_eq!(a.dims(), &[config.batch_size, config.noise_width]);
        let diff: f32 = (a - b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_sampled_noise_changes() {
        let config = GtnConfig {
            learned_curriculum: false,
            ..GtnConfig::tiny()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let curriculum = Curriculum::new(&config, &mut rng, &Device::Cpu).unwrap();
        assert!(curriculum.var().is_none());

        let a = curriculum.noise(0, &mut rng).unwrap();
        let b = curriculum.noise(0, &mut rng).unwrap();
        let diff: f32 = (a - b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff > 0.0);
    }

    #[test]
    fn test_cyclic_schedule_is_fixed_across_iterations() {
        let config = GtnConfig::tiny();
        let mut rng = StdRng::seed_from_u64(0);
        let mut curriculum = Curriculum::new(&config, &mut rng, &Device::Cpu).unwrap();
        let before = curriculum.labels().to_vec();
        curriculum.begin_iteration(&mut rng).unwrap();
        assert_eq!(before, curriculum.labels());
    }

    #[test]
    fn test_shuffled_schedule_keeps_label_multiset() {
        let config = GtnConfig {
            learned_curriculum: false,
            label_schedule: LabelSchedule::Shuffled,
            batch_size: 40,
            ..GtnConfig::tiny()
        };
        let mut rng = StdRng::seed_from_u64(5);
        let mut curriculum = Curriculum::new(&config, &mut rng, &Device::Cpu).unwrap();
        let mut before = curriculum.labels().to_vec();
        curriculum.begin_iteration(&mut rng).unwrap();
        let mut after = curriculum.labels().to_vec();
        before.sort_unstable();
        after.sort_unstable();
        assert_eq!(before, after);
    }
}
