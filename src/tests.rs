//! Integration Tests for Generative Teaching
//!
//! Scenarios spanning several modules: full outer iterations, budget
//! termination, architecture search and the style-based components.

use crate::config::{GtnConfig, StudentConfig, TeacherConfig, WidthSpec};
use crate::data::{DatasetSplits, ImageDataset};
use crate::inner_loop::UnrollMode;
use crate::meta::{GenerativeTeachingNetwork, CURRICULUM};
use crate::metrics::MetricsLogger;
use crate::search::{ArchitectureSearch, SearchConfig};
use candle_core::{Device, Tensor};

fn real_batch(config: &GtnConfig, seed: u64) -> (Tensor, Tensor) {
    let ds = ImageDataset::synthetic_blocks(
        config.batch_size,
        config.image_size,
        config.num_classes,
        0.2,
        seed,
        &Device::Cpu,
    )
    .unwrap();
    (ds.images().clone(), ds.labels().clone())
}

fn tiny_splits() -> DatasetSplits {
    DatasetSplits::synthetic(60, 30, 8, 10, 3, &Device::Cpu).unwrap().0
}

// ═══════════════════════════════════════════════════════════════════════════
// OUTER LOOP TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod outer_loop_tests {
    use super::*;

    #[test]
    fn test_every_teacher_tensor_receives_gradient() {
        let config = GtnConfig::tiny();
        let mut gtn = GenerativeTeachingNetwork::new(config.clone(), &Device::Cpu).unwrap();
        let (x, y) = real_batch(&config, 0);

        let report = gtn.outer_step(&x, &y).unwrap();
        assert!(report.meta_loss > 0.0);
        assert!(
            report.missing_gradients.is_empty(),
            "missing: {:?}",
            report.missing_gradients
        );
        assert!(gtn.curriculum().var().is_some());
        assert!(report.grad_norm > 0.0);
        assert!(!report.missing_gradients.contains(&CURRICULUM.to_string()));
    }

    #[test]
    fn test_sampled_noise_run_without_curriculum() {
        let config = GtnConfig {
            learned_curriculum: false,
            ..GtnConfig::tiny()
        };
        let mut gtn = GenerativeTeachingNetwork::new(config.clone(), &Device::Cpu).unwrap();
        let (x, y) = real_batch(&config, 1);
        let report = gtn.outer_step(&x, &y).unwrap();
        assert!(report.missing_gradients.is_empty());
        assert!(gtn.curriculum().var().is_none());
    }

    #[test]
    fn test_first_iteration_inner_losses_decrease() {
        let config = GtnConfig {
            seed: 0,
            image_size: 8,
            noise_width: 64,
            num_classes: 10,
            inner_steps: 32,
            batch_size: 40,
            teacher: TeacherConfig {
                hidden: 128,
                channels: 16,
                ..TeacherConfig::default()
            },
            student: StudentConfig {
                conv1: WidthSpec::Fixed(8),
                conv2: WidthSpec::Fixed(16),
                ..StudentConfig::default()
            },
            ..GtnConfig::default()
        };
        let mut gtn = GenerativeTeachingNetwork::new(config.clone(), &Device::Cpu).unwrap();
        let (x, y) = real_batch(&config, 2);

        let report = gtn.outer_step(&x, &y).unwrap();
        let losses = &report.inner_losses;
        assert_eq!(losses.len(), 32);
        let q = losses.len() / 4;
        let first: f32 = losses[..q].iter().sum::<f32>() / q as f32;
        let last: f32 = losses[losses.len() - q..].iter().sum::<f32>() / q as f32;
        assert!(first > last, "inner losses {:?}", losses);
    }

    #[test]
    fn test_same_seed_same_first_iteration() {
        let config = GtnConfig::tiny();
        let (x, y) = real_batch(&config, 4);
        let mut a = GenerativeTeachingNetwork::new(config.clone(), &Device::Cpu).unwrap();
        let mut b = GenerativeTeachingNetwork::new(config, &Device::Cpu).unwrap();
        let ra = a.outer_step(&x, &y).unwrap();
        let rb = b.outer_step(&x, &y).unwrap();
        assert_eq!(ra.arch, rb.arch);
        assert!((ra.meta_loss - rb.meta_loss).abs() < 1e-5);
    }

    #[test]
    fn test_zero_lr_student_keeps_initial_params() {
        let config = GtnConfig::tiny();
        let mut gtn = GenerativeTeachingNetwork::new(config, &Device::Cpu).unwrap();
        gtn.teacher().set_inner_lr(0.0).unwrap();
        let student = gtn.sample_student().unwrap();
        let trajectory = gtn.train_student(&student, UnrollMode::Detached).unwrap();
        let first = &trajectory.snapshots[0];
        let last = trajectory.final_params().unwrap();
        assert_eq!(first.max_abs_diff(last).unwrap(), 0.0);
    }

    #[test]
    fn test_train_stops_at_budget_with_test_accuracy() {
        let config = GtnConfig::tiny();
        let splits = tiny_splits();
        let mut gtn = GenerativeTeachingNetwork::new(config.clone(), &Device::Cpu).unwrap();
        let mut logger = MetricsLogger::disabled();

        let summary = gtn.train(&splits, &mut logger).unwrap();
        assert_eq!(summary.iterations, config.outer_iterations);
        assert_eq!(summary.reports.len(), config.outer_iterations);
        assert_eq!(summary.validation.len(), config.outer_iterations);
        assert!((0.0..=1.0).contains(&summary.final_test_accuracy));
        assert!(gtn.budget_reached());
    }

    #[test]
    fn test_summary_serialises() {
        let config = GtnConfig {
            outer_iterations: 1,
            ..GtnConfig::tiny()
        };
        let splits = tiny_splits();
        let mut gtn = GenerativeTeachingNetwork::new(config, &Device::Cpu).unwrap();
        let summary = gtn.train(&splits, &mut MetricsLogger::disabled()).unwrap();
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("final_test_accuracy"));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SEARCH TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod search_tests {
    use super::*;

    #[test]
    fn test_search_reports_best_of_ten_trials() {
        let config = GtnConfig::tiny();
        let splits = tiny_splits();
        let mut gtn = GenerativeTeachingNetwork::new(config, &Device::Cpu).unwrap();
        let search = ArchitectureSearch::new(SearchConfig::default()).unwrap();

        let report = search
            .run(&mut gtn, &splits.validation, Some(&splits.test))
            .unwrap();
        assert_eq!(report.trials.len(), 10);
        for trial in &report.trials {
            assert!((1..64).contains(&trial.arch.conv1));
            assert!((1..128).contains(&trial.arch.conv2));
            assert!(report.best_accuracy() >= trial.validation_accuracy);
        }
        let test_acc = report.best_test_accuracy.unwrap();
        assert!((0.0..=1.0).contains(&test_acc));
    }

    #[test]
    fn test_search_leaves_teacher_frozen() {
        let config = GtnConfig::tiny();
        let splits = tiny_splits();
        let mut gtn = GenerativeTeachingNetwork::new(config, &Device::Cpu).unwrap();
        let before = gtn.teacher().inner_hyper_values().unwrap();
        let search = ArchitectureSearch::new(SearchConfig {
            trials: 2,
            conv1: WidthSpec::random(1, 4),
            conv2: WidthSpec::random(1, 4),
            ..SearchConfig::default()
        })
        .unwrap();
        search.run(&mut gtn, &splits.validation, None).unwrap();
        assert_eq!(before, gtn.teacher().inner_hyper_values().unwrap());
        assert_eq!(gtn.iteration(), 0);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// STYLE-BASED COMPONENT TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod stylegan_tests {
    use crate::stylegan::{PathLengthRegularizer, SynthesisConfig, SynthesisNetwork};
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_path_length_training_step() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = SynthesisConfig {
            latent_dim: 8,
            channels: 4,
            ..SynthesisConfig::default()
        };
        let net = SynthesisNetwork::new(config, vb).unwrap();
        let mut opt = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: 1e-3,
                weight_decay: 0.0,
                ..ParamsAdamW::default()
            },
        )
        .unwrap();

        let mut reg = PathLengthRegularizer::default();
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..2 {
            let w = Tensor::randn(0f32, 1.0, (3, 8), &Device::Cpu).unwrap();
            let out = reg
                .penalty(&w, |w| net.forward(w), &mut rng)
                .unwrap()
                .unwrap();
            let penalty: f32 = out.penalty.to_scalar().unwrap();
            assert!(penalty.is_finite());
            opt.backward_step(&out.penalty).unwrap();
        }
        assert!(reg.running_mean() > 0.0);
        assert_eq!(reg.calls(), 2);
    }
}
