//! # Outer Loop: Meta-Training the Teacher
//!
//! One outer iteration:
//!
//! 1. Sample a fresh student (random widths).
//! 2. Unroll K inner steps on teacher-made batches, keeping the history.
//! 3. Score the final student snapshot on a real batch (the meta loss).
//! 4. Back-propagate the meta loss through all K steps.
//! 5. One Adam step on the teacher, the learnable lr / momentum and the
//!    learned curriculum.
//!
//! When the iteration budget is used up the update is skipped and the final
//! held-out accuracy is reported instead.

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::config::GtnConfig;
use crate::curriculum::Curriculum;
use crate::data::{DataLoader, DatasetSplits, ImageDataset};
use crate::error::GtnError;
use crate::functional::{correct_predictions, cross_entropy_one_hot, one_hot_tensor};
use crate::inner_loop::{unroll, InnerHyper, SyntheticBatch, Trajectory, UnrollMode};
use crate::metrics::{MetricsCollector, MetricsLogger};
use crate::params::enable_higher_order_grads;
use crate::student::{Student, StudentArch};
use crate::teacher::Teacher;
use crate::GtnResult;

/// Name under which the learned curriculum shows up in gradient reports
pub const CURRICULUM: &str = "curriculum";

/// What happened in one outer iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OuterStepReport {
    /// Iteration index, starting at 0
    pub iteration: usize,
    pub arch: StudentArch,
    /// Synthetic-batch loss at every inner step
    pub inner_losses: Vec<f32>,
    /// Real-batch loss of the final student
    pub meta_loss: f32,
    /// Real-batch accuracy of the final student
    pub train_accuracy: f64,
    /// Student learning rate used during the unroll
    pub inner_lr: f32,
    /// Student momentum used during the unroll
    pub inner_momentum: f32,
    /// Global norm of the teacher gradient before clipping
    pub grad_norm: f64,
    /// Teacher tensors that received no gradient (expected empty)
    pub missing_gradients: Vec<String>,
    pub elapsed_ms: f64,
}

impl OuterStepReport {
    /// First inner loss minus last inner loss
    pub fn inner_loss_drop(&self) -> f32 {
        match (self.inner_losses.first(), self.inner_losses.last()) {
            (Some(first), Some(last)) => first - last,
            _ => 0.0,
        }
    }
}

/// Result of [`GenerativeTeachingNetwork::iterate`]
#[derive(Debug, Clone)]
pub enum OuterOutcome {
    /// The teacher was updated
    Updated(OuterStepReport),
    /// Budget reached: no update, final held-out accuracy instead
    BudgetReached { arch: StudentArch, test_accuracy: f64 },
}

/// Summary of a full meta-training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub iterations: usize,
    pub reports: Vec<OuterStepReport>,
    /// `(iteration, accuracy)` of every periodic validation
    pub validation: Vec<(usize, f64)>,
    pub final_arch: StudentArch,
    pub final_test_accuracy: f64,
    pub final_inner_lr: f32,
    pub final_inner_momentum: f32,
}

/// Teacher, curriculum and the optimiser that trains them
pub struct GenerativeTeachingNetwork {
    config: GtnConfig,
    device: Device,
    teacher: Teacher,
    curriculum: Curriculum,
    optimizer: AdamW,
    rng: StdRng,
    iteration: usize,
}

impl GenerativeTeachingNetwork {
    pub fn new(config: GtnConfig, device: &Device) -> GtnResult<Self> {
        config.validate()?;
        enable_higher_order_grads();

        let mut rng = StdRng::seed_from_u64(config.seed);
        let teacher = Teacher::new(&config, &mut rng, device)?;
        let curriculum = Curriculum::new(&config, &mut rng, device)?;

        let mut vars = teacher.all_vars();
        if let Some(var) = curriculum.var() {
            vars.push(var.clone());
        }
        let optimizer = AdamW::new(
            vars,
            ParamsAdamW {
                lr: config.teacher_lr,
                beta1: config.beta1,
                beta2: config.beta2,
                eps: config.eps,
                weight_decay: 0.0,
            },
        )?;

        log::info!(
            "GTN ready: teacher {} params, curriculum {}, K={} steps, batch {}",
            teacher.num_parameters(),
            if curriculum.is_learned() { "learned" } else { "sampled" },
            config.inner_steps,
            config.batch_size
        );

        Ok(Self {
            config,
            device: device.clone(),
            teacher,
            curriculum,
            optimizer,
            rng,
            iteration: 0,
        })
    }

    pub fn config(&self) -> &GtnConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn teacher(&self) -> &Teacher {
        &self.teacher
    }

    pub fn curriculum(&self) -> &Curriculum {
        &self.curriculum
    }

    /// Completed teacher updates
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn budget_reached(&self) -> bool {
        self.iteration >= self.config.outer_iterations
    }

    /// Run-owned random source, for callers sampling on behalf of the run
    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Sample a student from the configured width ranges
    pub fn sample_student(&mut self) -> GtnResult<Student> {
        Student::sample(&self.config, &mut self.rng)
    }

    /// Teacher batch for inner step `step`, detached from the teacher
    pub fn synthesize(&mut self, step: usize) -> GtnResult<SyntheticBatch> {
        let noise = self.curriculum.noise(step, &mut self.rng)?;
        let images = self.teacher.forward(&noise, self.curriculum.one_hot())?;
        Ok(SyntheticBatch {
            images: images.detach(),
            one_hot: self.curriculum.one_hot().clone(),
        })
    }

    /// Train a freshly initialised `student` on teacher data for K steps
    pub fn train_student(&mut self, student: &Student, mode: UnrollMode) -> GtnResult<Trajectory> {
        let init = student.init_params(&mut self.rng, &self.device)?;
        let hyper = InnerHyper::new(
            self.teacher.inner_lr().clone(),
            self.teacher.inner_momentum().clone(),
        );
        let teacher = &self.teacher;
        let curriculum = &self.curriculum;
        let rng = &mut self.rng;
        unroll(student, init, &hyper, self.config.inner_steps, mode, |step| {
            let noise = curriculum.noise(step, rng)?;
            let images = teacher.forward(&noise, curriculum.one_hot())?;
            Ok(SyntheticBatch {
                images,
                one_hot: curriculum.one_hot().clone(),
            })
        })
    }

    /// Teacher variables plus the learned curriculum, sorted by name
    fn trainable(&self) -> GtnResult<Vec<(String, Var)>> {
        let mut vars = self.teacher.named_vars()?;
        if let Some(var) = self.curriculum.var() {
            vars.push((CURRICULUM.to_string(), var.clone()));
        }
        Ok(vars)
    }

    /// One full outer iteration with a teacher update
    pub fn outer_step(&mut self, real_x: &Tensor, real_y: &Tensor) -> GtnResult<OuterStepReport> {
        let start = Instant::now();
        let iteration = self.iteration;

        self.curriculum.begin_iteration(&mut self.rng)?;
        let student = self.sample_student()?;
        let (inner_lr, inner_momentum) = self.teacher.inner_hyper_values()?;

        let trajectory = self.train_student(&student, UnrollMode::Differentiable)?;
        let final_params = trajectory.final_params()?;

        let logits = student.forward(final_params, real_x)?;
        let targets = one_hot_tensor(real_y, self.config.num_classes)?;
        let meta_loss = cross_entropy_one_hot(&logits, &targets)?;
        let meta_value: f32 = meta_loss.to_scalar()?;
        if !meta_value.is_finite() {
            return Err(GtnError::divergence("meta loss", iteration, meta_value as f64));
        }
        let train_accuracy =
            correct_predictions(&logits, real_y)? as f64 / real_x.dim(0)?.max(1) as f64;

        let mut grads = meta_loss.backward()?;
        let vars = self.trainable()?;
        let missing_gradients = detach_grads(&mut grads, &vars);
        if !missing_gradients.is_empty() {
            log::warn!(
                "Iteration {}: no gradient for {:?}",
                iteration,
                missing_gradients
            );
        }

        let grad_norm = grad_norm(&grads, &vars)?;
        if !grad_norm.is_finite() {
            return Err(GtnError::divergence("teacher gradient norm", iteration, grad_norm));
        }
        if let Some(max_norm) = self.config.max_grad_norm {
            clip_grads(&mut grads, &vars, grad_norm, max_norm)?;
        }
        self.optimizer.step(&grads)?;
        self.iteration += 1;

        Ok(OuterStepReport {
            iteration,
            arch: student.arch(),
            inner_losses: trajectory.losses,
            meta_loss: meta_value,
            train_accuracy,
            inner_lr,
            inner_momentum,
            grad_norm,
            missing_gradients,
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Train a fresh student on the current teacher and score it on a real
    /// batch, without updating anything
    pub fn evaluate_student(&mut self, real_x: &Tensor, real_y: &Tensor) -> GtnResult<f64> {
        let student = self.sample_student()?;
        let trajectory = self.train_student(&student, UnrollMode::Detached)?;
        student.batch_accuracy(trajectory.final_params()?, real_x, real_y)
    }

    /// Train a fresh student on the current teacher and score it on `dataset`
    pub fn evaluate_dataset(&mut self, dataset: &ImageDataset) -> GtnResult<(StudentArch, f64)> {
        let student = self.sample_student()?;
        let trajectory = self.train_student(&student, UnrollMode::Detached)?;
        let accuracy =
            student.evaluate(trajectory.final_params()?, dataset, self.config.eval_batch_size)?;
        Ok((student.arch(), accuracy))
    }

    /// Update the teacher on one real batch, or report final test accuracy
    /// once the budget is reached
    pub fn iterate(
        &mut self,
        real_x: &Tensor,
        real_y: &Tensor,
        test: &ImageDataset,
    ) -> GtnResult<OuterOutcome> {
        if self.budget_reached() {
            let (arch, test_accuracy) = self.evaluate_dataset(test)?;
            return Ok(OuterOutcome::BudgetReached {
                arch,
                test_accuracy,
            });
        }
        Ok(OuterOutcome::Updated(self.outer_step(real_x, real_y)?))
    }

    /// Meta-train until the iteration budget is reached
    pub fn train(
        &mut self,
        splits: &DatasetSplits,
        logger: &mut MetricsLogger,
    ) -> GtnResult<TrainingSummary> {
        let mut loader = DataLoader::new(
            splits.train.clone(),
            self.config.batch_size,
            true,
            self.config.seed,
        );
        let mut collector = MetricsCollector::new(10);
        let mut reports = Vec::new();
        let mut validation = Vec::new();

        log::info!(
            "Meta-training for {} outer iterations on {} real samples",
            self.config.outer_iterations,
            splits.train.len()
        );

        loop {
            let (real_x, real_y) = loader.next_cycling()?;
            let report = match self.iterate(&real_x, &real_y, &splits.test)? {
                OuterOutcome::Updated(report) => report,
                OuterOutcome::BudgetReached {
                    arch,
                    test_accuracy,
                } => {
                    let (lr, momentum) = self.teacher.inner_hyper_values()?;
                    log::info!(
                        "Budget reached after {} iterations: test accuracy {:.2}% ({})",
                        self.iteration,
                        test_accuracy * 100.0,
                        arch
                    );
                    logger.log_scalar("eval/test_accuracy", test_accuracy, self.iteration)?;
                    logger.flush()?;
                    return Ok(TrainingSummary {
                        iterations: self.iteration,
                        reports,
                        validation,
                        final_arch: arch,
                        final_test_accuracy: test_accuracy,
                        final_inner_lr: lr,
                        final_inner_momentum: momentum,
                    });
                }
            };

            collector.record(report.meta_loss as f64, report.train_accuracy);
            logger.log_outer_step(&report)?;

            let done = report.iteration + 1;
            if self.config.log_every > 0 && done % self.config.log_every == 0 {
                log::info!(
                    "Iter {:4} | {} | inner {:.3} -> {:.3} (drop {:.3}) | meta {:.4} | acc {:.2}% (avg {:.2}%) | lr {:.4} m {:.3} | {:.0}ms",
                    report.iteration,
                    report.arch,
                    report.inner_losses.first().copied().unwrap_or(f32::NAN),
                    report.inner_losses.last().copied().unwrap_or(f32::NAN),
                    report.inner_loss_drop(),
                    report.meta_loss,
                    report.train_accuracy * 100.0,
                    collector.avg_accuracy() * 100.0,
                    report.inner_lr,
                    report.inner_momentum,
                    report.elapsed_ms
                );
            }
            if self.config.eval_every > 0 && done % self.config.eval_every == 0 {
                let (arch, accuracy) = self.evaluate_dataset(&splits.validation)?;
                log::info!(
                    "Iter {:4} | validation accuracy {:.2}% ({})",
                    report.iteration,
                    accuracy * 100.0,
                    arch
                );
                logger.log_scalar("eval/validation_accuracy", accuracy, done)?;
                validation.push((done, accuracy));
            }
            reports.push(report);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// GRADIENT UTILITIES
// ═══════════════════════════════════════════════════════════════════════════

/// Replace every tracked gradient by a detached copy, returning the names of
/// variables without one
fn detach_grads(grads: &mut GradStore, vars: &[(String, Var)]) -> Vec<String> {
    let mut missing = Vec::new();
    for (name, var) in vars {
        match grads.remove(var.as_tensor()) {
            Some(grad) => {
                grads.insert(var.as_tensor(), grad.detach());
            }
            None => missing.push(name.clone()),
        }
    }
    missing
}

/// Global L2 norm of the gradients of `vars`
fn grad_norm(grads: &GradStore, vars: &[(String, Var)]) -> GtnResult<f64> {
    let mut total_norm_sq = 0.0f64;
    for (_, var) in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let norm_sq: f32 = grad.sqr()?.sum_all()?.to_scalar()?;
            total_norm_sq += norm_sq as f64;
        }
    }
    Ok(total_norm_sq.sqrt())
}

/// Scale gradients down so their global norm is at most `max_norm`
fn clip_grads(
    grads: &mut GradStore,
    vars: &[(String, Var)],
    total_norm: f64,
    max_norm: f64,
) -> GtnResult<()> {
    if total_norm <= max_norm {
        return Ok(());
    }
    let clip_coef = max_norm / (total_norm + 1e-6);
    for (_, var) in vars {
        if let Some(grad) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), (grad * clip_coef)?);
        }
    }
    Ok(())
}
