//! # Random Architecture Search
//!
//! Uses a trained teacher as a cheap proxy for real training: each trial
//! samples student widths, trains the student for K steps on teacher data
//! only, and scores it on the validation split. The teacher and curriculum
//! stay frozen.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::{StudentConfig, WidthSpec};
use crate::data::ImageDataset;
use crate::error::GtnError;
use crate::inner_loop::UnrollMode;
use crate::meta::GenerativeTeachingNetwork;
use crate::student::{Student, StudentArch};
use crate::GtnResult;

/// Search space and budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    pub trials: usize,
    pub conv1: WidthSpec,
    pub conv2: WidthSpec,
    /// Chunk size for validation accuracy
    pub eval_batch_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            trials: 10,
            conv1: WidthSpec::random(1, 64),
            conv2: WidthSpec::random(1, 128),
            eval_batch_size: 500,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> GtnResult<()> {
        if self.trials == 0 {
            return Err(GtnError::InvalidConfig("search needs at least one trial".to_string()));
        }
        self.conv1.validate()?;
        self.conv2.validate()
    }
}

/// Outcome of one trial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial: usize,
    pub arch: StudentArch,
    pub validation_accuracy: f64,
    /// Synthetic-batch loss after the last inner step
    pub final_inner_loss: f32,
}

/// All trials plus the winner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchReport {
    pub trials: Vec<TrialResult>,
    /// Index into `trials`
    pub best: usize,
    /// Best architecture retrained and scored on the test split
    pub best_test_accuracy: Option<f64>,
}

impl SearchReport {
    pub fn best_trial(&self) -> &TrialResult {
        &self.trials[self.best]
    }

    pub fn best_accuracy(&self) -> f64 {
        self.best_trial().validation_accuracy
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> GtnResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| GtnError::SerializationError(e.to_string()))?;
        fs::write(path.as_ref(), json)
            .map_err(|e| GtnError::Io(format!("Failed to write search report: {}", e)))?;
        Ok(())
    }
}

/// Index of the highest accuracy, earliest on ties
fn best_index(trials: &[TrialResult]) -> usize {
    let mut best = 0;
    for (i, trial) in trials.iter().enumerate().skip(1) {
        if trial.validation_accuracy > trials[best].validation_accuracy {
            best = i;
        }
    }
    best
}

/// Random search over student widths
pub struct ArchitectureSearch {
    config: SearchConfig,
}

impl ArchitectureSearch {
    pub fn new(config: SearchConfig) -> GtnResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    fn train_and_score(
        &self,
        gtn: &mut GenerativeTeachingNetwork,
        student: &Student,
        dataset: &ImageDataset,
    ) -> GtnResult<(f64, f32)> {
        let trajectory = gtn.train_student(student, UnrollMode::Detached)?;
        let accuracy = student.evaluate(
            trajectory.final_params()?,
            dataset,
            self.config.eval_batch_size,
        )?;
        let loss = trajectory.losses.last().copied().unwrap_or(f32::NAN);
        Ok((accuracy, loss))
    }

    /// Run every trial against `validation`; optionally score the winner on
    /// `test`
    pub fn run(
        &self,
        gtn: &mut GenerativeTeachingNetwork,
        validation: &ImageDataset,
        test: Option<&ImageDataset>,
    ) -> GtnResult<SearchReport> {
        let widths = StudentConfig {
            conv1: self.config.conv1,
            conv2: self.config.conv2,
            ..gtn.config().student.clone()
        };
        let config = gtn.config().clone();

        log::info!(
            "Architecture search: {} trials over conv1 {:?}, conv2 {:?}",
            self.config.trials,
            self.config.conv1,
            self.config.conv2
        );

        let mut trials = Vec::with_capacity(self.config.trials);
        for trial in 0..self.config.trials {
            let student = Student::sample_with(&widths, &config, gtn.rng_mut())?;
            let (validation_accuracy, final_inner_loss) =
                self.train_and_score(gtn, &student, validation)?;
            log::info!(
                "Trial {:3} | {} | inner loss {:.4} | validation {:.2}%",
                trial,
                student.arch(),
                final_inner_loss,
                validation_accuracy * 100.0
            );
            trials.push(TrialResult {
                trial,
                arch: student.arch(),
                validation_accuracy,
                final_inner_loss,
            });
        }

        let best = best_index(&trials);
        let best_test_accuracy = match test {
            Some(test) => {
                let student = Student::new(trials[best].arch, &config)?;
                let (accuracy, _) = self.train_and_score(gtn, &student, test)?;
                Some(accuracy)
            }
            None => None,
        };

        log::info!(
            "Best architecture: {} (validation {:.2}%{})",
            trials[best].arch,
            trials[best].validation_accuracy * 100.0,
            best_test_accuracy
                .map(|a| format!(", test {:.2}%", a * 100.0))
                .unwrap_or_default()
        );

        Ok(SearchReport {
            trials,
            best,
            best_test_accuracy,
        })
    }
}
