//! # Run Configuration
//!
//! Every hyper-parameter of a teaching run lives in [`GtnConfig`] and is
//! handed to each component at construction. Nothing is read from globals.
//!
//! ```rust,ignore
//! use generative_teaching::config::GtnConfig;
//!
//! let config = GtnConfig::quick();
//! config.validate()?;
//! config.to_json_file("run.json")?;
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::GtnError;
use crate::GtnResult;

// ═══════════════════════════════════════════════════════════════════════════
// WIDTH SPECIFICATION
// ═══════════════════════════════════════════════════════════════════════════

/// Channel width of a student stage: drawn at random or pinned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WidthSpec {
    /// Uniform in `[low, high)`
    Random { low: usize, high: usize },
    /// Always exactly this width
    Fixed(usize),
}

impl WidthSpec {
    pub fn random(low: usize, high: usize) -> Self {
        WidthSpec::Random { low, high }
    }

    /// Draw a concrete width
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> GtnResult<usize> {
        self.validate()?;
        Ok(match *self {
            WidthSpec::Random { low, high } => rng.gen_range(low..high),
            WidthSpec::Fixed(width) => width,
        })
    }

    pub fn validate(&self) -> GtnResult<()> {
        match *self {
            WidthSpec::Random { low, high } => {
                if low == 0 || low >= high {
                    return Err(GtnError::InvalidConfig(format!(
                        "width range [{}, {}) must be non-empty and start at 1 or more",
                        low, high
                    )));
                }
            }
            WidthSpec::Fixed(width) => {
                if width == 0 {
                    return Err(GtnError::InvalidConfig(
                        "fixed width must be at least 1".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LABEL SCHEDULE
// ═══════════════════════════════════════════════════════════════════════════

/// How synthetic labels are assigned to the rows of each inner-loop batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelSchedule {
    /// `row % num_classes`, identical for every step and every outer iteration
    Cyclic,
    /// Cyclic labels re-permuted at the start of each outer iteration
    Shuffled,
}

// ═══════════════════════════════════════════════════════════════════════════
// COMPONENT CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

/// Generator ("teacher") network shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeacherConfig {
    /// Width of the first fully connected layer
    pub hidden: usize,
    /// Channels of the quarter-resolution feature map
    pub channels: usize,
    /// Negative slope of the leaky ReLUs
    pub leaky_slope: f64,
    /// Batch-norm epsilon
    pub bn_eps: f64,
}

impl Default for TeacherConfig {
    fn default() -> Self {
        Self {
            hidden: 1024,
            channels: 128,
            leaky_slope: 0.1,
            bn_eps: 1e-5,
        }
    }
}

/// Student ("learner") network shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentConfig {
    pub conv1: WidthSpec,
    pub conv2: WidthSpec,
    pub leaky_slope: f64,
    pub bn_eps: f64,
}

impl Default for StudentConfig {
    fn default() -> Self {
        Self {
            conv1: WidthSpec::random(32, 64),
            conv2: WidthSpec::random(64, 128),
            leaky_slope: 0.1,
            bn_eps: 1e-5,
        }
    }
}

/// Complete configuration of a teaching run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GtnConfig {
    /// Seed for every sampler owned by the run
    pub seed: u64,
    /// Side length of the square single-channel images
    pub image_size: usize,
    /// Number of classes
    pub num_classes: usize,
    /// Width of the generator noise vector
    pub noise_width: usize,
    /// Rows per synthetic and per real batch
    pub batch_size: usize,
    /// Unrolled student steps per outer iteration
    pub inner_steps: usize,
    /// Teacher updates before the final held-out evaluation
    pub outer_iterations: usize,
    /// Starting value of the learnable student learning rate
    pub initial_inner_lr: f64,
    /// Starting value of the learnable student momentum
    pub initial_inner_momentum: f64,
    /// Adam learning rate for the teacher
    pub teacher_lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// Clip the teacher gradient to this global norm
    pub max_grad_norm: Option<f64>,
    /// Optimise the noise curriculum alongside the teacher
    pub learned_curriculum: bool,
    pub label_schedule: LabelSchedule,
    /// Normalisation statistics of the real data
    pub data_mean: f64,
    pub data_std: f64,
    /// Validation accuracy every N outer iterations (0 disables)
    pub eval_every: usize,
    /// Chunk size for held-out accuracy
    pub eval_batch_size: usize,
    /// Log every N outer iterations
    pub log_every: usize,
    pub teacher: TeacherConfig,
    pub student: StudentConfig,
}

impl Default for GtnConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            image_size: 28,
            num_classes: 10,
            noise_width: 64,
            batch_size: 128,
            inner_steps: 32,
            outer_iterations: 200,
            initial_inner_lr: 0.02,
            initial_inner_momentum: 0.5,
            teacher_lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            max_grad_norm: None,
            learned_curriculum: true,
            label_schedule: LabelSchedule::Cyclic,
            data_mean: 0.1307,
            data_std: 0.3081,
            eval_every: 10,
            eval_batch_size: 500,
            log_every: 1,
            teacher: TeacherConfig::default(),
            student: StudentConfig::default(),
        }
    }
}

impl GtnConfig {
    /// Configuration for quick experiments on CPU
    pub fn quick() -> Self {
        Self {
            batch_size: 64,
            inner_steps: 8,
            outer_iterations: 50,
            eval_every: 10,
            teacher: TeacherConfig {
                hidden: 256,
                channels: 32,
                ..TeacherConfig::default()
            },
            student: StudentConfig {
                conv1: WidthSpec::random(8, 16),
                conv2: WidthSpec::random(16, 32),
                ..StudentConfig::default()
            },
            ..Self::default()
        }
    }

    /// Minimal configuration for tests and benchmarks
    pub fn tiny() -> Self {
        Self {
            image_size: 8,
            noise_width: 8,
            batch_size: 10,
            inner_steps: 3,
            outer_iterations: 2,
            eval_every: 1,
            eval_batch_size: 50,
            teacher: TeacherConfig {
                hidden: 32,
                channels: 4,
                ..TeacherConfig::default()
            },
            student: StudentConfig {
                conv1: WidthSpec::random(2, 4),
                conv2: WidthSpec::random(2, 6),
                ..StudentConfig::default()
            },
            ..Self::default()
        }
    }

    /// Check the configuration for values no component can run with
    pub fn validate(&self) -> GtnResult<()> {
        if self.image_size < 4 || self.image_size % 4 != 0 {
            return Err(GtnError::InvalidConfig(format!(
                "image_size must be a positive multiple of 4, got {}",
                self.image_size
            )));
        }
        if self.num_classes < 2 {
            return Err(GtnError::InvalidConfig(format!(
                "num_classes must be at least 2, got {}",
                self.num_classes
            )));
        }
        if self.noise_width == 0 || self.batch_size == 0 || self.eval_batch_size == 0 {
            return Err(GtnError::InvalidConfig(
                "noise_width, batch_size and eval_batch_size must be non-zero".to_string(),
            ));
        }
        if !(self.data_std > 0.0) {
            return Err(GtnError::InvalidConfig(format!(
                "data_std must be positive, got {}",
                self.data_std
            )));
        }
        if self.teacher_lr <= 0.0 || self.eps <= 0.0 {
            return Err(GtnError::InvalidConfig(
                "teacher_lr and eps must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(GtnError::InvalidConfig(
                "Adam betas must lie in [0, 1)".to_string(),
            ));
        }
        if let Some(norm) = self.max_grad_norm {
            if norm <= 0.0 {
                return Err(GtnError::InvalidConfig(
                    "max_grad_norm must be positive".to_string(),
                ));
            }
        }
        if self.teacher.hidden == 0 || self.teacher.channels == 0 {
            return Err(GtnError::InvalidConfig(
                "teacher hidden and channel widths must be non-zero".to_string(),
            ));
        }
        if self.learned_curriculum && self.label_schedule == LabelSchedule::Shuffled {
            return Err(GtnError::InvalidConfig(
                "a learned curriculum is tied to the cyclic label order".to_string(),
            ));
        }
        self.student.conv1.validate()?;
        self.student.conv2.validate()?;
        Ok(())
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> GtnResult<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| GtnError::Io(format!("Failed to read config: {}", e)))?;
        let config: GtnConfig = serde_json::from_str(&content)
            .map_err(|e| GtnError::SerializationError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> GtnResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| GtnError::SerializationError(e.to_string()))?;
        fs::write(path.as_ref(), json)
            .map_err(|e| GtnError::Io(format!("Failed to write config: {}", e)))?;
        Ok(())
    }
}
