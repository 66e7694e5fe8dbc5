//! # Teaching Metrics and Logging
//!
//! Tensorboard scalars for a teaching run plus a rolling window used for the
//! smoothed console report.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use generative_teaching::metrics::MetricsLogger;
//!
//! let mut logger = MetricsLogger::new("./runs")?;
//! logger.log_outer_step(&report)?;
//! logger.log_scalar("eval/validation_accuracy", 0.91, 10)?;
//! logger.flush()?;
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use tensorboard_rs::summary_writer::SummaryWriter;

use crate::meta::OuterStepReport;
use crate::GtnResult;

/// Metrics logger with Tensorboard support
pub struct MetricsLogger {
    /// Tensorboard summary writer (None if disabled)
    writer: Option<SummaryWriter>,
    log_dir: PathBuf,
    enabled: bool,
}

impl MetricsLogger {
    /// Create a logger writing into a timestamped run directory under `log_dir`
    pub fn new(log_dir: impl AsRef<Path>) -> GtnResult<Self> {
        let log_dir = log_dir.as_ref();

        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let run_dir = log_dir.join(format!("gtn_{}", timestamp));
        fs::create_dir_all(&run_dir)?;

        let writer = SummaryWriter::new(&run_dir);

        log::info!("Tensorboard logs: {:?}", run_dir);
        log::info!("View with: tensorboard --logdir {:?}", log_dir);

        Ok(Self {
            writer: Some(writer),
            log_dir: run_dir,
            enabled: true,
        })
    }

    /// Logger that drops everything
    pub fn disabled() -> Self {
        Self {
            writer: None,
            log_dir: PathBuf::new(),
            enabled: false,
        }
    }

    pub fn log_scalar(&mut self, tag: &str, value: f64, step: usize) -> GtnResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(ref mut writer) = self.writer {
            writer.add_scalar(tag, value as f32, step);
        }
        Ok(())
    }

    pub fn log_scalars(&mut self, values: &[(&str, f64)], step: usize) -> GtnResult<()> {
        for (tag, value) in values {
            self.log_scalar(tag, *value, step)?;
        }
        Ok(())
    }

    /// Scalars of one outer iteration
    pub fn log_outer_step(&mut self, report: &OuterStepReport) -> GtnResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let step = report.iteration;
        self.log_scalars(
            &[
                ("meta/loss", report.meta_loss as f64),
                ("meta/train_accuracy", report.train_accuracy),
                ("meta/grad_norm", report.grad_norm),
                ("inner/lr", report.inner_lr as f64),
                ("inner/momentum", report.inner_momentum as f64),
            ],
            step,
        )?;
        if let (Some(first), Some(last)) = (report.inner_losses.first(), report.inner_losses.last()) {
            self.log_scalar("inner/first_loss", *first as f64, step)?;
            self.log_scalar("inner/last_loss", *last as f64, step)?;
            self.log_scalar("inner/loss_drop", report.inner_loss_drop() as f64, step)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> GtnResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(ref mut writer) = self.writer {
            writer.flush();
        }
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Drop for MetricsLogger {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.flush();
        }
    }
}

/// Rolling window over recent outer iterations
#[derive(Debug, Default)]
pub struct MetricsCollector {
    meta_losses: Vec<f64>,
    accuracies: Vec<f64>,
    window_size: usize,
}

impl MetricsCollector {
    pub fn new(window_size: usize) -> Self {
        Self {
            meta_losses: Vec::with_capacity(window_size),
            accuracies: Vec::with_capacity(window_size),
            window_size: window_size.max(1),
        }
    }

    pub fn record(&mut self, meta_loss: f64, accuracy: f64) {
        self.meta_losses.push(meta_loss);
        self.accuracies.push(accuracy);

        if self.meta_losses.len() > self.window_size {
            self.meta_losses.remove(0);
        }
        if self.accuracies.len() > self.window_size {
            self.accuracies.remove(0);
        }
    }

    pub fn avg_meta_loss(&self) -> f64 {
        mean(&self.meta_losses)
    }

    pub fn avg_accuracy(&self) -> f64 {
        mean(&self.accuracies)
    }

    pub fn len(&self) -> usize {
        self.meta_losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meta_losses.is_empty()
    }

    pub fn clear(&mut self) {
        self.meta_losses.clear();
        self.accuracies.clear();
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
