//! # Generative Teaching Networks
//!
//! A generator ("teacher") learns to synthesize training data such that a
//! freshly initialised classifier ("student"), trained for a handful of SGD
//! steps on that data alone, performs well on real data. The teacher is
//! trained by differentiating the student's real-data loss through the whole
//! unrolled inner loop.
//!
//! Alongside, the crate carries two style-based generator components:
//! modulated/demodulated convolution and path-length regularization.
//!
//! ## Features
//! - Bi-level optimisation with second-order gradients through K student steps
//! - Learnable student learning rate, momentum and noise curriculum
//! - Random architecture search with the trained teacher as a proxy
//! - Modulated convolution with per-sample and grouped evaluation
//! - Path-length regularization with a running average and lazy interval
//! - CPU/GPU execution via candle-core
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────────── outer loop (Adam on teacher) ─────────────────┐
//!              │                                                               │
//!  curriculum ─┤   noise_t ─► Teacher ─► x_t ─┐                                │
//!              │                              ▼                                │
//!              │   θ_0 ─► step ─► θ_1 ─► ... ─► θ_K ─► Student(θ_K, real) ─► L ─┘
//!              │          (lr, momentum)
//!              └────────────────────────────────────────────────────────────────
//! ```

// Core modules
pub mod config;
pub mod error;
pub mod functional;
pub mod params;

// Networks
pub mod curriculum;
pub mod student;
pub mod teacher;

// Training
pub mod inner_loop;
pub mod meta;
pub mod search;

// Data and reporting
pub mod data;
pub mod grid;
pub mod metrics;

// Style-based generator components
pub mod stylegan;

// Integration tests
#[cfg(test)]
mod tests;

pub use config::{GtnConfig, LabelSchedule, StudentConfig, TeacherConfig, WidthSpec};
pub use curriculum::Curriculum;
pub use data::{DataLoader, DatasetSplits, ImageDataset};
pub use error::GtnError;
pub use inner_loop::{InnerHyper, MomentumState, SyntheticBatch, Trajectory, UnrollMode};
pub use meta::{GenerativeTeachingNetwork, OuterOutcome, OuterStepReport, TrainingSummary};
pub use metrics::{MetricsCollector, MetricsLogger};
pub use params::{enable_higher_order_grads, ParamSnapshot};
pub use search::{ArchitectureSearch, SearchConfig, SearchReport, TrialResult};
pub use student::{Student, StudentArch};
pub use stylegan::{
    ConvStrategy, ModConvConfig, ModulatedConv2d, PathLengthRegularizer, SynthesisConfig,
    SynthesisNetwork,
};
pub use teacher::Teacher;

/// Result type for generative teaching operations
pub type GtnResult<T> = Result<T, GtnError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        // Configuration
        GtnConfig,
        SearchConfig,
        WidthSpec,
        LabelSchedule,

        // Training
        GenerativeTeachingNetwork,
        ArchitectureSearch,
        Student,
        Teacher,
        UnrollMode,

        // Data
        DatasetSplits,
        ImageDataset,
        MetricsLogger,

        // Style-based components
        ModulatedConv2d,
        PathLengthRegularizer,

        // Result type
        GtnResult,
        GtnError,
    };
}
