//! # Generative Teaching Network Training CLI
//!
//! Meta-trains a teacher, then runs a random architecture search with the
//! trained teacher as the training-data source.
//!
//! ## Usage
//!
//! ```bash
//! # Quick run on the built-in synthetic dataset
//! cargo run --release --bin gtn_train -- --preset quick
//!
//! # MNIST from a directory of IDX files (raw or .gz)
//! cargo run --release --bin gtn_train -- --mnist data/mnist --iterations 200
//!
//! # Load a JSON config and write reports
//! cargo run --release --bin gtn_train -- --config run.json --out runs/gtn
//! ```

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, ValueEnum};
use std::fs;
use std::path::PathBuf;
use generative_teaching::{
    data::{load_mnist_dir, DatasetSplits},
    grid::save_grid,
    ArchitectureSearch, GenerativeTeachingNetwork, GtnConfig, MetricsLogger, SearchConfig,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    Default,
    Quick,
    Tiny,
}

/// Generative Teaching Network trainer
#[derive(Parser, Debug)]
#[command(name = "gtn_train")]
#[command(about = "Meta-train a data-generating teacher and search student architectures")]
struct Args {
    /// Configuration preset (ignored when --config is given)
    #[arg(long, value_enum, default_value = "quick")]
    preset: Preset,

    /// JSON configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Directory with MNIST IDX files; synthetic data when omitted
    #[arg(long)]
    mnist: Option<PathBuf>,

    /// Override the number of outer iterations
    #[arg(long, short = 'i')]
    iterations: Option<usize>,

    /// Override the number of inner steps
    #[arg(long, short = 'k')]
    inner_steps: Option<usize>,

    /// Override the seed
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Disable the learned curriculum
    #[arg(long)]
    no_curriculum: bool,

    /// Architecture-search trials (0 skips the search)
    #[arg(long, default_value = "10")]
    trials: usize,

    /// Fraction of the training split held out for validation
    #[arg(long, default_value = "0.1")]
    validation_fraction: f64,

    /// Output directory for reports, image grid and Tensorboard logs
    #[arg(long, short = 'o', default_value = "runs/gtn")]
    out: PathBuf,

    /// Write Tensorboard scalars
    #[arg(long)]
    tensorboard: bool,
}

fn build_config(args: &Args) -> Result<GtnConfig> {
    let mut config = match &args.config {
        Some(path) => GtnConfig::from_json_file(path)
            .with_context(|| format!("loading config {:?}", path))?,
        None => match args.preset {
            Preset::Default => GtnConfig::default(),
            Preset::Quick => GtnConfig::quick(),
            Preset::Tiny => GtnConfig::tiny(),
        },
    };
    if let Some(iterations) = args.iterations {
        config.outer_iterations = iterations;
    }
    if let Some(steps) = args.inner_steps {
        config.inner_steps = steps;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if args.no_curriculum {
        config.learned_curriculum = false;
    }
    config.validate()?;
    Ok(config)
}

fn select_device() -> Device {
    if cfg!(feature = "cuda") {
        match Device::cuda_if_available(0) {
            Ok(d) => {
                println!("🚀 Using CUDA device");
                d
            }
            Err(_) => {
                println!("💻 CUDA not available, using CPU");
                Device::Cpu
            }
        }
    } else {
        println!("💻 Using CPU device");
        Device::Cpu
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              Generative Teaching Network Trainer             ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let args = Args::parse();
    let mut config = build_config(&args)?;
    let device = select_device();
    fs::create_dir_all(&args.out).with_context(|| format!("creating {:?}", args.out))?;

    let splits = match &args.mnist {
        Some(dir) => {
            println!("📂 Loading MNIST from: {:?}", dir);
            let (train, test) = load_mnist_dir(dir, &device)?;
            config.image_size = train.image_size();
            config.validate()?;
            DatasetSplits::from_train_test(train, test, args.validation_fraction)?
                .normalized(config.data_mean, config.data_std)?
        }
        None => {
            println!("⚠️  No data directory given, using synthetic block images");
            let (splits, (mean, std)) = DatasetSplits::synthetic(
                2000,
                500,
                config.image_size,
                config.num_classes,
                config.seed,
                &device,
            )?;
            // teacher output must match the normalisation the data was given
            config.data_mean = mean;
            config.data_std = std;
            splits
        }
    };
    println!(
        "   Train: {} | Validation: {} | Test: {}",
        splits.train.len(),
        splits.validation.len(),
        splits.test.len()
    );
    config.to_json_file(args.out.join("config.json"))?;

    let mut logger = if args.tensorboard {
        MetricsLogger::new(args.out.join("tensorboard"))?
    } else {
        MetricsLogger::disabled()
    };

    println!("\n═══ Meta-training ═══");
    let mut gtn = GenerativeTeachingNetwork::new(config, &device)?;
    let summary = gtn.train(&splits, &mut logger)?;
    println!(
        "✅ {} iterations | final test accuracy {:.2}% ({}) | lr {:.4} | momentum {:.3}",
        summary.iterations,
        summary.final_test_accuracy * 100.0,
        summary.final_arch,
        summary.final_inner_lr,
        summary.final_inner_momentum
    );
    fs::write(
        args.out.join("training.json"),
        serde_json::to_string_pretty(&summary)?,
    )?;

    let batch = gtn.synthesize(0)?;
    save_grid(&batch.images, 10, 1, args.out.join("teacher_step0.pgm"))?;

    if args.trials > 0 {
        println!("\n═══ Architecture search ═══");
        let search = ArchitectureSearch::new(SearchConfig {
            trials: args.trials,
            eval_batch_size: gtn.config().eval_batch_size,
            ..SearchConfig::default()
        })?;
        let report = search.run(&mut gtn, &splits.validation, Some(&splits.test))?;
        let best = report.best_trial();
        println!(
            "🏆 Best of {} trials: {} | validation {:.2}% | test {}",
            report.trials.len(),
            best.arch,
            best.validation_accuracy * 100.0,
            report
                .best_test_accuracy
                .map(|a| format!("{:.2}%", a * 100.0))
                .unwrap_or_else(|| "-".to_string())
        );
        report.to_json_file(args.out.join("search.json"))?;
    }

    println!("\n📁 Reports written to {:?}", args.out);
    Ok(())
}
