use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::EnvFilter;

use epochloop::config::AppConfig;
use epochloop::linear::{LinearRegression, Sgd, SyntheticRegression};
use epochloop::model::ClipGradNorm;
use epochloop::rng::RandomSources;
use epochloop::training::Trainer;

/// Train the reference linear-regression job.
#[derive(Parser)]
#[command(name = "train", about = "Train a linear regression model with resumable checkpoints")]
struct Cli {
    /// Path to TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Resume from this checkpoint file, e.g. training/ckpts/checkpoint_last.json
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Override number of training epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Override learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Override the training directory
    #[arg(long)]
    training_dir: Option<PathBuf>,

    /// Print the default configuration as TOML and exit
    #[arg(long)]
    print_default_config: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if cli.print_default_config {
        print!("{}", AppConfig::default_toml().context("rendering default config")?);
        return Ok(());
    }

    // Load configuration
    let mut app_config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(epochs) = cli.epochs {
        app_config.training.epochs = epochs;
    }
    if let Some(lr) = cli.lr {
        app_config.model.lr = lr;
    }
    if let Some(dir) = cli.training_dir {
        app_config.training.training_dir = dir;
    }
    app_config.validate().context("validating configuration")?;

    let data = &app_config.data;
    let mut data_rng = ChaCha8Rng::seed_from_u64(data.seed);
    let (train, val) = SyntheticRegression::generate_split(
        data.samples,
        data.val_samples,
        data.features,
        data.batch_size,
        data.noise_std,
        &mut data_rng,
    )
    .map_err(|e| anyhow::anyhow!("generating data: {e}"))?;

    let mut init = RandomSources::seeded(app_config.training.seed);
    let model = LinearRegression::new(data.features, &mut init);
    let optimizer = Sgd::new(app_config.model.lr).with_weight_decay(app_config.model.weight_decay);

    let mut trainer = Trainer::new(
        app_config.training.clone(),
        model,
        optimizer,
        LinearRegression::forward_step(),
        train,
    )
    .with_average_kind(app_config.metrics.average, app_config.metrics.ema_decay);
    if !val.is_empty() {
        trainer = trainer.with_validation(val);
    }
    if let Some(max_norm) = app_config.model.clip_grad_norm {
        trainer = trainer.with_param_op(ClipGradNorm::new(max_norm));
    }

    let report = trainer
        .fit(cli.resume.as_deref())
        .context("training failed")?;

    if let Some(best) = report.best {
        tracing::info!(
            step = best.step,
            loss = best.loss,
            checkpoints = ?report.checkpoints,
            "best checkpoint"
        );
    }
    Ok(())
}
