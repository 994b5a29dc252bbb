use anyhow::Result;
use clap::Parser;
use reclab::{init_tracing, Config, Experiment};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Override the number of training epochs.
    #[arg(long)]
    epochs: Option<usize>,

    /// Override the per-epoch batch cap.
    #[arg(long)]
    max_batches: Option<usize>,

    /// Enable experiment tracking regardless of the config file.
    #[arg(long)]
    track: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    std::env::set_var("RUST_LOG", &args.log_level);
    init_tracing().await;

    info!("Starting reclab trainer");

    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::from_file(&args.config)?
    } else {
        info!("Config file not found, using default configuration");
        Config::default()
    };
    if let Some(epochs) = args.epochs {
        config.training.num_epochs = epochs;
    }
    if let Some(max_batches) = args.max_batches {
        config.training.max_batches = max_batches;
    }
    if args.track {
        config.tracking.enabled = true;
    }

    rayon::ThreadPoolBuilder::new()
        .num_threads(config.training.workers)
        .build_global()
        .ok();

    info!("Trainer configuration loaded: {:?}", config.training);

    let experiment = Experiment::new(config).await?;
    info!(run_id = %experiment.tracker.run_id(), "experiment initialized");

    let history = experiment
        .training_service
        .run(&experiment.dataset)
        .await?;
    if let Some(last) = history.last() {
        info!(
            epochs = history.len(),
            final_loss = last.mean_loss,
            "training run complete"
        );
    }

    let path = experiment
        .training_service
        .save_checkpoint("checkpoint-final")
        .await?;
    info!(path = %path.display(), "final checkpoint written");

    experiment.tracker.finish().await;
    Ok(())
}
