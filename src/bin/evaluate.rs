use anyhow::Result;
use clap::Parser;
use reclab::algorithms::build_model;
use reclab::data::RatingsDataset;
use reclab::services::evaluation::EvaluationService;
use reclab::services::training::read_checkpoint;
use reclab::{init_tracing, Config};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    /// Checkpoint file produced by reclab-train.
    #[arg(long)]
    checkpoint: String,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    std::env::set_var("RUST_LOG", &args.log_level);
    init_tracing().await;

    info!("Starting reclab evaluator");

    let config = if std::path::Path::new(&args.config).exists() {
        Config::from_file(&args.config)?
    } else {
        info!("Config file not found, using default configuration");
        Config::default()
    };

    let checkpoint = read_checkpoint(std::path::Path::new(&args.checkpoint))?;
    info!(
        version = %checkpoint.version,
        architecture = ?checkpoint.model.architecture,
        "checkpoint loaded"
    );

    let dataset = RatingsDataset::load_csv(&config.data.path, &config.data)?;
    anyhow::ensure!(
        dataset.num_users() <= checkpoint.num_users
            && dataset.num_items() <= checkpoint.num_items,
        "dataset has more users or items than the checkpointed model covers"
    );

    let mut model = build_model(
        &checkpoint.model,
        checkpoint.rating_format,
        checkpoint.num_users,
        checkpoint.num_items,
        config.data.seed,
    );
    model.restore(&checkpoint)?;

    let (_, eval) = dataset.split(config.training.eval_size, config.data.seed)?;
    let batch = eval
        .batches(config.training.eval_size, false)
        .next()
        .ok_or_else(|| anyhow::anyhow!("eval split produced no batch"))?;

    let service = EvaluationService::new(Arc::new(config));
    let report = service.evaluate(&dataset, model.as_ref(), &batch).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
