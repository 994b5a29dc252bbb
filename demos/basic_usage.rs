use reclab::data::RatingsDataset;
use reclab::{init_tracing, Config, Experiment, ModelArchitecture};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing().await;

    println!("🚀 reclab basic usage");

    // 1. Configuration: small model, short run.
    let mut config = Config::default();
    config.data.max_rows = None;
    config.model.architecture = ModelArchitecture::MatrixFactorization;
    config.model.embedding_dim = 16;
    config.training.batch_size = 32;
    config.training.eval_size = 50;
    config.training.num_epochs = 5;
    config.training.max_batches = 20;
    config.training.checkpoint_every = 0;
    println!("✅ configuration ready: {:?}", config.model.architecture);

    // 2. Synthetic rating log: users prefer items sharing their parity.
    let mut rows = Vec::new();
    for user in 0..30 {
        for item in 0..40 {
            let rating = if user % 2 == item % 2 { 4.5 } else { 1.5 };
            rows.push((user, item, rating));
        }
    }
    let dataset = RatingsDataset::from_rows(rows, &config.data)?;
    println!(
        "📊 dataset loaded: {} examples, {} users, {} items",
        dataset.len(),
        dataset.num_users(),
        dataset.num_items()
    );

    // 3. Wire the experiment and train.
    let experiment = Experiment::with_dataset(config.clone(), dataset).await?;
    let history = experiment
        .training_service
        .run(&experiment.dataset)
        .await?;
    println!(
        "🧠 trained {} epochs, final mean loss {:.4}",
        history.len(),
        history.last().map(|s| s.mean_loss).unwrap_or(f64::NAN)
    );

    // 4. One explicit evaluation pass on the held-out batch.
    let (_, eval) = experiment
        .dataset
        .split(config.training.eval_size, config.data.seed)?;
    let batch = eval
        .batches(config.training.eval_size, false)
        .next()
        .expect("eval batch");
    let report = experiment
        .training_service
        .evaluate(&experiment.dataset, &batch)
        .await?;
    println!("📈 evaluation report:");
    println!("{}", serde_json::to_string_pretty(&report)?);

    experiment.tracker.finish().await;
    Ok(())
}
