use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::algorithms::{optimizer, optimizer::Optimizer, Recommender};
use crate::config::Config;
use crate::data::RatingsDataset;
use crate::models::{Checkpoint, EpochStats, EvalReport};
use crate::services::evaluation::EvaluationService;
use crate::services::tracking::ExperimentTracker;
use crate::utils::validation::validate_checkpoint;

/// Drives epochs over the training split: per-batch gradient steps with
/// norm clipping, periodic evaluation and periodic checkpointing.
pub struct TrainingService {
    recommender: Arc<RwLock<Box<dyn Recommender>>>,
    optimizer: Mutex<Box<dyn Optimizer>>,
    evaluation: Arc<EvaluationService>,
    tracker: Arc<ExperimentTracker>,
    config: Arc<Config>,
}

impl TrainingService {
    pub fn new(
        recommender: Arc<RwLock<Box<dyn Recommender>>>,
        evaluation: Arc<EvaluationService>,
        tracker: Arc<ExperimentTracker>,
        config: Arc<Config>,
    ) -> Self {
        let optimizer = Mutex::new(optimizer::build(&config.training));
        Self {
            recommender,
            optimizer,
            evaluation,
            tracker,
            config,
        }
    }

    /// Full training run over `num_epochs` epochs, evaluating every
    /// `eval_every` epochs on a fixed eval batch.
    pub async fn run(&self, dataset: &RatingsDataset) -> Result<Vec<EpochStats>> {
        let training = &self.config.training;
        let (train, eval) = dataset.split(training.eval_size, self.config.data.seed)?;
        let eval_batch = eval
            .batches(training.eval_size, false)
            .next()
            .context("eval split produced no batch")?;

        {
            let recommender = self.recommender.read().await;
            info!(
                architecture = ?recommender.architecture(),
                parameters = recommender.num_parameters(),
                train_examples = train.len(),
                eval_examples = eval.len(),
                "starting training run"
            );
        }

        let mut history = Vec::with_capacity(training.num_epochs);
        let mut step: u64 = 0;
        for epoch in 0..training.num_epochs {
            if epoch % training.eval_every == 0 {
                info!(epoch, "running eval");
                let report = self.evaluate(dataset, &eval_batch).await?;
                self.log_report(step, &report);
            }

            let mut losses = Vec::new();
            let mut norms = Vec::new();
            for (batch_index, batch) in train.batches(training.batch_size, true).enumerate() {
                if batch_index >= training.max_batches {
                    break;
                }

                let stats = {
                    let mut recommender = self.recommender.write().await;
                    let mut optimizer = self.optimizer.lock().await;
                    recommender.fit_batch(&batch, optimizer.as_mut(), training.grad_clip_norm)
                };

                step += 1;
                self.tracker.log_scalars(
                    step,
                    &[
                        ("train_loss", stats.loss),
                        ("total_norm", stats.grad_norm),
                    ],
                );
                info!(
                    "epoch {:03}, batch {:03}, loss {:.3}, total norm {:.3}",
                    epoch, batch_index, stats.loss, stats.grad_norm
                );
                losses.push(stats.loss);
                norms.push(stats.grad_norm);
            }

            let epoch_stats = EpochStats {
                epoch,
                batches: losses.len(),
                mean_loss: crate::utils::mean(&losses),
                mean_grad_norm: crate::utils::mean(&norms),
            };
            self.tracker
                .log_scalars(step, &[("epoch_loss", epoch_stats.mean_loss)]);
            history.push(epoch_stats);

            if training.checkpoint_every > 0 && (epoch + 1) % training.checkpoint_every == 0 {
                let path = self
                    .save_checkpoint(&format!("checkpoint-epoch{:03}", epoch))
                    .await?;
                info!(epoch, path = %path.display(), "checkpoint written");
            }
        }

        Ok(history)
    }

    pub async fn evaluate(
        &self,
        dataset: &RatingsDataset,
        batch: &crate::models::Batch,
    ) -> Result<EvalReport> {
        let recommender = self.recommender.read().await;
        self.evaluation
            .evaluate(dataset, recommender.as_ref(), batch)
            .await
    }

    fn log_report(&self, step: u64, report: &EvalReport) {
        let mut scalars = vec![
            ("eval_loss", report.eval_loss),
            ("precision", report.precision_at_k),
            ("recall", report.recall_at_k),
            ("f1", report.f1_score),
            ("ndcg", report.ndcg_at_k),
            ("novelty", report.novelty),
            ("prediction_coverage", report.prediction_coverage),
            ("catalog_coverage", report.catalog_coverage),
            ("personalization", report.personalization),
        ];
        if let Some(auc) = report.roc_auc {
            scalars.push(("roc_auc", auc));
        }
        self.tracker.log_scalars(step, &scalars);
    }

    /// Snapshots the model under `<checkpoint_dir>/<name>.json`.
    pub async fn save_checkpoint(&self, name: &str) -> Result<PathBuf> {
        let checkpoint = {
            let recommender = self.recommender.read().await;
            recommender.checkpoint()
        };
        let dir = Path::new(&self.config.training.checkpoint_dir);
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(format!("{}.json", name));
        write_checkpoint(&path, &checkpoint)?;
        Ok(path)
    }
}

pub fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    validate_checkpoint(checkpoint)?;
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer(std::io::BufWriter::new(file), checkpoint)?;
    Ok(())
}

pub fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let checkpoint: Checkpoint = serde_json::from_reader(std::io::BufReader::new(file))?;
    validate_checkpoint(&checkpoint)?;
    Ok(checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::build_model;
    use crate::models::RatingFormat;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.data.max_rows = None;
        config.model.embedding_dim = 8;
        config.training.batch_size = 8;
        config.training.eval_size = 12;
        config.training.num_epochs = 2;
        config.training.max_batches = 5;
        config.training.checkpoint_every = 0;
        config.evaluation.top_k = 3;
        config
    }

    fn small_dataset(config: &Config) -> RatingsDataset {
        let mut rows = Vec::new();
        for user in 0..8 {
            for item in 0..10 {
                let rating = if (user + item) % 2 == 0 { 4.0 } else { 2.0 };
                rows.push((user, item, rating));
            }
        }
        RatingsDataset::from_rows(rows, &config.data).unwrap()
    }

    fn service(config: Arc<Config>, dataset: &RatingsDataset) -> TrainingService {
        let recommender = Arc::new(RwLock::new(build_model(
            &config.model,
            RatingFormat::Binary,
            dataset.num_users(),
            dataset.num_items(),
            config.data.seed,
        )));
        let evaluation = Arc::new(EvaluationService::new(config.clone()));
        let tracker = Arc::new(ExperimentTracker::disabled());
        TrainingService::new(recommender, evaluation, tracker, config)
    }

    #[tokio::test]
    async fn run_produces_history_for_every_epoch() {
        let config = Arc::new(small_config());
        let dataset = small_dataset(&config);
        let service = service(config.clone(), &dataset);

        let history = service.run(&dataset).await.unwrap();
        assert_eq!(history.len(), 2);
        for stats in &history {
            assert!(stats.batches > 0);
            assert!(stats.mean_loss.is_finite());
        }
    }

    #[tokio::test]
    async fn checkpoint_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config();
        config.training.checkpoint_dir = dir.path().to_str().unwrap().to_string();
        let config = Arc::new(config);
        let dataset = small_dataset(&config);
        let service = service(config.clone(), &dataset);

        let path = service.save_checkpoint("checkpoint-final").await.unwrap();
        let checkpoint = read_checkpoint(&path).unwrap();
        assert_eq!(checkpoint.num_users, dataset.num_users());
        assert_eq!(checkpoint.num_items, dataset.num_items());
    }
}
