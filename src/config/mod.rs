use serde::{Deserialize, Serialize};

use crate::models::{DatasetSource, ModelArchitecture, RatingFormat};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data: DataConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub evaluation: EvaluationConfig,
    pub tracking: TrackingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub path: String,
    pub source: DatasetSource,
    pub rating_format: RatingFormat,
    /// Ratings at or above this value count as positive interactions.
    pub positive_threshold: f32,
    /// One positive example is drawn for every `negative_ratio` examples.
    pub negative_ratio: usize,
    pub max_rows: Option<usize>,
    pub max_users: Option<usize>,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub architecture: ModelArchitecture,
    pub embedding_dim: usize,
    /// Hidden layer widths of the deep tower, input to output.
    pub layers: Vec<usize>,
    pub dropout: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub eval_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub optimizer: OptimizerKind,
    pub num_epochs: usize,
    pub eval_every: usize,
    pub max_batches: usize,
    pub grad_clip_norm: f32,
    pub checkpoint_every: usize,
    pub checkpoint_dir: String,
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    pub top_k: usize,
    /// Number of recommendation lists sampled for catalog coverage.
    pub coverage_sample_lists: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub enabled: bool,
    pub dir: String,
    pub flush_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    Adam,
    AdamW,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig {
                path: "data/ratings.csv".to_string(),
                source: DatasetSource::MovieLens,
                rating_format: RatingFormat::Binary,
                positive_threshold: 3.0,
                negative_ratio: 4,
                max_rows: Some(100_000),
                max_users: None,
                seed: 0,
            },
            model: ModelConfig {
                architecture: ModelArchitecture::MatrixFactorization,
                embedding_dim: 32,
                layers: vec![64, 32, 16, 8],
                dropout: 0.2,
            },
            training: TrainingConfig {
                batch_size: 128,
                eval_size: 100,
                learning_rate: 5e-4,
                weight_decay: 1e-5,
                optimizer: OptimizerKind::AdamW,
                num_epochs: 100,
                eval_every: 1,
                max_batches: 100,
                grad_clip_norm: 100.0,
                checkpoint_every: 10,
                checkpoint_dir: "checkpoints".to_string(),
                workers: num_cpus::get(),
            },
            evaluation: EvaluationConfig {
                top_k: 10,
                coverage_sample_lists: 10,
            },
            tracking: TrackingConfig {
                enabled: false,
                dir: "runs".to_string(),
                flush_interval_secs: 5,
            },
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("RECLAB"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
