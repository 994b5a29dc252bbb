use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::ModelConfig;

pub type UserId = usize;
pub type ItemId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetSource {
    MovieLens,
    Amazon,
    Criteo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelArchitecture {
    MatrixFactorization,
    NeuralCf,
    DeepFm,
    WideDeep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingFormat {
    /// Ratings are thresholded to 0/1 labels; models emit a probability.
    Binary,
    /// Raw ratings are regression targets; models emit an unbounded score.
    Explicit,
}

impl RatingFormat {
    /// Maps a raw model output to the prediction the loss is defined over.
    pub fn activate(&self, logit: f32) -> f32 {
        match self {
            RatingFormat::Binary => crate::utils::sigmoid(logit),
            RatingFormat::Explicit => logit,
        }
    }

    /// Per-example loss for an activated prediction.
    pub fn loss(&self, prediction: f32, label: f32) -> f32 {
        match self {
            RatingFormat::Binary => {
                let p = prediction.clamp(1e-7, 1.0 - 1e-7);
                -(label * p.ln() + (1.0 - label) * (1.0 - p).ln())
            }
            RatingFormat::Explicit => {
                let err = prediction - label;
                err * err
            }
        }
    }

    /// Gradient of the loss with respect to the raw model output.
    ///
    /// For Binary this folds the sigmoid through the cross-entropy, so the
    /// returned value is d(loss)/d(logit) = p - y.
    pub fn loss_grad(&self, prediction: f32, label: f32) -> f32 {
        match self {
            RatingFormat::Binary => prediction - label,
            RatingFormat::Explicit => 2.0 * (prediction - label),
        }
    }
}

/// One rating row after loading: dense ids plus the training label.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Interaction {
    pub user_id: UserId,
    pub item_id: ItemId,
    pub label: f32,
}

/// A mini-batch in column layout, the shape every model consumes.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub users: Vec<UserId>,
    pub items: Vec<ItemId>,
    pub labels: Vec<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn push(&mut self, interaction: &Interaction) {
        self.users.push(interaction.user_id);
        self.items.push(interaction.item_id);
        self.labels.push(interaction.label);
    }
}

/// Per-batch training statistics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchStats {
    pub loss: f64,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub batches: usize,
    pub mean_loss: f64,
    pub mean_grad_norm: f64,
}

/// Recommendation-quality metrics aggregated over one evaluation batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalReport {
    pub eval_loss: f64,
    pub precision_at_k: f64,
    pub recall_at_k: f64,
    pub f1_score: f64,
    pub ndcg_at_k: f64,
    pub novelty: f64,
    pub prediction_coverage: f64,
    pub catalog_coverage: f64,
    pub personalization: f64,
    /// Absent when the eval batch's labels are single-class.
    pub roc_auc: Option<f64>,
}

/// Row-major dense tensor payload inside a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorData {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl TensorData {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        Self { rows, cols, data }
    }

    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }
}

/// Serializable snapshot of a trained model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: String,
    pub model: ModelConfig,
    pub rating_format: RatingFormat,
    pub num_users: usize,
    pub num_items: usize,
    pub created_at: DateTime<Utc>,
    pub tensors: HashMap<String, TensorData>,
}

impl Checkpoint {
    pub fn new(
        model: ModelConfig,
        rating_format: RatingFormat,
        num_users: usize,
        num_items: usize,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            version: format!("v{}", created_at.timestamp()),
            model,
            rating_format,
            num_users,
            num_items,
            created_at,
            tensors: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: &str, tensor: TensorData) {
        self.tensors.insert(name.to_string(), tensor);
    }

    pub fn tensor(&self, name: &str) -> anyhow::Result<&TensorData> {
        self.tensors
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("checkpoint is missing tensor {}", name))
    }
}
