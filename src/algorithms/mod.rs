pub mod initializer;
pub mod mlp;
pub mod neural;
pub mod optimizer;

use nalgebra::DVector;
use std::collections::HashMap;

use crate::config::ModelConfig;
use crate::models::{
    Batch, BatchStats, Checkpoint, ItemId, ModelArchitecture, RatingFormat, TensorData, UserId,
};
use initializer::EmbeddingInitializer;
use optimizer::Optimizer;

/// A trainable model mapping (user, item) id pairs to preference scores.
pub trait Recommender: Send + Sync {
    fn architecture(&self) -> ModelArchitecture;

    /// Activated prediction: a probability for binary ratings, a raw score
    /// for explicit ones.
    fn predict(&self, user_id: UserId, item_id: ItemId) -> f32;

    /// One gradient step over a mini-batch. The global gradient norm is
    /// clipped to `grad_clip_norm` before the optimizer update; the returned
    /// norm is the pre-clipping value.
    fn fit_batch(
        &mut self,
        batch: &Batch,
        optimizer: &mut dyn Optimizer,
        grad_clip_norm: f32,
    ) -> BatchStats;

    fn checkpoint(&self) -> Checkpoint;

    fn restore(&mut self, checkpoint: &Checkpoint) -> anyhow::Result<()>;

    fn num_parameters(&self) -> usize;
}

pub fn build_model(
    config: &ModelConfig,
    format: RatingFormat,
    num_users: usize,
    num_items: usize,
    seed: u64,
) -> Box<dyn Recommender> {
    match config.architecture {
        ModelArchitecture::MatrixFactorization => Box::new(MatrixFactorization::new(
            config.clone(),
            format,
            num_users,
            num_items,
            seed,
        )),
        ModelArchitecture::NeuralCf => Box::new(neural::NeuralCf::new(
            config.clone(),
            format,
            num_users,
            num_items,
            seed,
        )),
        ModelArchitecture::DeepFm => Box::new(neural::DeepFm::new(
            config.clone(),
            format,
            num_users,
            num_items,
            seed,
        )),
        ModelArchitecture::WideDeep => Box::new(neural::WideDeep::new(
            config.clone(),
            format,
            num_users,
            num_items,
            seed,
        )),
    }
}

pub(crate) fn sparse_norm_sq(grads: &HashMap<usize, DVector<f32>>) -> f64 {
    grads
        .values()
        .map(|g| g.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>())
        .sum()
}

pub(crate) fn dense_norm_sq(grad: &DVector<f32>) -> f64 {
    grad.iter().map(|x| (*x as f64) * (*x as f64)).sum()
}

/// Scale factor that caps a gradient norm at `max_norm`.
pub(crate) fn clip_scale(norm: f64, max_norm: f32) -> f32 {
    if norm > max_norm as f64 && norm > 0.0 {
        (max_norm as f64 / norm) as f32
    } else {
        1.0
    }
}

pub(crate) fn rows_tensor(rows: &[DVector<f32>]) -> TensorData {
    let cols = rows.first().map(|r| r.len()).unwrap_or(0);
    let data: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    TensorData::new(rows.len(), cols, data)
}

pub(crate) fn tensor_rows(tensor: &TensorData) -> Vec<DVector<f32>> {
    (0..tensor.rows)
        .map(|i| DVector::from_row_slice(tensor.row(i)))
        .collect()
}

/// Classic matrix factorization: dot product of user and item factors plus
/// user, item and global biases.
pub struct MatrixFactorization {
    config: ModelConfig,
    format: RatingFormat,
    user_factors: Vec<DVector<f32>>,
    item_factors: Vec<DVector<f32>>,
    user_bias: DVector<f32>,
    item_bias: DVector<f32>,
    global_bias: f32,
}

impl MatrixFactorization {
    pub fn new(
        config: ModelConfig,
        format: RatingFormat,
        num_users: usize,
        num_items: usize,
        seed: u64,
    ) -> Self {
        let init = EmbeddingInitializer::new(config.embedding_dim, seed);
        Self {
            user_factors: init.table("user_factors", num_users),
            item_factors: init.table("item_factors", num_items),
            user_bias: DVector::zeros(num_users),
            item_bias: DVector::zeros(num_items),
            global_bias: 0.0,
            config,
            format,
        }
    }

    fn logit(&self, user_id: UserId, item_id: ItemId) -> f32 {
        self.user_factors[user_id].dot(&self.item_factors[item_id])
            + self.user_bias[user_id]
            + self.item_bias[item_id]
            + self.global_bias
    }
}

impl Recommender for MatrixFactorization {
    fn architecture(&self) -> ModelArchitecture {
        ModelArchitecture::MatrixFactorization
    }

    fn predict(&self, user_id: UserId, item_id: ItemId) -> f32 {
        self.format.activate(self.logit(user_id, item_id))
    }

    fn fit_batch(
        &mut self,
        batch: &Batch,
        optimizer: &mut dyn Optimizer,
        grad_clip_norm: f32,
    ) -> BatchStats {
        if batch.is_empty() {
            return BatchStats {
                loss: 0.0,
                grad_norm: 0.0,
            };
        }
        let n = batch.len() as f32;
        let dim = self.config.embedding_dim;

        let mut user_grads: HashMap<UserId, DVector<f32>> = HashMap::new();
        let mut item_grads: HashMap<ItemId, DVector<f32>> = HashMap::new();
        let mut user_bias_grad = DVector::zeros(self.user_bias.len());
        let mut item_bias_grad = DVector::zeros(self.item_bias.len());
        let mut global_grad = 0.0f32;
        let mut total_loss = 0.0f64;

        for ((&user_id, &item_id), &label) in
            batch.users.iter().zip(&batch.items).zip(&batch.labels)
        {
            let prediction = self.format.activate(self.logit(user_id, item_id));
            total_loss += self.format.loss(prediction, label) as f64;
            let g = self.format.loss_grad(prediction, label) / n;

            let item_vec = &self.item_factors[item_id];
            let user_vec = &self.user_factors[user_id];
            *user_grads
                .entry(user_id)
                .or_insert_with(|| DVector::zeros(dim)) += item_vec * g;
            *item_grads
                .entry(item_id)
                .or_insert_with(|| DVector::zeros(dim)) += user_vec * g;
            user_bias_grad[user_id] += g;
            item_bias_grad[item_id] += g;
            global_grad += g;
        }

        let norm_sq = sparse_norm_sq(&user_grads)
            + sparse_norm_sq(&item_grads)
            + dense_norm_sq(&user_bias_grad)
            + dense_norm_sq(&item_bias_grad)
            + (global_grad as f64) * (global_grad as f64);
        let grad_norm = norm_sq.sqrt();
        let scale = clip_scale(grad_norm, grad_clip_norm);

        for (user_id, mut grad) in user_grads {
            grad *= scale;
            optimizer.step(
                &format!("user_factors.{}", user_id),
                &mut self.user_factors[user_id],
                &grad,
            );
        }
        for (item_id, mut grad) in item_grads {
            grad *= scale;
            optimizer.step(
                &format!("item_factors.{}", item_id),
                &mut self.item_factors[item_id],
                &grad,
            );
        }
        user_bias_grad *= scale;
        item_bias_grad *= scale;
        optimizer.step("user_bias", &mut self.user_bias, &user_bias_grad);
        optimizer.step("item_bias", &mut self.item_bias, &item_bias_grad);

        let mut global = DVector::from_element(1, self.global_bias);
        let global_g = DVector::from_element(1, global_grad * scale);
        optimizer.step("global_bias", &mut global, &global_g);
        self.global_bias = global[0];

        BatchStats {
            loss: total_loss / batch.len() as f64,
            grad_norm,
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        let mut checkpoint = Checkpoint::new(
            self.config.clone(),
            self.format,
            self.user_factors.len(),
            self.item_factors.len(),
        );
        checkpoint.insert("user_factors", rows_tensor(&self.user_factors));
        checkpoint.insert("item_factors", rows_tensor(&self.item_factors));
        checkpoint.insert(
            "user_bias",
            TensorData::new(self.user_bias.len(), 1, self.user_bias.as_slice().to_vec()),
        );
        checkpoint.insert(
            "item_bias",
            TensorData::new(self.item_bias.len(), 1, self.item_bias.as_slice().to_vec()),
        );
        checkpoint.insert("global_bias", TensorData::new(1, 1, vec![self.global_bias]));
        checkpoint
    }

    fn restore(&mut self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let users = checkpoint.tensor("user_factors")?;
        let items = checkpoint.tensor("item_factors")?;
        anyhow::ensure!(
            users.rows == self.user_factors.len() && users.cols == self.config.embedding_dim,
            "user_factors shape mismatch"
        );
        anyhow::ensure!(
            items.rows == self.item_factors.len() && items.cols == self.config.embedding_dim,
            "item_factors shape mismatch"
        );
        self.user_factors = tensor_rows(users);
        self.item_factors = tensor_rows(items);
        self.user_bias = DVector::from_vec(checkpoint.tensor("user_bias")?.data.clone());
        self.item_bias = DVector::from_vec(checkpoint.tensor("item_bias")?.data.clone());
        self.global_bias = checkpoint.tensor("global_bias")?.data[0];
        Ok(())
    }

    fn num_parameters(&self) -> usize {
        self.user_factors.len() * self.config.embedding_dim
            + self.item_factors.len() * self.config.embedding_dim
            + self.user_bias.len()
            + self.item_bias.len()
            + 1
    }
}
