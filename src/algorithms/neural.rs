//! Embedding-plus-MLP recommenders: NeuralCF, DeepFM and Wide&Deep.
//!
//! All three share the same deep path (concatenated user/item embeddings
//! through a [`DenseTower`]); they differ in the shallow terms added to the
//! tower output.

use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

use crate::algorithms::initializer::EmbeddingInitializer;
use crate::algorithms::mlp::{DenseTower, TowerGradients};
use crate::algorithms::optimizer::Optimizer;
use crate::algorithms::{
    clip_scale, dense_norm_sq, rows_tensor, sparse_norm_sq, tensor_rows, Recommender,
};
use crate::models::{
    Batch, BatchStats, Checkpoint, ItemId, ModelArchitecture, RatingFormat, TensorData, UserId,
};
use crate::config::ModelConfig;

/// Embedding tables plus the deep tower, shared by the neural models.
struct DeepCore {
    config: ModelConfig,
    format: RatingFormat,
    user_factors: Vec<DVector<f32>>,
    item_factors: Vec<DVector<f32>>,
    tower: DenseTower,
    rng: StdRng,
}

/// Accumulated gradients for one mini-batch over the shared deep path.
struct DeepAccum {
    tower: TowerGradients,
    user: HashMap<UserId, DVector<f32>>,
    item: HashMap<ItemId, DVector<f32>>,
}

impl DeepCore {
    fn new(
        config: ModelConfig,
        format: RatingFormat,
        num_users: usize,
        num_items: usize,
        seed: u64,
    ) -> Self {
        let init = EmbeddingInitializer::new(config.embedding_dim, seed);
        let mut rng = StdRng::seed_from_u64(seed);
        let tower = DenseTower::new(
            2 * config.embedding_dim,
            &config.layers,
            config.dropout,
            &mut rng,
        );
        Self {
            user_factors: init.table("user_factors", num_users),
            item_factors: init.table("item_factors", num_items),
            tower,
            rng,
            config,
            format,
        }
    }

    fn concat(&self, user_id: UserId, item_id: ItemId) -> DVector<f32> {
        let dim = self.config.embedding_dim;
        let mut x = DVector::zeros(2 * dim);
        x.rows_mut(0, dim).copy_from(&self.user_factors[user_id]);
        x.rows_mut(dim, dim).copy_from(&self.item_factors[item_id]);
        x
    }

    fn begin(&self) -> DeepAccum {
        DeepAccum {
            tower: TowerGradients::zeros_like(&self.tower, self.tower.input_dim()),
            user: HashMap::new(),
            item: HashMap::new(),
        }
    }

    /// Folds one example's tower gradients into the accumulator, splitting
    /// the input gradient back onto the two embedding rows.
    fn record(
        &self,
        accum: &mut DeepAccum,
        user_id: UserId,
        item_id: ItemId,
        tower_grads: &TowerGradients,
    ) {
        let dim = self.config.embedding_dim;
        accum.tower.accumulate(tower_grads);
        let user_part = tower_grads.input.rows(0, dim).clone_owned();
        let item_part = tower_grads.input.rows(dim, dim).clone_owned();
        *accum
            .user
            .entry(user_id)
            .or_insert_with(|| DVector::zeros(dim)) += user_part;
        *accum
            .item
            .entry(item_id)
            .or_insert_with(|| DVector::zeros(dim)) += item_part;
    }

    fn norm_sq(&self, accum: &DeepAccum) -> f64 {
        accum.tower.norm_squared() + sparse_norm_sq(&accum.user) + sparse_norm_sq(&accum.item)
    }

    fn apply(&mut self, mut accum: DeepAccum, scale: f32, optimizer: &mut dyn Optimizer) {
        accum.tower.scale(scale);
        self.tower.apply_gradients("deep", &accum.tower, optimizer);
        for (user_id, mut grad) in accum.user {
            grad *= scale;
            optimizer.step(
                &format!("user_factors.{}", user_id),
                &mut self.user_factors[user_id],
                &grad,
            );
        }
        for (item_id, mut grad) in accum.item {
            grad *= scale;
            optimizer.step(
                &format!("item_factors.{}", item_id),
                &mut self.item_factors[item_id],
                &grad,
            );
        }
    }

    fn export(&self, checkpoint: &mut Checkpoint) {
        checkpoint.insert("user_factors", rows_tensor(&self.user_factors));
        checkpoint.insert("item_factors", rows_tensor(&self.item_factors));
        self.tower.export_tensors("deep", checkpoint);
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
        self.tower.restore_tensors("deep", checkpoint)
    }

    fn num_parameters(&self) -> usize {
        (self.user_factors.len() + self.item_factors.len()) * self.config.embedding_dim
            + self.tower.num_parameters()
    }
}

/// Neural collaborative filtering: the tower output alone is the logit.
pub struct NeuralCf {
    core: DeepCore,
}

impl NeuralCf {
    pub fn new(
        config: ModelConfig,
        format: RatingFormat,
        num_users: usize,
        num_items: usize,
        seed: u64,
    ) -> Self {
        Self {
            core: DeepCore::new(config, format, num_users, num_items, seed),
        }
    }
}

impl Recommender for NeuralCf {
    fn architecture(&self) -> ModelArchitecture {
        ModelArchitecture::NeuralCf
    }

    fn predict(&self, user_id: UserId, item_id: ItemId) -> f32 {
        let x = self.core.concat(user_id, item_id);
        self.core.format.activate(self.core.tower.forward(&x))
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
        let mut accum = self.core.begin();
        let mut total_loss = 0.0f64;

        for ((&user_id, &item_id), &label) in
            batch.users.iter().zip(&batch.items).zip(&batch.labels)
        {
            let x = self.core.concat(user_id, item_id);
            let (logit, cache) = self.core.tower.forward_train(&x, &mut self.core.rng);
            let prediction = self.core.format.activate(logit);
            total_loss += self.core.format.loss(prediction, label) as f64;
            let g = self.core.format.loss_grad(prediction, label) / n;

            let tower_grads = self.core.tower.backward(&cache, g);
            self.core.record(&mut accum, user_id, item_id, &tower_grads);
        }

        let grad_norm = self.core.norm_sq(&accum).sqrt();
        let scale = clip_scale(grad_norm, grad_clip_norm);
        self.core.apply(accum, scale, optimizer);

        BatchStats {
            loss: total_loss / batch.len() as f64,
            grad_norm,
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        let mut checkpoint = Checkpoint::new(
            self.core.config.clone(),
            self.core.format,
            self.core.user_factors.len(),
            self.core.item_factors.len(),
        );
        self.core.export(&mut checkpoint);
        checkpoint
    }

    fn restore(&mut self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        self.core.restore(checkpoint)
    }

    fn num_parameters(&self) -> usize {
        self.core.num_parameters()
    }
}

/// DeepFM: factorization-machine second-order term and per-id first-order
/// weights alongside the deep tower.
pub struct DeepFm {
    core: DeepCore,
    user_linear: DVector<f32>,
    item_linear: DVector<f32>,
    global_bias: f32,
}

impl DeepFm {
    pub fn new(
        config: ModelConfig,
        format: RatingFormat,
        num_users: usize,
        num_items: usize,
        seed: u64,
    ) -> Self {
        Self {
            core: DeepCore::new(config, format, num_users, num_items, seed),
            user_linear: DVector::zeros(num_users),
            item_linear: DVector::zeros(num_items),
            global_bias: 0.0,
        }
    }

    fn shallow_logit(&self, user_id: UserId, item_id: ItemId) -> f32 {
        self.core.user_factors[user_id].dot(&self.core.item_factors[item_id])
            + self.user_linear[user_id]
            + self.item_linear[item_id]
            + self.global_bias
    }
}

impl Recommender for DeepFm {
    fn architecture(&self) -> ModelArchitecture {
        ModelArchitecture::DeepFm
    }

    fn predict(&self, user_id: UserId, item_id: ItemId) -> f32 {
        let x = self.core.concat(user_id, item_id);
        let logit = self.core.tower.forward(&x) + self.shallow_logit(user_id, item_id);
        self.core.format.activate(logit)
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
        let mut accum = self.core.begin();
        let mut user_linear_grad = DVector::zeros(self.user_linear.len());
        let mut item_linear_grad = DVector::zeros(self.item_linear.len());
        let mut global_grad = 0.0f32;
        let mut total_loss = 0.0f64;

        for ((&user_id, &item_id), &label) in
            batch.users.iter().zip(&batch.items).zip(&batch.labels)
        {
            let x = self.core.concat(user_id, item_id);
            let (deep_logit, cache) = self.core.tower.forward_train(&x, &mut self.core.rng);
            let logit = deep_logit + self.shallow_logit(user_id, item_id);
            let prediction = self.core.format.activate(logit);
            total_loss += self.core.format.loss(prediction, label) as f64;
            let g = self.core.format.loss_grad(prediction, label) / n;

            let tower_grads = self.core.tower.backward(&cache, g);
            self.core.record(&mut accum, user_id, item_id, &tower_grads);

            // FM term contributes g * other-embedding to each factor row.
            let dim = self.core.config.embedding_dim;
            *accum
                .user
                .entry(user_id)
                .or_insert_with(|| DVector::zeros(dim)) += &self.core.item_factors[item_id] * g;
            *accum
                .item
                .entry(item_id)
                .or_insert_with(|| DVector::zeros(dim)) += &self.core.user_factors[user_id] * g;

            user_linear_grad[user_id] += g;
            item_linear_grad[item_id] += g;
            global_grad += g;
        }

        let norm_sq = self.core.norm_sq(&accum)
            + dense_norm_sq(&user_linear_grad)
            + dense_norm_sq(&item_linear_grad)
            + (global_grad as f64) * (global_grad as f64);
        let grad_norm = norm_sq.sqrt();
        let scale = clip_scale(grad_norm, grad_clip_norm);

        self.core.apply(accum, scale, optimizer);
        user_linear_grad *= scale;
        item_linear_grad *= scale;
        optimizer.step("user_linear", &mut self.user_linear, &user_linear_grad);
        optimizer.step("item_linear", &mut self.item_linear, &item_linear_grad);
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
            self.core.config.clone(),
            self.core.format,
            self.core.user_factors.len(),
            self.core.item_factors.len(),
        );
        self.core.export(&mut checkpoint);
        checkpoint.insert(
            "user_linear",
            TensorData::new(self.user_linear.len(), 1, self.user_linear.as_slice().to_vec()),
        );
        checkpoint.insert(
            "item_linear",
            TensorData::new(self.item_linear.len(), 1, self.item_linear.as_slice().to_vec()),
        );
        checkpoint.insert("global_bias", TensorData::new(1, 1, vec![self.global_bias]));
        checkpoint
    }

    fn restore(&mut self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        self.core.restore(checkpoint)?;
        self.user_linear = DVector::from_vec(checkpoint.tensor("user_linear")?.data.clone());
        self.item_linear = DVector::from_vec(checkpoint.tensor("item_linear")?.data.clone());
        self.global_bias = checkpoint.tensor("global_bias")?.data[0];
        Ok(())
    }

    fn num_parameters(&self) -> usize {
        self.core.num_parameters() + self.user_linear.len() + self.item_linear.len() + 1
    }
}

/// Wide&Deep: per-id wide weights plus the deep tower.
pub struct WideDeep {
    core: DeepCore,
    wide_user: DVector<f32>,
    wide_item: DVector<f32>,
    global_bias: f32,
}

impl WideDeep {
    pub fn new(
        config: ModelConfig,
        format: RatingFormat,
        num_users: usize,
        num_items: usize,
        seed: u64,
    ) -> Self {
        Self {
            core: DeepCore::new(config, format, num_users, num_items, seed),
            wide_user: DVector::zeros(num_users),
            wide_item: DVector::zeros(num_items),
            global_bias: 0.0,
        }
    }

    fn wide_logit(&self, user_id: UserId, item_id: ItemId) -> f32 {
        self.wide_user[user_id] + self.wide_item[item_id] + self.global_bias
    }
}

impl Recommender for WideDeep {
    fn architecture(&self) -> ModelArchitecture {
        ModelArchitecture::WideDeep
    }

    fn predict(&self, user_id: UserId, item_id: ItemId) -> f32 {
        let x = self.core.concat(user_id, item_id);
        let logit = self.core.tower.forward(&x) + self.wide_logit(user_id, item_id);
        self.core.format.activate(logit)
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
        let mut accum = self.core.begin();
        let mut wide_user_grad = DVector::zeros(self.wide_user.len());
        let mut wide_item_grad = DVector::zeros(self.wide_item.len());
        let mut global_grad = 0.0f32;
        let mut total_loss = 0.0f64;

        for ((&user_id, &item_id), &label) in
            batch.users.iter().zip(&batch.items).zip(&batch.labels)
        {
            let x = self.core.concat(user_id, item_id);
            let (deep_logit, cache) = self.core.tower.forward_train(&x, &mut self.core.rng);
            let logit = deep_logit + self.wide_logit(user_id, item_id);
            let prediction = self.core.format.activate(logit);
            total_loss += self.core.format.loss(prediction, label) as f64;
            let g = self.core.format.loss_grad(prediction, label) / n;

            let tower_grads = self.core.tower.backward(&cache, g);
            self.core.record(&mut accum, user_id, item_id, &tower_grads);

            wide_user_grad[user_id] += g;
            wide_item_grad[item_id] += g;
            global_grad += g;
        }

        let norm_sq = self.core.norm_sq(&accum)
            + dense_norm_sq(&wide_user_grad)
            + dense_norm_sq(&wide_item_grad)
            + (global_grad as f64) * (global_grad as f64);
        let grad_norm = norm_sq.sqrt();
        let scale = clip_scale(grad_norm, grad_clip_norm);

        self.core.apply(accum, scale, optimizer);
        wide_user_grad *= scale;
        wide_item_grad *= scale;
        optimizer.step("wide_user", &mut self.wide_user, &wide_user_grad);
        optimizer.step("wide_item", &mut self.wide_item, &wide_item_grad);
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
            self.core.config.clone(),
            self.core.format,
            self.core.user_factors.len(),
            self.core.item_factors.len(),
        );
        self.core.export(&mut checkpoint);
        checkpoint.insert(
            "wide_user",
            TensorData::new(self.wide_user.len(), 1, self.wide_user.as_slice().to_vec()),
        );
        checkpoint.insert(
            "wide_item",
            TensorData::new(self.wide_item.len(), 1, self.wide_item.as_slice().to_vec()),
        );
        checkpoint.insert("global_bias", TensorData::new(1, 1, vec![self.global_bias]));
        checkpoint
    }

    fn restore(&mut self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        self.core.restore(checkpoint)?;
        self.wide_user = DVector::from_vec(checkpoint.tensor("wide_user")?.data.clone());
        self.wide_item = DVector::from_vec(checkpoint.tensor("wide_item")?.data.clone());
        self.global_bias = checkpoint.tensor("global_bias")?.data[0];
        Ok(())
    }

    fn num_parameters(&self) -> usize {
        self.core.num_parameters() + self.wide_user.len() + self.wide_item.len() + 1
    }
}
