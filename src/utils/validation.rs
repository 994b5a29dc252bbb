use anyhow::{anyhow, Result};

use crate::config::Config;
use crate::models::{Checkpoint, Interaction};

pub fn validate_config(config: &Config) -> Result<()> {
    if config.training.batch_size == 0 {
        return Err(anyhow!("batch size cannot be zero"));
    }

    if config.training.eval_size == 0 {
        return Err(anyhow!("eval size cannot be zero"));
    }

    if config.training.learning_rate <= 0.0 {
        return Err(anyhow!("learning rate must be positive"));
    }

    if config.training.weight_decay < 0.0 {
        return Err(anyhow!("weight decay cannot be negative"));
    }

    if config.training.grad_clip_norm <= 0.0 {
        return Err(anyhow!("gradient clip norm must be positive"));
    }

    if config.training.eval_every == 0 {
        return Err(anyhow!("eval_every cannot be zero"));
    }

    if config.model.embedding_dim == 0 {
        return Err(anyhow!("embedding dimension cannot be zero"));
    }

    if config.model.embedding_dim > 2048 {
        return Err(anyhow!("embedding dimension too large (max 2048)"));
    }

    if config.model.layers.is_empty() {
        return Err(anyhow!("deep tower needs at least one hidden layer"));
    }

    if !(0.0..1.0).contains(&config.model.dropout) {
        return Err(anyhow!("dropout must be in [0, 1)"));
    }

    if config.data.negative_ratio == 0 {
        return Err(anyhow!("negative ratio cannot be zero"));
    }

    if !config.data.positive_threshold.is_finite() {
        return Err(anyhow!("positive threshold must be finite"));
    }

    if config.evaluation.top_k == 0 {
        return Err(anyhow!("top_k cannot be zero"));
    }

    Ok(())
}

pub fn validate_interaction(interaction: &Interaction) -> Result<()> {
    if !interaction.label.is_finite() {
        return Err(anyhow!(
            "interaction ({}, {}) has a non-finite label",
            interaction.user_id,
            interaction.item_id
        ));
    }

    Ok(())
}

pub fn validate_checkpoint(checkpoint: &Checkpoint) -> Result<()> {
    if checkpoint.version.is_empty() {
        return Err(anyhow!("checkpoint version cannot be empty"));
    }

    if checkpoint.num_users == 0 || checkpoint.num_items == 0 {
        return Err(anyhow!("checkpoint must cover at least one user and item"));
    }

    if checkpoint.tensors.is_empty() {
        return Err(anyhow!("checkpoint contains no tensors"));
    }

    for (name, tensor) in &checkpoint.tensors {
        if tensor.rows * tensor.cols != tensor.data.len() {
            return Err(anyhow!(
                "tensor {} claims {}x{} but holds {} values",
                name,
                tensor.rows,
                tensor.cols,
                tensor.data.len()
            ));
        }

        for &value in &tensor.data {
            if !value.is_finite() {
                return Err(anyhow!("tensor {} contains invalid values (NaN or Infinity)", name));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RatingFormat, TensorData};

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut config = Config::default();
        config.training.batch_size = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn dropout_of_one_is_rejected() {
        let mut config = Config::default();
        config.model.dropout = 1.0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn non_finite_label_is_rejected() {
        let interaction = Interaction {
            user_id: 0,
            item_id: 0,
            label: f32::NAN,
        };
        assert!(validate_interaction(&interaction).is_err());
    }

    #[test]
    fn checkpoint_with_nan_tensor_is_rejected() {
        let mut checkpoint =
            Checkpoint::new(Config::default().model, RatingFormat::Binary, 2, 2);
        checkpoint.insert("weights", TensorData::new(1, 2, vec![0.1, f32::NAN]));
        assert!(validate_checkpoint(&checkpoint).is_err());
    }

    #[test]
    fn checkpoint_shape_mismatch_is_rejected() {
        let mut checkpoint =
            Checkpoint::new(Config::default().model, RatingFormat::Binary, 2, 2);
        checkpoint.insert("weights", TensorData::new(2, 2, vec![0.0; 3]));
        assert!(validate_checkpoint(&checkpoint).is_err());
    }
}
