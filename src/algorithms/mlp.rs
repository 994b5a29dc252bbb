use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;

use crate::algorithms::{initializer, optimizer::Optimizer};
use crate::models::{Checkpoint, TensorData};

/// Fully-connected tower with ReLU hidden layers, inverted dropout and a
/// scalar head. Forward and backward passes are explicit so parameters can
/// go through the shared keyed optimizer.
pub struct DenseTower {
    weights: Vec<DMatrix<f32>>,
    biases: Vec<DVector<f32>>,
    dropout: f32,
}

/// Intermediate state of a training forward pass, kept for backprop.
pub struct TowerCache {
    /// Input fed to each layer (inputs[0] is the tower input).
    inputs: Vec<DVector<f32>>,
    /// Post-ReLU activations of the hidden layers, before dropout.
    hidden: Vec<DVector<f32>>,
    /// Dropout masks applied to hidden activations, if dropout is active.
    masks: Vec<Option<DVector<f32>>>,
}

pub struct TowerGradients {
    pub weights: Vec<DMatrix<f32>>,
    pub biases: Vec<DVector<f32>>,
    /// Gradient with respect to the tower input, for the embedding tables.
    pub input: DVector<f32>,
}

impl TowerGradients {
    pub fn zeros_like(tower: &DenseTower, input_dim: usize) -> Self {
        Self {
            weights: tower
                .weights
                .iter()
                .map(|w| DMatrix::zeros(w.nrows(), w.ncols()))
                .collect(),
            biases: tower.biases.iter().map(|b| DVector::zeros(b.len())).collect(),
            input: DVector::zeros(input_dim),
        }
    }

    pub fn accumulate(&mut self, other: &TowerGradients) {
        for (acc, g) in self.weights.iter_mut().zip(&other.weights) {
            *acc += g;
        }
        for (acc, g) in self.biases.iter_mut().zip(&other.biases) {
            *acc += g;
        }
        self.input += &other.input;
    }

    pub fn scale(&mut self, factor: f32) {
        for w in &mut self.weights {
            *w *= factor;
        }
        for b in &mut self.biases {
            *b *= factor;
        }
        self.input *= factor;
    }

    /// Squared L2 norm of the weight and bias gradients (input excluded,
    /// it is not a parameter gradient).
    pub fn norm_squared(&self) -> f64 {
        let mut sum = 0.0f64;
        for w in &self.weights {
            sum += w.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>();
        }
        for b in &self.biases {
            sum += b.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>();
        }
        sum
    }
}

impl DenseTower {
    pub fn new(input_dim: usize, hidden_layers: &[usize], dropout: f32, rng: &mut StdRng) -> Self {
        let mut dims = vec![input_dim];
        dims.extend_from_slice(hidden_layers);
        dims.push(1);

        let mut weights = Vec::with_capacity(dims.len() - 1);
        let mut biases = Vec::with_capacity(dims.len() - 1);
        for pair in dims.windows(2) {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let data = initializer::xavier_uniform_with(rng, fan_in + fan_out, fan_in * fan_out);
            weights.push(DMatrix::from_vec(fan_out, fan_in, data));
            biases.push(DVector::zeros(fan_out));
        }

        Self {
            weights,
            biases,
            dropout,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.weights[0].ncols()
    }

    fn num_layers(&self) -> usize {
        self.weights.len()
    }

    /// Inference pass: no dropout (inverted dropout needs no rescaling here).
    pub fn forward(&self, input: &DVector<f32>) -> f32 {
        let mut activation = input.clone();
        for l in 0..self.num_layers() - 1 {
            let mut z = &self.weights[l] * &activation + &self.biases[l];
            z.apply(|x| *x = x.max(0.0));
            activation = z;
        }
        let last = self.num_layers() - 1;
        (&self.weights[last] * &activation + &self.biases[last])[0]
    }

    /// Training pass: applies dropout and returns the cache for backprop.
    pub fn forward_train(&self, input: &DVector<f32>, rng: &mut StdRng) -> (f32, TowerCache) {
        let layers = self.num_layers();
        let mut inputs = Vec::with_capacity(layers);
        let mut hidden = Vec::with_capacity(layers - 1);
        let mut masks = Vec::with_capacity(layers - 1);

        inputs.push(input.clone());
        for l in 0..layers - 1 {
            let mut z = &self.weights[l] * &inputs[l] + &self.biases[l];
            z.apply(|x| *x = x.max(0.0));
            hidden.push(z.clone());

            let (dropped, mask) = if self.dropout > 0.0 {
                let keep = 1.0 - self.dropout;
                let mask = DVector::from_iterator(
                    z.len(),
                    (0..z.len()).map(|_| {
                        if rng.gen::<f32>() < self.dropout {
                            0.0
                        } else {
                            1.0 / keep
                        }
                    }),
                );
                (z.component_mul(&mask), Some(mask))
            } else {
                (z, None)
            };
            masks.push(mask);
            inputs.push(dropped);
        }

        let last = layers - 1;
        let logit = (&self.weights[last] * &inputs[last] + &self.biases[last])[0];
        (
            logit,
            TowerCache {
                inputs,
                hidden,
                masks,
            },
        )
    }

    /// Backprop from the scalar head gradient down to the tower input.
    pub fn backward(&self, cache: &TowerCache, output_grad: f32) -> TowerGradients {
        let layers = self.num_layers();
        let mut grad_weights: Vec<DMatrix<f32>> = self
            .weights
            .iter()
            .map(|w| DMatrix::zeros(w.nrows(), w.ncols()))
            .collect();
        let mut grad_biases: Vec<DVector<f32>> =
            self.biases.iter().map(|b| DVector::zeros(b.len())).collect();

        let mut delta = DVector::from_element(1, output_grad);
        let mut input_grad = DVector::zeros(self.input_dim());
        for l in (0..layers).rev() {
            grad_weights[l] = &delta * cache.inputs[l].transpose();
            grad_biases[l] = delta.clone();

            let back = self.weights[l].tr_mul(&delta);
            if l == 0 {
                input_grad = back;
            } else {
                let mut d = back;
                let activation = &cache.hidden[l - 1];
                for i in 0..d.len() {
                    if activation[i] <= 0.0 {
                        d[i] = 0.0;
                    }
                }
                if let Some(mask) = &cache.masks[l - 1] {
                    d.component_mul_assign(mask);
                }
                delta = d;
            }
        }

        TowerGradients {
            weights: grad_weights,
            biases: grad_biases,
            input: input_grad,
        }
    }

    pub fn apply_gradients(
        &mut self,
        prefix: &str,
        grads: &TowerGradients,
        optimizer: &mut dyn Optimizer,
    ) {
        for (l, (w, gw)) in self.weights.iter_mut().zip(&grads.weights).enumerate() {
            let mut flat = DVector::from_column_slice(w.as_slice());
            let grad_flat = DVector::from_column_slice(gw.as_slice());
            optimizer.step(&format!("{}.w{}", prefix, l), &mut flat, &grad_flat);
            w.as_mut_slice().copy_from_slice(flat.as_slice());
        }
        for (l, (b, gb)) in self.biases.iter_mut().zip(&grads.biases).enumerate() {
            optimizer.step(&format!("{}.b{}", prefix, l), b, gb);
        }
    }

    pub fn num_parameters(&self) -> usize {
        let weights: usize = self.weights.iter().map(|w| w.len()).sum();
        let biases: usize = self.biases.iter().map(|b| b.len()).sum();
        weights + biases
    }

    pub fn export_tensors(&self, prefix: &str, checkpoint: &mut Checkpoint) {
        for (l, w) in self.weights.iter().enumerate() {
            let data: Vec<f32> = w.row_iter().flat_map(|r| r.iter().copied().collect::<Vec<_>>()).collect();
            checkpoint.insert(
                &format!("{}.w{}", prefix, l),
                TensorData::new(w.nrows(), w.ncols(), data),
            );
        }
        for (l, b) in self.biases.iter().enumerate() {
            checkpoint.insert(
                &format!("{}.b{}", prefix, l),
                TensorData::new(b.len(), 1, b.as_slice().to_vec()),
            );
        }
    }

    pub fn restore_tensors(&mut self, prefix: &str, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        for l in 0..self.num_layers() {
            let w = checkpoint.tensor(&format!("{}.w{}", prefix, l))?;
            anyhow::ensure!(
                w.rows == self.weights[l].nrows() && w.cols == self.weights[l].ncols(),
                "tensor {}.w{} has shape {}x{}, expected {}x{}",
                prefix,
                l,
                w.rows,
                w.cols,
                self.weights[l].nrows(),
                self.weights[l].ncols()
            );
            self.weights[l] = DMatrix::from_row_slice(w.rows, w.cols, &w.data);

            let b = checkpoint.tensor(&format!("{}.b{}", prefix, l))?;
            anyhow::ensure!(
                b.rows == self.biases[l].len(),
                "tensor {}.b{} has {} rows, expected {}",
                prefix,
                l,
                b.rows,
                self.biases[l].len()
            );
            self.biases[l] = DVector::from_vec(b.data.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::optimizer::Sgd;
    use rand::SeedableRng;

    fn tower() -> (DenseTower, StdRng) {
        let mut rng = StdRng::seed_from_u64(0);
        let tower = DenseTower::new(4, &[8, 4], 0.0, &mut rng);
        (tower, rng)
    }

    #[test]
    fn forward_matches_train_forward_without_dropout() {
        let (tower, mut rng) = tower();
        let x = DVector::from_vec(vec![0.5, -0.2, 0.1, 0.9]);
        let inference = tower.forward(&x);
        let (train, _) = tower.forward_train(&x, &mut rng);
        assert!((inference - train).abs() < 1e-6);
    }

    #[test]
    fn backward_gradient_matches_finite_difference() {
        let (mut tower, mut rng) = tower();
        let x = DVector::from_vec(vec![0.5, -0.2, 0.1, 0.9]);
        let (_, cache) = tower.forward_train(&x, &mut rng);
        let grads = tower.backward(&cache, 1.0);

        // Nudge one weight entry and compare against the analytic gradient.
        let eps = 1e-3f32;
        let base = tower.forward(&x);
        tower.weights[0][(2, 1)] += eps;
        let bumped = tower.forward(&x);
        let numeric = (bumped - base) / eps;
        let analytic = grads.weights[0][(2, 1)];
        assert!(
            (numeric - analytic).abs() < 1e-2,
            "numeric {} vs analytic {}",
            numeric,
            analytic
        );
    }

    #[test]
    fn gradient_step_reduces_output_error() {
        let (mut tower, mut rng) = tower();
        let x = DVector::from_vec(vec![1.0, 0.5, -0.5, 0.25]);
        let target = 2.0f32;
        let mut optimizer = Sgd::new(0.05);

        let mut last_error = f32::INFINITY;
        for _ in 0..50 {
            let (out, cache) = tower.forward_train(&x, &mut rng);
            let error = out - target;
            let grads = tower.backward(&cache, 2.0 * error);
            tower.apply_gradients("deep", &grads, &mut optimizer);
            last_error = error.abs();
        }
        assert!(last_error < 0.1, "error after training: {}", last_error);
    }

    #[test]
    fn checkpoint_round_trip_preserves_output() {
        let (tower, _) = tower();
        let config = crate::config::Config::default().model;
        let mut checkpoint = Checkpoint::new(
            config,
            crate::models::RatingFormat::Binary,
            1,
            1,
        );
        tower.export_tensors("deep", &mut checkpoint);

        let mut rng = StdRng::seed_from_u64(99);
        let mut restored = DenseTower::new(4, &[8, 4], 0.0, &mut rng);
        restored.restore_tensors("deep", &checkpoint).unwrap();

        let x = DVector::from_vec(vec![0.3, 0.1, -0.7, 0.4]);
        assert!((tower.forward(&x) - restored.forward(&x)).abs() < 1e-6);
    }

    #[test]
    fn dropout_masks_are_inverted_scale() {
        let mut rng = StdRng::seed_from_u64(1);
        let tower = DenseTower::new(4, &[32], 0.5, &mut rng);
        let x = DVector::from_vec(vec![1.0, 1.0, 1.0, 1.0]);
        let (_, cache) = tower.forward_train(&x, &mut rng);
        let mask = cache.masks[0].as_ref().unwrap();
        assert!(mask.iter().all(|&m| m == 0.0 || (m - 2.0).abs() < 1e-6));
    }
}
