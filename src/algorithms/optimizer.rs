use nalgebra::DVector;
use std::collections::HashMap;

use crate::config::{OptimizerKind, TrainingConfig};

/// Parameter updates keyed by name, so embedding rows keep their own
/// moment state and update sparsely.
pub trait Optimizer: Send + Sync {
    fn step(&mut self, key: &str, params: &mut DVector<f32>, gradients: &DVector<f32>);
    fn reset(&mut self);
}

pub fn build(config: &TrainingConfig) -> Box<dyn Optimizer> {
    match config.optimizer {
        OptimizerKind::Sgd => Box::new(Sgd::new(config.learning_rate)),
        OptimizerKind::Adam => Box::new(Adam::new(config.learning_rate, 0.9, 0.999, 1e-8)),
        OptimizerKind::AdamW => Box::new(AdamW::new(
            config.learning_rate,
            config.weight_decay,
            0.9,
            0.999,
            1e-8,
        )),
    }
}

#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f64,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, _key: &str, params: &mut DVector<f32>, gradients: &DVector<f32>) {
        *params -= gradients * self.learning_rate as f32;
    }

    fn reset(&mut self) {
        // SGD doesn't maintain state
    }
}

#[derive(Debug, Clone)]
struct MomentSlot {
    t: i32,
    m: DVector<f32>,
    v: DVector<f32>,
}

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    state: HashMap<String, MomentSlot>,
}

impl Adam {
    pub fn new(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            state: HashMap::new(),
        }
    }

    fn adam_update(&mut self, key: &str, params: &mut DVector<f32>, gradients: &DVector<f32>) {
        let slot = self.state.entry(key.to_string()).or_insert_with(|| MomentSlot {
            t: 0,
            m: DVector::zeros(params.len()),
            v: DVector::zeros(params.len()),
        });
        slot.t += 1;

        let beta1 = self.beta1 as f32;
        let beta2 = self.beta2 as f32;

        // Biased moment estimates
        slot.m = slot.m.scale(beta1) + gradients.scale(1.0 - beta1);
        slot.v = slot.v.scale(beta2)
            + gradients.component_mul(gradients).scale(1.0 - beta2);

        // Bias correction
        let m_hat = slot.m.scale(1.0 / (1.0 - beta1.powi(slot.t)));
        let v_hat = slot.v.scale(1.0 / (1.0 - beta2.powi(slot.t)));

        let denominator = v_hat.map(|x| (x.sqrt() + self.epsilon as f32));
        let update = m_hat.component_div(&denominator).scale(self.learning_rate as f32);

        *params -= update;
    }
}

impl Optimizer for Adam {
    fn step(&mut self, key: &str, params: &mut DVector<f32>, gradients: &DVector<f32>) {
        self.adam_update(key, params, gradients);
    }

    fn reset(&mut self) {
        self.state.clear();
    }
}

/// Adam with decoupled weight decay: the decay term shrinks parameters
/// directly instead of entering the moment estimates.
#[derive(Debug, Clone)]
pub struct AdamW {
    inner: Adam,
    weight_decay: f64,
}

impl AdamW {
    pub fn new(
        learning_rate: f64,
        weight_decay: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
    ) -> Self {
        Self {
            inner: Adam::new(learning_rate, beta1, beta2, epsilon),
            weight_decay,
        }
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, key: &str, params: &mut DVector<f32>, gradients: &DVector<f32>) {
        let shrink = 1.0 - (self.inner.learning_rate * self.weight_decay) as f32;
        *params *= shrink;
        self.inner.adam_update(key, params, gradients);
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}
