use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;

pub fn xavier_uniform(size: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    xavier_uniform_with(&mut rng, size, size)
}

/// Xavier-uniform draw with an explicit fan sum, for weight matrices.
pub fn xavier_uniform_with(rng: &mut impl Rng, fan: usize, size: usize) -> Vec<f32> {
    let limit = (6.0 / fan as f32).sqrt();
    (0..size).map(|_| rng.gen_range(-limit..limit)).collect()
}

pub fn xavier_normal_with(rng: &mut impl Rng, fan: usize, size: usize) -> Vec<f32> {
    let std_dev = (2.0 / fan as f32).sqrt();
    (0..size)
        .map(|_| {
            let u1: f32 = rng.gen_range(1e-7..1.0);
            let u2: f32 = rng.gen();
            let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
            z0 * std_dev
        })
        .collect()
}

pub fn zeros(size: usize) -> Vec<f32> {
    vec![0.0; size]
}

/// Deterministic per-row embedding initialization: a given (table, row)
/// pair always produces the same vector for the same master seed.
pub struct EmbeddingInitializer {
    dimension: usize,
    seed: u64,
}

impl EmbeddingInitializer {
    pub fn new(dimension: usize, seed: u64) -> Self {
        Self { dimension, seed }
    }

    pub fn row(&self, table: &str, index: usize) -> DVector<f32> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        table.hash(&mut hasher);
        index.hash(&mut hasher);
        let mut rng = StdRng::seed_from_u64(self.seed ^ hasher.finish());

        let limit = (6.0 / self.dimension as f32).sqrt();
        DVector::from_iterator(
            self.dimension,
            (0..self.dimension).map(|_| rng.gen_range(-limit..limit)),
        )
    }

    pub fn table(&self, name: &str, rows: usize) -> Vec<DVector<f32>> {
        (0..rows).map(|i| self.row(name, i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xavier_uniform_stays_in_range() {
        let weights = xavier_uniform(100);
        assert_eq!(weights.len(), 100);
        let limit = (6.0 / 100.0_f32).sqrt();
        for &w in &weights {
            assert!(w >= -limit && w <= limit);
        }
    }

    #[test]
    fn embedding_rows_are_reproducible() {
        let init = EmbeddingInitializer::new(16, 42);
        assert_eq!(init.row("user_factors", 3), init.row("user_factors", 3));
        assert_ne!(init.row("user_factors", 3), init.row("user_factors", 4));
        assert_ne!(init.row("user_factors", 3), init.row("item_factors", 3));
    }

    #[test]
    fn table_has_requested_rows() {
        let init = EmbeddingInitializer::new(8, 0);
        let table = init.table("item_factors", 12);
        assert_eq!(table.len(), 12);
        assert!(table.iter().all(|row| row.len() == 8));
    }
}
