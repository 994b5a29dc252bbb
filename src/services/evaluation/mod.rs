use anyhow::Result;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use crate::algorithms::Recommender;
use crate::config::Config;
use crate::data::RatingsDataset;
use crate::models::{Batch, EvalReport, ItemId, UserId};
use crate::utils::metrics::{self, MetricsCalculator};
use crate::utils::{mean, top_k_indices};

/// Scores every candidate item for every user in an eval batch, ranks them
/// and aggregates recommendation-quality metrics over the top-k lists.
pub struct EvaluationService {
    config: Arc<Config>,
    calculator: MetricsCalculator,
    rng: Mutex<StdRng>,
}

impl EvaluationService {
    pub fn new(config: Arc<Config>) -> Self {
        let calculator = MetricsCalculator::new(config.evaluation.top_k);
        let rng = Mutex::new(StdRng::seed_from_u64(config.data.seed));
        Self {
            config,
            calculator,
            rng,
        }
    }

    pub async fn evaluate(
        &self,
        dataset: &RatingsDataset,
        recommender: &dyn Recommender,
        batch: &Batch,
    ) -> Result<EvalReport> {
        anyhow::ensure!(!batch.is_empty(), "cannot evaluate an empty batch");
        let k = self.config.evaluation.top_k;
        let format = dataset.rating_format();

        // Loss over the batch under the training objective.
        let predictions: Vec<f32> = batch
            .users
            .par_iter()
            .zip(batch.items.par_iter())
            .map(|(&user_id, &item_id)| recommender.predict(user_id, item_id))
            .collect();
        let eval_loss = mean(
            &predictions
                .iter()
                .zip(&batch.labels)
                .map(|(&p, &y)| format.loss(p, y) as f64)
                .collect::<Vec<_>>(),
        );

        // Distinct users in first-occurrence order; the first one doubles
        // as the spot-check user.
        let mut seen = HashSet::new();
        let mut users: Vec<UserId> = Vec::new();
        for &user_id in &batch.users {
            if seen.insert(user_id) {
                users.push(user_id);
            }
        }

        // The ground-truth list is the batch's top-rated positions.
        let true_items: Vec<ItemId> = top_k_indices(&batch.labels, k)
            .into_iter()
            .map(|position| batch.items[position])
            .collect();
        let true_set: HashSet<ItemId> = true_items.iter().copied().collect();

        // Per-user ranking over every candidate item in the batch.
        let lists: Vec<Vec<ItemId>> = users
            .par_iter()
            .map(|&user_id| {
                let scores: Vec<f32> = batch
                    .items
                    .iter()
                    .map(|&item_id| recommender.predict(user_id, item_id))
                    .collect();
                top_k_indices(&scores, k)
                    .into_iter()
                    .map(|position| batch.items[position])
                    .collect()
            })
            .collect();

        if let (Some(&first_user), Some(first_list)) = (users.first(), lists.first()) {
            dataset.describe_recommendations(first_user, first_list, &true_items);
        }

        let catalog: HashSet<ItemId> = batch.items.iter().copied().collect();
        let catalog_size = catalog.len();

        let precision = mean(
            &lists
                .iter()
                .map(|list| self.calculator.precision_at_k(list, &true_set))
                .collect::<Vec<_>>(),
        );
        let recall = mean(
            &lists
                .iter()
                .map(|list| self.calculator.recall_at_k(list, &true_set))
                .collect::<Vec<_>>(),
        );
        let f1 = self.calculator.f1_score(precision, recall);
        let ndcg = mean(
            &lists
                .iter()
                .map(|list| self.calculator.ndcg_at_k(list, &true_set))
                .collect::<Vec<_>>(),
        );

        let novelty =
            self.calculator
                .novelty(&lists, dataset.item_popularity(), dataset.num_users());
        let prediction_coverage = self.calculator.prediction_coverage(&lists, catalog_size);
        let catalog_coverage = {
            let mut rng = self.rng.lock();
            self.calculator.catalog_coverage(
                &lists,
                catalog_size,
                self.config.evaluation.coverage_sample_lists,
                &mut *rng,
            )
        };
        let personalization = self.calculator.personalization(&lists);
        let roc_auc = metrics::roc_auc(&predictions, &batch.labels);

        let report = EvalReport {
            eval_loss,
            precision_at_k: precision,
            recall_at_k: recall,
            f1_score: f1,
            ndcg_at_k: ndcg,
            novelty,
            prediction_coverage,
            catalog_coverage,
            personalization,
            roc_auc,
        };
        info!(
            users = users.len(),
            candidates = catalog_size,
            k,
            "evaluation complete: {}",
            serde_json::to_string(&report)?
        );
        Ok(report)
    }
}
