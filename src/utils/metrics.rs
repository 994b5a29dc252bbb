use rand::rngs::StdRng;
use rand::Rng;
use std::collections::{HashMap, HashSet};

use crate::models::ItemId;

/// Ranking and diversity metrics over per-user top-k recommendation lists.
#[derive(Debug, Clone)]
pub struct MetricsCalculator {
    k: usize,
}

impl MetricsCalculator {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    pub fn precision_at_k(&self, recommended: &[ItemId], relevant: &HashSet<ItemId>) -> f64 {
        if recommended.is_empty() {
            return 0.0;
        }

        let hits = recommended
            .iter()
            .take(self.k)
            .filter(|item| relevant.contains(item))
            .count();

        hits as f64 / self.k.min(recommended.len()) as f64
    }

    pub fn recall_at_k(&self, recommended: &[ItemId], relevant: &HashSet<ItemId>) -> f64 {
        if relevant.is_empty() {
            return 0.0;
        }

        let hits = recommended
            .iter()
            .take(self.k)
            .filter(|item| relevant.contains(item))
            .count();

        hits as f64 / relevant.len() as f64
    }

    pub fn f1_score(&self, precision: f64, recall: f64) -> f64 {
        if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        }
    }

    /// NDCG@k with unit gain for items in the relevant set and a
    /// log2(rank + 1) discount.
    pub fn ndcg_at_k(&self, recommended: &[ItemId], relevant: &HashSet<ItemId>) -> f64 {
        let dcg: f64 = recommended
            .iter()
            .take(self.k)
            .enumerate()
            .filter(|(_, item)| relevant.contains(item))
            .map(|(i, _)| 1.0 / ((i + 2) as f64).log2())
            .sum();

        let ideal_hits = self.k.min(relevant.len());
        let idcg: f64 = (0..ideal_hits).map(|i| 1.0 / ((i + 2) as f64).log2()).sum();

        if idcg == 0.0 {
            0.0
        } else {
            dcg / idcg
        }
    }

    /// Mean self-information of the recommended items: rare items score
    /// high, blockbusters score low. Items absent from the popularity table
    /// are skipped.
    pub fn novelty(
        &self,
        lists: &[Vec<ItemId>],
        popularity: &HashMap<ItemId, usize>,
        num_users: usize,
    ) -> f64 {
        if lists.is_empty() || num_users == 0 {
            return 0.0;
        }

        let per_list: Vec<f64> = lists
            .iter()
            .map(|list| {
                if list.is_empty() {
                    return 0.0;
                }
                let information: f64 = list
                    .iter()
                    .filter_map(|item| popularity.get(item))
                    .map(|&count| -(count as f64 / num_users as f64).log2())
                    .sum();
                information / list.len() as f64
            })
            .collect();

        crate::utils::mean(&per_list)
    }

    /// Share of the candidate catalog that appears in at least one list.
    pub fn prediction_coverage(&self, lists: &[Vec<ItemId>], catalog_size: usize) -> f64 {
        if catalog_size == 0 {
            return 0.0;
        }

        let recommended: HashSet<ItemId> = lists.iter().flatten().copied().collect();
        recommended.len() as f64 / catalog_size as f64
    }

    /// Catalog coverage over a random sample of `sample_lists` lists.
    pub fn catalog_coverage(
        &self,
        lists: &[Vec<ItemId>],
        catalog_size: usize,
        sample_lists: usize,
        rng: &mut StdRng,
    ) -> f64 {
        if catalog_size == 0 || lists.is_empty() {
            return 0.0;
        }

        let sample = sample_lists.min(lists.len());
        let mut indices: Vec<usize> = (0..lists.len()).collect();
        for i in (1..indices.len()).rev() {
            let j = rng.gen_range(0..=i);
            indices.swap(i, j);
        }

        let recommended: HashSet<ItemId> = indices[..sample]
            .iter()
            .flat_map(|&i| lists[i].iter().copied())
            .collect();
        recommended.len() as f64 / catalog_size as f64
    }

    /// 1 minus the mean pairwise cosine similarity between users' binary
    /// recommendation-indicator vectors. 1.0 means fully disjoint lists.
    pub fn personalization(&self, lists: &[Vec<ItemId>]) -> f64 {
        if lists.len() < 2 {
            return 0.0;
        }

        let vocabulary: Vec<ItemId> = {
            let set: HashSet<ItemId> = lists.iter().flatten().copied().collect();
            let mut items: Vec<ItemId> = set.into_iter().collect();
            items.sort_unstable();
            items
        };
        let index: HashMap<ItemId, usize> = vocabulary
            .iter()
            .enumerate()
            .map(|(i, &item)| (item, i))
            .collect();

        let indicators: Vec<Vec<f32>> = lists
            .iter()
            .map(|list| {
                let mut row = vec![0.0f32; vocabulary.len()];
                for item in list {
                    row[index[item]] = 1.0;
                }
                row
            })
            .collect();

        let mut total = 0.0f64;
        let mut pairs = 0usize;
        for i in 0..indicators.len() {
            for j in (i + 1)..indicators.len() {
                total += crate::utils::cosine_similarity(&indicators[i], &indicators[j]) as f64;
                pairs += 1;
            }
        }

        1.0 - total / pairs as f64
    }
}

/// Rank-based ROC AUC (Mann-Whitney) with average ranks for tied scores.
/// Returns `None` when the labels are single-class.
pub fn roc_auc(scores: &[f32], labels: &[f32]) -> Option<f64> {
    debug_assert_eq!(scores.len(), labels.len());

    let num_positive = labels.iter().filter(|&&l| l >= 0.5).count();
    let num_negative = labels.len() - num_positive;
    if num_positive == 0 || num_negative == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[a]
            .partial_cmp(&scores[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // Average ranks across tie groups, 1-based.
    let mut ranks = vec![0.0f64; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let rank = (i + 1 + j + 1) as f64 / 2.0;
        for &index in &order[i..=j] {
            ranks[index] = rank;
        }
        i = j + 1;
    }

    let positive_rank_sum: f64 = labels
        .iter()
        .zip(&ranks)
        .filter(|(&l, _)| l >= 0.5)
        .map(|(_, &r)| r)
        .sum();

    let u = positive_rank_sum - (num_positive * (num_positive + 1)) as f64 / 2.0;
    Some(u / (num_positive * num_negative) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn precision_and_recall() {
        let calculator = MetricsCalculator::new(3);
        let recommended = vec![1, 2, 3];
        let relevant: HashSet<ItemId> = [1, 3].into_iter().collect();

        let precision = calculator.precision_at_k(&recommended, &relevant);
        assert!((precision - 2.0 / 3.0).abs() < 1e-9);

        let recall = calculator.recall_at_k(&recommended, &relevant);
        assert!((recall - 1.0).abs() < 1e-9);

        let f1 = calculator.f1_score(precision, recall);
        let expected = 2.0 * precision * recall / (precision + recall);
        assert!((f1 - expected).abs() < 1e-9);
    }

    #[test]
    fn ndcg_is_one_for_perfect_ranking() {
        let calculator = MetricsCalculator::new(3);
        let relevant: HashSet<ItemId> = [1, 2, 3].into_iter().collect();
        let ndcg = calculator.ndcg_at_k(&[1, 2, 3], &relevant);
        assert!((ndcg - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ndcg_penalizes_late_hits() {
        let calculator = MetricsCalculator::new(3);
        let relevant: HashSet<ItemId> = [9].into_iter().collect();
        let early = calculator.ndcg_at_k(&[9, 1, 2], &relevant);
        let late = calculator.ndcg_at_k(&[1, 2, 9], &relevant);
        assert!(early > late);
        assert!(late > 0.0);
    }

    #[test]
    fn novelty_prefers_rare_items() {
        let calculator = MetricsCalculator::new(2);
        let mut popularity = HashMap::new();
        popularity.insert(1, 90);
        popularity.insert(2, 1);

        let popular = calculator.novelty(&[vec![1, 1]], &popularity, 100);
        let rare = calculator.novelty(&[vec![2, 2]], &popularity, 100);
        assert!(rare > popular);
    }

    #[test]
    fn prediction_coverage_counts_unique_items() {
        let calculator = MetricsCalculator::new(2);
        let lists = vec![vec![1, 2], vec![2, 3]];
        let coverage = calculator.prediction_coverage(&lists, 10);
        assert!((coverage - 0.3).abs() < 1e-9);
    }

    #[test]
    fn catalog_coverage_with_all_lists_matches_prediction_coverage() {
        let calculator = MetricsCalculator::new(2);
        let lists = vec![vec![1, 2], vec![2, 3]];
        let mut rng = StdRng::seed_from_u64(0);
        let catalog = calculator.catalog_coverage(&lists, 10, lists.len(), &mut rng);
        let prediction = calculator.prediction_coverage(&lists, 10);
        assert!((catalog - prediction).abs() < 1e-9);
    }

    #[test]
    fn personalization_is_one_for_disjoint_lists() {
        let calculator = MetricsCalculator::new(2);
        let disjoint = calculator.personalization(&[vec![1, 2], vec![3, 4]]);
        assert!((disjoint - 1.0).abs() < 1e-9);

        let identical = calculator.personalization(&[vec![1, 2], vec![1, 2]]);
        assert!(identical.abs() < 1e-9);
    }

    #[test]
    fn roc_auc_perfect_separation() {
        let scores = vec![0.9, 0.8, 0.2, 0.1];
        let labels = vec![1.0, 1.0, 0.0, 0.0];
        assert!((roc_auc(&scores, &labels).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn roc_auc_random_is_half() {
        let scores = vec![0.5, 0.5, 0.5, 0.5];
        let labels = vec![1.0, 0.0, 1.0, 0.0];
        assert!((roc_auc(&scores, &labels).unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn roc_auc_single_class_is_undefined() {
        let scores = vec![0.5, 0.4];
        assert!(roc_auc(&scores, &[1.0, 1.0]).is_none());
        assert!(roc_auc(&scores, &[0.0, 0.0]).is_none());
    }
}
