use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::config::DataConfig;
use crate::models::{Batch, DatasetSource, Interaction, ItemId, RatingFormat, UserId};

#[derive(Debug, Error)]
pub enum DataError {
    #[error("failed to read ratings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse ratings file: {0}")]
    Csv(#[from] csv::Error),
    #[error("row {row}: expected at least 3 columns (user, item, rating)")]
    MissingColumns { row: usize },
    #[error("row {row}: could not parse field '{value}'")]
    BadField { row: usize, value: String },
    #[error("row {row}: rating is not finite")]
    NonFiniteRating { row: usize },
    #[error("no interactions loaded")]
    Empty,
    #[error("invalid interaction: {0}")]
    Invalid(String),
    #[error("eval size {eval_size} must be smaller than the dataset ({len} examples)")]
    EvalTooLarge { eval_size: usize, len: usize },
}

/// One raw rating row before label mapping.
#[derive(Debug, Clone, Copy)]
struct RawRating {
    user_id: UserId,
    item_id: ItemId,
    rating: f32,
}

/// Loaded rating log with positive/negative pools and derived statistics.
///
/// Examples are materialized once at construction from a seeded RNG: index
/// `i` draws from the positive pool when `i % negative_ratio == 0` and from
/// the negative pool otherwise, so roughly one example in `negative_ratio`
/// is positive. Labels follow the configured [`RatingFormat`].
pub struct RatingsDataset {
    format: RatingFormat,
    num_users: usize,
    num_items: usize,
    examples: Vec<Interaction>,
    popularity: HashMap<ItemId, usize>,
}

impl RatingsDataset {
    pub fn load_csv(path: impl AsRef<Path>, config: &DataConfig) -> Result<Self, DataError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path.as_ref())?;

        let mut rows = Vec::new();
        for (i, record) in reader.records().enumerate() {
            if let Some(max_rows) = config.max_rows {
                if rows.len() >= max_rows {
                    break;
                }
            }
            let record = record?;
            if record.len() < 3 {
                return Err(DataError::MissingColumns { row: i + 1 });
            }
            let parse_id = |field: &str| -> Result<usize, DataError> {
                field.trim().parse::<usize>().map_err(|_| DataError::BadField {
                    row: i + 1,
                    value: field.to_string(),
                })
            };
            let user_id = parse_id(&record[0])?;
            let item_id = parse_id(&record[1])?;
            let rating: f32 =
                record[2]
                    .trim()
                    .parse()
                    .map_err(|_| DataError::BadField {
                        row: i + 1,
                        value: record[2].to_string(),
                    })?;
            if !rating.is_finite() {
                return Err(DataError::NonFiniteRating { row: i + 1 });
            }
            if let Some(max_users) = config.max_users {
                if user_id >= max_users {
                    continue;
                }
            }
            rows.push(RawRating {
                user_id,
                item_id,
                rating,
            });
        }

        let dataset = Self::from_raw(rows, config)?;
        info!(
            source = ?config.source,
            examples = dataset.len(),
            users = dataset.num_users,
            items = dataset.num_items,
            "loaded ratings dataset"
        );
        Ok(dataset)
    }

    /// Builds a dataset from in-memory `(user, item, rating)` triples.
    pub fn from_rows(
        rows: Vec<(UserId, ItemId, f32)>,
        config: &DataConfig,
    ) -> Result<Self, DataError> {
        let rows = rows
            .into_iter()
            .filter(|(user_id, _, _)| match config.max_users {
                Some(max) => *user_id < max,
                None => true,
            })
            .map(|(user_id, item_id, rating)| RawRating {
                user_id,
                item_id,
                rating,
            })
            .collect();
        Self::from_raw(rows, config)
    }

    fn from_raw(rows: Vec<RawRating>, config: &DataConfig) -> Result<Self, DataError> {
        if rows.is_empty() {
            return Err(DataError::Empty);
        }

        let num_users = rows.iter().map(|r| r.user_id).max().unwrap_or(0) + 1;
        let num_items = rows.iter().map(|r| r.item_id).max().unwrap_or(0) + 1;

        let mut popularity: HashMap<ItemId, usize> = HashMap::new();
        for row in &rows {
            *popularity.entry(row.item_id).or_insert(0) += 1;
        }

        let threshold = config.positive_threshold;
        let (positives, negatives): (Vec<RawRating>, Vec<RawRating>) =
            rows.iter().copied().partition(|r| r.rating >= threshold);

        let mut rng = StdRng::seed_from_u64(config.seed);
        let ratio = config.negative_ratio.max(1);
        let mut examples = Vec::with_capacity(rows.len());
        for i in 0..rows.len() {
            let want_positive = i % ratio == 0;
            // Fall back to the other pool when the preferred one is empty.
            let pool = match (want_positive, positives.is_empty(), negatives.is_empty()) {
                (true, false, _) | (false, _, true) => &positives,
                _ => &negatives,
            };
            let raw = pool[rng.gen_range(0..pool.len())];
            let label = match config.rating_format {
                RatingFormat::Binary => {
                    if raw.rating >= threshold {
                        1.0
                    } else {
                        0.0
                    }
                }
                RatingFormat::Explicit => raw.rating,
            };
            let interaction = Interaction {
                user_id: raw.user_id,
                item_id: raw.item_id,
                label,
            };
            crate::utils::validation::validate_interaction(&interaction)
                .map_err(|e| DataError::Invalid(e.to_string()))?;
            examples.push(interaction);
        }

        Ok(Self {
            format: config.rating_format,
            num_users,
            num_items,
            examples,
            popularity,
        })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn num_users(&self) -> usize {
        self.num_users
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn rating_format(&self) -> RatingFormat {
        self.format
    }

    /// Interaction counts per item over the loaded log.
    pub fn item_popularity(&self) -> &HashMap<ItemId, usize> {
        &self.popularity
    }

    /// Random train/eval split; eval holds exactly `eval_size` examples.
    pub fn split(&self, eval_size: usize, seed: u64) -> Result<(Subset, Subset), DataError> {
        if eval_size >= self.examples.len() {
            return Err(DataError::EvalTooLarge {
                eval_size,
                len: self.examples.len(),
            });
        }

        let mut indices: Vec<usize> = (0..self.examples.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        // Fisher-Yates
        for i in (1..indices.len()).rev() {
            let j = rng.gen_range(0..=i);
            indices.swap(i, j);
        }

        let eval = indices[..eval_size]
            .iter()
            .map(|&i| self.examples[i])
            .collect();
        let train = indices[eval_size..]
            .iter()
            .map(|&i| self.examples[i])
            .collect();
        Ok((Subset { examples: train }, Subset { examples: eval }))
    }

    /// Logs a user's predicted and actual top-k lists for spot checks.
    pub fn describe_recommendations(
        &self,
        user_id: UserId,
        predicted: &[ItemId],
        actual: &[ItemId],
    ) {
        info!(user_id, "predicted top-{}: {:?}", predicted.len(), predicted);
        info!(user_id, "actual    top-{}: {:?}", actual.len(), actual);
    }
}

/// A materialized slice of the dataset, as produced by [`RatingsDataset::split`].
pub struct Subset {
    examples: Vec<Interaction>,
}

impl Subset {
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn batches(&self, batch_size: usize, drop_last: bool) -> impl Iterator<Item = Batch> + '_ {
        self.examples
            .chunks(batch_size)
            .filter(move |chunk| !drop_last || chunk.len() == batch_size)
            .map(|chunk| {
                let mut batch = Batch::default();
                for interaction in chunk {
                    batch.push(interaction);
                }
                batch
            })
    }
}
