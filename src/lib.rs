pub mod algorithms;
pub mod config;
pub mod data;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use models::*;

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::RwLock;

use algorithms::Recommender;
use data::RatingsDataset;
use services::evaluation::EvaluationService;
use services::tracking::ExperimentTracker;
use services::training::TrainingService;

/// One wired-up training/evaluation run: dataset, model and services.
#[derive(Clone)]
pub struct Experiment {
    pub config: Arc<Config>,
    pub dataset: Arc<RatingsDataset>,
    pub recommender: Arc<RwLock<Box<dyn Recommender>>>,
    pub tracker: Arc<ExperimentTracker>,
    pub evaluation_service: Arc<EvaluationService>,
    pub training_service: Arc<TrainingService>,
}

impl Experiment {
    pub async fn new(config: Config) -> Result<Self> {
        let dataset = RatingsDataset::load_csv(&config.data.path, &config.data)?;
        Self::with_dataset(config, dataset).await
    }

    /// Wires an experiment around an already-loaded dataset.
    pub async fn with_dataset(config: Config, dataset: RatingsDataset) -> Result<Self> {
        utils::validation::validate_config(&config)?;
        let config = Arc::new(config);
        let dataset = Arc::new(dataset);

        let recommender = Arc::new(RwLock::new(algorithms::build_model(
            &config.model,
            dataset.rating_format(),
            dataset.num_users(),
            dataset.num_items(),
            config.data.seed,
        )));

        let tracker = Arc::new(ExperimentTracker::new(&config.tracking)?);

        let evaluation_service = Arc::new(EvaluationService::new(config.clone()));

        let training_service = Arc::new(TrainingService::new(
            recommender.clone(),
            evaluation_service.clone(),
            tracker.clone(),
            config.clone(),
        ));

        Ok(Self {
            config,
            dataset,
            recommender,
            tracker,
            evaluation_service,
            training_service,
        })
    }
}

pub async fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
