use criterion::{black_box, criterion_group, criterion_main, Criterion};
use reclab::algorithms::{build_model, optimizer::Sgd};
use reclab::config::Config;
use reclab::data::RatingsDataset;
use reclab::services::evaluation::EvaluationService;
use reclab::{Batch, Experiment, ModelArchitecture, RatingFormat};
use std::sync::Arc;

fn bench_config() -> Config {
    let mut config = Config::default();
    config.data.max_rows = None;
    config.model.embedding_dim = 32;
    config.model.layers = vec![64, 32, 16, 8];
    config.model.dropout = 0.2;
    config.evaluation.top_k = 10;
    config
}

fn synthetic_batch(size: usize, num_users: usize, num_items: usize) -> Batch {
    Batch {
        users: (0..size).map(|i| i % num_users).collect(),
        items: (0..size).map(|i| (i * 7) % num_items).collect(),
        labels: (0..size).map(|i| (i % 2) as f32).collect(),
    }
}

fn benchmark_fit_batch(c: &mut Criterion) {
    let config = bench_config();
    let batch = synthetic_batch(128, 500, 1000);

    c.bench_function("matrix_factorization_fit_batch", |b| {
        let mut model = build_model(&config.model, RatingFormat::Binary, 500, 1000, 0);
        let mut optimizer = Sgd::new(0.01);
        b.iter(|| {
            black_box(model.fit_batch(&batch, &mut optimizer, 100.0));
        });
    });

    c.bench_function("neural_cf_fit_batch", |b| {
        let mut model_config = config.model.clone();
        model_config.architecture = ModelArchitecture::NeuralCf;
        let mut model = build_model(&model_config, RatingFormat::Binary, 500, 1000, 0);
        let mut optimizer = Sgd::new(0.01);
        b.iter(|| {
            black_box(model.fit_batch(&batch, &mut optimizer, 100.0));
        });
    });
}

fn benchmark_evaluation(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = bench_config();

    let mut rows = Vec::new();
    for user in 0..100 {
        for item in 0..50 {
            let rating = if (user + item) % 3 == 0 { 4.5 } else { 2.0 };
            rows.push((user, item, rating));
        }
    }
    let dataset = RatingsDataset::from_rows(rows, &config.data).unwrap();
    let experiment = rt
        .block_on(Experiment::with_dataset(config.clone(), dataset))
        .unwrap();
    let (_, eval) = experiment.dataset.split(100, 0).unwrap();
    let batch = eval.batches(100, false).next().unwrap();
    let service = EvaluationService::new(Arc::new(config));

    c.bench_function("evaluate_top_k_batch", |b| {
        b.to_async(&rt).iter(|| async {
            let recommender = experiment.recommender.read().await;
            black_box(
                service
                    .evaluate(&experiment.dataset, recommender.as_ref(), &batch)
                    .await
                    .unwrap(),
            );
        });
    });
}

criterion_group!(benches, benchmark_fit_batch, benchmark_evaluation);
criterion_main!(benches);
