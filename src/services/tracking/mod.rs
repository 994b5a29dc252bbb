use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::TrackingConfig;

/// One logged scalar, as it lands in the run's JSONL file.
#[derive(Debug, Clone, Serialize)]
pub struct TrackRecord {
    pub run_id: Uuid,
    pub step: u64,
    pub name: String,
    pub value: f64,
    pub logged_at: DateTime<Utc>,
}

enum TrackMessage {
    Record(TrackRecord),
    Flush(oneshot::Sender<()>),
}

/// Where flushed records go.
#[async_trait]
pub trait TrackerBackend: Send {
    async fn write(&mut self, records: &[TrackRecord]) -> anyhow::Result<()>;
}

/// Appends records to `<dir>/run-<id>.jsonl`.
pub struct JsonlBackend {
    writer: std::io::BufWriter<std::fs::File>,
    path: PathBuf,
}

impl JsonlBackend {
    pub fn create(dir: &str, run_id: Uuid) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = PathBuf::from(dir).join(format!("run-{}.jsonl", run_id));
        let file = std::fs::File::create(&path)?;
        Ok(Self {
            writer: std::io::BufWriter::new(file),
            path,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl TrackerBackend for JsonlBackend {
    async fn write(&mut self, records: &[TrackRecord]) -> anyhow::Result<()> {
        for record in records {
            serde_json::to_writer(&mut self.writer, record)?;
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// Local experiment tracker: scalars are queued onto a channel and batch
/// flushed by a background worker, with the latest value of every metric
/// kept in memory for inspection.
pub struct ExperimentTracker {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    tx: Option<mpsc::Sender<TrackMessage>>,
    latest: Arc<RwLock<HashMap<String, f64>>>,
}

impl ExperimentTracker {
    pub fn new(config: &TrackingConfig) -> anyhow::Result<Self> {
        let run_id = Uuid::new_v4();
        if !config.enabled {
            return Ok(Self::disabled_with_run_id(run_id));
        }

        let backend = JsonlBackend::create(&config.dir, run_id)?;
        info!(%run_id, path = %backend.path().display(), "experiment tracking enabled");
        let tracker = Self {
            run_id,
            started_at: Utc::now(),
            tx: Some(Self::spawn_worker(
                Box::new(backend),
                Duration::from_secs(config.flush_interval_secs.max(1)),
            )),
            latest: Arc::new(RwLock::new(HashMap::new())),
        };
        Ok(tracker)
    }

    /// Tracker that keeps the in-memory metric map but writes nothing.
    pub fn disabled() -> Self {
        Self::disabled_with_run_id(Uuid::new_v4())
    }

    fn disabled_with_run_id(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            tx: None,
            latest: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn spawn_worker(
        mut backend: Box<dyn TrackerBackend>,
        flush_interval: Duration,
    ) -> mpsc::Sender<TrackMessage> {
        let (tx, mut rx) = mpsc::channel::<TrackMessage>(1024);

        tokio::spawn(async move {
            let mut buffer: Vec<TrackRecord> = Vec::new();

            loop {
                tokio::select! {
                    message = rx.recv() => {
                        match message {
                            Some(TrackMessage::Record(record)) => {
                                buffer.push(record);
                                if buffer.len() >= 64 {
                                    if let Err(e) = backend.write(&buffer).await {
                                        error!("failed to write track records: {}", e);
                                    }
                                    buffer.clear();
                                }
                            }
                            Some(TrackMessage::Flush(ack)) => {
                                if let Err(e) = backend.write(&buffer).await {
                                    error!("failed to flush track records: {}", e);
                                }
                                buffer.clear();
                                let _ = ack.send(());
                            }
                            None => {
                                if !buffer.is_empty() {
                                    if let Err(e) = backend.write(&buffer).await {
                                        error!("failed to write final track records: {}", e);
                                    }
                                }
                                break;
                            }
                        }
                    }
                    _ = tokio::time::sleep(flush_interval) => {
                        if !buffer.is_empty() {
                            if let Err(e) = backend.write(&buffer).await {
                                error!("failed to write track records: {}", e);
                            }
                            buffer.clear();
                        }
                    }
                }
            }
        });

        tx
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn log_scalars(&self, step: u64, scalars: &[(&str, f64)]) {
        {
            let mut latest = self.latest.write();
            for (name, value) in scalars {
                latest.insert(name.to_string(), *value);
            }
        }

        let Some(tx) = &self.tx else {
            return;
        };
        for (name, value) in scalars {
            let record = TrackRecord {
                run_id: self.run_id,
                step,
                name: name.to_string(),
                value: *value,
                logged_at: Utc::now(),
            };
            debug!(step, name, value, "tracked scalar");
            if tx.try_send(TrackMessage::Record(record)).is_err() {
                warn!(name, "tracker channel full, dropping record");
            }
        }
    }

    /// Most recent value logged under `name` in this run.
    pub fn latest(&self, name: &str) -> Option<f64> {
        self.latest.read().get(name).copied()
    }

    /// Drains the channel and flushes pending records to the backend.
    pub async fn finish(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(TrackMessage::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_tracker_keeps_latest_values() {
        let tracker = ExperimentTracker::disabled();
        tracker.log_scalars(1, &[("train_loss", 0.7)]);
        tracker.log_scalars(2, &[("train_loss", 0.5)]);
        assert_eq!(tracker.latest("train_loss"), Some(0.5));
        assert_eq!(tracker.latest("missing"), None);
        tracker.finish().await;
    }

    #[tokio::test]
    async fn jsonl_backend_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrackingConfig {
            enabled: true,
            dir: dir.path().to_str().unwrap().to_string(),
            flush_interval_secs: 60,
        };
        let tracker = ExperimentTracker::new(&config).unwrap();
        tracker.log_scalars(1, &[("eval_loss", 0.9), ("ndcg", 0.4)]);
        tracker.finish().await;

        let path = dir
            .path()
            .join(format!("run-{}.jsonl", tracker.run_id()));
        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["step"], 1);
        }
    }
}
