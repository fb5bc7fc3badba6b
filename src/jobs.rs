use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::CatalogSource;
use crate::errors::AppResult;
use crate::geo::Geocoder;
use crate::normalize::{normalize_value, NormalizedProperty};
use crate::ranking::{Recommendation, RecommendationEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Started,
    Retry,
    Failure,
    Success,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub status: JobStatus,
    pub result: Option<Recommendation>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    fn pending() -> Self {
        let now = Utc::now();
        Self {
            status: JobStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What a caller polling a job sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub status: JobStatus,
    pub result: Option<Recommendation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobView {
    /// View of a job nobody has submitted.
    pub fn unknown() -> Self {
        Self {
            status: JobStatus::Pending,
            result: None,
            error: None,
        }
    }
}

impl From<&JobRecord> for JobView {
    fn from(record: &JobRecord) -> Self {
        Self {
            status: record.status,
            result: record.result.clone(),
            error: record.error.clone(),
        }
    }
}

struct QueuedJob {
    id: Uuid,
    base: NormalizedProperty,
}

#[derive(Default)]
struct JobStore {
    records: Mutex<HashMap<Uuid, JobRecord>>,
}

impl JobStore {
    fn insert_pending(&self, id: Uuid) {
        self.records.lock().insert(id, JobRecord::pending());
    }

    fn update(&self, id: Uuid, apply: impl FnOnce(&mut JobRecord)) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(&id) {
            apply(record);
            record.updated_at = Utc::now();
        }
    }

    fn view(&self, id: &Uuid) -> Option<JobView> {
        self.records.lock().get(id).map(JobView::from)
    }
}

/// Shared pieces every worker needs to finish a job.
#[derive(Clone)]
struct WorkerContext {
    engine: RecommendationEngine,
    catalog: Arc<dyn CatalogSource>,
    page_limit: u32,
    store: Arc<JobStore>,
}

impl WorkerContext {
    async fn run(&self, job: QueuedJob) {
        let QueuedJob { id, base } = job;
        self.store.update(id, |record| record.status = JobStatus::Started);
        debug!(job_id = %id, "job started");

        match self.recommend(&base).await {
            Ok(recommendation) => {
                info!(
                    job_id = %id,
                    matches = recommendation.recommendations.len(),
                    "job finished"
                );
                self.store.update(id, |record| {
                    record.status = JobStatus::Success;
                    record.result = Some(recommendation);
                });
            }
            Err(err) => {
                warn!(job_id = %id, error = %err, "job failed");
                self.store.update(id, |record| {
                    record.status = JobStatus::Failure;
                    record.error = Some(err.to_string());
                });
            }
        }
    }

    /// Runs `job` on its own task so a panic fails the job instead of the worker.
    async fn run_isolated(&self, job: QueuedJob) {
        let id = job.id;
        let context = self.clone();
        if let Err(err) = tokio::spawn(async move { context.run(job).await }).await {
            error!(job_id = %id, error = %err, "job aborted");
            self.store.update(id, |record| {
                record.status = JobStatus::Failure;
                record.error = Some(format!("job aborted: {err}"));
            });
        }
    }

    async fn recommend(&self, base: &NormalizedProperty) -> AppResult<Recommendation> {
        let catalog = self.catalog.fetch_catalog(1, self.page_limit).await?;
        Ok(self.engine.rank(base, catalog).await)
    }
}

/// In-process job queue with a fixed pool of workers.
pub struct JobService {
    store: Arc<JobStore>,
    sender: mpsc::UnboundedSender<QueuedJob>,
}

impl JobService {
    pub fn start(
        engine: RecommendationEngine,
        catalog: Arc<dyn CatalogSource>,
        page_limit: u32,
        workers: usize,
    ) -> Self {
        let store = Arc::new(JobStore::default());
        let (sender, receiver) = mpsc::unbounded_channel::<QueuedJob>();
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let context = WorkerContext {
            engine,
            catalog,
            page_limit,
            store: store.clone(),
        };

        for worker in 0..workers.max(1) {
            let receiver = receiver.clone();
            let context = context.clone();
            tokio::spawn(async move {
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(job) = next else {
                        debug!(worker, "job queue closed");
                        break;
                    };
                    context.run_isolated(job).await;
                }
            });
        }

        Self { store, sender }
    }

    pub fn submit(&self, base: NormalizedProperty) -> Uuid {
        let id = Uuid::new_v4();
        self.store.insert_pending(id);
        if self.sender.send(QueuedJob { id, base }).is_err() {
            self.store.update(id, |record| {
                record.status = JobStatus::Failure;
                record.error = Some("job queue is closed".to_string());
            });
        }
        id
    }

    /// Unknown ids read as pending.
    pub fn query(&self, id: &Uuid) -> JobView {
        self.store.view(id).unwrap_or_else(JobView::unknown)
    }
}

/// Normalizes a submitted property and geocodes it when it has a location but
/// no coordinates.
pub async fn prepare_base(value: Value, geocoder: &dyn Geocoder) -> AppResult<NormalizedProperty> {
    let base = normalize_value(value)?;
    if base.coordinates.is_some() {
        return Ok(base);
    }
    let Some(text) = base.location_text() else {
        return Ok(base);
    };
    match geocoder.geocode(&text).await {
        Some(found) => Ok(base.with_coordinates(found.coordinates())),
        None => Ok(base),
    }
}
