use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::aggregator::CascadingAggregator;
use crate::config::IngestConfig;
use crate::dedup::name_similarity;
use crate::embedding::SafeEmbedder;
use crate::errors::AppResult;
use crate::model::{AggregationQuery, CanonicalPlace};
use crate::retry::RetryPolicy;
use crate::store::{StoreFilter, VectorStore};

const EXISTING_MATCH_RADIUS_M: f64 = 100.0;
const EXISTING_MATCH_SIMILARITY: f64 = 0.8;
const STORE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionJob {
    pub id: String,
    pub params: AggregationQuery,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<IngestionResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionResult {
    pub job_id: String,
    pub stored: usize,
    pub updated: usize,
    pub duplicates_skipped: usize,
    pub errors: usize,
    pub quality_rejected: bool,
    pub elapsed_ms: u64,
}

/// Aggregation → quality gate → embedding → upsert, tracked as a job with an
/// immutable terminal state. Individual record failures never abort the
/// batch; only a failed aggregation fails the job.
pub struct IngestionPipeline {
    aggregator: Arc<CascadingAggregator>,
    embedder: SafeEmbedder,
    store: Arc<dyn VectorStore>,
    config: IngestConfig,
    retry: RetryPolicy,
    jobs: Mutex<HashMap<String, IngestionJob>>,
}

impl IngestionPipeline {
    pub fn new(
        aggregator: Arc<CascadingAggregator>,
        embedder: SafeEmbedder,
        store: Arc<dyn VectorStore>,
        config: IngestConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            aggregator,
            embedder,
            store,
            config,
            retry,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub async fn ingest_for_location(
        &self,
        query: &AggregationQuery,
    ) -> AppResult<IngestionResult> {
        // each run doubles as the retention sweep for earlier jobs
        self.gc_jobs(Utc::now());

        let job_id = new_job_id();
        let started = Instant::now();
        self.create_job(&job_id, query);
        self.transition(&job_id, JobStatus::Running, None);

        let outcome = match self.aggregator.aggregate(query).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.transition(&job_id, JobStatus::Failed, Some(err.to_string()));
                return Err(err);
            }
        };

        // an empty area is a successful answer, not a failure
        if outcome.places.is_empty() {
            let result = self.finish(
                &job_id,
                0,
                0,
                outcome.duplicates_removed,
                0,
                false,
                started,
            );
            return Ok(result);
        }

        let mean_quality = outcome
            .places
            .iter()
            .map(CanonicalPlace::quality_score)
            .sum::<f64>()
            / outcome.places.len() as f64;
        if mean_quality < self.config.min_quality {
            warn!(
                job = %job_id,
                mean_quality,
                gate = self.config.min_quality,
                "batch quality below gate; refusing ingestion"
            );
            let result = self.finish(
                &job_id,
                0,
                0,
                outcome.duplicates_removed,
                0,
                true,
                started,
            );
            return Ok(result);
        }

        let mut stored = 0usize;
        let mut updated = 0usize;
        let mut errors = 0usize;
        for mut place in outcome.places {
            place.embedding = self.embedder.embed(&place.embedding_text()).await;

            let existing = self
                .find_existing(&place)
                .await
                .unwrap_or_else(|err| {
                    warn!(?err, place = %place.name, "duplicate check failed; treating as new");
                    None
                });

            let is_update = match existing {
                Some(existing_id) => {
                    // keep the stored identity so the upsert lands in place
                    place.id = existing_id;
                    true
                }
                None => false,
            };

            let upsert = self
                .retry
                .execute("store_upsert", STORE_ATTEMPT_TIMEOUT, || {
                    let store = Arc::clone(&self.store);
                    let record = place.clone();
                    async move { store.upsert(&record).await }
                })
                .await;
            match upsert {
                Ok(()) => {
                    if is_update {
                        updated += 1;
                    } else {
                        stored += 1;
                    }
                }
                Err(err) => {
                    errors += 1;
                    warn!(?err, place = %place.name, "failed to store record");
                }
            }
        }

        if stored > self.config.optimize_threshold {
            if let Err(err) = self.store.optimize().await {
                warn!(?err, "post-batch optimization failed; continuing");
            }
        }

        let result = self.finish(
            &job_id,
            stored,
            updated,
            outcome.duplicates_removed,
            errors,
            false,
            started,
        );
        info!(
            job = %job_id,
            stored = result.stored,
            updated = result.updated,
            errors = result.errors,
            "ingestion complete"
        );
        Ok(result)
    }

    /// Geo-radius duplicate check: an existing record within 100m whose name
    /// is close enough means update-in-place instead of a new row.
    async fn find_existing(&self, place: &CanonicalPlace) -> AppResult<Option<String>> {
        let center = place.location;
        let hits = self
            .retry
            .execute("store_geo_query", STORE_ATTEMPT_TIMEOUT, || {
                let store = Arc::clone(&self.store);
                async move {
                    let filter = StoreFilter {
                        limit: 10,
                        ..Default::default()
                    };
                    store
                        .geo_radius_query(center, EXISTING_MATCH_RADIUS_M, &filter)
                        .await
                }
            })
            .await?;
        Ok(hits
            .into_iter()
            .find(|hit| {
                name_similarity(&hit.place.name, &place.name) > EXISTING_MATCH_SIMILARITY
            })
            .map(|hit| hit.place.id))
    }

    pub fn job(&self, id: &str) -> Option<IngestionJob> {
        self.jobs.lock().get(id).cloned()
    }

    pub fn jobs(&self) -> Vec<IngestionJob> {
        let mut all: Vec<_> = self.jobs.lock().values().cloned().collect();
        all.sort_by_key(|j| j.start_time);
        all
    }

    /// Drop terminal jobs older than the retention window.
    pub fn gc_jobs(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::seconds(self.config.job_retention_secs.max(0));
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.status.is_terminal()
                && job.end_time.map(|t| now - t > retention).unwrap_or(false))
        });
        let removed = before - jobs.len();
        if removed > 0 {
            debug!(removed, "garbage collected ingestion jobs");
        }
        removed
    }

    fn create_job(&self, id: &str, params: &AggregationQuery) {
        let job = IngestionJob {
            id: id.to_string(),
            params: params.clone(),
            status: JobStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            result: None,
            error: None,
        };
        self.jobs.lock().insert(id.to_string(), job);
    }

    fn transition(&self, id: &str, status: JobStatus, error: Option<String>) {
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.get_mut(id) {
            if job.status.is_terminal() {
                // terminal states are immutable
                return;
            }
            job.status = status;
            if status.is_terminal() {
                job.end_time = Some(Utc::now());
                job.error = error;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        id: &str,
        stored: usize,
        updated: usize,
        duplicates_skipped: usize,
        errors: usize,
        quality_rejected: bool,
        started: Instant,
    ) -> IngestionResult {
        let result = IngestionResult {
            job_id: id.to_string(),
            stored,
            updated,
            duplicates_skipped,
            errors,
            quality_rejected,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.get_mut(id) {
            if !job.status.is_terminal() {
                job.status = JobStatus::Completed;
                job.end_time = Some(Utc::now());
                job.result = Some(result.clone());
            }
        }
        result
    }
}

fn new_job_id() -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!("job-{suffix}")
}
