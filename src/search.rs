use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{LocalCache, QueryKey};
use crate::config::SearchConfig;
use crate::embedding::SafeEmbedder;
use crate::errors::AppResult;
use crate::ingest::IngestionPipeline;
use crate::model::{AggregationQuery, CanonicalPlace};
use crate::retry::RetryPolicy;
use crate::store::{StoreFilter, VectorStore};

const CACHE_SOURCE: &str = "search";
const STORE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub places: Vec<CanonicalPlace>,
    pub from_cache: bool,
    pub fallback_used: bool,
    pub sources: Vec<String>,
    pub suggestion: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlowQuery {
    pub summary: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchAnalytics {
    pub total_searches: u64,
    pub cache_hits: u64,
    pub fallback_ingestions: u64,
    pub cache_hit_rate: f64,
    pub avg_result_count: f64,
    pub slow_queries: Vec<SlowQuery>,
}

#[derive(Default)]
struct AnalyticsInner {
    total_searches: u64,
    cache_hits: u64,
    fallback_ingestions: u64,
    total_results: u64,
    slow_queries: VecDeque<SlowQuery>,
}

/// One front door for lookups: cache first, then the vector store, then a
/// synchronous ingestion when the store comes back thin. Whatever path
/// produced the answer, the result lands in the cache so the next caller in
/// the same area skips the whole chain.
pub struct UnifiedSearchService {
    cache: Arc<LocalCache>,
    store: Arc<dyn VectorStore>,
    ingestion: Arc<IngestionPipeline>,
    embedder: SafeEmbedder,
    config: SearchConfig,
    retry: RetryPolicy,
    analytics: Mutex<AnalyticsInner>,
}

impl UnifiedSearchService {
    pub fn new(
        cache: Arc<LocalCache>,
        store: Arc<dyn VectorStore>,
        ingestion: Arc<IngestionPipeline>,
        embedder: SafeEmbedder,
        config: SearchConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cache,
            store,
            ingestion,
            embedder,
            config,
            retry,
            analytics: Mutex::new(AnalyticsInner::default()),
        }
    }

    pub async fn search(&self, query: &AggregationQuery) -> AppResult<SearchOutcome> {
        let started = Instant::now();
        let limit = if query.limit == 0 {
            self.config.default_limit
        } else {
            query.limit
        };
        let mut query = query.clone();
        if query.radius_m <= 0.0 {
            query.radius_m = self.config.default_radius_m;
        }
        query.limit = limit;
        let query = &query;
        let key = QueryKey::from_query(query);

        if let Some(entry) =
            self.cache
                .get(query.location.lat, query.location.lon, query.radius_m, &key)
        {
            debug!(bucket = %entry.bucket_key, "serving search from cache");
            let places: Vec<CanonicalPlace> = entry.payload.into_iter().take(limit).collect();
            let outcome = SearchOutcome {
                suggestion: self.suggestion_for(places.len(), limit),
                places,
                from_cache: true,
                fallback_used: false,
                sources: vec![entry.source],
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
            self.record(query, &outcome);
            return Ok(outcome);
        }

        let filter = self.build_filter(query, limit).await;
        let mut places = self.query_store(query, &filter).await?;
        let mut sources = vec!["store".to_string()];
        let mut fallback_used = false;

        // a thin store answer triggers one synchronous refill, then a single
        // re-query; whatever we have after that is the answer
        if places.len() < limit.div_ceil(2) {
            fallback_used = true;
            match self.ingestion.ingest_for_location(query).await {
                Ok(result) => {
                    info!(
                        job = %result.job_id,
                        stored = result.stored,
                        updated = result.updated,
                        "fallback ingestion refreshed the store"
                    );
                    sources.push("ingestion".to_string());
                    places = self.query_store(query, &filter).await?;
                }
                Err(err) => {
                    warn!(?err, "fallback ingestion failed; returning partial data");
                }
            }
        }

        self.cache.set(
            query.location.lat,
            query.location.lon,
            query.radius_m,
            key,
            places.clone(),
            CACHE_SOURCE,
        );

        let outcome = SearchOutcome {
            suggestion: self.suggestion_for(places.len(), limit),
            places,
            from_cache: false,
            fallback_used,
            sources,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        self.record(query, &outcome);
        Ok(outcome)
    }

    async fn build_filter(&self, query: &AggregationQuery, limit: usize) -> StoreFilter {
        let (query_vector, min_score) = match query.text.as_deref().filter(|t| !t.trim().is_empty())
        {
            Some(text) => (
                Some(self.embedder.embed(text).await),
                self.config.min_similarity_score,
            ),
            None => (None, 0.0),
        };
        StoreFilter {
            categories: query.categories.clone(),
            query_vector,
            min_score,
            limit,
        }
    }

    async fn query_store(
        &self,
        query: &AggregationQuery,
        filter: &StoreFilter,
    ) -> AppResult<Vec<CanonicalPlace>> {
        let center = query.location;
        let radius_m = query.radius_m;
        let hits = self
            .retry
            .execute("store_query", STORE_ATTEMPT_TIMEOUT, || {
                let store = Arc::clone(&self.store);
                let filter = filter.clone();
                async move { store.geo_radius_query(center, radius_m, &filter).await }
            })
            .await?;
        Ok(hits.into_iter().map(|hit| hit.place).collect())
    }

    fn suggestion_for(&self, found: usize, limit: usize) -> Option<String> {
        if found == 0 {
            Some("No places found here yet. Try a wider radius or fewer category filters.".into())
        } else if found < limit.div_ceil(2) {
            Some(format!(
                "Only {found} places found. Widening the search radius may surface more."
            ))
        } else {
            None
        }
    }

    fn record(&self, query: &AggregationQuery, outcome: &SearchOutcome) {
        let mut inner = self.analytics.lock();
        inner.total_searches += 1;
        inner.total_results += outcome.places.len() as u64;
        if outcome.from_cache {
            inner.cache_hits += 1;
        }
        if outcome.fallback_used {
            inner.fallback_ingestions += 1;
        }
        if outcome.elapsed_ms >= self.config.slow_query_threshold_ms {
            warn!(elapsed_ms = outcome.elapsed_ms, "slow search");
            inner.slow_queries.push_back(SlowQuery {
                summary: format!(
                    "({:.4},{:.4}) r={:.0}m text={}",
                    query.location.lat,
                    query.location.lon,
                    query.radius_m,
                    query.text.as_deref().unwrap_or("-")
                ),
                elapsed_ms: outcome.elapsed_ms,
            });
            while inner.slow_queries.len() > self.config.slow_query_log_size.max(1) {
                inner.slow_queries.pop_front();
            }
        }
    }

    pub fn analytics(&self) -> SearchAnalytics {
        let inner = self.analytics.lock();
        let hit_rate = if inner.total_searches == 0 {
            0.0
        } else {
            inner.cache_hits as f64 / inner.total_searches as f64
        };
        let avg = if inner.total_searches == 0 {
            0.0
        } else {
            inner.total_results as f64 / inner.total_searches as f64
        };
        SearchAnalytics {
            total_searches: inner.total_searches,
            cache_hits: inner.cache_hits,
            fallback_ingestions: inner.fallback_ingestions,
            cache_hit_rate: hit_rate,
            avg_result_count: avg,
            slow_queries: inner.slow_queries.iter().cloned().collect(),
        }
    }
}
