use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AggregatorConfig;
use crate::dedup::{dedupe_all, is_duplicate, DedupThresholds};
use crate::errors::{AppError, AppResult};
use crate::health::ProviderHealthMonitor;
use crate::metrics::UsageRecorder;
use crate::model::{AggregationOutcome, AggregationQuery, CanonicalPlace};
use crate::providers::ProviderRegistry;
use crate::retry::RetryPolicy;

/// Orchestrates the provider cascade: call sources in tier order, merge
/// incrementally, stop as soon as the accumulated set is sufficient. Pure
/// given provider responses; the only side effects are the network calls and
/// usage samples.
pub struct CascadingAggregator {
    registry: ProviderRegistry,
    monitor: Arc<ProviderHealthMonitor>,
    usage: Arc<UsageRecorder>,
    retry: RetryPolicy,
    config: AggregatorConfig,
}

impl CascadingAggregator {
    pub fn new(
        registry: ProviderRegistry,
        monitor: Arc<ProviderHealthMonitor>,
        usage: Arc<UsageRecorder>,
        config: AggregatorConfig,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            registry,
            monitor,
            usage,
            retry,
            config,
        }
    }

    pub async fn aggregate(&self, query: &AggregationQuery) -> AppResult<AggregationOutcome> {
        let deadline = (self.config.overall_deadline_ms > 0)
            .then(|| Duration::from_millis(self.config.overall_deadline_ms));
        self.aggregate_with_deadline(query, deadline).await
    }

    /// Cascade with an optional overall soft deadline. Running past it stops
    /// the cascade with whatever has accumulated rather than failing the
    /// request, and the remaining budget caps each in-flight provider call.
    pub async fn aggregate_with_deadline(
        &self,
        query: &AggregationQuery,
        deadline: Option<Duration>,
    ) -> AppResult<AggregationOutcome> {
        let operation_id = operation_id();
        let started = Instant::now();
        let per_provider = Duration::from_millis(self.config.timeout_per_provider_ms);

        let mut accumulated: Vec<CanonicalPlace> = Vec::new();
        let mut sources_used: Vec<String> = Vec::new();
        let mut total_raw_found = 0usize;
        let mut duplicates_removed = 0usize;
        let mut attempted = 0usize;
        let mut failures = 0usize;

        for name in self.monitor.tier_order() {
            let attempt_budget = match deadline {
                Some(budget) => {
                    let remaining = budget.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        info!(op = %operation_id, "aggregation deadline reached; stopping cascade");
                        break;
                    }
                    per_provider.min(remaining)
                }
                None => per_provider,
            };
            let Some(provider) = self.registry.get(&name) else {
                continue;
            };
            if provider.requires_text_query() && query.text.is_none() {
                debug!(provider = %name, "skipped: query lacks required text");
                continue;
            }

            attempted += 1;
            let call_started = Instant::now();
            let provider_for_call = Arc::clone(&provider);
            let result = self
                .retry
                .execute(&name, attempt_budget, || {
                    let provider = Arc::clone(&provider_for_call);
                    let query = query.clone();
                    async move { provider.fetch(&query).await }
                })
                .await;
            let latency_ms = call_started.elapsed().as_millis() as u64;

            match result {
                Ok(mut raws) => {
                    self.usage.record(&operation_id, &name, true, latency_ms);
                    total_raw_found += raws.len();
                    // cap so no single source dominates the merge
                    raws.truncate(self.config.max_results_per_provider);
                    let now = Utc::now();
                    let mut novel = 0usize;
                    for raw in raws {
                        let candidate = CanonicalPlace::from_raw(raw, now);
                        if is_duplicate(&candidate, &accumulated, DedupThresholds::INCREMENTAL) {
                            duplicates_removed += 1;
                        } else {
                            accumulated.push(candidate);
                            novel += 1;
                        }
                    }
                    debug!(provider = %name, novel, latency_ms, "provider round merged");
                    sources_used.push(name.clone());

                    if accumulated.len() >= self.config.min_results_threshold {
                        info!(
                            op = %operation_id,
                            accumulated = accumulated.len(),
                            "sufficiency threshold met; stopping cascade"
                        );
                        break;
                    }
                }
                Err(err) => {
                    self.usage.record(&operation_id, &name, false, latency_ms);
                    failures += 1;
                    warn!(provider = %name, ?err, "provider failed after retries");
                }
            }
        }

        if attempted > 0 && failures == attempted {
            return Err(AppError::Aggregation(format!(
                "all {attempted} attempted providers failed"
            )));
        }

        // the incremental pass is pairwise against whatever had accumulated
        // so far; a final full-set pass catches cross-provider stragglers
        let (mut places, removed_in_final) = dedupe_all(accumulated, DedupThresholds::FINAL);
        duplicates_removed += removed_in_final;

        apply_filters(&mut places, query);
        sort_places(&mut places);
        paginate(&mut places, query);

        Ok(AggregationOutcome {
            places,
            sources_used,
            total_raw_found,
            duplicates_removed,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Exhaustive variant: fan out to every eligible provider concurrently
    /// and keep whatever succeeds. Used when coverage matters more than
    /// latency; forfeits the early-stop optimization by design.
    pub async fn aggregate_exhaustive(
        &self,
        query: &AggregationQuery,
    ) -> AppResult<AggregationOutcome> {
        let operation_id = operation_id();
        let started = Instant::now();
        let per_provider = Duration::from_millis(self.config.timeout_per_provider_ms);

        let eligible: Vec<_> = self
            .monitor
            .tier_order()
            .into_iter()
            .filter_map(|name| self.registry.get(&name))
            .filter(|p| !p.requires_text_query() || query.text.is_some())
            .collect();

        let calls = eligible.iter().map(|provider| {
            let provider = Arc::clone(provider);
            let query = query.clone();
            let retry = self.retry.clone();
            let name = provider.name().to_string();
            async move {
                let call_started = Instant::now();
                let result = retry
                    .execute(&name, per_provider, || {
                        let provider = Arc::clone(&provider);
                        let query = query.clone();
                        async move { provider.fetch(&query).await }
                    })
                    .await;
                (name, result, call_started.elapsed().as_millis() as u64)
            }
        });

        let mut raw_records = Vec::new();
        let mut sources_used = Vec::new();
        let mut total_raw_found = 0usize;
        for (name, result, latency_ms) in join_all(calls).await {
            match result {
                Ok(mut raws) => {
                    self.usage.record(&operation_id, &name, true, latency_ms);
                    total_raw_found += raws.len();
                    raws.truncate(self.config.max_results_per_provider);
                    raw_records.extend(raws);
                    sources_used.push(name);
                }
                Err(err) => {
                    self.usage.record(&operation_id, &name, false, latency_ms);
                    warn!(provider = %name, ?err, "provider failed in exhaustive fan-out");
                }
            }
        }

        let now = Utc::now();
        let candidates: Vec<CanonicalPlace> = raw_records
            .into_iter()
            .map(|raw| CanonicalPlace::from_raw(raw, now))
            .collect();
        let incoming = candidates.len();
        let (mut places, _) = dedupe_all(candidates, DedupThresholds::FINAL);
        let duplicates_removed = incoming - places.len();

        apply_filters(&mut places, query);
        sort_places(&mut places);
        paginate(&mut places, query);

        Ok(AggregationOutcome {
            places,
            sources_used,
            total_raw_found,
            duplicates_removed,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn operation_id() -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("agg-{suffix}")
}

fn apply_filters(places: &mut Vec<CanonicalPlace>, query: &AggregationQuery) {
    if !query.categories.is_empty() {
        places.retain(|p| query.categories.contains(&p.category));
    }
    if !query.sources.is_empty() {
        places.retain(|p| query.sources.contains(&p.source));
    }
}

fn sort_places(places: &mut [CanonicalPlace]) {
    places.sort_by(|a, b| {
        b.rating
            .unwrap_or(0.0)
            .partial_cmp(&a.rating.unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
}

fn paginate(places: &mut Vec<CanonicalPlace>, query: &AggregationQuery) {
    if query.offset > 0 {
        let keep = places.len().saturating_sub(query.offset);
        places.drain(..places.len() - keep);
    }
    if query.limit > 0 {
        places.truncate(query.limit);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::config::HealthConfig;
    use crate::geo::GeoPoint;
    use crate::model::RawPlaceRecord;
    use crate::providers::{ProviderAdapter, SyntheticProvider};

    use super::*;

    struct ScriptedProvider {
        name: &'static str,
        records: Vec<RawPlaceRecord>,
        fail: bool,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn built(name: &'static str, count: usize, lat_base: f64) -> Self {
            let records = (0..count)
                .map(|i| RawPlaceRecord {
                    name: format!("{name} place {i}"),
                    category: "tourism.attraction".into(),
                    address: format!("{i} {name} road"),
                    location: GeoPoint::new(lat_base + i as f64 * 0.01, 77.2090),
                    rating: Some(3.0 + (i % 20) as f64 / 10.0),
                    description: None,
                    source: name.into(),
                    source_id: None,
                })
                .collect();
            Self {
                name,
                records,
                fail: false,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn returning(name: &'static str, count: usize, lat_base: f64) -> Arc<Self> {
            Arc::new(Self::built(name, count, lat_base))
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                fail: true,
                ..Self::built(name, 0, 0.0)
            })
        }

        fn stalling(name: &'static str, count: usize, lat_base: f64, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Self::built(name, count, lat_base)
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch(&self, _query: &AggregationQuery) -> AppResult<Vec<RawPlaceRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(AppError::Config("provider down".into()));
            }
            Ok(self.records.clone())
        }
    }

    fn test_health_config() -> HealthConfig {
        HealthConfig {
            interval_secs: 300,
            probe_timeout_ms: 1_000,
            critical_success_rate: 0.5,
            critical_response_time_ms: 8_000.0,
            warning_success_rate: 0.7,
            warning_response_time_ms: 3_000.0,
        }
    }

    fn test_agg_config() -> AggregatorConfig {
        AggregatorConfig {
            min_results_threshold: 15,
            max_results_per_provider: 25,
            timeout_per_provider_ms: 1_000,
            overall_deadline_ms: 0,
            max_retry_attempts: 1,
            retry_base_backoff_ms: 1,
            retry_max_backoff_ms: 2,
            priority_order: Vec::new(),
        }
    }

    fn aggregator_for(
        providers: Vec<Arc<dyn ProviderAdapter>>,
        config: AggregatorConfig,
    ) -> CascadingAggregator {
        let registry = ProviderRegistry::from_providers(providers);
        let usage = Arc::new(UsageRecorder::in_memory());
        let monitor = Arc::new(ProviderHealthMonitor::new(
            registry.clone(),
            usage.clone(),
            test_health_config(),
            &[],
        ));
        CascadingAggregator::new(registry, monitor, usage, config)
    }

    fn query() -> AggregationQuery {
        AggregationQuery::near(GeoPoint::new(28.6139, 77.2090), 5_000.0, 20)
    }

    #[tokio::test]
    async fn early_stop_skips_later_providers() {
        let a = ScriptedProvider::returning("alpha", 20, 28.0);
        let b = ScriptedProvider::returning("beta", 20, 29.0);
        let c = ScriptedProvider::returning("gamma", 20, 30.0);
        let aggregator = aggregator_for(
            vec![a.clone(), b.clone(), c.clone()],
            test_agg_config(),
        );

        let outcome = aggregator.aggregate(&query()).await.unwrap();
        assert_eq!(outcome.sources_used, vec!["alpha"]);
        assert_eq!(a.call_count(), 1);
        assert_eq!(b.call_count(), 0);
        assert_eq!(c.call_count(), 0);
        assert!(outcome.places.len() >= 15);
    }

    #[tokio::test]
    async fn cascade_continues_past_failures() {
        let broken = ScriptedProvider::failing("alpha");
        let working = ScriptedProvider::returning("beta", 20, 29.0);
        let aggregator = aggregator_for(vec![broken.clone(), working.clone()], test_agg_config());

        let outcome = aggregator.aggregate(&query()).await.unwrap();
        assert_eq!(outcome.sources_used, vec!["beta"]);
        assert!(!outcome.places.is_empty());
    }

    #[tokio::test]
    async fn all_providers_failing_is_fatal() {
        let a = ScriptedProvider::failing("alpha");
        let b = ScriptedProvider::failing("beta");
        let aggregator = aggregator_for(vec![a, b], test_agg_config());

        let result = aggregator.aggregate(&query()).await;
        assert!(matches!(result, Err(AppError::Aggregation(_))));
    }

    #[tokio::test]
    async fn synthetic_fallback_rescues_dark_fleet() {
        let a = ScriptedProvider::failing("alpha");
        let aggregator = aggregator_for(
            vec![a, Arc::new(SyntheticProvider)],
            test_agg_config(),
        );

        let outcome = aggregator.aggregate(&query()).await.unwrap();
        assert_eq!(outcome.sources_used, vec!["synthetic"]);
        assert!(!outcome.places.is_empty());
    }

    #[tokio::test]
    async fn per_provider_cap_limits_dominance() {
        let flood = ScriptedProvider::returning("alpha", 60, 28.0);
        let mut config = test_agg_config();
        config.min_results_threshold = 100;
        let aggregator = aggregator_for(vec![flood], config);

        let mut q = query();
        q.limit = 100;
        let outcome = aggregator.aggregate(&q).await.unwrap();
        assert_eq!(outcome.total_raw_found, 60);
        assert!(outcome.places.len() <= 25);
    }

    #[tokio::test]
    async fn results_sorted_by_rating_then_name() {
        let provider = ScriptedProvider::returning("alpha", 5, 28.0);
        let mut config = test_agg_config();
        config.min_results_threshold = 3;
        let aggregator = aggregator_for(vec![provider], config);

        let outcome = aggregator.aggregate(&query()).await.unwrap();
        let ratings: Vec<f64> = outcome
            .places
            .iter()
            .map(|p| p.rating.unwrap_or(0.0))
            .collect();
        let mut sorted = ratings.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert_eq!(ratings, sorted);
    }

    #[tokio::test]
    async fn deadline_mid_cascade_keeps_partial_accumulation() {
        let fast = ScriptedProvider::returning("alpha", 5, 28.0);
        let stalled =
            ScriptedProvider::stalling("beta", 5, 29.0, Duration::from_millis(500));
        let untouched = ScriptedProvider::returning("gamma", 5, 30.0);
        let mut config = test_agg_config();
        config.min_results_threshold = 100;
        config.overall_deadline_ms = 80;
        let aggregator = aggregator_for(
            vec![fast.clone(), stalled.clone(), untouched.clone()],
            config,
        );

        let mut q = query();
        q.limit = 50;
        let outcome = aggregator.aggregate(&q).await.unwrap();

        // beta's in-flight call was cut at the remaining budget and gamma
        // never ran
        assert_eq!(outcome.sources_used, vec!["alpha"]);
        assert_eq!(outcome.places.len(), 5);
        assert_eq!(fast.call_count(), 1);
        assert_eq!(stalled.call_count(), 1);
        assert_eq!(untouched.call_count(), 0);
    }

    #[tokio::test]
    async fn exhaustive_variant_collects_all_sources_despite_failures() {
        let a = ScriptedProvider::returning("alpha", 5, 28.0);
        let b = ScriptedProvider::failing("beta");
        let c = ScriptedProvider::returning("gamma", 5, 30.0);
        let mut config = test_agg_config();
        config.min_results_threshold = 3;
        let aggregator = aggregator_for(vec![a.clone(), b, c.clone()], config);

        let mut q = query();
        q.limit = 50;
        let outcome = aggregator.aggregate_exhaustive(&q).await.unwrap();
        assert_eq!(a.call_count(), 1);
        assert_eq!(c.call_count(), 1);
        let mut sources = outcome.sources_used.clone();
        sources.sort();
        assert_eq!(sources, vec!["alpha", "gamma"]);
        assert_eq!(outcome.places.len(), 10);
    }
}
