use httptest::matchers::{all_of, request};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use serde_json::json;
use tempfile::tempdir;

use geoscout::config::{
    AggregatorConfig, AppConfig, CacheConfig, HealthConfig, IngestConfig, SearchConfig,
};
use geoscout::geo::GeoPoint;
use geoscout::ingest::JobStatus;
use geoscout::model::AggregationQuery;
use geoscout::SearchStack;

fn test_config(overpass_url: String) -> AppConfig {
    AppConfig {
        aggregator: AggregatorConfig {
            // low enough that the Overpass fixture alone satisfies the
            // cascade and the synthetic tier stays idle
            min_results_threshold: 3,
            max_results_per_provider: 25,
            timeout_per_provider_ms: 2_000,
            overall_deadline_ms: 10_000,
            max_retry_attempts: 2,
            retry_base_backoff_ms: 1,
            retry_max_backoff_ms: 5,
            priority_order: Vec::new(),
        },
        cache: CacheConfig {
            max_entries: 100,
            radius_tolerance_m: 1_000.0,
            ttl_places_secs: 3_600,
            ttl_hotels_secs: 3_600,
            ttl_restaurants_secs: 3_600,
            ttl_mixed_secs: 3_600,
        },
        health: HealthConfig {
            interval_secs: 300,
            probe_timeout_ms: 1_000,
            critical_success_rate: 0.5,
            critical_response_time_ms: 8_000.0,
            warning_success_rate: 0.7,
            warning_response_time_ms: 3_000.0,
        },
        ingest: IngestConfig {
            min_quality: 0.3,
            optimize_threshold: 1_000,
            job_retention_secs: 3_600,
        },
        search: SearchConfig {
            default_radius_m: 5_000.0,
            default_limit: 20,
            min_similarity_score: 0.2,
            slow_query_threshold_ms: 5_000,
            slow_query_log_size: 10,
        },
        embedding_dim: 16,
        embedding_url: None,
        embedding_model: "hash".to_string(),
        vector_store_url: None,
        vector_store_collection: "places".to_string(),
        vector_store_api_key: None,
        overpass_url: Some(overpass_url),
        geoapify_url: None,
        geoapify_api_key: None,
        usage_buffer_max_bytes: 64 * 1024,
        usage_buffer_max_files: 2,
    }
}

fn overpass_payload() -> serde_json::Value {
    json!({
        "elements": [
            {
                "id": 101,
                "lat": 28.6562,
                "lon": 77.2410,
                "tags": {
                    "name": "Red Fort",
                    "tourism": "attraction",
                    "description": "Mughal-era fort complex",
                    "addr:street": "Netaji Subhash Marg",
                    "addr:city": "Delhi"
                }
            },
            {
                "id": 102,
                "lat": 28.6129,
                "lon": 77.2295,
                "tags": {
                    "name": "India Gate",
                    "tourism": "monument",
                    "description": "War memorial arch",
                    "addr:city": "Delhi"
                }
            },
            {
                "id": 103,
                "center": { "lat": 28.5535, "lon": 77.2588 },
                "tags": {
                    "name": "Lotus Temple",
                    "tourism": "attraction",
                    "description": "Bahai house of worship",
                    "addr:city": "Delhi"
                }
            },
            {
                "id": 104,
                "tags": { "name": "No Coordinates Cafe", "amenity": "cafe" }
            }
        ]
    })
}

#[tokio::test]
async fn cold_search_ingests_then_serves_from_cache() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("POST"),
            request::path("/api/interpreter")
        ))
        .respond_with(json_encoded(overpass_payload())),
    );
    let audit_dir = tempdir().expect("audit dir");

    let stack = SearchStack::from_config(
        test_config(server.url_str("/api/interpreter")),
        Some(audit_dir.path()),
    )
    .await
    .expect("stack wiring");

    let query = AggregationQuery::near(GeoPoint::new(28.6139, 77.2090), 20_000.0, 20);
    let first = stack.search.search(&query).await.expect("cold search");

    // the coordinate-less element is dropped at the provider boundary
    assert_eq!(first.places.len(), 3);
    assert!(first.fallback_used);
    assert!(!first.from_cache);
    let names: Vec<&str> = first.places.iter().map(|p| p.name.as_str()).collect();
    assert!(names.contains(&"Red Fort"));
    assert!(names.contains(&"Lotus Temple"));

    // a single completed ingestion job exists and stored every record
    let jobs = stack.ingestion.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);
    let result = jobs[0].result.as_ref().expect("job result");
    assert_eq!(result.stored, 3);
    assert_eq!(result.errors, 0);

    // the store now holds the records with embeddings attached
    let stats = stack.store.collection_stats().await.expect("stats");
    assert_eq!(stats.count, 3);
    assert_eq!(stats.vector_dim, Some(16));

    // second identical search never touches the provider (the expectation
    // above allows exactly one POST)
    let second = stack.search.search(&query).await.expect("warm search");
    assert!(second.from_cache);
    assert_eq!(second.places.len(), 3);

    let analytics = stack.search.analytics();
    assert_eq!(analytics.total_searches, 2);
    assert_eq!(analytics.cache_hits, 1);
    assert_eq!(analytics.fallback_ingestions, 1);

    // provider usage was recorded through the audit buffer as well
    let summary = stack.usage.summary("overpass");
    assert_eq!(summary.samples, 1);
    assert!((summary.success_rate - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn provider_outage_falls_through_to_synthetic_tier() {
    let server = Server::run();
    // 503 is transient, so the retry policy burns both attempts before the
    // cascade moves on to the synthetic tier
    server.expect(
        Expectation::matching(all_of!(
            request::method("POST"),
            request::path("/api/interpreter")
        ))
        .times(2)
        .respond_with(status_code(503)),
    );

    let stack = SearchStack::from_config(test_config(server.url_str("/api/interpreter")), None)
        .await
        .expect("stack wiring");

    let query = AggregationQuery::near(GeoPoint::new(28.6139, 77.2090), 20_000.0, 20);
    let outcome = stack.search.search(&query).await.expect("degraded search");

    assert!(outcome.fallback_used);
    assert!(!outcome.places.is_empty());
    assert!(outcome
        .places
        .iter()
        .all(|place| place.source == "synthetic"));

    let jobs = stack.ingestion.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);
    let result = jobs[0].result.as_ref().expect("job result");
    assert!(result.stored > 0);
    assert_eq!(result.errors, 0);

    // the overpass failures are visible in usage, the synthetic rescue too
    let overpass = stack.usage.summary("overpass");
    assert!(overpass.samples >= 1);
    assert!(overpass.success_rate < 1.0);
    let synthetic = stack.usage.summary("synthetic");
    assert!((synthetic.success_rate - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn repeat_ingestion_is_idempotent() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("POST"),
            request::path("/api/interpreter")
        ))
        .times(2)
        .respond_with(json_encoded(overpass_payload())),
    );

    let stack = SearchStack::from_config(test_config(server.url_str("/api/interpreter")), None)
        .await
        .expect("stack wiring");

    let query = AggregationQuery::near(GeoPoint::new(28.6139, 77.2090), 20_000.0, 20);
    let first = stack
        .ingestion
        .ingest_for_location(&query)
        .await
        .expect("first ingestion");
    assert_eq!(first.stored, 3);
    assert_eq!(first.updated, 0);

    let second = stack
        .ingestion
        .ingest_for_location(&query)
        .await
        .expect("second ingestion");
    assert_eq!(second.stored, 0);
    assert_eq!(second.updated, 3);

    let stats = stack.store.collection_stats().await.expect("stats");
    assert_eq!(stats.count, 3);
}
