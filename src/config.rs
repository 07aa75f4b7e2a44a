use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_EMBEDDING_DIM: usize = 768;
const DEFAULT_CACHE_MAX_ENTRIES: usize = 500;
const DEFAULT_USAGE_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_USAGE_BUFFER_MAX_FILES: usize = 5;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub aggregator: AggregatorConfig,
    pub cache: CacheConfig,
    pub health: HealthConfig,
    pub ingest: IngestConfig,
    pub search: SearchConfig,
    pub embedding_dim: usize,
    pub embedding_url: Option<String>,
    pub embedding_model: String,
    pub vector_store_url: Option<String>,
    pub vector_store_collection: String,
    pub vector_store_api_key: Option<SecretString>,
    pub overpass_url: Option<String>,
    pub geoapify_url: Option<String>,
    pub geoapify_api_key: Option<SecretString>,
    pub usage_buffer_max_bytes: u64,
    pub usage_buffer_max_files: usize,
}

#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    /// Stop the cascade once this many deduplicated places are accumulated.
    pub min_results_threshold: usize,
    /// Per-provider result cap so no single source dominates the merge.
    pub max_results_per_provider: usize,
    /// Per-provider attempt timeout in milliseconds.
    pub timeout_per_provider_ms: u64,
    /// Soft budget for one whole cascade round in milliseconds; reaching it
    /// stops the cascade with whatever has accumulated. 0 disables it.
    pub overall_deadline_ms: u64,
    pub max_retry_attempts: u32,
    pub retry_base_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    /// Explicit priority override; empty means "use monitor ordering".
    pub priority_order: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub max_entries: usize,
    /// Accept a cached entry whose center is within this many meters of the
    /// query point, provided its stored radius covers the request.
    pub radius_tolerance_m: f64,
    pub ttl_places_secs: i64,
    pub ttl_hotels_secs: i64,
    pub ttl_restaurants_secs: i64,
    pub ttl_mixed_secs: i64,
}

#[derive(Clone, Debug)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub critical_success_rate: f64,
    pub critical_response_time_ms: f64,
    pub warning_success_rate: f64,
    pub warning_response_time_ms: f64,
}

#[derive(Clone, Debug)]
pub struct IngestConfig {
    /// Batches whose mean quality score falls below this are refused.
    pub min_quality: f64,
    /// Stored-record count that triggers a best-effort index optimization.
    pub optimize_threshold: usize,
    /// Completed/failed jobs older than this are garbage collected.
    pub job_retention_secs: i64,
}

#[derive(Clone, Debug)]
pub struct SearchConfig {
    pub default_radius_m: f64,
    pub default_limit: usize,
    pub min_similarity_score: f32,
    pub slow_query_threshold_ms: u64,
    pub slow_query_log_size: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub embedding_dim: usize,
    pub embedding_model: String,
    pub vector_store_collection: String,
    pub has_vector_store_key: bool,
    pub has_geoapify_key: bool,
    pub min_results_threshold: usize,
    pub cache_max_entries: usize,
    pub health_interval_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            aggregator: AggregatorConfig {
                min_results_threshold: parse_usize("GEOSCOUT_MIN_RESULTS_THRESHOLD", 15),
                max_results_per_provider: parse_usize("GEOSCOUT_MAX_RESULTS_PER_API", 25),
                timeout_per_provider_ms: parse_u64("GEOSCOUT_TIMEOUT_PER_API_MS", 8_000),
                overall_deadline_ms: parse_u64("GEOSCOUT_OVERALL_DEADLINE_MS", 30_000),
                max_retry_attempts: parse_u32("GEOSCOUT_MAX_RETRY_ATTEMPTS", 3),
                retry_base_backoff_ms: parse_u64("GEOSCOUT_RETRY_BASE_BACKOFF_MS", 250),
                retry_max_backoff_ms: parse_u64("GEOSCOUT_RETRY_MAX_BACKOFF_MS", 4_000),
                priority_order: parse_list("GEOSCOUT_PRIORITY_ORDER"),
            },
            cache: CacheConfig {
                max_entries: parse_usize("GEOSCOUT_CACHE_MAX_ENTRIES", DEFAULT_CACHE_MAX_ENTRIES),
                radius_tolerance_m: parse_f64("GEOSCOUT_CACHE_RADIUS_TOLERANCE_M", 1_000.0),
                ttl_places_secs: parse_i64("GEOSCOUT_CACHE_TTL_PLACES_SECS", 6 * 3600),
                ttl_hotels_secs: parse_i64("GEOSCOUT_CACHE_TTL_HOTELS_SECS", 24 * 3600),
                ttl_restaurants_secs: parse_i64("GEOSCOUT_CACHE_TTL_RESTAURANTS_SECS", 2 * 3600),
                ttl_mixed_secs: parse_i64("GEOSCOUT_CACHE_TTL_MIXED_SECS", 4 * 3600),
            },
            health: HealthConfig {
                interval_secs: parse_u64("GEOSCOUT_HEALTH_INTERVAL_SECS", 300),
                probe_timeout_ms: parse_u64("GEOSCOUT_HEALTH_PROBE_TIMEOUT_MS", 5_000),
                critical_success_rate: parse_f64("GEOSCOUT_HEALTH_CRITICAL_SUCCESS_RATE", 0.5),
                critical_response_time_ms: parse_f64("GEOSCOUT_HEALTH_CRITICAL_RT_MS", 8_000.0),
                warning_success_rate: parse_f64("GEOSCOUT_HEALTH_WARNING_SUCCESS_RATE", 0.7),
                warning_response_time_ms: parse_f64("GEOSCOUT_HEALTH_WARNING_RT_MS", 3_000.0),
            },
            ingest: IngestConfig {
                min_quality: parse_f64("GEOSCOUT_INGEST_MIN_QUALITY", 0.3),
                optimize_threshold: parse_usize("GEOSCOUT_INGEST_OPTIMIZE_THRESHOLD", 1_000),
                job_retention_secs: parse_i64("GEOSCOUT_INGEST_JOB_RETENTION_SECS", 3_600),
            },
            search: SearchConfig {
                default_radius_m: parse_f64("GEOSCOUT_SEARCH_DEFAULT_RADIUS_M", 5_000.0),
                default_limit: parse_usize("GEOSCOUT_SEARCH_DEFAULT_LIMIT", 20),
                min_similarity_score: parse_f64("GEOSCOUT_SEARCH_MIN_SIMILARITY", 0.35) as f32,
                slow_query_threshold_ms: parse_u64("GEOSCOUT_SLOW_QUERY_THRESHOLD_MS", 5_000),
                slow_query_log_size: parse_usize("GEOSCOUT_SLOW_QUERY_LOG_SIZE", 50),
            },
            embedding_dim: parse_usize("EMBEDDING_DIM", DEFAULT_EMBEDDING_DIM),
            embedding_url: env::var("GEOSCOUT_EMBEDDING_URL").ok().filter(not_blank),
            embedding_model: env::var("GEOSCOUT_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "nomic-embed-text".to_string()),
            vector_store_url: env::var("GEOSCOUT_VECTOR_STORE_URL").ok().filter(not_blank),
            vector_store_collection: env::var("GEOSCOUT_VECTOR_STORE_COLLECTION")
                .unwrap_or_else(|_| "places".to_string()),
            vector_store_api_key: secret_from_env("GEOSCOUT_VECTOR_STORE_API_KEY"),
            overpass_url: env::var("GEOSCOUT_OVERPASS_URL").ok().filter(not_blank),
            geoapify_url: env::var("GEOSCOUT_GEOAPIFY_URL").ok().filter(not_blank),
            geoapify_api_key: secret_from_env("GEOAPIFY_API_KEY"),
            usage_buffer_max_bytes: parse_u64(
                "GEOSCOUT_USAGE_BUFFER_MAX_BYTES",
                DEFAULT_USAGE_BUFFER_MAX_BYTES,
            ),
            usage_buffer_max_files: parse_usize(
                "GEOSCOUT_USAGE_BUFFER_MAX_FILES",
                DEFAULT_USAGE_BUFFER_MAX_FILES,
            )
            .max(1),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            embedding_dim: self.embedding_dim,
            embedding_model: self.embedding_model.clone(),
            vector_store_collection: self.vector_store_collection.clone(),
            has_vector_store_key: self.vector_store_api_key.is_some(),
            has_geoapify_key: self.geoapify_api_key.is_some(),
            min_results_threshold: self.aggregator.min_results_threshold,
            cache_max_entries: self.cache.max_entries,
            health_interval_secs: self.health.interval_secs,
        }
    }
}

fn not_blank(value: &String) -> bool {
    !value.trim().is_empty()
}

fn secret_from_env(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn parse_list(key: &str) -> Vec<String> {
    env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
