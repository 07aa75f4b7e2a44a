pub mod aggregator;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod embedding;
pub mod errors;
pub mod geo;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod providers;
pub mod retry;
pub mod search;
pub mod store;

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::aggregator::CascadingAggregator;
use crate::cache::LocalCache;
use crate::config::AppConfig;
use crate::embedding::{Embedder, HashEmbedder, HttpEmbedder, SafeEmbedder};
use crate::errors::{AppError, AppResult};
use crate::health::ProviderHealthMonitor;
use crate::ingest::IngestionPipeline;
use crate::metrics::UsageRecorder;
use crate::providers::ProviderRegistry;
use crate::retry::RetryPolicy;
use crate::search::UnifiedSearchService;
use crate::store::{HttpVectorStore, MemoryVectorStore, VectorStore};

/// The fully wired pipeline. Every component is constructed here and handed
/// its dependencies explicitly; nothing reaches for globals.
pub struct SearchStack {
    pub config: AppConfig,
    pub usage: Arc<UsageRecorder>,
    pub monitor: Arc<ProviderHealthMonitor>,
    pub aggregator: Arc<CascadingAggregator>,
    pub cache: Arc<LocalCache>,
    pub store: Arc<dyn VectorStore>,
    pub ingestion: Arc<IngestionPipeline>,
    pub search: Arc<UnifiedSearchService>,
}

impl SearchStack {
    /// Environment-driven construction with no audit buffer on disk.
    pub async fn from_env() -> AppResult<Self> {
        Self::from_config(AppConfig::from_env(), None).await
    }

    pub async fn from_config(config: AppConfig, audit_dir: Option<&Path>) -> AppResult<Self> {
        let usage = Arc::new(match audit_dir {
            Some(dir) => UsageRecorder::with_audit(
                dir,
                config.usage_buffer_max_bytes,
                config.usage_buffer_max_files,
            )?,
            None => UsageRecorder::in_memory(),
        });

        let registry = ProviderRegistry::from_config(&config);
        let monitor = Arc::new(ProviderHealthMonitor::new(
            registry.clone(),
            usage.clone(),
            config.health.clone(),
            &config.aggregator.priority_order,
        ));
        let aggregator = Arc::new(CascadingAggregator::new(
            registry,
            monitor.clone(),
            usage.clone(),
            config.aggregator.clone(),
        ));

        let embedder: Arc<dyn Embedder> = match &config.embedding_url {
            Some(url) => Arc::new(HttpEmbedder::new(
                url.clone(),
                config.embedding_model.clone(),
                config.embedding_dim,
            )),
            None => Arc::new(HashEmbedder::new(config.embedding_dim)),
        };
        let embedder = SafeEmbedder::new(embedder);

        let store: Arc<dyn VectorStore> = match &config.vector_store_url {
            Some(url) => Arc::new(HttpVectorStore::new(
                url.clone(),
                config.vector_store_collection.clone(),
                config.vector_store_api_key.clone(),
            )),
            None => Arc::new(MemoryVectorStore::new()),
        };
        validate_dimension(store.as_ref(), embedder.dimension()).await?;

        let cache = Arc::new(LocalCache::new(config.cache.clone()));
        let retry = RetryPolicy::from_config(&config.aggregator);
        let ingestion = Arc::new(IngestionPipeline::new(
            aggregator.clone(),
            embedder.clone(),
            store.clone(),
            config.ingest.clone(),
            retry.clone(),
        ));
        let search = Arc::new(UnifiedSearchService::new(
            cache.clone(),
            store.clone(),
            ingestion.clone(),
            embedder,
            config.search.clone(),
            retry,
        ));

        info!(
            providers = ?monitor.tier_order(),
            embedding_dim = config.embedding_dim,
            "search stack wired"
        );
        Ok(Self {
            config,
            usage,
            monitor,
            aggregator,
            cache,
            store,
            ingestion,
            search,
        })
    }

    /// Background health loop; stops when `shutdown` flips to true.
    pub fn spawn_health_loop(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = self.monitor.clone();
        tokio::spawn(monitor.run(shutdown))
    }
}

/// A store indexed with one embedding width cannot answer queries embedded
/// at another, so mismatches are refused at startup rather than surfacing
/// as silently empty searches later.
async fn validate_dimension(store: &dyn VectorStore, dimension: usize) -> AppResult<()> {
    match store.collection_stats().await {
        Ok(stats) => {
            if let Some(existing) = stats.vector_dim {
                if existing != dimension {
                    return Err(AppError::Config(format!(
                        "vector store collection uses dimension {existing} but the embedder produces {dimension}"
                    )));
                }
            }
            Ok(())
        }
        Err(err) => {
            warn!(?err, "collection stats unavailable; skipping dimension check");
            Ok(())
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,geoscout=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;

    use crate::geo::GeoPoint;
    use crate::model::CanonicalPlace;
    use crate::store::{CollectionStats, ScoredPlace, StoreFilter};

    use super::*;

    struct FixedDimStore {
        dim: usize,
    }

    #[async_trait]
    impl VectorStore for FixedDimStore {
        async fn upsert(&self, _place: &CanonicalPlace) -> AppResult<()> {
            Ok(())
        }

        async fn geo_radius_query(
            &self,
            _center: GeoPoint,
            _radius_m: f64,
            _filter: &StoreFilter,
        ) -> AppResult<Vec<ScoredPlace>> {
            Ok(Vec::new())
        }

        async fn collection_stats(&self) -> AppResult<CollectionStats> {
            Ok(CollectionStats {
                count: 1,
                vector_dim: Some(self.dim),
                last_updated: Some(Utc::now()),
            })
        }

        async fn optimize(&self) -> AppResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn mismatched_dimension_is_refused() {
        let store = FixedDimStore { dim: 384 };
        let err = validate_dimension(&store, 768).await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn matching_dimension_passes() {
        let store = FixedDimStore { dim: 768 };
        assert!(validate_dimension(&store, 768).await.is_ok());
    }

    #[tokio::test]
    async fn empty_collection_passes_dimension_check() {
        let store = MemoryVectorStore::new();
        // an unseeded memory store reports no dimension yet
        assert!(validate_dimension(&store, 768).await.is_ok());
    }
}
