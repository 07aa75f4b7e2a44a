use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::geo::{distance_m, GeoPoint};
use crate::model::{CanonicalPlace, PlaceCategory};

const HTTP_TIMEOUT_SECS: u64 = 15;

/// Filters applied inside a geo-radius query.
#[derive(Debug, Clone, Default)]
pub struct StoreFilter {
    pub categories: Vec<PlaceCategory>,
    /// When present, results are scored by vector similarity and gated by
    /// `min_score`.
    pub query_vector: Option<Vec<f32>>,
    pub min_score: f32,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct ScoredPlace {
    pub place: CanonicalPlace,
    pub score: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStats {
    pub count: usize,
    pub vector_dim: Option<usize>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// The durable, shared record store. Upserts are idempotent because the
/// place id is a deterministic hash, so concurrent ingestions converge
/// instead of duplicating.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, place: &CanonicalPlace) -> AppResult<()>;

    async fn geo_radius_query(
        &self,
        center: GeoPoint,
        radius_m: f64,
        filter: &StoreFilter,
    ) -> AppResult<Vec<ScoredPlace>>;

    async fn collection_stats(&self) -> AppResult<CollectionStats>;

    /// Best-effort maintenance; failures are logged by callers, never fatal.
    async fn optimize(&self) -> AppResult<()>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// In-memory store with cosine scoring and haversine geo filtering. Backs
/// tests and offline runs; mirrors the remote store's contract exactly.
#[derive(Default)]
pub struct MemoryVectorStore {
    entries: RwLock<Vec<CanonicalPlace>>,
    last_updated: RwLock<Option<DateTime<Utc>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, place: &CanonicalPlace) -> AppResult<()> {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|e| e.id == place.id) {
            Some(existing) => *existing = place.clone(),
            None => entries.push(place.clone()),
        }
        *self.last_updated.write() = Some(Utc::now());
        Ok(())
    }

    async fn geo_radius_query(
        &self,
        center: GeoPoint,
        radius_m: f64,
        filter: &StoreFilter,
    ) -> AppResult<Vec<ScoredPlace>> {
        let entries = self.entries.read();
        let mut hits: Vec<ScoredPlace> = entries
            .iter()
            .filter(|place| distance_m(center, place.location) <= radius_m)
            .filter(|place| {
                filter.categories.is_empty() || filter.categories.contains(&place.category)
            })
            .map(|place| {
                let score = filter
                    .query_vector
                    .as_ref()
                    .map(|qv| cosine_similarity(qv, &place.embedding));
                ScoredPlace {
                    place: place.clone(),
                    score,
                }
            })
            .filter(|hit| match hit.score {
                Some(score) => score >= filter.min_score,
                None => true,
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .unwrap_or(0.0)
                .partial_cmp(&a.score.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.place.name.cmp(&b.place.name))
        });
        if filter.limit > 0 {
            hits.truncate(filter.limit);
        }
        Ok(hits)
    }

    async fn collection_stats(&self) -> AppResult<CollectionStats> {
        let entries = self.entries.read();
        Ok(CollectionStats {
            count: entries.len(),
            vector_dim: entries.first().map(|e| e.embedding.len()),
            last_updated: *self.last_updated.read(),
        })
    }

    async fn optimize(&self) -> AppResult<()> {
        debug!("memory store optimize is a no-op");
        Ok(())
    }
}

/// Qdrant-style REST client. Point ids must be numeric, so the place's
/// deterministic string id is folded into a u64; the full record rides in
/// the payload.
pub struct HttpVectorStore {
    http: reqwest::Client,
    base_url: String,
    collection: String,
    api_key: Option<SecretString>,
}

fn numeric_point_id(place_id: &str) -> u64 {
    let digest = Sha256::digest(place_id.as_bytes());
    u64::from_le_bytes(digest[..8].try_into().expect("sha256 is 32 bytes"))
}

impl HttpVectorStore {
    pub fn new(base_url: String, collection: String, api_key: Option<SecretString>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("vector store http client");
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            collection,
            api_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let mut builder = self.http.request(method, url);
        if let Some(key) = &self.api_key {
            builder = builder.header("api-key", key.expose_secret());
        }
        builder
    }

    fn geo_filter(center: GeoPoint, radius_m: f64, categories: &[PlaceCategory]) -> serde_json::Value {
        let mut must = vec![serde_json::json!({
            "key": "location",
            "geo_radius": {
                "center": { "lat": center.lat, "lon": center.lon },
                "radius": radius_m,
            }
        })];
        if !categories.is_empty() {
            let values: Vec<&str> = categories.iter().map(|c| c.as_str()).collect();
            must.push(serde_json::json!({
                "key": "category",
                "match": { "any": values }
            }));
        }
        serde_json::json!({ "must": must })
    }

    fn parse_payload(payload: serde_json::Value) -> Option<CanonicalPlace> {
        match serde_json::from_value::<CanonicalPlace>(payload.get("place")?.clone()) {
            Ok(place) => Some(place),
            Err(err) => {
                warn!(?err, "dropping stored point with unreadable payload");
                None
            }
        }
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn upsert(&self, place: &CanonicalPlace) -> AppResult<()> {
        let body = serde_json::json!({
            "points": [{
                "id": numeric_point_id(&place.id),
                "vector": place.embedding,
                "payload": {
                    "place": place,
                    "category": place.category.as_str(),
                    "source": place.source,
                    "location": { "lat": place.location.lat, "lon": place.location.lon },
                }
            }]
        });

        self.request(
            reqwest::Method::PUT,
            &format!("/collections/{}/points?wait=true", self.collection),
        )
        .json(&body)
        .send()
        .await?
        .error_for_status()
        .map_err(|err| AppError::Store(err.to_string()))?;
        Ok(())
    }

    async fn geo_radius_query(
        &self,
        center: GeoPoint,
        radius_m: f64,
        filter: &StoreFilter,
    ) -> AppResult<Vec<ScoredPlace>> {
        let limit = if filter.limit > 0 { filter.limit } else { 50 };
        let qdrant_filter = Self::geo_filter(center, radius_m, &filter.categories);

        let hits: Vec<(Option<f32>, serde_json::Value)> = match &filter.query_vector {
            Some(vector) => {
                #[derive(Deserialize)]
                struct QueryResponse {
                    result: Option<QueryResult>,
                }
                #[derive(Deserialize)]
                struct QueryResult {
                    points: Option<Vec<QueryPoint>>,
                }
                #[derive(Deserialize)]
                struct QueryPoint {
                    score: Option<f32>,
                    payload: Option<serde_json::Value>,
                }

                let body = serde_json::json!({
                    "query": vector,
                    "filter": qdrant_filter,
                    "limit": limit,
                    "score_threshold": filter.min_score,
                    "with_payload": true,
                });
                let response = self
                    .request(
                        reqwest::Method::POST,
                        &format!("/collections/{}/points/query", self.collection),
                    )
                    .json(&body)
                    .send()
                    .await?
                    .error_for_status()
                    .map_err(|err| AppError::Store(err.to_string()))?;
                let parsed: QueryResponse =
                    response.json().await.map_err(AppError::from)?;
                parsed
                    .result
                    .and_then(|r| r.points)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|p| p.payload.map(|payload| (p.score, payload)))
                    .collect()
            }
            None => {
                #[derive(Deserialize)]
                struct ScrollResponse {
                    result: Option<ScrollResult>,
                }
                #[derive(Deserialize)]
                struct ScrollResult {
                    points: Option<Vec<ScrollPoint>>,
                }
                #[derive(Deserialize)]
                struct ScrollPoint {
                    payload: Option<serde_json::Value>,
                }

                let body = serde_json::json!({
                    "filter": qdrant_filter,
                    "limit": limit,
                    "with_payload": true,
                });
                let response = self
                    .request(
                        reqwest::Method::POST,
                        &format!("/collections/{}/points/scroll", self.collection),
                    )
                    .json(&body)
                    .send()
                    .await?
                    .error_for_status()
                    .map_err(|err| AppError::Store(err.to_string()))?;
                let parsed: ScrollResponse =
                    response.json().await.map_err(AppError::from)?;
                parsed
                    .result
                    .and_then(|r| r.points)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|p| p.payload.map(|payload| (None, payload)))
                    .collect()
            }
        };

        Ok(hits
            .into_iter()
            .filter_map(|(score, payload)| {
                Self::parse_payload(payload).map(|place| ScoredPlace { place, score })
            })
            .collect())
    }

    async fn collection_stats(&self) -> AppResult<CollectionStats> {
        #[derive(Deserialize)]
        struct InfoResponse {
            result: Option<Info>,
        }
        #[derive(Deserialize)]
        struct Info {
            points_count: Option<usize>,
            config: Option<Config>,
        }
        #[derive(Deserialize)]
        struct Config {
            params: Option<Params>,
        }
        #[derive(Deserialize)]
        struct Params {
            vectors: Option<Vectors>,
        }
        #[derive(Deserialize)]
        struct Vectors {
            size: Option<usize>,
        }

        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/collections/{}", self.collection),
            )
            .send()
            .await?
            .error_for_status()
            .map_err(|err| AppError::Store(err.to_string()))?;
        let parsed: InfoResponse = response.json().await.map_err(AppError::from)?;
        let info = parsed
            .result
            .ok_or_else(|| AppError::Store("collection info missing result".into()))?;
        Ok(CollectionStats {
            count: info.points_count.unwrap_or(0),
            vector_dim: info
                .config
                .and_then(|c| c.params)
                .and_then(|p| p.vectors)
                .and_then(|v| v.size),
            last_updated: None,
        })
    }

    async fn optimize(&self) -> AppResult<()> {
        let body = serde_json::json!({
            "optimizers_config": { "indexing_threshold": 10_000 }
        });
        self.request(
            reqwest::Method::PATCH,
            &format!("/collections/{}", self.collection),
        )
        .json(&body)
        .send()
        .await?
        .error_for_status()
        .map_err(|err| AppError::Store(err.to_string()))?;
        Ok(())
    }
}
