use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geo::GeoPoint;
use crate::model::{AggregationQuery, PlaceCategory, RawPlaceRecord};

pub const FALLBACK_PROVIDER: &str = "synthetic";

const HTTP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";
const DEFAULT_GEOAPIFY_URL: &str = "https://api.geoapify.com/v2/places";

/// One external place source. Adapters normalize at the boundary: a record
/// with a missing name or invalid coordinates never leaves the adapter.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Providers that can only answer text queries are skipped when the
    /// aggregation query carries coordinates alone.
    fn requires_text_query(&self) -> bool {
        false
    }

    /// Lightweight endpoint for the health monitor; None means health is
    /// derived from real usage instead.
    fn probe_url(&self) -> Option<String> {
        None
    }

    async fn fetch(&self, query: &AggregationQuery) -> AppResult<Vec<RawPlaceRecord>>;
}

/// The set of configured adapters. Ordering is owned by the health monitor,
/// not the registry.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn from_config(config: &AppConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("provider http client");

        let mut providers: Vec<Arc<dyn ProviderAdapter>> = vec![Arc::new(OverpassProvider::new(
            http.clone(),
            config.overpass_url.clone(),
        ))];
        if let Some(key) = config.geoapify_api_key.clone() {
            providers.push(Arc::new(GeoapifyProvider::new(
                http,
                config.geoapify_url.clone(),
                key,
            )));
        }
        providers.push(Arc::new(SyntheticProvider::default()));
        Self { providers }
    }

    pub fn from_providers(providers: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        Self { providers }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .map(Arc::clone)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ProviderAdapter>> {
        self.providers.iter()
    }
}

/// Strict boundary normalization: provider payloads with missing names or
/// out-of-range coordinates are dropped here, never downstream.
pub fn normalize_record(
    source: &'static str,
    name: Option<String>,
    category: Option<String>,
    address: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    rating: Option<f64>,
    description: Option<String>,
    source_id: Option<String>,
) -> Option<RawPlaceRecord> {
    let name = name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())?;
    let location = GeoPoint::new(lat?, lon?);
    if !location.is_valid() {
        debug!(source, %name, "rejecting record with invalid coordinates");
        return None;
    }
    Some(RawPlaceRecord {
        name,
        category: category.unwrap_or_default(),
        address: address.unwrap_or_default(),
        location,
        rating: rating.filter(|r| (0.0..=5.0).contains(r)),
        description: description.filter(|d| !d.trim().is_empty()),
        source: source.to_string(),
        source_id,
    })
}

/// OpenStreetMap Overpass adapter. Coordinate-only queries work; no key
/// needed; the public endpoint rate limits aggressively.
pub struct OverpassProvider {
    http: reqwest::Client,
    url: String,
}

impl OverpassProvider {
    pub fn new(http: reqwest::Client, url: Option<String>) -> Self {
        Self {
            http,
            url: url.unwrap_or_else(|| DEFAULT_OVERPASS_URL.to_string()),
        }
    }

    fn build_query(query: &AggregationQuery) -> String {
        let radius = query.radius_m.max(100.0) as u64;
        let GeoPoint { lat, lon } = query.location;
        let selectors = if query.categories.is_empty() {
            vec!["tourism", "amenity", "leisure"]
        } else {
            query
                .categories
                .iter()
                .map(|c| match c {
                    PlaceCategory::Restaurant | PlaceCategory::Nightlife => "amenity",
                    PlaceCategory::Hotel => "tourism",
                    PlaceCategory::Park => "leisure",
                    _ => "tourism",
                })
                .collect()
        };
        let mut body = String::from("[out:json][timeout:8];(");
        for selector in selectors {
            body.push_str(&format!(
                "node[\"{selector}\"][\"name\"](around:{radius},{lat},{lon});"
            ));
        }
        body.push_str(");out center 60;");
        body
    }
}

#[async_trait]
impl ProviderAdapter for OverpassProvider {
    fn name(&self) -> &'static str {
        "overpass"
    }

    fn probe_url(&self) -> Option<String> {
        Some(self.url.clone())
    }

    async fn fetch(&self, query: &AggregationQuery) -> AppResult<Vec<RawPlaceRecord>> {
        #[derive(serde::Deserialize)]
        struct Response {
            elements: Option<Vec<Element>>,
        }

        #[derive(serde::Deserialize)]
        struct Element {
            id: Option<u64>,
            lat: Option<f64>,
            lon: Option<f64>,
            center: Option<Center>,
            tags: Option<serde_json::Map<String, serde_json::Value>>,
        }

        #[derive(serde::Deserialize)]
        struct Center {
            lat: Option<f64>,
            lon: Option<f64>,
        }

        let response = self
            .http
            .post(&self.url)
            .body(Self::build_query(query))
            .send()
            .await?
            .error_for_status()?;

        let parsed: Response = response.json().await.map_err(AppError::from)?;
        let mut records = Vec::new();
        for element in parsed.elements.unwrap_or_default() {
            let tags = element.tags.unwrap_or_default();
            let text = |key: &str| {
                tags.get(key)
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            };
            let (lat, lon) = match (element.lat, element.lon, element.center) {
                (Some(lat), Some(lon), _) => (Some(lat), Some(lon)),
                (_, _, Some(center)) => (center.lat, center.lon),
                _ => (None, None),
            };
            let category = text("tourism")
                .or_else(|| text("amenity"))
                .or_else(|| text("leisure"));
            let address = [text("addr:housenumber"), text("addr:street"), text("addr:city")]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            if let Some(record) = normalize_record(
                self.name(),
                text("name"),
                category,
                Some(address),
                lat,
                lon,
                None,
                text("description"),
                element.id.map(|id| id.to_string()),
            ) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Geoapify Places adapter. Keyed; richer categories and formatted addresses
/// than Overpass.
pub struct GeoapifyProvider {
    http: reqwest::Client,
    url: String,
    api_key: SecretString,
}

impl GeoapifyProvider {
    pub fn new(http: reqwest::Client, url: Option<String>, api_key: SecretString) -> Self {
        Self {
            http,
            url: url.unwrap_or_else(|| DEFAULT_GEOAPIFY_URL.to_string()),
            api_key,
        }
    }

    fn category_filter(categories: &[PlaceCategory]) -> String {
        if categories.is_empty() {
            return "tourism,catering,accommodation,entertainment".to_string();
        }
        categories
            .iter()
            .map(|c| match c {
                PlaceCategory::Restaurant => "catering",
                PlaceCategory::Hotel => "accommodation",
                PlaceCategory::Museum => "entertainment.museum",
                PlaceCategory::Park => "leisure.park",
                PlaceCategory::Shopping => "commercial",
                PlaceCategory::Nightlife => "adult.nightclub",
                _ => "tourism",
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[async_trait]
impl ProviderAdapter for GeoapifyProvider {
    fn name(&self) -> &'static str {
        "geoapify"
    }

    fn probe_url(&self) -> Option<String> {
        Some(self.url.clone())
    }

    async fn fetch(&self, query: &AggregationQuery) -> AppResult<Vec<RawPlaceRecord>> {
        #[derive(serde::Deserialize)]
        struct Response {
            features: Option<Vec<Feature>>,
        }

        #[derive(serde::Deserialize)]
        struct Feature {
            properties: Option<Properties>,
        }

        #[derive(serde::Deserialize)]
        struct Properties {
            name: Option<String>,
            formatted: Option<String>,
            lat: Option<f64>,
            lon: Option<f64>,
            categories: Option<Vec<String>>,
            place_id: Option<String>,
            #[serde(rename = "description")]
            description: Option<String>,
        }

        let GeoPoint { lat, lon } = query.location;
        let filter = format!("circle:{lon},{lat},{}", query.radius_m.max(100.0) as u64);
        let response = self
            .http
            .get(&self.url)
            .query(&[
                ("categories", Self::category_filter(&query.categories)),
                ("filter", filter),
                ("limit", "50".to_string()),
                ("apiKey", self.api_key.expose_secret().to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let parsed: Response = response.json().await.map_err(AppError::from)?;
        let mut records = Vec::new();
        for feature in parsed.features.unwrap_or_default() {
            let Some(props) = feature.properties else {
                continue;
            };
            let category = props
                .categories
                .as_ref()
                .and_then(|c| c.first())
                .cloned();
            if let Some(record) = normalize_record(
                self.name(),
                props.name,
                category,
                props.formatted,
                props.lat,
                props.lon,
                None,
                props.description,
                props.place_id,
            ) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Deterministic generative fallback, always ranked last by the health
/// monitor. Produces plausible records seeded from the query coordinates so
/// a fully dark provider fleet still yields something to show.
#[derive(Default)]
pub struct SyntheticProvider;

impl SyntheticProvider {
    fn seed_for(query: &AggregationQuery) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(query.location.lat.to_le_bytes());
        hasher.update(query.location.lon.to_le_bytes());
        hasher.update(query.radius_m.to_le_bytes());
        let digest = hasher.finalize();
        u64::from_le_bytes(digest[..8].try_into().expect("sha256 is 32 bytes"))
    }
}

#[async_trait]
impl ProviderAdapter for SyntheticProvider {
    fn name(&self) -> &'static str {
        FALLBACK_PROVIDER
    }

    async fn fetch(&self, query: &AggregationQuery) -> AppResult<Vec<RawPlaceRecord>> {
        let mut rng = StdRng::seed_from_u64(Self::seed_for(query));
        let categories: &[(&str, PlaceCategory)] = &[
            ("viewpoint", PlaceCategory::Attraction),
            ("restaurant", PlaceCategory::Restaurant),
            ("park", PlaceCategory::Park),
            ("market", PlaceCategory::Shopping),
        ];
        let wanted = if query.categories.is_empty() {
            None
        } else {
            Some(query.categories.clone())
        };

        let mut records = Vec::new();
        for index in 0..8 {
            let (label, category) = categories[index % categories.len()];
            if let Some(filter) = &wanted {
                if !filter.contains(&category) {
                    continue;
                }
            }
            // spread within ~60% of the requested radius
            let spread = query.radius_m * 0.6 / 111_000.0;
            let lat = query.location.lat + rng.gen_range(-spread..=spread);
            let lon = query.location.lon + rng.gen_range(-spread..=spread);
            let record = normalize_record(
                FALLBACK_PROVIDER,
                Some(format!("Nearby {label} {}", index + 1)),
                Some(label.to_string()),
                Some(String::new()),
                Some(lat),
                Some(lon),
                Some((rng.gen_range(30..=48) as f64) / 10.0),
                Some(format!("Suggested {label} near the requested area")),
                None,
            );
            match record {
                Some(record) => records.push(record),
                None => warn!(index, "synthetic record fell outside valid bounds"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> AggregationQuery {
        AggregationQuery::near(GeoPoint::new(28.6139, 77.2090), 5_000.0, 20)
    }

    #[test]
    fn normalization_rejects_bad_records() {
        assert!(normalize_record(
            "test",
            Some("  ".into()),
            None,
            None,
            Some(28.6),
            Some(77.2),
            None,
            None,
            None
        )
        .is_none());
        assert!(normalize_record(
            "test",
            Some("No coords".into()),
            None,
            None,
            None,
            Some(77.2),
            None,
            None,
            None
        )
        .is_none());
        assert!(normalize_record(
            "test",
            Some("Null island".into()),
            None,
            None,
            Some(0.0),
            Some(0.0),
            None,
            None,
            None
        )
        .is_none());
        let ok = normalize_record(
            "test",
            Some("Red Fort".into()),
            Some("fort".into()),
            Some("Netaji Subhash Marg".into()),
            Some(28.6562),
            Some(77.2410),
            Some(4.6),
            None,
            None,
        )
        .unwrap();
        assert_eq!(ok.name, "Red Fort");
        assert_eq!(ok.rating, Some(4.6));
    }

    #[test]
    fn normalization_discards_out_of_scale_ratings() {
        let record = normalize_record(
            "test",
            Some("Odd rating".into()),
            None,
            None,
            Some(28.6),
            Some(77.2),
            Some(87.0),
            None,
            None,
        )
        .unwrap();
        assert_eq!(record.rating, None);
    }

    #[tokio::test]
    async fn synthetic_provider_is_deterministic() {
        let provider = SyntheticProvider;
        let a = provider.fetch(&query()).await.unwrap();
        let b = provider.fetch(&query()).await.unwrap();
        assert!(!a.is_empty());
        assert_eq!(a.len(), b.len());
        assert_eq!(a[0].name, b[0].name);
        assert_eq!(a[0].location, b[0].location);
        assert!(a.iter().all(|r| r.location.is_valid()));
    }

    #[tokio::test]
    async fn synthetic_provider_honors_category_filter() {
        let mut q = query();
        q.categories = vec![PlaceCategory::Restaurant];
        let records = SyntheticProvider.fetch(&q).await.unwrap();
        assert!(!records.is_empty());
        assert!(records
            .iter()
            .all(|r| PlaceCategory::normalize(&r.category) == PlaceCategory::Restaurant));
    }

    #[test]
    fn overpass_query_targets_radius_and_center() {
        let body = OverpassProvider::build_query(&query());
        assert!(body.contains("around:5000,28.6139,77.209"));
        assert!(body.contains("tourism"));
    }
}
