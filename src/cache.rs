use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::geo::{bucket_key, distance_m, GeoPoint};
use crate::model::{AggregationQuery, CanonicalPlace, DataType, PlaceCategory};

/// Semantic half of the cache key. Two requests over the same bucket still
/// must not share an entry when their text or category filters differ, since
/// those change which records qualify and how they are ranked.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryKey {
    pub data_type: DataType,
    pub text: Option<String>,
    pub categories: Vec<PlaceCategory>,
}

impl QueryKey {
    /// Normalized key: text is trimmed and lowercased, categories sorted and
    /// deduplicated, so equivalent queries land on the same entry.
    pub fn from_query(query: &AggregationQuery) -> Self {
        let mut categories = query.categories.clone();
        categories.sort_by_key(|c| c.as_str());
        categories.dedup();
        Self {
            data_type: query.data_type(),
            text: query
                .text
                .as_deref()
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty()),
            categories,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub bucket_key: String,
    pub key: QueryKey,
    pub center: GeoPoint,
    pub radius_used: f64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: Vec<CanonicalPlace>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// In-memory geo-bucketed cache. Every read and write starts with a TTL
/// sweep, so an expired entry can never be observed; size is bounded by
/// oldest-first eviction. All operations are O(n) over live entries, which
/// the eviction cap keeps small.
pub struct LocalCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    entries: Vec<CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl LocalCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn ttl_for(&self, data_type: DataType) -> Duration {
        let secs = match data_type {
            DataType::Places => self.config.ttl_places_secs,
            DataType::Hotels => self.config.ttl_hotels_secs,
            DataType::Restaurants => self.config.ttl_restaurants_secs,
            DataType::Mixed => self.config.ttl_mixed_secs,
        };
        Duration::seconds(secs.max(1))
    }

    pub fn get(&self, lat: f64, lon: f64, radius_m: f64, key: &QueryKey) -> Option<CacheEntry> {
        self.get_at(lat, lon, radius_m, key, Utc::now())
    }

    pub fn get_at(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
        key: &QueryKey,
        now: DateTime<Utc>,
    ) -> Option<CacheEntry> {
        let bucket = bucket_key(lat, lon, radius_m);
        let query_point = GeoPoint::new(lat, lon);

        let mut inner = self.inner.lock();
        self.purge_expired(&mut inner, now);

        let exact = inner
            .entries
            .iter()
            .find(|e| e.bucket_key == bucket && e.key == *key)
            .cloned();
        if let Some(entry) = exact {
            inner.hits += 1;
            trace!(%bucket, "cache hit (exact bucket)");
            return Some(entry);
        }

        // A wider stored result centered nearby safely answers a narrower
        // request with the same semantics.
        let tolerant = inner
            .entries
            .iter()
            .find(|e| {
                e.key == *key
                    && e.radius_used >= radius_m
                    && distance_m(e.center, query_point) <= self.config.radius_tolerance_m
            })
            .cloned();

        match tolerant {
            Some(entry) => {
                inner.hits += 1;
                trace!(%bucket, matched = %entry.bucket_key, "cache hit (radius tolerance)");
                Some(entry)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn set(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
        key: QueryKey,
        payload: Vec<CanonicalPlace>,
        source: impl Into<String>,
    ) {
        self.set_at(lat, lon, radius_m, key, payload, source, Utc::now());
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_at(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
        key: QueryKey,
        payload: Vec<CanonicalPlace>,
        source: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let bucket = bucket_key(lat, lon, radius_m);
        let entry = CacheEntry {
            bucket_key: bucket.clone(),
            key,
            center: GeoPoint::new(lat, lon),
            radius_used: radius_m,
            timestamp: now,
            source: source.into(),
            payload,
        };

        let mut inner = self.inner.lock();
        self.purge_expired(&mut inner, now);
        inner
            .entries
            .retain(|e| !(e.bucket_key == bucket && e.key == entry.key));
        inner.entries.push(entry);
        self.evict_over_capacity(&mut inner);
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    fn purge_expired(&self, inner: &mut CacheInner, now: DateTime<Utc>) {
        let before = inner.entries.len();
        let ttl_of = |e: &CacheEntry| self.ttl_for(e.key.data_type);
        inner.entries.retain(|e| now - e.timestamp <= ttl_of(e));
        let purged = before - inner.entries.len();
        if purged > 0 {
            debug!(purged, "purged expired cache entries");
        }
    }

    fn evict_over_capacity(&self, inner: &mut CacheInner) {
        while inner.entries.len() > self.config.max_entries.max(1) {
            let oldest = inner
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.timestamp)
                .map(|(i, _)| i);
            if let Some(index) = oldest {
                let evicted = inner.entries.remove(index);
                inner.evictions += 1;
                debug!(key = %evicted.bucket_key, "evicted cache entry over capacity");
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::model::{sample_raw, CanonicalPlace};

    use super::*;

    fn test_config() -> CacheConfig {
        CacheConfig {
            max_entries: 3,
            radius_tolerance_m: 1_000.0,
            ttl_places_secs: 3_600,
            ttl_hotels_secs: 7_200,
            ttl_restaurants_secs: 600,
            ttl_mixed_secs: 1_800,
        }
    }

    fn payload(name: &str) -> Vec<CanonicalPlace> {
        vec![CanonicalPlace::from_raw(
            sample_raw(name, 28.6139, 77.2090, "test"),
            Utc::now(),
        )]
    }

    fn plain() -> QueryKey {
        QueryKey {
            data_type: DataType::Places,
            text: None,
            categories: Vec::new(),
        }
    }

    fn with_text(text: &str) -> QueryKey {
        QueryKey {
            text: Some(text.to_string()),
            ..plain()
        }
    }

    fn with_categories(categories: Vec<PlaceCategory>) -> QueryKey {
        QueryKey {
            data_type: DataType::for_categories(&categories),
            text: None,
            categories,
        }
    }

    #[test]
    fn round_trip_within_ttl() {
        let cache = LocalCache::new(test_config());
        cache.set(28.6139, 77.2090, 5_000.0, plain(), payload("P"), "test");
        let hit = cache
            .get(28.6139, 77.2090, 5_000.0, &plain())
            .expect("cache hit");
        assert_eq!(hit.payload[0].name, "P");
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn expired_entries_are_never_returned() {
        let cache = LocalCache::new(test_config());
        let start = Utc::now();
        let key = with_categories(vec![PlaceCategory::Restaurant]);
        cache.set_at(28.6139, 77.2090, 5_000.0, key.clone(), payload("P"), "test", start);
        // restaurants TTL is 600s in the test config
        let within = start + Duration::seconds(599);
        assert!(cache.get_at(28.6139, 77.2090, 5_000.0, &key, within).is_some());
        let after = start + Duration::seconds(601);
        assert!(cache.get_at(28.6139, 77.2090, 5_000.0, &key, after).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn wider_radius_satisfies_narrower_nearby_request() {
        let cache = LocalCache::new(test_config());
        cache.set(28.6139, 77.2090, 10_000.0, plain(), payload("Wide"), "test");
        // ~500m north of the stored center, narrower radius
        let hit = cache
            .get(28.6184, 77.2090, 5_000.0, &plain())
            .expect("tolerant hit");
        assert_eq!(hit.payload[0].name, "Wide");
    }

    #[test]
    fn narrower_stored_radius_does_not_satisfy_wider_request() {
        let cache = LocalCache::new(test_config());
        cache.set(28.6139, 77.2090, 2_000.0, plain(), payload("Narrow"), "test");
        assert!(cache.get(28.6184, 77.2090, 5_000.0, &plain()).is_none());
    }

    #[test]
    fn text_query_never_matches_a_plain_entry() {
        let cache = LocalCache::new(test_config());
        cache.set(28.6139, 77.2090, 5_000.0, plain(), payload("Generic"), "test");

        // same bucket, different semantics: miss, even via radius tolerance
        assert!(cache
            .get(28.6139, 77.2090, 5_000.0, &with_text("historic fort walls"))
            .is_none());
        assert_eq!(cache.stats().misses, 1);

        cache.set(
            28.6139,
            77.2090,
            5_000.0,
            with_text("historic fort walls"),
            payload("Forts"),
            "test",
        );
        assert_eq!(cache.stats().entries, 2);
        let hit = cache
            .get(28.6139, 77.2090, 5_000.0, &with_text("historic fort walls"))
            .unwrap();
        assert_eq!(hit.payload[0].name, "Forts");
    }

    #[test]
    fn distinct_category_sets_do_not_collide() {
        let cache = LocalCache::new(test_config());
        // both map to the mixed data type, but they are different filters
        let museums = with_categories(vec![PlaceCategory::Museum]);
        let parks = with_categories(vec![PlaceCategory::Park]);
        assert_eq!(museums.data_type, parks.data_type);

        cache.set(28.6139, 77.2090, 5_000.0, museums.clone(), payload("M"), "test");
        assert!(cache.get(28.6139, 77.2090, 5_000.0, &parks).is_none());
        let hit = cache.get(28.6139, 77.2090, 5_000.0, &museums).unwrap();
        assert_eq!(hit.payload[0].name, "M");
    }

    #[test]
    fn key_normalization_canonicalizes_text_and_categories() {
        let loose = AggregationQuery {
            text: Some("  Historic FORT walls ".into()),
            categories: vec![PlaceCategory::Park, PlaceCategory::Museum, PlaceCategory::Park],
            ..AggregationQuery::near(GeoPoint::new(28.6139, 77.2090), 5_000.0, 20)
        };
        let canonical = AggregationQuery {
            text: Some("historic fort walls".into()),
            categories: vec![PlaceCategory::Museum, PlaceCategory::Park],
            ..AggregationQuery::near(GeoPoint::new(28.6139, 77.2090), 5_000.0, 20)
        };
        assert_eq!(QueryKey::from_query(&loose), QueryKey::from_query(&canonical));
    }

    #[test]
    fn evicts_oldest_over_capacity() {
        let cache = LocalCache::new(test_config());
        let start = Utc::now();
        for (i, lat) in [28.1, 28.2, 28.3, 28.4].iter().enumerate() {
            cache.set_at(
                *lat,
                77.0,
                5_000.0,
                plain(),
                payload(&format!("P{i}")),
                "test",
                start + Duration::seconds(i as i64),
            );
        }
        let stats = cache.stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.evictions, 1);
        // the first (oldest) entry is the one that went
        assert!(cache.get(28.1, 77.0, 5_000.0, &plain()).is_none());
        assert!(cache.get(28.4, 77.0, 5_000.0, &plain()).is_some());
    }

    #[test]
    fn rewriting_same_bucket_replaces_entry() {
        let cache = LocalCache::new(test_config());
        cache.set(28.6139, 77.2090, 5_000.0, plain(), payload("Old"), "test");
        cache.set(28.6139, 77.2090, 5_000.0, plain(), payload("New"), "test");
        assert_eq!(cache.stats().entries, 1);
        let hit = cache.get(28.6139, 77.2090, 5_000.0, &plain()).unwrap();
        assert_eq!(hit.payload[0].name, "New");
    }
}
