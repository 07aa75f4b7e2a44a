use std::collections::BTreeSet;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::geo::{round_coord, GeoPoint};

/// Provider output before normalization. Never persisted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPlaceRecord {
    pub name: String,
    pub category: String,
    pub address: String,
    pub location: GeoPoint,
    pub rating: Option<f64>,
    pub description: Option<String>,
    pub source: String,
    pub source_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceCategory {
    Attraction,
    Restaurant,
    Hotel,
    Museum,
    Park,
    Shopping,
    Nightlife,
    Other,
}

impl PlaceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaceCategory::Attraction => "attraction",
            PlaceCategory::Restaurant => "restaurant",
            PlaceCategory::Hotel => "hotel",
            PlaceCategory::Museum => "museum",
            PlaceCategory::Park => "park",
            PlaceCategory::Shopping => "shopping",
            PlaceCategory::Nightlife => "nightlife",
            PlaceCategory::Other => "other",
        }
    }

    /// Map a provider-specific category string onto the taxonomy. Providers
    /// disagree wildly ("fast_food", "catering.restaurant", "lodging"), so
    /// matching is substring-based on the lowercased input.
    pub fn normalize(raw: &str) -> Self {
        let lowered = raw.to_ascii_lowercase();
        let has = |needle: &str| lowered.contains(needle);
        if has("restaurant") || has("food") || has("cafe") || has("catering") {
            PlaceCategory::Restaurant
        } else if has("hotel") || has("lodging") || has("hostel") || has("guest_house") {
            PlaceCategory::Hotel
        } else if has("museum") || has("gallery") {
            PlaceCategory::Museum
        } else if has("park") || has("garden") || has("nature") {
            PlaceCategory::Park
        } else if has("mall") || has("shop") || has("market") || has("commercial") {
            PlaceCategory::Shopping
        } else if has("bar") || has("pub") || has("club") || has("nightlife") {
            PlaceCategory::Nightlife
        } else if has("attraction") || has("tourism") || has("monument") || has("temple")
            || has("sight")
        {
            PlaceCategory::Attraction
        } else {
            PlaceCategory::Other
        }
    }
}

/// The deduplicated, normalized, embedding-augmented record persisted in the
/// vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalPlace {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: PlaceCategory,
    pub address: String,
    pub location: GeoPoint,
    pub rating: Option<f64>,
    pub image: Option<String>,
    pub source: String,
    pub source_id: Option<String>,
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl CanonicalPlace {
    pub fn from_raw(raw: RawPlaceRecord, now: DateTime<Utc>) -> Self {
        let id = place_id(&raw.name, &raw.source, raw.location);
        let category = PlaceCategory::normalize(&raw.category);
        let mut tags = BTreeSet::new();
        if !raw.category.trim().is_empty() {
            tags.insert(raw.category.trim().to_ascii_lowercase());
        }
        Self {
            id,
            name: raw.name,
            description: raw.description,
            category,
            address: raw.address,
            location: raw.location,
            rating: raw.rating,
            image: None,
            source: raw.source,
            source_id: raw.source_id,
            embedding: Vec::new(),
            last_updated: now,
            tags,
        }
    }

    /// Text fed to the embedding generator. Order matters for determinism,
    /// not for quality.
    pub fn embedding_text(&self) -> String {
        let mut parts = vec![self.name.clone(), self.category.as_str().to_string()];
        if let Some(description) = &self.description {
            parts.push(description.clone());
        }
        if !self.address.trim().is_empty() {
            parts.push(self.address.clone());
        }
        parts.join(". ")
    }

    /// Rough 0–1 completeness score used by the ingestion quality gate.
    pub fn quality_score(&self) -> f64 {
        let mut score: f64 = 0.0;
        if !self.name.trim().is_empty() {
            score += 0.35;
        }
        if !self.address.trim().is_empty() {
            score += 0.2;
        }
        if self.description.as_deref().is_some_and(|d| d.len() > 10) {
            score += 0.2;
        }
        if self.rating.is_some() {
            score += 0.15;
        }
        if self.category != PlaceCategory::Other {
            score += 0.1;
        }
        score.min(1.0)
    }

    /// Count of populated optional fields; the dedup merge keeps the record
    /// with more of them.
    pub fn completeness(&self) -> usize {
        let mut filled = 0;
        if self.description.is_some() {
            filled += 1;
        }
        if self.rating.is_some() {
            filled += 1;
        }
        if self.image.is_some() {
            filled += 1;
        }
        if self.source_id.is_some() {
            filled += 1;
        }
        if !self.address.trim().is_empty() {
            filled += 1;
        }
        filled
    }
}

/// Deterministic place id: same (name, source, coordinates) always hashes to
/// the same id, which is what makes vector-store upserts idempotent.
pub fn place_id(name: &str, source: &str, location: GeoPoint) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.trim().to_ascii_lowercase().as_bytes());
    hasher.update(source.as_bytes());
    hasher.update(round_coord(location.lat, 5).to_le_bytes());
    hasher.update(round_coord(location.lon, 5).to_le_bytes());
    STANDARD_NO_PAD.encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Places,
    Hotels,
    Restaurants,
    Mixed,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Places => "places",
            DataType::Hotels => "hotels",
            DataType::Restaurants => "restaurants",
            DataType::Mixed => "mixed",
        }
    }

    pub fn for_categories(categories: &[PlaceCategory]) -> Self {
        match categories {
            [PlaceCategory::Hotel] => DataType::Hotels,
            [PlaceCategory::Restaurant] => DataType::Restaurants,
            [] => DataType::Places,
            _ => DataType::Mixed,
        }
    }
}

/// Input to the aggregation entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationQuery {
    pub location: GeoPoint,
    pub radius_m: f64,
    #[serde(default)]
    pub categories: Vec<PlaceCategory>,
    /// Free-text intent, required by text-based providers and used for
    /// vector similarity when present.
    #[serde(default)]
    pub text: Option<String>,
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl AggregationQuery {
    pub fn near(location: GeoPoint, radius_m: f64, limit: usize) -> Self {
        Self {
            location,
            radius_m,
            categories: Vec::new(),
            text: None,
            limit,
            offset: 0,
            sources: Vec::new(),
        }
    }

    pub fn data_type(&self) -> DataType {
        DataType::for_categories(&self.categories)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregationOutcome {
    pub places: Vec<CanonicalPlace>,
    pub sources_used: Vec<String>,
    pub total_raw_found: usize,
    pub duplicates_removed: usize,
    pub elapsed_ms: u64,
}

#[cfg(test)]
pub(crate) fn sample_raw(name: &str, lat: f64, lon: f64, source: &str) -> RawPlaceRecord {
    RawPlaceRecord {
        name: name.to_string(),
        category: "tourism.attraction".to_string(),
        address: "1 Test Street".to_string(),
        location: GeoPoint::new(lat, lon),
        rating: Some(4.2),
        description: Some("A spot worth seeing".to_string()),
        source: source.to_string(),
        source_id: None,
    }
}
