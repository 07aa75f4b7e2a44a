use serde::{Deserialize, Serialize};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
            // (0, 0) is open ocean; every provider uses it as "unknown".
            && !(self.lat == 0.0 && self.lon == 0.0)
    }
}

/// Great-circle distance in meters (haversine).
pub fn distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

pub fn within_radius(center: GeoPoint, point: GeoPoint, radius_m: f64) -> bool {
    distance_m(center, point) <= radius_m
}

/// Round a coordinate to `decimals` places. 3 decimals ≈ 111m, 4 ≈ 11m.
pub fn round_coord(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Bucket key at 3 decimal places plus radius rounded to the nearest 1000m.
/// Two queries landing in the same bucket are close enough to share a cache
/// entry outright.
pub fn bucket_key(lat: f64, lon: f64, radius_m: f64) -> String {
    let radius_bucket = ((radius_m / 1000.0).round() as i64).max(1) * 1000;
    format!(
        "{:.3}:{:.3}:{radius_bucket}",
        round_coord(lat, 3),
        round_coord(lon, 3)
    )
}

/// Fine-grained bucket used by the deduplicator: identical 4-decimal
/// coordinates are the same physical place regardless of name.
pub fn dedup_bucket(point: GeoPoint) -> (i64, i64) {
    (
        (point.lat * 10_000.0).round() as i64,
        (point.lon * 10_000.0).round() as i64,
    )
}
