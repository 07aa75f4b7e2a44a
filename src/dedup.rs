use tracing::trace;

use crate::geo::{dedup_bucket, distance_m};
use crate::model::CanonicalPlace;

/// Distance/similarity pair deciding when two records are the same place.
///
/// Two tiers are in play: a looser incremental tier applied while the cascade
/// is still accumulating (merges aggressively, keeps the working set small)
/// and a stricter final tier applied to the full set (avoids collapsing
/// genuinely distinct neighbors).
#[derive(Debug, Clone, Copy)]
pub struct DedupThresholds {
    pub max_distance_m: f64,
    pub min_name_similarity: f64,
}

impl DedupThresholds {
    pub const INCREMENTAL: Self = Self {
        max_distance_m: 50.0,
        min_name_similarity: 0.7,
    };

    pub const FINAL: Self = Self {
        max_distance_m: 100.0,
        min_name_similarity: 0.8,
    };
}

/// `1 - levenshtein/max_len` over case-folded, whitespace-collapsed names.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / max_len as f64
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

pub fn is_duplicate_pair(
    a: &CanonicalPlace,
    b: &CanonicalPlace,
    thresholds: DedupThresholds,
) -> bool {
    if dedup_bucket(a.location) == dedup_bucket(b.location) {
        return true;
    }
    let distance = distance_m(a.location, b.location);
    if distance >= thresholds.max_distance_m {
        return false;
    }
    name_similarity(&a.name, &b.name) > thresholds.min_name_similarity
}

/// Whether `candidate` duplicates anything already accumulated.
pub fn is_duplicate(
    candidate: &CanonicalPlace,
    existing: &[CanonicalPlace],
    thresholds: DedupThresholds,
) -> bool {
    existing
        .iter()
        .any(|place| is_duplicate_pair(candidate, place, thresholds))
}

/// Collapse duplicates in `places`, keeping one merged record per physical
/// place. Returns the survivors and the number of records removed.
pub fn dedupe_all(
    places: Vec<CanonicalPlace>,
    thresholds: DedupThresholds,
) -> (Vec<CanonicalPlace>, usize) {
    let incoming = places.len();
    let mut kept: Vec<CanonicalPlace> = Vec::with_capacity(incoming);

    for candidate in places {
        if let Some(existing) = kept
            .iter_mut()
            .find(|place| is_duplicate_pair(&candidate, place, thresholds))
        {
            trace!(
                kept = %existing.name,
                dropped = %candidate.name,
                "merging duplicate place"
            );
            merge_into(existing, candidate);
        } else {
            kept.push(candidate);
        }
    }

    let removed = incoming - kept.len();
    (kept, removed)
}

/// Keep the more complete of the two records, folding in whatever the other
/// has that the survivor lacks.
fn merge_into(existing: &mut CanonicalPlace, candidate: CanonicalPlace) {
    let candidate_wins = candidate.completeness() > existing.completeness()
        || (candidate.completeness() == existing.completeness()
            && candidate.rating.unwrap_or(0.0) > existing.rating.unwrap_or(0.0));

    if candidate_wins {
        let absorbed = std::mem::replace(existing, candidate);
        fill_gaps(existing, absorbed);
    } else {
        fill_gaps(existing, candidate);
    }
}

fn fill_gaps(target: &mut CanonicalPlace, other: CanonicalPlace) {
    if target.description.is_none() {
        target.description = other.description;
    }
    if target.rating.is_none() {
        target.rating = other.rating;
    }
    if target.image.is_none() {
        target.image = other.image;
    }
    if target.source_id.is_none() {
        target.source_id = other.source_id;
    }
    if target.address.trim().is_empty() {
        target.address = other.address;
    }
    target.tags.extend(other.tags);
}
