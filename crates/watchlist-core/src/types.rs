use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cosine similarity at or above which two signatures are the same person.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.85;

/// A face located in a source image, in source-image pixel space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl DetectedFace {
    /// Build a face from its top-left and bottom-right corners.
    pub fn from_corners(top_left: (f32, f32), bottom_right: (f32, f32), confidence: f32) -> Self {
        Self {
            left: top_left.0,
            top: top_left.1,
            width: bottom_right.0 - top_left.0,
            height: bottom_right.1 - top_left.1,
            confidence,
        }
    }

    pub fn right(&self) -> f32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.top + self.height
    }
}

/// Fixed-length face signature produced by the embedding model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature {
    pub values: Vec<f32>,
}

impl Signature {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cosine similarity in [-1, 1].
    ///
    /// Signatures of different length are not comparable and score 0.
    /// A zero-magnitude signature also scores 0 against anything.
    pub fn similarity(&self, other: &Signature) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

impl From<Vec<f32>> for Signature {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Where the photo behind a record was stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceImage {
    pub filename: String,
    pub storage_path: String,
}

/// A person seen at least once, identified by a representative signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspiciousRecord {
    pub id: String,
    pub filename: String,
    pub storage_path: String,
    pub signature: Signature,
    pub sighting_count: u32,
    pub is_legitimate: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl SuspiciousRecord {
    /// A first sighting: count 1, not legitimate, both timestamps `now`.
    pub fn first_sighting(signature: Signature, source: SourceImage, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            filename: source.filename,
            storage_path: source.storage_path,
            signature,
            sighting_count: 1,
            is_legitimate: false,
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    /// Register one more sighting at `now`.
    pub fn sighted_again(&mut self, now: DateTime<Utc>) {
        self.sighting_count = self.sighting_count.saturating_add(1);
        self.last_seen_at = now;
    }
}

/// Result of searching a gallery for a query signature.
#[derive(Debug, Clone, Copy)]
pub struct MatchResult<'g> {
    /// Best record at or above the threshold, if any.
    pub record: Option<&'g SuspiciousRecord>,
    /// Highest similarity seen in the scan, regardless of threshold.
    pub best_similarity: f32,
}

impl MatchResult<'_> {
    pub fn matched(&self) -> bool {
        self.record.is_some()
    }
}

/// Strategy for comparing a query signature against the gallery.
pub trait Matcher {
    fn find_best<'g>(
        &self,
        query: &Signature,
        gallery: &'g [SuspiciousRecord],
        threshold: f32,
    ) -> MatchResult<'g>;
}

/// Linear cosine-similarity scan.
///
/// The tracked match only moves on a strict improvement of the running
/// maximum, so among records tied at the top the first one scanned wins.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn find_best<'g>(
        &self,
        query: &Signature,
        gallery: &'g [SuspiciousRecord],
        threshold: f32,
    ) -> MatchResult<'g> {
        let mut highest = f32::NEG_INFINITY;
        let mut best: Option<&'g SuspiciousRecord> = None;

        for record in gallery {
            let sim = query.similarity(&record.signature);
            if sim > highest {
                highest = sim;
                if sim >= threshold {
                    best = Some(record);
                }
            }
        }

        MatchResult {
            record: best,
            best_similarity: if highest == f32::NEG_INFINITY {
                0.0
            } else {
                highest
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(values: &[f32]) -> Signature {
        Signature::new(values.to_vec())
    }

    fn record(id: &str, values: &[f32]) -> SuspiciousRecord {
        let mut r = SuspiciousRecord::first_sighting(
            sig(values),
            SourceImage {
                filename: format!("{id}.jpg"),
                storage_path: format!("/uploads/{id}.jpg"),
            },
            Utc::now(),
        );
        r.id = id.to_string();
        r
    }

    /// A unit vector whose cosine against [1, 0] is exactly `cos`.
    fn at_cosine(cos: f32) -> Vec<f32> {
        vec![cos, (1.0 - cos * cos).sqrt()]
    }

    #[test]
    fn test_similarity_identical() {
        let a = sig(&[0.3, -1.2, 4.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_symmetric() {
        let a = sig(&[0.3, -1.2, 4.0, 0.5]);
        let b = sig(&[1.0, 2.0, -0.7, 0.1]);
        assert_eq!(a.similarity(&b), b.similarity(&a));
    }

    #[test]
    fn test_similarity_orthogonal_and_opposite() {
        let a = sig(&[1.0, 0.0]);
        assert!(a.similarity(&sig(&[0.0, 1.0])).abs() < 1e-6);
        assert!((a.similarity(&sig(&[-2.0, 0.0])) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_length_mismatch_is_zero() {
        let a = sig(&[1.0, 0.0, 0.0]);
        let b = sig(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
        assert_eq!(b.similarity(&a), 0.0);
    }

    #[test]
    fn test_similarity_zero_vector() {
        let a = sig(&[0.0, 0.0]);
        let b = sig(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
        assert_eq!(a.similarity(&a), 0.0);
    }

    #[test]
    fn test_find_best_first_of_ties_wins() {
        let query = sig(&[1.0, 0.0]);
        let gallery = vec![
            record("r1", &at_cosine(0.90)),
            record("r2", &at_cosine(0.90)),
        ];
        let threshold = DEFAULT_SIMILARITY_THRESHOLD;
        let result = CosineMatcher.find_best(&query, &gallery, threshold);
        assert_eq!(result.record.map(|r| r.id.as_str()), Some("r1"));
    }

    #[test]
    fn test_find_best_threshold_is_inclusive() {
        let query = sig(&[1.0, 0.0]);
        let gallery = vec![record("edge", &[1.0, 0.0])];
        let sim = query.similarity(&gallery[0].signature);
        let result = CosineMatcher.find_best(&query, &gallery, sim);
        assert!(result.matched());
    }

    #[test]
    fn test_find_best_never_below_threshold() {
        let query = sig(&[1.0, 0.0]);
        let gallery = vec![
            record("a", &at_cosine(0.50)),
            record("b", &at_cosine(0.84)),
            record("c", &at_cosine(-0.2)),
        ];
        let result = CosineMatcher.find_best(&query, &gallery, 0.85);
        assert!(!result.matched());
        assert!((result.best_similarity - 0.84).abs() < 1e-5);
    }

    #[test]
    fn test_find_best_later_higher_record_replaces_match() {
        let query = sig(&[1.0, 0.0]);
        let gallery = vec![
            record("good", &at_cosine(0.90)),
            record("better", &at_cosine(0.97)),
            record("worse", &at_cosine(0.88)),
        ];
        let result = CosineMatcher.find_best(&query, &gallery, 0.85);
        assert_eq!(result.record.map(|r| r.id.as_str()), Some("better"));
        assert!((result.best_similarity - 0.97).abs() < 1e-5);
    }

    #[test]
    fn test_find_best_skips_mismatched_lengths() {
        let query = sig(&[1.0, 0.0]);
        let gallery = vec![
            record("old-model", &[1.0, 0.0, 0.0]),
            record("ok", &[1.0, 0.0]),
        ];
        let result = CosineMatcher.find_best(&query, &gallery, 0.85);
        assert_eq!(result.record.map(|r| r.id.as_str()), Some("ok"));
    }

    #[test]
    fn test_find_best_empty_gallery() {
        let result = CosineMatcher.find_best(&sig(&[1.0]), &[], 0.85);
        assert!(!result.matched());
        assert_eq!(result.best_similarity, 0.0);
    }

    #[test]
    fn test_sighted_again_bumps_count_and_time() {
        let mut r = record("x", &[1.0]);
        let first = r.last_seen_at;
        let later = first + chrono::Duration::seconds(5);
        r.sighted_again(later);
        assert_eq!(r.sighting_count, 2);
        assert_eq!(r.last_seen_at, later);
        assert_eq!(r.first_seen_at, first);
    }

    #[test]
    fn test_record_json_is_camel_case() {
        let r = record("x", &[0.5, 0.25]);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["sightingCount"], 1);
        assert_eq!(json["isLegitimate"], false);
        assert_eq!(json["storagePath"], "/uploads/x.jpg");
        assert_eq!(json["signature"], serde_json::json!([0.5, 0.25]));
    }
}
