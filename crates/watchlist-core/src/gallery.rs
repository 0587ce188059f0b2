//! Gallery persistence boundary and the sighting update rule.

use crate::types::{Matcher, Signature, SourceImage, SuspiciousRecord};
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("gallery backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Durable set of suspicious records.
pub trait GalleryStore: Send + Sync {
    /// Every record, in storage order. Scan order decides match tie-breaks.
    fn all(&self) -> Result<Vec<SuspiciousRecord>, GalleryError>;

    fn get(&self, id: &str) -> Result<Option<SuspiciousRecord>, GalleryError>;

    fn insert(&self, record: &SuspiciousRecord) -> Result<(), GalleryError>;

    /// Persist a changed `sighting_count` / `last_seen_at`.
    fn save_sighting(&self, record: &SuspiciousRecord) -> Result<(), GalleryError>;

    fn set_legitimate(&self, id: &str, legitimate: bool) -> Result<SuspiciousRecord, GalleryError>;

    fn count(&self) -> Result<usize, GalleryError> {
        Ok(self.all()?.len())
    }
}

/// What a sighting did to the gallery.
#[derive(Debug, Clone)]
pub enum SightingOutcome {
    /// An existing record matched and was bumped.
    Repeat {
        record: SuspiciousRecord,
        similarity: f32,
    },
    /// Nothing matched; a record was created. `best_similarity` is the
    /// closest non-matching score, for diagnostics.
    New {
        record: SuspiciousRecord,
        best_similarity: f32,
    },
}

impl SightingOutcome {
    pub fn record(&self) -> &SuspiciousRecord {
        match self {
            SightingOutcome::Repeat { record, .. } | SightingOutcome::New { record, .. } => record,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, SightingOutcome::New { .. })
    }
}

/// Match `signature` against the gallery and either bump the best record or
/// insert a new one.
pub fn record_sighting(
    store: &dyn GalleryStore,
    matcher: &dyn Matcher,
    signature: Signature,
    source: SourceImage,
    threshold: f32,
    now: DateTime<Utc>,
) -> Result<SightingOutcome, GalleryError> {
    let gallery = store.all()?;
    let result = matcher.find_best(&signature, &gallery, threshold);

    if let Some(found) = result.record {
        let mut record = found.clone();
        record.sighted_again(now);
        store.save_sighting(&record)?;

        tracing::info!(
            id = %record.id,
            similarity = result.best_similarity,
            sightings = record.sighting_count,
            "suspicious person seen again"
        );

        return Ok(SightingOutcome::Repeat {
            record,
            similarity: result.best_similarity,
        });
    }

    let record = SuspiciousRecord::first_sighting(signature, source, now);
    store.insert(&record)?;

    tracing::info!(
        id = %record.id,
        best_similarity = result.best_similarity,
        gallery_size = gallery.len() + 1,
        "new suspicious person recorded"
    );

    Ok(SightingOutcome::New {
        record,
        best_similarity: result.best_similarity,
    })
}

/// In-process gallery, insertion ordered.
#[derive(Default)]
pub struct MemoryGallery {
    records: Mutex<Vec<SuspiciousRecord>>,
}

impl MemoryGallery {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<SuspiciousRecord>>, GalleryError> {
        self.records
            .lock()
            .map_err(|e| GalleryError::Backend(e.to_string().into()))
    }
}

impl GalleryStore for MemoryGallery {
    fn all(&self) -> Result<Vec<SuspiciousRecord>, GalleryError> {
        Ok(self.lock()?.clone())
    }

    fn get(&self, id: &str) -> Result<Option<SuspiciousRecord>, GalleryError> {
        Ok(self.lock()?.iter().find(|r| r.id == id).cloned())
    }

    fn insert(&self, record: &SuspiciousRecord) -> Result<(), GalleryError> {
        self.lock()?.push(record.clone());
        Ok(())
    }

    fn save_sighting(&self, record: &SuspiciousRecord) -> Result<(), GalleryError> {
        let mut records = self.lock()?;
        let slot = records
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| GalleryError::NotFound(record.id.clone()))?;
        slot.sighting_count = record.sighting_count;
        slot.last_seen_at = record.last_seen_at;
        Ok(())
    }

    fn set_legitimate(&self, id: &str, legitimate: bool) -> Result<SuspiciousRecord, GalleryError> {
        let mut records = self.lock()?;
        let slot = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| GalleryError::NotFound(id.to_string()))?;
        slot.is_legitimate = legitimate;
        Ok(slot.clone())
    }

    fn count(&self) -> Result<usize, GalleryError> {
        Ok(self.lock()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CosineMatcher, DEFAULT_SIMILARITY_THRESHOLD};

    fn source(name: &str) -> SourceImage {
        SourceImage {
            filename: name.to_string(),
            storage_path: format!("/uploads/{name}"),
        }
    }

    fn sighting(store: &MemoryGallery, values: Vec<f32>, now: DateTime<Utc>) -> SightingOutcome {
        record_sighting(
            store,
            &CosineMatcher,
            Signature::new(values),
            source("p.jpg"),
            DEFAULT_SIMILARITY_THRESHOLD,
            now,
        )
        .unwrap()
    }

    #[test]
    fn test_no_match_creates_one_record() {
        let store = MemoryGallery::new();
        let t0 = Utc::now();
        sighting(&store, vec![1.0, 0.0], t0);

        // cosine 0.8 < 0.85
        let outcome = sighting(&store, vec![0.8, 0.6], t0);

        assert!(outcome.is_new());
        assert_eq!(outcome.record().sighting_count, 1);
        assert!(!outcome.record().is_legitimate);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_match_at_090_bumps_existing_record() {
        let store = MemoryGallery::new();
        let t0 = Utc::now();
        let first = sighting(&store, vec![1.0, 0.0], t0);

        let t1 = t0 + chrono::Duration::seconds(30);
        let cos = 0.90f32;
        let outcome = sighting(&store, vec![cos, (1.0 - cos * cos).sqrt()], t1);

        match &outcome {
            SightingOutcome::Repeat { record, similarity } => {
                assert_eq!(record.id, first.record().id);
                assert!((similarity - 0.90).abs() < 1e-5);
            }
            other => panic!("expected repeat, got {other:?}"),
        }

        assert_eq!(store.count().unwrap(), 1);
        let stored = store.get(&first.record().id).unwrap().unwrap();
        assert_eq!(stored.sighting_count, 2);
        assert_eq!(stored.last_seen_at, t1);
        assert_eq!(stored.first_seen_at, t0);
        // representative signature is not replaced
        assert_eq!(stored.signature.values, vec![1.0, 0.0]);
    }

    #[test]
    fn test_tied_records_bump_first_inserted() {
        let store = MemoryGallery::new();
        let t0 = Utc::now();
        let first = |values: Vec<f32>, name: &str| {
            SuspiciousRecord::first_sighting(Signature::new(values), source(name), t0)
        };
        let a = first(vec![1.0, 0.0], "a");
        let b = first(vec![2.0, 0.0], "b");
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();

        let outcome = sighting(&store, vec![3.0, 0.0], t0);
        assert_eq!(outcome.record().id, a.id);
        assert_eq!(store.get(&b.id).unwrap().unwrap().sighting_count, 1);
    }

    #[test]
    fn test_set_legitimate() {
        let store = MemoryGallery::new();
        let rec = sighting(&store, vec![1.0], Utc::now()).record().clone();
        let updated = store.set_legitimate(&rec.id, true).unwrap();
        assert!(updated.is_legitimate);
        assert!(matches!(
            store.set_legitimate("missing", true),
            Err(GalleryError::NotFound(_))
        ));
    }
}
