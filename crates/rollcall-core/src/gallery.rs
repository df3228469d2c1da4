//! The face gallery: enrolled (label, embedding) pairs and nearest-match queries.

use crate::embedding::{Embedding, InvalidEmbedding};
use crate::label::{validate_label, LabelError};
use crate::ledger::PersistenceError;
use crate::matcher::{EuclideanMatcher, MatchResult, Matcher};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(#[from] InvalidEmbedding),
    #[error("label '{0}' is already registered")]
    DuplicateLabel(String),
    #[error("invalid label: {0}")]
    InvalidLabel(#[from] LabelError),
    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),
}

/// A raw persisted entry, not yet shape-checked.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub label: String,
    pub values: Vec<f64>,
}

/// Everything a store could read, plus the labels it had to set aside.
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    pub entries: Vec<StoredEntry>,
    /// Labels whose backing data was unreadable and has been quarantined.
    pub unreadable: Vec<String>,
}

/// Persistence collaborator for enrolled embeddings.
pub trait EmbeddingStore {
    fn load_all(&mut self) -> Result<StoreSnapshot, PersistenceError>;

    /// Durably store an embedding. Must be all-or-nothing.
    fn save(&mut self, label: &str, embedding: &Embedding) -> Result<(), PersistenceError>;

    /// Returns whether anything was deleted.
    fn delete(&mut self, label: &str) -> Result<bool, PersistenceError>;

    /// Move an entry out of the live set without destroying it.
    fn quarantine(&mut self, label: &str, reason: &str) -> Result<(), PersistenceError>;
}

/// Counts from a [`Gallery::reload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReloadReport {
    pub loaded: usize,
    pub quarantined: usize,
}

/// Enrolled faces, owned by whichever component drives recognition.
///
/// Every embedding held here has passed [`Embedding::new`] validation.
/// Entries are kept ordered by label, which makes match tie-breaks and
/// [`all_labels`](Gallery::all_labels) deterministic.
pub struct Gallery<S> {
    store: S,
    entries: BTreeMap<String, Embedding>,
}

impl<S: EmbeddingStore> Gallery<S> {
    /// Construct a gallery and populate it from `store`.
    pub fn open(store: S) -> Result<Self, GalleryError> {
        let mut gallery = Self {
            store,
            entries: BTreeMap::new(),
        };
        gallery.reload()?;
        Ok(gallery)
    }

    /// Enroll `label`. Nothing is kept in memory unless the store commit succeeds.
    pub fn register(&mut self, label: &str, embedding: Embedding) -> Result<(), GalleryError> {
        let label = validate_label(label)?;
        if self.entries.contains_key(label) {
            return Err(GalleryError::DuplicateLabel(label.to_string()));
        }

        self.store.save(label, &embedding)?;
        self.entries.insert(label.to_string(), embedding);
        tracing::info!(label, total = self.entries.len(), "face registered");
        Ok(())
    }

    /// Enroll from an unvalidated vector, as handed over by a vision backend.
    pub fn register_raw(&mut self, label: &str, values: Vec<f64>) -> Result<(), GalleryError> {
        let embedding = Embedding::new(values)?;
        self.register(label, embedding)
    }

    /// Remove `label` from the gallery and its store. Missing labels are not an error.
    ///
    /// A label that could never have been enrolled is reported as absent
    /// without touching the store.
    pub fn remove(&mut self, label: &str) -> Result<bool, GalleryError> {
        let Ok(label) = validate_label(label) else {
            tracing::debug!(label, "remove of invalid label ignored");
            return Ok(false);
        };
        let in_memory = self.entries.contains_key(label);
        let on_disk = self.store.delete(label)?;
        self.entries.remove(label);

        let removed = in_memory || on_disk;
        if removed {
            tracing::info!(label, "face removed");
        }
        Ok(removed)
    }

    pub fn all_labels(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.entries.contains_key(label)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Label of the nearest enrolled face if it lies strictly within `tolerance`.
    pub fn match_face(&self, probe: &Embedding, tolerance: f64) -> Option<String> {
        self.best_match(probe, tolerance).label
    }

    /// Like [`match_face`](Self::match_face) but also reports the best distance.
    pub fn best_match(&self, probe: &Embedding, tolerance: f64) -> MatchResult {
        let entries = self.entries.iter().map(|(l, e)| (l.as_str(), e));
        EuclideanMatcher.best_match(probe, entries, tolerance)
    }

    /// Rebuild the in-memory gallery from the store.
    ///
    /// Entries with the wrong shape, or whose label would not pass
    /// [`validate_label`] unchanged, are dropped and quarantined. If the
    /// store itself cannot be read the previous contents are kept.
    pub fn reload(&mut self) -> Result<ReloadReport, GalleryError> {
        let snapshot = self.store.load_all()?;
        let mut report = ReloadReport {
            loaded: 0,
            quarantined: snapshot.unreadable.len(),
        };
        let mut entries = BTreeMap::new();

        for StoredEntry { label, values } in snapshot.entries {
            if entries.contains_key(&label) {
                tracing::warn!(label = %label, "duplicate stored entry ignored");
                continue;
            }
            let label_problem = match validate_label(&label) {
                Ok(valid) if valid == label => None,
                Ok(_) => Some("label has surrounding whitespace".to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = label_problem {
                tracing::warn!(label = %label, reason = %reason, "invalid stored label; quarantining");
                if let Err(qe) = self.store.quarantine(&label, &reason) {
                    tracing::warn!(label = %label, error = %qe, "quarantine failed");
                }
                report.quarantined += 1;
                continue;
            }
            match Embedding::new(values) {
                Ok(embedding) => {
                    tracing::debug!(label = %label, "loaded face embedding");
                    entries.insert(label, embedding);
                    report.loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(label = %label, error = %e, "invalid stored embedding; quarantining");
                    if let Err(qe) = self.store.quarantine(&label, &e.to_string()) {
                        tracing::warn!(label = %label, error = %qe, "quarantine failed");
                    }
                    report.quarantined += 1;
                }
            }
        }

        self.entries = entries;
        tracing::info!(
            loaded = report.loaded,
            quarantined = report.quarantined,
            "gallery reloaded"
        );
        Ok(report)
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

/// Store kept entirely in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: BTreeMap<String, Vec<f64>>,
    quarantined: Vec<(String, String)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a raw entry without validation.
    pub fn with_raw(mut self, label: &str, values: Vec<f64>) -> Self {
        self.entries.insert(label.to_string(), values);
        self
    }

    /// Quarantined `(label, reason)` pairs.
    pub fn quarantined(&self) -> &[(String, String)] {
        &self.quarantined
    }
}

impl EmbeddingStore for MemoryStore {
    fn load_all(&mut self) -> Result<StoreSnapshot, PersistenceError> {
        Ok(StoreSnapshot {
            entries: self
                .entries
                .iter()
                .map(|(label, values)| StoredEntry {
                    label: label.clone(),
                    values: values.clone(),
                })
                .collect(),
            unreadable: Vec::new(),
        })
    }

    fn save(&mut self, label: &str, embedding: &Embedding) -> Result<(), PersistenceError> {
        self.entries
            .insert(label.to_string(), embedding.values().to_vec());
        Ok(())
    }

    fn delete(&mut self, label: &str) -> Result<bool, PersistenceError> {
        Ok(self.entries.remove(label).is_some())
    }

    fn quarantine(&mut self, label: &str, reason: &str) -> Result<(), PersistenceError> {
        self.entries.remove(label);
        self.quarantined.push((label.to_string(), reason.to_string()));
        Ok(())
    }
}
