//! Embedding files: `<dir>/<label>.json`, one per enrolled person.

use crate::StoreError;
use chrono::{Local, NaiveDateTime};
use rollcall_core::{Embedding, EmbeddingStore, PersistenceError, StoreSnapshot, StoredEntry};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const FACE_EXT: &str = "json";
const QUARANTINE_DIR: &str = "quarantine";

/// On-disk layout of one embedding file.
#[derive(Debug, Serialize, Deserialize)]
struct FaceFile {
    embedding: Vec<f64>,
    #[serde(default)]
    registered_at: Option<NaiveDateTime>,
}

/// Directory-backed [`EmbeddingStore`].
///
/// Files that cannot be parsed, or whose vectors fail validation, are
/// moved into `quarantine/` with a timestamp suffix instead of deleted.
pub struct FileEmbeddingStore {
    dir: PathBuf,
}

impl FileEmbeddingStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.dir.join(QUARANTINE_DIR)
    }

    /// File for `label`, refusing anything that could resolve outside `dir`.
    fn path_for(&self, label: &str) -> Result<PathBuf, StoreError> {
        let escapes = label.is_empty()
            || label == "."
            || label == ".."
            || label.contains(['/', '\\', '\0']);
        if escapes {
            return Err(StoreError::UnsafeLabel(label.to_string()));
        }
        Ok(self.dir.join(format!("{label}.{FACE_EXT}")))
    }

    fn read_face(path: &Path) -> Result<FaceFile, StoreError> {
        let text = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        serde_json::from_str(&text).map_err(|source| StoreError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    fn scan(&self) -> Result<StoreSnapshot, StoreError> {
        let mut snapshot = StoreSnapshot::default();
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, e))?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(FACE_EXT) {
                continue;
            }
            let Some(label) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                tracing::warn!(path = %path.display(), "skipping non-UTF-8 embedding file name");
                continue;
            };

            match Self::read_face(&path) {
                Ok(face) => snapshot.entries.push(StoredEntry {
                    label,
                    values: face.embedding,
                }),
                Err(e) => {
                    tracing::warn!(label = %label, error = %e, "unreadable embedding file");
                    if let Err(qe) = self.move_to_quarantine(&path, &label) {
                        tracing::warn!(label = %label, error = %qe, "quarantine failed; file left in place");
                    }
                    snapshot.unreadable.push(label);
                }
            }
        }

        snapshot.entries.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(snapshot)
    }

    fn move_to_quarantine(&self, path: &Path, label: &str) -> Result<PathBuf, StoreError> {
        let qdir = self.quarantine_dir();
        fs::create_dir_all(&qdir).map_err(|e| StoreError::io(&qdir, e))?;
        let stamp = Local::now().format("%Y%m%d%H%M%S%3f");
        let target = qdir.join(format!("{label}-{stamp}.{FACE_EXT}"));
        fs::rename(path, &target).map_err(|e| StoreError::io(path, e))?;
        tracing::warn!(from = %path.display(), to = %target.display(), "embedding file quarantined");
        Ok(target)
    }

    fn write_face(&self, label: &str, embedding: &Embedding) -> Result<(), StoreError> {
        let face = FaceFile {
            embedding: embedding.values().to_vec(),
            registered_at: Some(Local::now().naive_local()),
        };
        let target = self.path_for(label)?;
        let body = serde_json::to_vec_pretty(&face).map_err(|source| StoreError::Encode {
            path: target.clone(),
            source,
        })?;

        // Write-then-rename so a crash never leaves a half-written file.
        let tmp = self.dir.join(format!(".{label}.{FACE_EXT}.tmp"));
        let mut file = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(&body)
            .and_then(|_| file.sync_all())
            .map_err(|e| StoreError::io(&tmp, e))?;
        drop(file);
        fs::rename(&tmp, &target).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            StoreError::io(&target, e)
        })?;
        tracing::debug!(path = %target.display(), "embedding file written");
        Ok(())
    }
}

impl EmbeddingStore for FileEmbeddingStore {
    fn load_all(&mut self) -> Result<StoreSnapshot, PersistenceError> {
        Ok(self.scan()?)
    }

    fn save(&mut self, label: &str, embedding: &Embedding) -> Result<(), PersistenceError> {
        Ok(self.write_face(label, embedding)?)
    }

    fn delete(&mut self, label: &str) -> Result<bool, PersistenceError> {
        let path = self.path_for(label)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(path, e).into()),
        }
    }

    fn quarantine(&mut self, label: &str, reason: &str) -> Result<(), PersistenceError> {
        let path = self.path_for(label)?;
        if !path.exists() {
            return Ok(());
        }
        tracing::warn!(label, reason, "quarantining embedding");
        self.move_to_quarantine(&path, label)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{Gallery, EMBEDDING_DIM};

    fn embedding(fill: f64) -> Embedding {
        Embedding::new(vec![fill; EMBEDDING_DIM]).unwrap()
    }

    fn quarantined_files(store: &FileEmbeddingStore) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(store.quarantine_dir())
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[test]
    fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileEmbeddingStore::open(dir.path()).unwrap();

        store.save("alice", &embedding(0.25)).unwrap();
        assert!(dir.path().join("alice.json").is_file());

        let snapshot = store.load_all().unwrap();
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].label, "alice");
        assert_eq!(snapshot.entries[0].values, vec![0.25; EMBEDDING_DIM]);

        assert!(store.delete("alice").unwrap());
        assert!(!store.delete("alice").unwrap());
        assert!(store.load_all().unwrap().entries.is_empty());
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileEmbeddingStore::open(dir.path()).unwrap();
        store.save("bob", &embedding(0.1)).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["bob.json"]);
    }

    #[test]
    fn test_corrupt_file_is_quarantined_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        let mut store = FileEmbeddingStore::open(dir.path()).unwrap();

        let snapshot = store.load_all().unwrap();
        assert!(snapshot.entries.is_empty());
        assert_eq!(snapshot.unreadable, ["broken"]);
        assert!(!dir.path().join("broken.json").exists());

        let moved = quarantined_files(&store);
        assert_eq!(moved.len(), 1);
        assert!(moved[0].starts_with("broken-"));
        let content = fs::read_to_string(store.quarantine_dir().join(&moved[0])).unwrap();
        assert_eq!(content, "{not json");
    }

    #[test]
    fn test_labels_cannot_escape_the_directory() {
        let root = tempfile::tempdir().unwrap();
        let faces = root.path().join("faces");
        fs::write(root.path().join("precious.json"), "keep").unwrap();
        let mut store = FileEmbeddingStore::open(&faces).unwrap();

        for label in ["../precious", "..", "a\\b", ""] {
            assert!(store.delete(label).is_err(), "{label:?} accepted");
            assert!(store.save(label, &embedding(0.1)).is_err(), "{label:?} accepted");
        }
        assert_eq!(fs::read_to_string(root.path().join("precious.json")).unwrap(), "keep");

        let mut gallery = Gallery::open(store).unwrap();
        assert!(!gallery.remove("../precious").unwrap());
        assert!(root.path().join("precious.json").exists());
    }

    #[test]
    fn test_failed_quarantine_does_not_block_loading() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        // A plain file where the quarantine directory should go.
        fs::write(dir.path().join("quarantine"), "").unwrap();
        let mut store = FileEmbeddingStore::open(dir.path()).unwrap();
        store.save("good", &embedding(0.5)).unwrap();

        let snapshot = store.load_all().unwrap();
        assert_eq!(snapshot.unreadable, ["broken"]);
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].label, "good");
        assert!(dir.path().join("broken.json").exists());

        let gallery = Gallery::open(store).unwrap();
        assert_eq!(gallery.all_labels(), ["good"]);
    }

    #[test]
    fn test_gallery_quarantines_untrimmed_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let body = serde_json::json!({ "embedding": vec![0.2; EMBEDDING_DIM] }).to_string();
        fs::write(dir.path().join(" bob.json"), body).unwrap();

        let gallery = Gallery::open(FileEmbeddingStore::open(dir.path()).unwrap()).unwrap();
        assert!(gallery.is_empty());
        assert!(!dir.path().join(" bob.json").exists());
        let moved = quarantined_files(gallery.store());
        assert_eq!(moved.len(), 1);
        assert!(moved[0].starts_with(" bob-"));
    }

    #[test]
    fn test_gallery_reload_quarantines_wrong_shape() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("short.json"),
            serde_json::json!({ "embedding": [0.1, 0.2, 0.3] }).to_string(),
        )
        .unwrap();
        let mut store = FileEmbeddingStore::open(dir.path()).unwrap();
        store.save("good", &embedding(0.5)).unwrap();

        let gallery = Gallery::open(store).unwrap();
        assert_eq!(gallery.all_labels(), ["good"]);
        assert!(!dir.path().join("short.json").exists());
        assert_eq!(quarantined_files(gallery.store()).len(), 1);
    }

    #[test]
    fn test_gallery_register_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let probe = embedding(0.3);
        {
            let mut gallery = Gallery::open(FileEmbeddingStore::open(dir.path()).unwrap()).unwrap();
            gallery.register("carol", probe.clone()).unwrap();
        }
        let mut gallery = Gallery::open(FileEmbeddingStore::open(dir.path()).unwrap()).unwrap();
        gallery.reload().unwrap();
        assert_eq!(gallery.match_face(&probe, 0.6).as_deref(), Some("carol"));
    }

    #[test]
    fn test_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        fs::create_dir(dir.path().join("nested.json")).unwrap();
        let mut store = FileEmbeddingStore::open(dir.path()).unwrap();
        let snapshot = store.load_all().unwrap();
        assert!(snapshot.entries.is_empty());
        assert!(snapshot.unreadable.is_empty());
    }
}
