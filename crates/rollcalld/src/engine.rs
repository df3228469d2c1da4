use crate::config::Config;
use chrono::{Local, NaiveDateTime};
use rollcall_core::{
    admit_with_kind, render_report, AdmissionOutcome, AttendanceLedger, AttendanceStats,
    Embedding, Gallery, GalleryError, InvalidEmbedding, MarkKind, MatchResult, PersistenceError,
    ReloadReport,
};
use rollcall_store::{FileEmbeddingStore, SqliteLedger, StoreError, StoreLock, User};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Window used by the text report.
const REPORT_DAYS: u32 = 30;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(#[from] InvalidEmbedding),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of a recognition batch: per-person outcomes plus what was dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizeResult {
    pub outcomes: BTreeMap<String, AdmissionOutcome>,
    pub unknown_faces: usize,
    pub discarded_encodings: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub faces: usize,
    pub tolerance: f64,
    pub data_dir: PathBuf,
}

/// Owns the gallery and the ledger. All access is sequential.
pub struct Engine {
    gallery: Gallery<FileEmbeddingStore>,
    ledger: SqliteLedger,
    tolerance: f64,
    data_dir: PathBuf,
    _lock: StoreLock,
}

impl Engine {
    /// Take the store lock, then open the embedding store and the ledger.
    pub fn open(config: &Config) -> Result<Self, EngineError> {
        let lock = StoreLock::acquire(&config.data_dir)?;
        tracing::info!(path = %lock.path().display(), "store lock held");

        let store = FileEmbeddingStore::open(&config.faces_dir)?;
        let gallery = Gallery::open(store)?;
        tracing::info!(dir = %config.faces_dir.display(), faces = gallery.len(), "gallery loaded");

        let ledger = SqliteLedger::open(&config.db_path)?;
        tracing::info!(path = %config.db_path.display(), "attendance ledger opened");

        Ok(Self {
            gallery,
            ledger,
            tolerance: config.tolerance,
            data_dir: config.data_dir.clone(),
            _lock: lock,
        })
    }

    /// Enroll a face. The user row is written before the face file, so a
    /// ledger failure leaves nothing enrolled and the call can be retried.
    pub fn register(&mut self, label: &str, values: Vec<f64>) -> Result<(), EngineError> {
        let label = rollcall_core::validate_label(label).map_err(GalleryError::from)?;
        let embedding = Embedding::new(values)?;
        if self.gallery.contains(label) {
            return Err(GalleryError::DuplicateLabel(label.to_string()).into());
        }
        self.ledger.ensure_user(label)?;
        self.gallery.register(label, embedding)?;
        Ok(())
    }

    pub fn remove(&mut self, label: &str) -> Result<bool, EngineError> {
        Ok(self.gallery.remove(label)?)
    }

    pub fn labels(&self) -> Vec<String> {
        self.gallery.all_labels()
    }

    pub fn match_face(
        &self,
        values: Vec<f64>,
        tolerance: Option<f64>,
    ) -> Result<MatchResult, EngineError> {
        let probe = Embedding::new(values)?;
        Ok(self
            .gallery
            .best_match(&probe, tolerance.unwrap_or(self.tolerance)))
    }

    pub fn admit(
        &mut self,
        labels: &[String],
        kind: MarkKind,
        now: NaiveDateTime,
    ) -> Result<BTreeMap<String, AdmissionOutcome>, EngineError> {
        let mut valid = Vec::with_capacity(labels.len());
        for label in labels {
            valid.push(rollcall_core::validate_label(label).map_err(GalleryError::from)?);
        }
        Ok(admit_with_kind(valid, now, kind, &mut self.ledger)?)
    }

    /// Resolve each encoding against the gallery and admit everyone recognised.
    pub fn recognize(
        &mut self,
        encodings: Vec<Vec<f64>>,
        now: NaiveDateTime,
    ) -> Result<RecognizeResult, EngineError> {
        let mut recognised = BTreeSet::new();
        let mut unknown_faces = 0;
        let mut discarded_encodings = 0;

        for raw in encodings {
            let probe = match Embedding::new(raw) {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!(error = %e, "discarding invalid encoding");
                    discarded_encodings += 1;
                    continue;
                }
            };
            match self.gallery.match_face(&probe, self.tolerance) {
                Some(label) => {
                    recognised.insert(label);
                }
                None => unknown_faces += 1,
            }
        }

        let outcomes = admit_with_kind(
            recognised.iter().map(String::as_str),
            now,
            MarkKind::Auto,
            &mut self.ledger,
        )?;
        Ok(RecognizeResult {
            outcomes,
            unknown_faces,
            discarded_encodings,
        })
    }

    pub fn stats(&self, days: u32, now: NaiveDateTime) -> Result<AttendanceStats, EngineError> {
        let today = now.date();
        let records = self
            .ledger
            .records_since(AttendanceStats::window_start(today, days))?;
        Ok(AttendanceStats::compute(&records, today, days))
    }

    pub fn report(&self, now: NaiveDateTime) -> Result<String, EngineError> {
        let stats = self.stats(REPORT_DAYS, now)?;
        let history = self.ledger.all_records()?;
        Ok(render_report(&stats, &history, now))
    }

    pub fn users(&self) -> Result<Vec<User>, EngineError> {
        Ok(self.ledger.users()?)
    }

    /// Render the whole ledger as CSV. Returns the row count and the text.
    pub fn export(&self) -> Result<(usize, String), EngineError> {
        let mut buf = Vec::new();
        let rows = self.ledger.export_csv(&mut buf)?;
        let csv = String::from_utf8(buf).map_err(|e| StoreError::BadRow(e.to_string()))?;
        tracing::info!(rows, "attendance exported");
        Ok((rows, csv))
    }

    pub fn reload(&mut self) -> Result<ReloadReport, EngineError> {
        Ok(self.gallery.reload()?)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            faces: self.gallery.len(),
            tolerance: self.tolerance,
            data_dir: self.data_dir.clone(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Register {
        label: String,
        values: Vec<f64>,
        reply: Reply<()>,
    },
    Remove {
        label: String,
        reply: Reply<bool>,
    },
    Labels {
        reply: Reply<Vec<String>>,
    },
    Match {
        values: Vec<f64>,
        tolerance: Option<f64>,
        reply: Reply<MatchResult>,
    },
    Admit {
        labels: Vec<String>,
        kind: MarkKind,
        reply: Reply<BTreeMap<String, AdmissionOutcome>>,
    },
    Recognize {
        encodings: Vec<Vec<f64>>,
        reply: Reply<RecognizeResult>,
    },
    Stats {
        days: u32,
        reply: Reply<AttendanceStats>,
    },
    Report {
        reply: Reply<String>,
    },
    Users {
        reply: Reply<Vec<User>>,
    },
    Export {
        reply: Reply<(usize, String)>,
    },
    Reload {
        reply: Reply<ReloadReport>,
    },
    Status {
        reply: Reply<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn register(&self, label: String, values: Vec<f64>) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Register {
            label,
            values,
            reply,
        })
        .await
    }

    pub async fn remove(&self, label: String) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::Remove { label, reply })
            .await
    }

    pub async fn labels(&self) -> Result<Vec<String>, EngineError> {
        self.request(|reply| EngineRequest::Labels { reply }).await
    }

    pub async fn match_face(
        &self,
        values: Vec<f64>,
        tolerance: Option<f64>,
    ) -> Result<MatchResult, EngineError> {
        self.request(|reply| EngineRequest::Match {
            values,
            tolerance,
            reply,
        })
        .await
    }

    pub async fn admit(
        &self,
        labels: Vec<String>,
        kind: MarkKind,
    ) -> Result<BTreeMap<String, AdmissionOutcome>, EngineError> {
        self.request(|reply| EngineRequest::Admit {
            labels,
            kind,
            reply,
        })
        .await
    }

    pub async fn recognize(&self, encodings: Vec<Vec<f64>>) -> Result<RecognizeResult, EngineError> {
        self.request(|reply| EngineRequest::Recognize { encodings, reply })
            .await
    }

    pub async fn stats(&self, days: u32) -> Result<AttendanceStats, EngineError> {
        self.request(|reply| EngineRequest::Stats { days, reply })
            .await
    }

    pub async fn report(&self) -> Result<String, EngineError> {
        self.request(|reply| EngineRequest::Report { reply }).await
    }

    pub async fn users(&self) -> Result<Vec<User>, EngineError> {
        self.request(|reply| EngineRequest::Users { reply }).await
    }

    pub async fn export(&self) -> Result<(usize, String), EngineError> {
        self.request(|reply| EngineRequest::Export { reply }).await
    }

    pub async fn reload(&self) -> Result<ReloadReport, EngineError> {
        self.request(|reply| EngineRequest::Reload { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Takes the store lock and opens the gallery and ledger synchronously,
/// failing fast if any is unavailable, then serves requests in order.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let mut engine = Engine::open(config)?;
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle_request(&mut engine, req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

fn handle_request(engine: &mut Engine, req: EngineRequest) {
    // A dropped receiver only means the caller gave up waiting.
    match req {
        EngineRequest::Register {
            label,
            values,
            reply,
        } => {
            let _ = reply.send(engine.register(&label, values));
        }
        EngineRequest::Remove { label, reply } => {
            let _ = reply.send(engine.remove(&label));
        }
        EngineRequest::Labels { reply } => {
            let _ = reply.send(Ok(engine.labels()));
        }
        EngineRequest::Match {
            values,
            tolerance,
            reply,
        } => {
            let _ = reply.send(engine.match_face(values, tolerance));
        }
        EngineRequest::Admit {
            labels,
            kind,
            reply,
        } => {
            let _ = reply.send(engine.admit(&labels, kind, now()));
        }
        EngineRequest::Recognize { encodings, reply } => {
            let _ = reply.send(engine.recognize(encodings, now()));
        }
        EngineRequest::Stats { days, reply } => {
            let _ = reply.send(engine.stats(days, now()));
        }
        EngineRequest::Report { reply } => {
            let _ = reply.send(engine.report(now()));
        }
        EngineRequest::Users { reply } => {
            let _ = reply.send(engine.users());
        }
        EngineRequest::Export { reply } => {
            let _ = reply.send(engine.export());
        }
        EngineRequest::Reload { reply } => {
            let _ = reply.send(engine.reload());
        }
        EngineRequest::Status { reply } => {
            let _ = reply.send(Ok(engine.status()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rollcall_core::EMBEDDING_DIM;

    fn config(dir: &std::path::Path) -> Config {
        Config {
            data_dir: dir.to_path_buf(),
            faces_dir: dir.join("faces"),
            db_path: dir.join("attendance.db"),
            tolerance: 0.6,
            system_bus: false,
        }
    }

    fn axis(index: usize, magnitude: f64) -> Vec<f64> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[index] = magnitude;
        v
    }

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_second_engine_on_same_dir_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let _first = Engine::open(&config(dir.path())).unwrap();
        let second = Engine::open(&config(dir.path()));
        assert!(matches!(second, Err(EngineError::Store(StoreError::Locked(_)))));
    }

    #[test]
    fn test_register_creates_user_and_rejects_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::open(&config(dir.path())).unwrap();
        engine.register(" alice ", axis(0, 1.0)).unwrap();
        assert_eq!(engine.labels(), ["alice"]);
        assert_eq!(engine.users().unwrap()[0].name, "alice");

        let dup = engine.register("alice", axis(1, 1.0)).unwrap_err();
        assert!(matches!(dup, EngineError::Gallery(GalleryError::DuplicateLabel(_))));
    }

    #[test]
    fn test_register_ledger_failure_enrolls_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let mut engine = Engine::open(&cfg).unwrap();

        // Break the ledger underneath the engine.
        rusqlite::Connection::open(&cfg.db_path)
            .unwrap()
            .execute_batch("DROP TABLE attendance; DROP TABLE users;")
            .unwrap();

        let err = engine.register("alice", axis(0, 1.0)).unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
        assert!(engine.labels().is_empty());
        assert!(!cfg.faces_dir.join("alice.json").exists());
    }

    #[test]
    fn test_register_rejects_bad_input_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::open(&config(dir.path())).unwrap();

        let short = engine.register("alice", vec![0.0; 3]).unwrap_err();
        assert!(matches!(short, EngineError::InvalidEmbedding(_)));
        let bad = engine.register("../alice", axis(0, 1.0)).unwrap_err();
        assert!(matches!(bad, EngineError::Gallery(GalleryError::InvalidLabel(_))));
        assert!(engine.users().unwrap().is_empty());
    }

    #[test]
    fn test_recognize_admits_once_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::open(&config(dir.path())).unwrap();
        engine.register("alice", axis(0, 1.0)).unwrap();
        engine.register("bob", axis(1, 1.0)).unwrap();

        let batch = vec![axis(0, 0.9), axis(0, 1.1), axis(2, 1.0), vec![0.0; 3]];
        let first = engine.recognize(batch.clone(), at(8, 9)).unwrap();
        assert_eq!(first.outcomes.len(), 1);
        assert_eq!(first.outcomes["alice"], AdmissionOutcome::Admitted);
        assert_eq!(first.unknown_faces, 1);
        assert_eq!(first.discarded_encodings, 1);

        let again = engine.recognize(batch, at(8, 15)).unwrap();
        assert_eq!(again.outcomes["alice"], AdmissionOutcome::AlreadyMarkedToday);

        let stats = engine.stats(7, at(8, 18)).unwrap();
        assert_eq!(stats.total_attendances, 1);
        assert_eq!(stats.most_regular.as_deref(), Some("alice"));
    }

    #[test]
    fn test_admit_validates_labels() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::open(&config(dir.path())).unwrap();
        let err = engine
            .admit(&["ok".to_string(), "bad/label".to_string()], MarkKind::Manual, at(1, 9))
            .unwrap_err();
        assert!(matches!(err, EngineError::Gallery(GalleryError::InvalidLabel(_))));
        // Nothing is written when any label is rejected.
        assert!(engine.stats(30, at(1, 10)).unwrap().by_person.is_empty());

        let out = engine
            .admit(&["visitor".to_string()], MarkKind::Manual, at(1, 9))
            .unwrap();
        assert_eq!(out["visitor"], AdmissionOutcome::Admitted);
    }

    #[test]
    fn test_match_uses_configured_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::open(&config(dir.path())).unwrap();
        engine.register("alice", axis(0, 1.0)).unwrap();

        let near = engine.match_face(axis(0, 0.5), None).unwrap();
        assert_eq!(near.label.as_deref(), Some("alice"));
        let strict = engine.match_face(axis(0, 0.5), Some(0.4)).unwrap();
        assert_eq!(strict.label, None);
        assert!(matches!(
            engine.match_face(vec![1.0], None),
            Err(EngineError::InvalidEmbedding(_))
        ));
    }

    #[test]
    fn test_report_and_export() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::open(&config(dir.path())).unwrap();
        engine
            .admit(&["alice".to_string()], MarkKind::Auto, at(3, 9))
            .unwrap();

        let report = engine.report(at(3, 18)).unwrap();
        assert!(report.contains("- alice: 1 day"));

        let (rows, csv) = engine.export().unwrap();
        assert_eq!(rows, 1);
        assert!(csv.starts_with("Name,Time,Kind\nalice,2024-01-03 09:00:00,auto"));
    }

    #[tokio::test]
    async fn test_handle_round_trip_through_thread() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_engine(&config(dir.path())).unwrap();

        handle.register("carol".into(), axis(4, 1.0)).await.unwrap();
        assert_eq!(handle.labels().await.unwrap(), ["carol"]);
        assert_eq!(handle.status().await.unwrap().faces, 1);

        let matched = handle.match_face(axis(4, 1.0), None).await.unwrap();
        assert_eq!(matched.label.as_deref(), Some("carol"));

        assert!(handle.remove("carol".into()).await.unwrap());
        assert!(!handle.remove("carol".into()).await.unwrap());
        assert_eq!(handle.reload().await.unwrap().loaded, 0);
    }
}
