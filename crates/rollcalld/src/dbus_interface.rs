use crate::engine::{EngineError, EngineHandle};
use rollcall_core::{GalleryError, MarkKind};
use serde::Serialize;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance
/// Object path: /org/rollcall/Attendance1
///
/// Structured results are returned as JSON strings.
pub struct AttendanceService {
    engine: EngineHandle,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Enroll a face. `embedding` is a JSON array of 128 numbers.
    async fn register(&self, label: &str, embedding: &str) -> zbus::fdo::Result<()> {
        tracing::info!(label, "register requested");
        let values = parse_vector(embedding)?;
        self.engine
            .register(label.to_string(), values)
            .await
            .map_err(to_fdo)
    }

    /// Remove an enrolled face. Returns false if it did not exist.
    async fn remove(&self, label: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(label, "remove requested");
        self.engine.remove(label.to_string()).await.map_err(to_fdo)
    }

    /// List enrolled labels.
    async fn list_labels(&self) -> zbus::fdo::Result<String> {
        to_json(&self.engine.labels().await.map_err(to_fdo)?)
    }

    /// Match one embedding. A non-positive tolerance selects the daemon default.
    async fn match_face(&self, embedding: &str, tolerance: f64) -> zbus::fdo::Result<String> {
        let values = parse_vector(embedding)?;
        let tolerance = (tolerance > 0.0).then_some(tolerance);
        let result = self
            .engine
            .match_face(values, tolerance)
            .await
            .map_err(to_fdo)?;
        tracing::debug!(label = ?result.label, distance = ?result.distance, "match answered");
        to_json(&result)
    }

    /// Mark attendance for already-identified people. `kind` is auto, manual or api.
    async fn admit(&self, labels: Vec<String>, kind: &str) -> zbus::fdo::Result<String> {
        tracing::info!(count = labels.len(), kind, "admit requested");
        let kind: MarkKind = kind
            .parse()
            .map_err(|e: rollcall_core::ledger::UnknownMarkKind| {
                zbus::fdo::Error::InvalidArgs(e.to_string())
            })?;
        to_json(&self.engine.admit(labels, kind).await.map_err(to_fdo)?)
    }

    /// Match a batch of embeddings (JSON array of arrays) and admit everyone recognised.
    async fn recognize(&self, embeddings: &str) -> zbus::fdo::Result<String> {
        let encodings: Vec<Vec<f64>> = serde_json::from_str(embeddings)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("embeddings: {e}")))?;
        tracing::info!(faces = encodings.len(), "recognize requested");
        to_json(&self.engine.recognize(encodings).await.map_err(to_fdo)?)
    }

    /// Attendance statistics over the last `days` days.
    async fn stats(&self, days: u32) -> zbus::fdo::Result<String> {
        to_json(&self.engine.stats(days).await.map_err(to_fdo)?)
    }

    /// Plain-text attendance report.
    async fn report(&self) -> zbus::fdo::Result<String> {
        self.engine.report().await.map_err(to_fdo)
    }

    /// Registered people.
    async fn users(&self) -> zbus::fdo::Result<String> {
        to_json(&self.engine.users().await.map_err(to_fdo)?)
    }

    /// The ledger as CSV. Returns the number of rows and the CSV text;
    /// the caller decides where it is written.
    async fn export(&self) -> zbus::fdo::Result<(u64, String)> {
        let (rows, csv) = self.engine.export().await.map_err(to_fdo)?;
        tracing::info!(rows, "export requested");
        Ok((rows as u64, csv))
    }

    /// Re-read enrolled faces from disk.
    async fn reload(&self) -> zbus::fdo::Result<String> {
        to_json(&self.engine.reload().await.map_err(to_fdo)?)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "faces": status.faces,
            "tolerance": status.tolerance,
            "data_dir": status.data_dir,
        })
        .to_string())
    }
}

fn parse_vector(json: &str) -> zbus::fdo::Result<Vec<f64>> {
    serde_json::from_str(json)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("embedding: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// Map engine failures onto standard D-Bus error names.
fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    use zbus::fdo::Error;
    match e {
        EngineError::InvalidEmbedding(_)
        | EngineError::Gallery(GalleryError::InvalidEmbedding(_))
        | EngineError::Gallery(GalleryError::InvalidLabel(_)) => Error::InvalidArgs(e.to_string()),
        EngineError::Gallery(GalleryError::DuplicateLabel(_)) => Error::FileExists(e.to_string()),
        EngineError::Gallery(GalleryError::Persistence(_))
        | EngineError::Persistence(_)
        | EngineError::Store(_) => {
            tracing::error!(error = %e, "storage failure");
            Error::IOError(e.to_string())
        }
        EngineError::Spawn(_) | EngineError::ChannelClosed => Error::Failed(e.to_string()),
    }
}
