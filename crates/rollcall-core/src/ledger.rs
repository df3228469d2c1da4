//! Attendance records and the ledger abstraction they are persisted through.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Storage-layer failure, surfaced to callers unchanged.
///
/// Backends translate their own errors into this type so that raw
/// database or filesystem errors never cross the core's boundary.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("{context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl PersistenceError {
    pub fn backend(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: source.into(),
        }
    }
}

/// How an attendance record was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkKind {
    /// Recognised by the camera.
    Auto,
    /// Entered by an operator.
    Manual,
    /// Submitted through a remote client.
    Api,
}

impl MarkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MarkKind::Auto => "auto",
            MarkKind::Manual => "manual",
            MarkKind::Api => "api",
        }
    }
}

impl fmt::Display for MarkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown attendance kind: {0}")]
pub struct UnknownMarkKind(pub String);

impl FromStr for MarkKind {
    type Err = UnknownMarkKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(MarkKind::Auto),
            "manual" => Ok(MarkKind::Manual),
            "api" | "mobile" => Ok(MarkKind::Api),
            other => Err(UnknownMarkKind(other.to_string())),
        }
    }
}

/// One admitted attendance. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub label: String,
    pub timestamp: NaiveDateTime,
    pub kind: MarkKind,
}

impl AttendanceRecord {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }
}

/// Persisted attendance history.
pub trait AttendanceLedger {
    /// Whether `label` already has a record on `date`.
    fn has_record(&self, label: &str, date: NaiveDate) -> Result<bool, PersistenceError>;

    /// Append a record. Returns `false` without writing when the ledger
    /// already holds a record for the same label and calendar date.
    fn append_record(&mut self, record: &AttendanceRecord) -> Result<bool, PersistenceError>;

    /// All records dated on or after `since`, oldest first.
    fn records_since(&self, since: NaiveDate) -> Result<Vec<AttendanceRecord>, PersistenceError>;
}

/// In-process ledger with no backing store.
#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    records: Vec<AttendanceRecord>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[AttendanceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl AttendanceLedger for MemoryLedger {
    fn has_record(&self, label: &str, date: NaiveDate) -> Result<bool, PersistenceError> {
        Ok(self
            .records
            .iter()
            .any(|r| r.label == label && r.date() == date))
    }

    fn append_record(&mut self, record: &AttendanceRecord) -> Result<bool, PersistenceError> {
        if self.has_record(&record.label, record.date())? {
            return Ok(false);
        }
        self.records.push(record.clone());
        Ok(true)
    }

    fn records_since(&self, since: NaiveDate) -> Result<Vec<AttendanceRecord>, PersistenceError> {
        let mut out: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.date() >= since)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.timestamp);
        Ok(out)
    }
}
