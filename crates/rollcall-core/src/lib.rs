//! rollcall-core — Face gallery matching and attendance admission.
//!
//! Resolves 128-dimensional face embeddings to enrolled labels by
//! Euclidean nearest neighbour, and admits each recognised label into
//! the attendance ledger at most once per calendar day.

pub mod admission;
pub mod embedding;
pub mod gallery;
pub mod label;
pub mod ledger;
pub mod matcher;
pub mod report;
pub mod session;

pub use admission::{admit, admit_with_kind, AdmissionOutcome};
pub use embedding::{Embedding, InvalidEmbedding, EMBEDDING_DIM};
pub use gallery::{
    EmbeddingStore, Gallery, GalleryError, MemoryStore, ReloadReport, StoreSnapshot, StoredEntry,
};
pub use label::{validate_label, LabelError};
pub use ledger::{AttendanceLedger, AttendanceRecord, MarkKind, MemoryLedger, PersistenceError};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher};
pub use report::{render_report, AttendanceStats};
pub use session::{
    BoundingBox, CancelToken, Frame, RecognitionResult, RecognitionSession, VisionError,
    VisionProvider, DEFAULT_TOLERANCE,
};
