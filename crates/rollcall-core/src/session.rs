//! Recognition sessions: run captured frames through a vision backend and
//! resolve every detected face against the gallery.

use crate::embedding::Embedding;
use crate::gallery::{EmbeddingStore, Gallery};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Default tolerance of the vision library's face comparison.
pub const DEFAULT_TOLERANCE: f64 = 0.6;
/// Roughly ten seconds at 30 FPS.
pub const DEFAULT_MAX_FRAMES: usize = 300;
pub const DEFAULT_FRAME_SKIP: usize = 3;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("face detection failed: {0}")]
    Detection(String),
    #[error("face encoding failed: {0}")]
    Encoding(String),
}

/// A captured RGB frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Packed RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Face location in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

/// Face detection and encoding backend.
pub trait VisionProvider {
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, VisionError>;

    /// One raw encoding per bounding box, in the same order.
    fn encode_faces(
        &mut self,
        frame: &Frame,
        faces: &[BoundingBox],
    ) -> Result<Vec<Vec<f64>>, VisionError>;
}

/// Cooperative cancellation flag, checked between frames.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Labels recognised during one session, with bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecognitionResult {
    pub labels: BTreeSet<String>,
    pub frames_seen: usize,
    pub frames_processed: usize,
    pub faces_seen: usize,
    pub unknown_faces: usize,
    /// Encodings that failed validation and were thrown away.
    pub discarded_encodings: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct RecognitionSession {
    pub tolerance: f64,
    pub max_frames: usize,
    /// Process every n-th frame; 1 processes all of them.
    pub frame_skip: usize,
    cancel: CancelToken,
}

impl Default for RecognitionSession {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            max_frames: DEFAULT_MAX_FRAMES,
            frame_skip: DEFAULT_FRAME_SKIP,
            cancel: CancelToken::new(),
        }
    }
}

impl RecognitionSession {
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            ..Self::default()
        }
    }

    /// Handle that stops the session at the next frame boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Consume frames until the source ends, `max_frames` is reached, or
    /// the session is cancelled.
    ///
    /// Vision failures on a single frame are logged and the frame skipped.
    pub fn run<S, V, F>(
        &self,
        gallery: &Gallery<S>,
        vision: &mut V,
        frames: F,
    ) -> RecognitionResult
    where
        S: EmbeddingStore,
        V: VisionProvider + ?Sized,
        F: IntoIterator<Item = Frame>,
    {
        let mut result = RecognitionResult::default();
        if gallery.is_empty() {
            tracing::info!("no registered faces; skipping recognition");
            return result;
        }

        let skip = self.frame_skip.max(1);
        for frame in frames.into_iter().take(self.max_frames) {
            if self.cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            result.frames_seen += 1;
            if result.frames_seen % skip != 0 {
                continue;
            }
            result.frames_processed += 1;

            if let Err(e) = self.process_frame(gallery, vision, &frame, &mut result) {
                tracing::warn!(frame = result.frames_seen, error = %e, "recognition error; frame skipped");
            }
        }

        tracing::info!(
            recognised = result.labels.len(),
            frames = result.frames_seen,
            unknown = result.unknown_faces,
            cancelled = result.cancelled,
            "recognition session finished"
        );
        result
    }

    fn process_frame<S, V>(
        &self,
        gallery: &Gallery<S>,
        vision: &mut V,
        frame: &Frame,
        result: &mut RecognitionResult,
    ) -> Result<(), VisionError>
    where
        S: EmbeddingStore,
        V: VisionProvider + ?Sized,
    {
        let faces = vision.detect_faces(frame)?;
        if faces.is_empty() {
            return Ok(());
        }
        let encodings = vision.encode_faces(frame, &faces)?;

        for raw in encodings {
            result.faces_seen += 1;
            let embedding = match Embedding::new(raw) {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!(error = %e, "discarding invalid encoding");
                    result.discarded_encodings += 1;
                    continue;
                }
            };
            match gallery.match_face(&embedding, self.tolerance) {
                Some(label) => {
                    result.labels.insert(label);
                }
                None => result.unknown_faces += 1,
            }
        }
        Ok(())
    }
}
