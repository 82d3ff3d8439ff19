//! Progress reporting, early stop, and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::segment::TranscriptionSegment;

/// Snapshot handed to the progress observer at each generation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionProgress {
    /// Index of the window currently being decoded.
    pub window_index: usize,
    /// Partial transcript for the current window.
    pub text: String,
    /// Generated tokens so far in the current window.
    pub tokens: Vec<u32>,
    pub avg_log_prob: f32,
    pub compression_ratio: f32,
}

/// Observer verdict at each decode step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressVote {
    /// Keep decoding.
    Continue,
    /// Stop the current window's generation early.
    Stop,
    /// No opinion — treated as continue.
    Abstain,
}

/// Synchronous progress/segment observer. Prefill steps are never offered
/// for early stop; only generation steps reach `on_progress`.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: &TranscriptionProgress) -> ProgressVote {
        let _ = progress;
        ProgressVote::Abstain
    }

    /// Called once per window with the segments it produced.
    fn on_segments(&self, segments: &[TranscriptionSegment]) {
        let _ = segments;
    }
}

impl<F> ProgressObserver for F
where
    F: Fn(&TranscriptionProgress) -> ProgressVote + Send + Sync,
{
    fn on_progress(&self, progress: &TranscriptionProgress) -> ProgressVote {
        self(progress)
    }
}

/// Shared cooperative cancellation flag.
///
/// Checked before every external prediction call; cancellation surfaces as
/// `SottoError::Cancelled` and resets progress state, but is not an
/// application-level failure.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
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
