//! Segmentation: timestamp-pair seeking and word-level alignment.

pub mod alignment;
pub mod seeker;

pub use alignment::add_word_timestamps;
pub use seeker::find_seek_point_and_segments;

use serde::{Deserialize, Serialize};

/// A word with its aligned time span and confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordTiming {
    pub word: String,
    pub tokens: Vec<u32>,
    /// Start in seconds from the beginning of the input.
    pub start: f32,
    /// End in seconds; `end > start` after filtering.
    pub end: f32,
    /// Mean token probability over the word's sub-tokens.
    pub probability: f32,
}

impl WordTiming {
    pub fn duration(&self) -> f32 {
        self.end - self.start
    }
}

/// A contiguous time-bounded unit of transcribed text.
///
/// Segments within one window are produced in non-decreasing `start` order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionSegment {
    pub id: usize,
    /// Sample index of the window this segment was decoded from.
    pub seek: usize,
    pub start: f32,
    pub end: f32,
    pub text: String,
    /// Constituent tokens, timestamp tokens included.
    pub tokens: Vec<u32>,
    pub token_log_probs: Vec<f32>,
    pub temperature: f32,
    pub avg_log_prob: f32,
    pub compression_ratio: f32,
    pub no_speech_prob: f32,
    /// Word-level timings, when word alignment ran.
    pub words: Option<Vec<WordTiming>>,
}
