//! Pipeline timing telemetry.
//!
//! Monotonically accumulated stage timers plus run counters, threaded by
//! mutable reference through the pipeline. Observability only — nothing
//! reads these for control flow.

use serde::{Deserialize, Serialize};

/// Accumulated wall-clock seconds per stage plus run counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionTimings {
    pub log_mel: f64,
    pub encoding: f64,
    pub prefill: f64,
    pub decoding_loop: f64,
    pub decoding_predictions: f64,
    pub decoding_filtering: f64,
    pub decoding_sampling: f64,
    pub decoding_fallback: f64,
    pub segment_seeking: f64,
    pub word_timestamps: f64,
    pub full_pipeline: f64,

    pub total_decoding_loops: u64,
    pub total_decoding_windows: u64,
    pub total_decoding_fallbacks: u64,
}

impl TranscriptionTimings {
    /// Real-time factor: seconds of audio transcribed per second of wall
    /// clock. Returns `None` until the pipeline timer has accumulated.
    pub fn real_time_factor(&self, audio_seconds: f64) -> Option<f64> {
        (self.full_pipeline > 0.0).then(|| audio_seconds / self.full_pipeline)
    }

    /// Fold another timing record into this one (batch aggregation).
    pub fn accumulate(&mut self, other: &TranscriptionTimings) {
        self.log_mel += other.log_mel;
        self.encoding += other.encoding;
        self.prefill += other.prefill;
        self.decoding_loop += other.decoding_loop;
        self.decoding_predictions += other.decoding_predictions;
        self.decoding_filtering += other.decoding_filtering;
        self.decoding_sampling += other.decoding_sampling;
        self.decoding_fallback += other.decoding_fallback;
        self.segment_seeking += other.segment_seeking;
        self.word_timestamps += other.word_timestamps;
        self.full_pipeline += other.full_pipeline;
        self.total_decoding_loops += other.total_decoding_loops;
        self.total_decoding_windows += other.total_decoding_windows;
        self.total_decoding_fallbacks += other.total_decoding_fallbacks;
    }
}
