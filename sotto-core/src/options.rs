//! Per-call decoding configuration.
//!
//! `DecodingOptions` is immutable for the duration of one `transcribe` call.
//! Threshold fields are optional — `None` disables that quality check
//! entirely rather than applying a default.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SottoError};

// ── Audio / window constants ─────────────────────────────────────────────────

/// Model input sample rate (Hz).
pub const SAMPLE_RATE: usize = 16_000;
/// Samples per encoder window (30 s at 16 kHz).
pub const WINDOW_SAMPLES: usize = 480_000;
/// Minimum remaining samples worth decoding (1 s). Windows shorter than this
/// at the tail of a clip are dropped.
pub const WINDOW_PADDING_SAMPLES: usize = SAMPLE_RATE;
/// Seconds represented by one timestamp-token step.
pub const SECONDS_PER_TIME_TOKEN: f32 = 0.02;

// ── Decoder constants ────────────────────────────────────────────────────────

/// Hard ceiling on decoder context (prompt + generated tokens).
pub const MAX_TOKEN_CONTEXT: usize = 448;
/// Default generation budget per window.
pub const DEFAULT_SAMPLE_LENGTH: usize = 224;

/// Which task the decoder prompt requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodingTask {
    Transcribe,
    Translate,
}

/// Immutable per-call decoding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodingOptions {
    /// Transcribe (same language) or translate (to English). Default: transcribe.
    pub task: DecodingTask,
    /// Target language code (e.g. "en"). `None` on a multilingual model
    /// triggers detection when `detect_language` is set.
    pub language: Option<String>,
    /// Base sampling temperature. 0.0 = greedy. Default: 0.0.
    pub temperature: f32,
    /// Added to the temperature on each fallback retry. Default: 0.2.
    pub temperature_increment_on_fallback: f32,
    /// Number of retries after the base attempt. Must be finite; 0 disables
    /// fallback. Default: 5.
    pub temperature_fallback_count: usize,
    /// Maximum tokens to generate per window. Default: 224.
    pub sample_length: usize,
    /// Top-K restriction for stochastic sampling. Default: 5.
    pub top_k: usize,
    /// Run the forced prompt through the decoder before generation.
    pub use_prefill_prompt: bool,
    /// Reuse prefilled KV-cache state across fallback attempts.
    pub use_prefill_cache: bool,
    /// Auto-detect language on multilingual models when `language` is unset.
    pub detect_language: bool,
    /// Suppress timestamp tokens entirely.
    pub without_timestamps: bool,
    /// Compute word-level timestamps via attention alignment.
    pub word_timestamps: bool,
    /// First generated timestamp may not exceed this many seconds.
    pub max_initial_timestamp: Option<f32>,
    /// Clip boundaries in seconds, alternating start/end; a trailing
    /// unpaired start runs to the end of the audio. Empty = decode the
    /// whole input as one clip.
    pub clip_timestamps: Vec<f32>,
    /// Conditioning tokens prepended ahead of the start-of-transcript
    /// sequence, treated as prefill.
    pub prompt_tokens: Option<Vec<u32>>,
    /// Suppress the blank (space) token as the first generated token.
    pub suppress_blank: bool,
    /// Token ids suppressed unconditionally at every step.
    pub suppress_tokens: Vec<u32>,
    /// Decode is "repetitive" above this zlib compression ratio. Default: 2.4.
    pub compression_ratio_threshold: Option<f32>,
    /// Decode is "low confidence" below this average log-probability.
    /// Default: -1.0.
    pub log_prob_threshold: Option<f32>,
    /// Attempt fails fast when the first generated token scores below this.
    /// Default: -1.5.
    pub first_token_log_prob_threshold: Option<f32>,
    /// Window is "silence" above this no-speech probability. Default: 0.6.
    pub no_speech_threshold: Option<f32>,
    /// Punctuation merged onto the start of the following word.
    pub prepend_punctuations: String,
    /// Punctuation merged onto the end of the preceding word.
    pub append_punctuations: String,
    /// Worker threads for batch transcription. 0 = derive from the host
    /// (`available_parallelism` clamped to [1, 8]).
    pub concurrent_worker_count: usize,
}

impl Default for DecodingOptions {
    fn default() -> Self {
        Self {
            task: DecodingTask::Transcribe,
            language: None,
            temperature: 0.0,
            temperature_increment_on_fallback: 0.2,
            temperature_fallback_count: 5,
            sample_length: DEFAULT_SAMPLE_LENGTH,
            top_k: 5,
            use_prefill_prompt: true,
            use_prefill_cache: true,
            detect_language: false,
            without_timestamps: false,
            word_timestamps: false,
            max_initial_timestamp: Some(1.0),
            clip_timestamps: Vec::new(),
            prompt_tokens: None,
            suppress_blank: true,
            suppress_tokens: Vec::new(),
            compression_ratio_threshold: Some(2.4),
            log_prob_threshold: Some(-1.0),
            first_token_log_prob_threshold: Some(-1.5),
            no_speech_threshold: Some(0.6),
            prepend_punctuations: "\"'“¿([{-".to_string(),
            append_punctuations: "\"'.。,，!！?？:：”)]}、".to_string(),
            concurrent_worker_count: 0,
        }
    }
}

impl DecodingOptions {
    /// Validate invariants that would otherwise surface deep inside the
    /// decode loop.
    pub fn validate(&self) -> Result<()> {
        if self.sample_length == 0 {
            return Err(SottoError::InvalidOptions("sample_length must be > 0".into()));
        }
        if self.sample_length >= MAX_TOKEN_CONTEXT {
            return Err(SottoError::InvalidOptions(format!(
                "sample_length {} exceeds token context {}",
                self.sample_length, MAX_TOKEN_CONTEXT
            )));
        }
        if self.temperature < 0.0 {
            return Err(SottoError::InvalidOptions("temperature must be >= 0".into()));
        }
        if self.temperature_increment_on_fallback < 0.0 {
            return Err(SottoError::InvalidOptions(
                "temperature_increment_on_fallback must be >= 0".into(),
            ));
        }
        if self.top_k == 0 {
            return Err(SottoError::InvalidOptions("top_k must be > 0".into()));
        }
        let mut clips = self.clip_timestamps.iter();
        if let Some(mut prev) = clips.next() {
            for next in clips {
                if next < prev {
                    return Err(SottoError::InvalidOptions(
                        "clip_timestamps must be non-decreasing".into(),
                    ));
                }
                prev = next;
            }
        }
        Ok(())
    }

    /// The temperature ladder walked by the fallback controller:
    /// `[t0, t0 + Δ, …]`, `temperature_fallback_count + 1` entries.
    pub fn temperature_ladder(&self) -> Vec<f32> {
        (0..=self.temperature_fallback_count)
            .map(|i| self.temperature + i as f32 * self.temperature_increment_on_fallback)
            .collect()
    }
}
