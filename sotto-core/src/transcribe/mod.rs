//! Transcription orchestrator.
//!
//! ## Per-window flow
//!
//! ```text
//! 1. Slice the next window from the current seek clip
//! 2. Log-mel features (external) → encoder (external)
//! 3. decode_with_fallback — temperature ladder over the decode loop
//! 4. find_seek_point_and_segments — timestamps → segments, seek advance
//! 5. Optional word alignment (DTW over accumulated attention weights)
//! 6. Drop zero-length segments, advance seek, reset cache masks
//! ```
//!
//! One `DecodingInputs` lives for the whole call; `reset` rewinds its mask
//! state between windows and fallback retries.

pub mod batch;
pub mod timings;

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::decode::fallback::decode_with_fallback;
use crate::decode::inputs::DecodingInputs;
use crate::decode::runner::decode_text_tokens;
use crate::error::{Result, SottoError};
use crate::model::{AudioEncoding, FeatureExtracting, TextDecoding};
use crate::options::{DecodingOptions, DecodingTask, SAMPLE_RATE, WINDOW_PADDING_SAMPLES};
use crate::progress::{CancellationToken, ProgressObserver};
use crate::segment::alignment::add_word_timestamps;
use crate::segment::seeker::find_seek_point_and_segments;
use crate::segment::TranscriptionSegment;
use crate::tokenizer::Tokenizing;
use crate::transcribe::timings::TranscriptionTimings;

/// Final output of one transcription call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionResult {
    /// Concatenated text of every non-special token.
    pub text: String,
    /// Ordered segments across all windows and clips.
    pub segments: Vec<TranscriptionSegment>,
    /// Declared or detected language code.
    pub language: String,
    pub timings: TranscriptionTimings,
}

/// The outer per-window transcription loop over injected backends.
pub struct Transcriber {
    feature_extractor: Arc<dyn FeatureExtracting>,
    encoder: Arc<dyn AudioEncoding>,
    decoder: Arc<dyn TextDecoding>,
    tokenizer: Arc<dyn Tokenizing>,
}

impl Transcriber {
    pub fn new(
        feature_extractor: Arc<dyn FeatureExtracting>,
        encoder: Arc<dyn AudioEncoding>,
        decoder: Arc<dyn TextDecoding>,
        tokenizer: Arc<dyn Tokenizing>,
    ) -> Self {
        Self {
            feature_extractor,
            encoder,
            decoder,
            tokenizer,
        }
    }

    pub fn tokenizer(&self) -> &dyn Tokenizing {
        self.tokenizer.as_ref()
    }

    /// Transcribe one audio array with default callbacks.
    pub fn transcribe(
        &self,
        audio: &[f32],
        options: &DecodingOptions,
    ) -> Result<TranscriptionResult> {
        self.transcribe_with(audio, options, None, &CancellationToken::new())
    }

    /// Transcribe one audio array with a progress observer and a shared
    /// cancellation token.
    pub fn transcribe_with(
        &self,
        audio: &[f32],
        options: &DecodingOptions,
        observer: Option<&dyn ProgressObserver>,
        cancellation: &CancellationToken,
    ) -> Result<TranscriptionResult> {
        options.validate()?;
        let pipeline_started = Instant::now();
        let mut timings = TranscriptionTimings::default();

        let tokenizer = self.tokenizer.as_ref();
        let decoder = self.decoder.as_ref();
        let window_samples = self.feature_extractor.window_samples();

        let prompt = self.build_prompt(options, options.language.as_deref());
        let mut inputs = DecodingInputs::new(
            decoder.kv_cache_dim(),
            decoder.max_token_context(),
            prompt,
        );
        let prefill_length = inputs.prompt.len();

        let mut all_segments: Vec<TranscriptionSegment> = Vec::new();
        let mut all_tokens: Vec<u32> = Vec::new();
        let mut language = options.language.clone().unwrap_or_else(|| "en".to_string());
        let mut window_index = 0usize;

        for (clip_start, clip_end) in seek_clips(&options.clip_timestamps, audio.len()) {
            let mut seek = clip_start;
            while seek < clip_end {
                let remaining = clip_end - seek;
                if remaining < WINDOW_PADDING_SAMPLES {
                    break;
                }
                if cancellation.is_cancelled() {
                    return Err(SottoError::Cancelled);
                }

                let segment_size = remaining.min(window_samples);
                let window = &audio[seek..seek + segment_size];

                let mel_started = Instant::now();
                let features = self.feature_extractor.log_mel_spectrogram(window)?;
                timings.log_mel += mel_started.elapsed().as_secs_f64();

                let encode_started = Instant::now();
                let encoder_output = self.encoder.encode_features(&features)?;
                timings.encoding += encode_started.elapsed().as_secs_f64();

                let result = decode_with_fallback(
                    decoder,
                    tokenizer,
                    &encoder_output,
                    &mut inputs,
                    options,
                    window_index,
                    cancellation,
                    observer,
                    &mut timings,
                )?;
                language = result.language.clone();
                timings.total_decoding_windows += 1;

                let seek_started = Instant::now();
                let (mut new_seek, window_segments) = find_seek_point_and_segments(
                    &result,
                    options,
                    all_segments.len(),
                    seek,
                    segment_size,
                    SAMPLE_RATE,
                    tokenizer,
                )?;
                timings.segment_seeking += seek_started.elapsed().as_secs_f64();

                if let Some(mut segments) = window_segments {
                    if options.word_timestamps {
                        if let Some(weights) = &result.alignment_weights {
                            let align_started = Instant::now();
                            let seconds_per_frame = window_samples as f32
                                / SAMPLE_RATE as f32
                                / weights.ncols().max(1) as f32;
                            add_word_timestamps(
                                &mut segments,
                                &result.tokens,
                                weights,
                                tokenizer,
                                &result.language,
                                options,
                                seek as f32 / SAMPLE_RATE as f32,
                                seconds_per_frame,
                            )?;
                            timings.word_timestamps += align_started.elapsed().as_secs_f64();
                        }

                        // Word boundaries track speech more closely than
                        // timestamp tokens; prefer the later of the two.
                        if let Some(last_word_end) = segments
                            .iter()
                            .rev()
                            .find_map(|s| s.words.as_ref().and_then(|w| w.last()))
                            .map(|w| w.end)
                        {
                            let word_seek = (last_word_end * SAMPLE_RATE as f32) as usize;
                            new_seek = new_seek.max(word_seek);
                        }
                    }

                    segments.retain(|s| s.end > s.start);
                    if let Some(observer) = observer {
                        observer.on_segments(&segments);
                    }
                    for segment in &segments {
                        all_tokens.extend(&segment.tokens);
                    }
                    all_segments.extend(segments);
                }

                debug!(
                    window = window_index,
                    seek,
                    new_seek,
                    segments = all_segments.len(),
                    "window complete"
                );
                seek = new_seek;
                window_index += 1;
                inputs.reset(prefill_length);
            }
        }

        let text = decode_text_tokens(tokenizer, &all_tokens)?;
        timings.full_pipeline = pipeline_started.elapsed().as_secs_f64();
        info!(
            windows = window_index,
            segments = all_segments.len(),
            language = %language,
            "transcription complete"
        );

        Ok(TranscriptionResult {
            text,
            segments: all_segments,
            language,
            timings,
        })
    }

    /// Forced decoder prompt: optional conditioning prefix, then the
    /// start-of-transcript sequence with language/task tags on multilingual
    /// models.
    fn build_prompt(&self, options: &DecodingOptions, language: Option<&str>) -> Vec<u32> {
        let specials = self.tokenizer.special_tokens().clone();
        if !options.use_prefill_prompt {
            return vec![specials.start_of_transcript];
        }

        let mut prompt = Vec::new();
        if let (Some(prefix_tokens), Some(start_of_prev)) =
            (&options.prompt_tokens, specials.start_of_prev)
        {
            // Conditioning text occupies at most half the context.
            let budget = self.decoder.max_token_context() / 2 - 1;
            let keep = prefix_tokens.len().min(budget);
            prompt.push(start_of_prev);
            prompt.extend(&prefix_tokens[prefix_tokens.len() - keep..]);
        }
        prompt.push(specials.start_of_transcript);
        if self.decoder.is_multilingual() {
            let code = language.unwrap_or("en");
            if let Some(token) = self.tokenizer.language_token(code) {
                prompt.push(token);
            }
            prompt.push(match options.task {
                DecodingTask::Transcribe => specials.transcribe,
                DecodingTask::Translate => specials.translate,
            });
        }
        if options.without_timestamps {
            prompt.push(specials.no_timestamps);
        }
        prompt
    }
}

/// Resolve clip timestamps (seconds, alternating start/end; a trailing
/// unpaired start runs to the end of the audio) into sample ranges.
fn seek_clips(clip_timestamps: &[f32], total_samples: usize) -> Vec<(usize, usize)> {
    if clip_timestamps.is_empty() {
        return vec![(0, total_samples)];
    }
    let mut clips = Vec::new();
    let mut pairs = clip_timestamps.chunks(2);
    for pair in &mut pairs {
        let start = ((pair[0] * SAMPLE_RATE as f32) as usize).min(total_samples);
        let end = pair
            .get(1)
            .map(|&s| ((s * SAMPLE_RATE as f32) as usize).min(total_samples))
            .unwrap_or(total_samples);
        if start < end {
            clips.push((start, end));
        }
    }
    clips
}
