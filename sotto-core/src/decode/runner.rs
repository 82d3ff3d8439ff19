//! The autoregressive decode loop.
//!
//! ## Per-iteration flow (position *t*)
//!
//! ```text
//! 1. Cancellation check
//! 2. decoder.predict(token[t], t, caches, encoder output) → logits + deltas
//! 3. Prefill position?   → commit cache deltas, force prompt[t+1], continue
//! 4. Filters (in place)  → sampler → next token + log-prob
//! 5. Completion check    → break WITHOUT committing this step's cache
//! 6. Commit cache column t, accumulate alignment weights, progress callback
//! ```
//!
//! Post-loop: finalize the sampler output, trim at the end token, recompute
//! quality metrics over the trimmed span, and derive the fallback verdict.

use std::io::Write as _;
use std::time::Instant;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::decode::filters::LogitsFiltering;
use crate::decode::inputs::DecodingInputs;
use crate::decode::sampler::{softmax, TokenSampling};
use crate::error::{Result, SottoError};
use crate::model::{EncoderOutput, TextDecoding};
use crate::options::DecodingOptions;
use crate::progress::{CancellationToken, ProgressObserver, ProgressVote, TranscriptionProgress};
use crate::tokenizer::Tokenizing;
use crate::transcribe::timings::TranscriptionTimings;

/// Why a decode attempt wants (or explicitly declines) a retry, in priority
/// order: first-token confidence > silence > repetition > low confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FallbackReason {
    FirstTokenLogProbThreshold,
    Silence,
    CompressionRatioThreshold,
    LogProbThreshold,
}

/// Verdict over one decode attempt's quality heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodingFallback {
    pub needs_fallback: bool,
    pub reason: Option<FallbackReason>,
}

impl DecodingFallback {
    /// Apply the four-threshold priority rule. Silence wins over the
    /// repetition/confidence checks but declines a retry — re-decoding
    /// silence at a higher temperature only hallucinates harder.
    pub fn evaluate(
        options: &DecodingOptions,
        first_token_log_prob_too_low: bool,
        no_speech_prob: f32,
        compression_ratio: f32,
        avg_log_prob: f32,
    ) -> Self {
        if first_token_log_prob_too_low {
            return Self {
                needs_fallback: true,
                reason: Some(FallbackReason::FirstTokenLogProbThreshold),
            };
        }
        if let Some(threshold) = options.no_speech_threshold {
            if no_speech_prob > threshold {
                return Self {
                    needs_fallback: false,
                    reason: Some(FallbackReason::Silence),
                };
            }
        }
        if let Some(threshold) = options.compression_ratio_threshold {
            if compression_ratio > threshold {
                return Self {
                    needs_fallback: true,
                    reason: Some(FallbackReason::CompressionRatioThreshold),
                };
            }
        }
        if let Some(threshold) = options.log_prob_threshold {
            if avg_log_prob < threshold {
                return Self {
                    needs_fallback: true,
                    reason: Some(FallbackReason::LogProbThreshold),
                };
            }
        }
        Self {
            needs_fallback: false,
            reason: None,
        }
    }
}

/// Output of one decode attempt over one audio window.
#[derive(Debug, Clone)]
pub struct DecodingResult {
    /// Language in effect for this attempt (declared or detected).
    pub language: String,
    /// Generated tokens after the forced prompt, trimmed at the end token.
    /// Timestamp tokens are included.
    pub tokens: Vec<u32>,
    /// Log-probability per generated token, aligned with `tokens`.
    pub token_log_probs: Vec<f32>,
    /// Decoded text (specials and timestamps stripped).
    pub text: String,
    pub avg_log_prob: f32,
    pub no_speech_prob: f32,
    pub temperature: f32,
    pub compression_ratio: f32,
    /// Cross-attention alignment weights, one row per generated token, one
    /// column per encoder time-step. Present only when the decoder exposes
    /// them on every committed step.
    pub alignment_weights: Option<Array2<f32>>,
    pub fallback: DecodingFallback,
}

/// Zlib compressibility of the decoded text. Repetitive output compresses
/// far better than natural speech; > ~2.4 flags a degenerate decode.
pub fn compression_ratio(text: &str) -> f32 {
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return 0.0;
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(bytes).is_err() {
        return 0.0;
    }
    match encoder.finish() {
        Ok(compressed) if !compressed.is_empty() => bytes.len() as f32 / compressed.len() as f32,
        _ => 0.0,
    }
}

/// Everything one decode attempt needs beyond the mutable window state.
pub(crate) struct DecodeAttempt<'a> {
    pub decoder: &'a dyn TextDecoding,
    pub tokenizer: &'a dyn Tokenizing,
    pub sampler: &'a dyn TokenSampling,
    pub filters: &'a [Box<dyn LogitsFiltering>],
    pub options: &'a DecodingOptions,
    pub language: &'a str,
    pub temperature: f32,
    pub window_index: usize,
    pub cancellation: &'a CancellationToken,
    pub observer: Option<&'a dyn ProgressObserver>,
}

/// Run one full decode attempt over `inputs`.
pub(crate) fn run_decode_loop(
    attempt: &DecodeAttempt<'_>,
    encoder_output: &EncoderOutput,
    inputs: &mut DecodingInputs,
    timings: &mut TranscriptionTimings,
) -> Result<DecodingResult> {
    let decoder = attempt.decoder;
    let tokenizer = attempt.tokenizer;
    let specials = tokenizer.special_tokens().clone();
    let vocab_size = decoder.vocab_size();
    let kv_dim = decoder.kv_cache_dim();
    let max_context = decoder.max_token_context();

    let sample_begin = inputs.prompt.len();
    let loop_end = (sample_begin + attempt.options.sample_length).min(max_context - 1);

    let mut tokens: Vec<u32> = inputs.prompt.clone();
    let mut log_probs: Vec<f32> = vec![0.0; sample_begin];
    let mut no_speech_prob = 0.0f32;
    let mut first_token_log_prob_too_low = false;
    let mut alignment_rows: Vec<Vec<f32>> = Vec::new();
    let mut alignment_complete = true;

    let loop_started = Instant::now();
    let mut t = 0usize;
    while t < loop_end {
        if attempt.cancellation.is_cancelled() {
            return Err(SottoError::Cancelled);
        }

        let current = match tokens.get(t) {
            Some(&token) => token,
            None => break,
        };

        let predict_started = Instant::now();
        let mut prediction = decoder.predict(current, t, inputs, encoder_output)?;
        prediction.validate(vocab_size, kv_dim)?;
        timings.decoding_predictions += predict_started.elapsed().as_secs_f64();
        timings.total_decoding_loops += 1;

        if t == 0 {
            no_speech_prob = softmax(&prediction.logits)
                .get(specials.no_speech as usize)
                .copied()
                .unwrap_or(0.0);
        }

        if t + 1 < sample_begin {
            // Prefill: the next token is forced from the prompt. The forward
            // pass still ran so the cache fills; nothing is sampled and the
            // observer is not consulted.
            let prefill_started = Instant::now();
            inputs.commit(t, &prediction)?;
            timings.prefill += prefill_started.elapsed().as_secs_f64();
            t += 1;
            continue;
        }

        let filter_started = Instant::now();
        for filter in attempt.filters {
            filter.filter(&mut prediction.logits, &tokens);
        }
        timings.decoding_filtering += filter_started.elapsed().as_secs_f64();

        let sample_started = Instant::now();
        let sampled = attempt.sampler.update(&tokens, &prediction.logits, &log_probs);
        timings.decoding_sampling += sample_started.elapsed().as_secs_f64();

        let next_log_prob = sampled.log_probs.last().copied().unwrap_or(0.0);
        if tokens.len() == sample_begin {
            if let Some(threshold) = attempt.options.first_token_log_prob_threshold {
                if next_log_prob < threshold {
                    first_token_log_prob_too_low = true;
                }
            }
        }

        // Completion: end token, exhausted context, or a hopeless first
        // token. This step's cache update is intentionally not committed.
        if sampled.completed || tokens.len() + 1 >= max_context || first_token_log_prob_too_low {
            break;
        }

        tokens = sampled.tokens;
        log_probs = sampled.log_probs;
        inputs.commit(t, &prediction)?;

        match prediction.alignment_weights {
            Some(weights) => alignment_rows.push(weights),
            None => alignment_complete = false,
        }

        if let Some(observer) = attempt.observer {
            let generated = &tokens[sample_begin..];
            let partial_text = decode_text_tokens(tokenizer, generated)?;
            let generated_log_probs = &log_probs[sample_begin..];
            let progress = TranscriptionProgress {
                window_index: attempt.window_index,
                compression_ratio: compression_ratio(&partial_text),
                text: partial_text,
                tokens: generated.to_vec(),
                avg_log_prob: mean(generated_log_probs),
            };
            if observer.on_progress(&progress) == ProgressVote::Stop {
                debug!(
                    window = attempt.window_index,
                    generated = generated.len(),
                    "early stop requested by progress observer"
                );
                t += 1;
                break;
            }
        }

        t += 1;
    }
    timings.decoding_loop += loop_started.elapsed().as_secs_f64();

    // Terminate cleanly, then trim to the span before the end token.
    let finalized = attempt
        .sampler
        .finalize(&tokens[sample_begin..], &log_probs[sample_begin..]);
    let end = finalized
        .tokens
        .iter()
        .position(|&token| token == specials.end_of_text)
        .unwrap_or(finalized.tokens.len());
    let generated_tokens = finalized.tokens[..end].to_vec();
    let generated_log_probs = finalized.log_probs[..end].to_vec();

    let text = decode_text_tokens(tokenizer, &generated_tokens)?;
    let avg_log_prob = mean(&generated_log_probs);
    let ratio = compression_ratio(&text);

    let alignment_weights = if alignment_complete && !alignment_rows.is_empty() {
        let width = alignment_rows[0].len();
        let rows = alignment_rows.len();
        let flat: Vec<f32> = alignment_rows.concat();
        Array2::from_shape_vec((rows, width), flat).ok()
    } else {
        None
    };

    let fallback = DecodingFallback::evaluate(
        attempt.options,
        first_token_log_prob_too_low,
        no_speech_prob,
        ratio,
        avg_log_prob,
    );

    debug!(
        window = attempt.window_index,
        temperature = attempt.temperature,
        generated = generated_tokens.len(),
        avg_log_prob,
        compression_ratio = ratio,
        no_speech_prob,
        needs_fallback = fallback.needs_fallback,
        "decode attempt complete"
    );

    Ok(DecodingResult {
        language: attempt.language.to_string(),
        tokens: generated_tokens,
        token_log_probs: generated_log_probs,
        text,
        avg_log_prob,
        no_speech_prob,
        temperature: attempt.temperature,
        compression_ratio: ratio,
        alignment_weights,
        fallback,
    })
}

/// Decode only the plain-text tokens (no specials, no timestamps).
pub(crate) fn decode_text_tokens(tokenizer: &dyn Tokenizing, tokens: &[u32]) -> Result<String> {
    let text_tokens: Vec<u32> = tokens
        .iter()
        .copied()
        .filter(|&t| !tokenizer.is_special(t) && !tokenizer.is_timestamp(t))
        .collect();
    tokenizer.decode(&text_tokens)
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}
