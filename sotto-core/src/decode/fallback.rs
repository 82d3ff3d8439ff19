//! Temperature-fallback control around the decode loop.
//!
//! One decode attempt per ladder entry. A quality failure rewinds the
//! window state and retries hotter; every retry is a fully independent
//! decode — nothing from the failed attempt's tokens is reused. Ladder
//! exhaustion returns the final attempt flagged by its fallback metadata;
//! only a ladder that produced no result at all is an error.

use std::time::Instant;

use tracing::{debug, warn};

use crate::decode::filters::{
    LanguageFilter, LogitsFiltering, SuppressBlankFilter, SuppressTokensFilter,
    TimestampRulesFilter,
};
use crate::decode::inputs::DecodingInputs;
use crate::decode::runner::{run_decode_loop, DecodeAttempt, DecodingResult};
use crate::decode::sampler::GreedyTokenSampler;
use crate::error::{Result, SottoError};
use crate::model::{EncoderOutput, TextDecoding};
use crate::options::{DecodingOptions, SECONDS_PER_TIME_TOKEN};
use crate::progress::{CancellationToken, ProgressObserver};
use crate::tokenizer::Tokenizing;
use crate::transcribe::timings::TranscriptionTimings;

/// Decode one window, escalating temperature until a quality-clean result
/// (or the ladder runs out).
#[allow(clippy::too_many_arguments)]
pub fn decode_with_fallback(
    decoder: &dyn TextDecoding,
    tokenizer: &dyn Tokenizing,
    encoder_output: &EncoderOutput,
    inputs: &mut DecodingInputs,
    options: &DecodingOptions,
    window_index: usize,
    cancellation: &CancellationToken,
    observer: Option<&dyn ProgressObserver>,
    timings: &mut TranscriptionTimings,
) -> Result<DecodingResult> {
    let specials = tokenizer.special_tokens().clone();
    let ladder = options.temperature_ladder();
    let prefill_length = inputs.prompt.len();
    let mut language = options
        .language
        .clone()
        .unwrap_or_else(|| "en".to_string());
    let mut last_result: Option<DecodingResult> = None;

    for (attempt_index, &temperature) in ladder.iter().enumerate() {
        if decoder.is_multilingual() && options.language.is_none() && options.detect_language {
            let (code, token) = detect_language(decoder, tokenizer, encoder_output, cancellation)?;
            if let Some(slot) = inputs
                .prompt
                .iter()
                .position(|t| tokenizer.all_language_tokens().contains(t))
            {
                inputs.prompt[slot] = token;
            } else {
                warn!("prompt carries no language slot — detected language not applied");
            }
            debug!(window = window_index, language = %code, "language detected");
            language = code;
        }

        let sampler = GreedyTokenSampler::new(temperature, specials.end_of_text, options.top_k);
        let filters = build_filters(tokenizer, options, inputs.prompt.len());
        let attempt = DecodeAttempt {
            decoder,
            tokenizer,
            sampler: &sampler,
            filters: &filters,
            options,
            language: &language,
            temperature,
            window_index,
            cancellation,
            observer,
        };

        let result = run_decode_loop(&attempt, encoder_output, inputs, timings)?;

        if result.fallback.needs_fallback && attempt_index + 1 < ladder.len() {
            warn!(
                window = window_index,
                temperature,
                reason = ?result.fallback.reason,
                "decode quality check failed — retrying at higher temperature"
            );
            let reset_started = Instant::now();
            timings.total_decoding_fallbacks += 1;
            inputs.reset(if options.use_prefill_cache {
                prefill_length
            } else {
                0
            });
            timings.decoding_fallback += reset_started.elapsed().as_secs_f64();
            last_result = Some(result);
            continue;
        }

        return Ok(result);
    }

    last_result.ok_or(SottoError::DecodingFailed)
}

/// Single filtered forward pass that can only select a language tag.
pub fn detect_language(
    decoder: &dyn TextDecoding,
    tokenizer: &dyn Tokenizing,
    encoder_output: &EncoderOutput,
    cancellation: &CancellationToken,
) -> Result<(String, u32)> {
    if cancellation.is_cancelled() {
        return Err(SottoError::Cancelled);
    }
    let language_tokens = tokenizer.all_language_tokens();
    if language_tokens.is_empty() {
        return Err(SottoError::Tokenizer(
            "multilingual model but tokenizer exposes no language tokens".into(),
        ));
    }

    let specials = tokenizer.special_tokens();
    let scratch = DecodingInputs::new(
        decoder.kv_cache_dim(),
        1,
        vec![specials.start_of_transcript],
    );
    let mut prediction =
        decoder.predict(specials.start_of_transcript, 0, &scratch, encoder_output)?;
    prediction.validate(decoder.vocab_size(), decoder.kv_cache_dim())?;

    LanguageFilter::new(language_tokens.to_vec()).filter(&mut prediction.logits, &[]);
    let token = prediction
        .logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as u32)
        .unwrap_or(specials.start_of_transcript);

    let code = tokenizer
        .language_code(token)
        .ok_or_else(|| SottoError::Tokenizer(format!("token {token} is not a language tag")))?;
    Ok((code, token))
}

/// Assemble the filter pipeline for one attempt. Order matters: suppression
/// lists first, blank guard second, the timestamp grammar last.
fn build_filters(
    tokenizer: &dyn Tokenizing,
    options: &DecodingOptions,
    sample_begin: usize,
) -> Vec<Box<dyn LogitsFiltering>> {
    let specials = tokenizer.special_tokens();
    let mut suppressed = options.suppress_tokens.clone();
    suppressed.extend([
        specials.start_of_transcript,
        specials.transcribe,
        specials.translate,
        specials.no_speech,
    ]);
    if let Some(start_of_prev) = specials.start_of_prev {
        suppressed.push(start_of_prev);
    }
    suppressed.sort_unstable();
    suppressed.dedup();

    let mut filters: Vec<Box<dyn LogitsFiltering>> =
        vec![Box::new(SuppressTokensFilter::new(suppressed))];
    if options.suppress_blank {
        filters.push(Box::new(SuppressBlankFilter::new(
            specials.blank,
            specials.end_of_text,
            sample_begin,
        )));
    }
    if !options.without_timestamps {
        let max_initial_index = options
            .max_initial_timestamp
            .map(|seconds| (seconds / SECONDS_PER_TIME_TOKEN).round() as usize);
        filters.push(Box::new(TimestampRulesFilter::new(
            specials,
            sample_begin,
            max_initial_index,
        )));
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::model::Prediction;
    use crate::progress::{ProgressVote, TranscriptionProgress};
    use crate::tokenizer::SpecialTokens;

    const VOCAB: usize = 30;
    const KV_DIM: usize = 4;
    const EOT: u32 = 11;
    const SOT: u32 = 12;
    const TRANSCRIBE: u32 = 13;
    const NO_TIMESTAMPS: u32 = 15;
    const NO_SPEECH: u32 = 16;
    const LANG_EN: u32 = 17;
    const LANG_ZH: u32 = 18;

    struct TestTokenizer {
        specials: SpecialTokens,
        languages: Vec<u32>,
    }

    impl TestTokenizer {
        fn new() -> Self {
            Self {
                specials: SpecialTokens {
                    end_of_text: EOT,
                    start_of_transcript: SOT,
                    start_of_prev: None,
                    transcribe: TRANSCRIBE,
                    translate: 14,
                    no_timestamps: NO_TIMESTAMPS,
                    no_speech: NO_SPEECH,
                    time_token_begin: 20,
                    blank: 10,
                },
                languages: vec![LANG_EN, LANG_ZH],
            }
        }
    }

    impl Tokenizing for TestTokenizer {
        fn decode(&self, tokens: &[u32]) -> crate::error::Result<String> {
            Ok(tokens
                .iter()
                .map(|&t| match t {
                    1 => " alpha",
                    2 => " beta",
                    3 => " gamma",
                    7 => " seven",
                    _ => "",
                })
                .collect())
        }

        fn token_to_id(&self, _piece: &str) -> Option<u32> {
            None
        }

        fn special_tokens(&self) -> &SpecialTokens {
            &self.specials
        }

        fn language_token(&self, code: &str) -> Option<u32> {
            match code {
                "en" => Some(LANG_EN),
                "zh" => Some(LANG_ZH),
                _ => None,
            }
        }

        fn all_language_tokens(&self) -> &[u32] {
            &self.languages
        }

        fn language_code(&self, token: u32) -> Option<String> {
            match token {
                LANG_EN => Some("en".to_string()),
                LANG_ZH => Some("zh".to_string()),
                _ => None,
            }
        }

        fn is_special(&self, token: u32) -> bool {
            (EOT..20).contains(&token)
        }
    }

    /// Emits a fixed token script per attempt (attempt = nth position-0
    /// call), padding with EOT once the script runs out.
    struct ScriptedDecoder {
        scripts: Vec<Vec<u32>>,
        silent: bool,
        multilingual: bool,
        detected_language: u32,
        frames: usize,
        first_position_calls: AtomicUsize,
    }

    impl ScriptedDecoder {
        fn new(scripts: Vec<Vec<u32>>) -> Self {
            Self {
                scripts,
                silent: false,
                multilingual: false,
                detected_language: LANG_EN,
                frames: 8,
                first_position_calls: AtomicUsize::new(0),
            }
        }

        fn attempts(&self) -> usize {
            self.first_position_calls.load(Ordering::SeqCst)
        }
    }

    impl TextDecoding for ScriptedDecoder {
        fn vocab_size(&self) -> usize {
            VOCAB
        }

        fn kv_cache_dim(&self) -> usize {
            KV_DIM
        }

        fn is_multilingual(&self) -> bool {
            self.multilingual
        }

        fn predict(
            &self,
            _token: u32,
            position: usize,
            inputs: &DecodingInputs,
            _encoder_output: &EncoderOutput,
        ) -> crate::error::Result<Prediction> {
            if position == 0 && inputs.prompt.len() > 1 {
                self.first_position_calls.fetch_add(1, Ordering::SeqCst);
            }
            // The language-detection pass uses a single-token scratch prompt.
            if inputs.prompt.len() == 1 {
                let mut logits = vec![0.0; VOCAB];
                logits[self.detected_language as usize] = 10.0;
                return Ok(Prediction {
                    logits,
                    key_update: vec![0.0; KV_DIM],
                    value_update: vec![0.0; KV_DIM],
                    alignment_weights: None,
                });
            }

            let attempt = self.attempts().saturating_sub(1).min(self.scripts.len() - 1);
            let mut logits = vec![0.0; VOCAB];
            if position == 0 && self.silent {
                logits[NO_SPEECH as usize] = 10.0;
            } else {
                let generation_index = (position + 1).checked_sub(inputs.prompt.len());
                let target = generation_index
                    .and_then(|g| self.scripts[attempt].get(g))
                    .copied()
                    .unwrap_or(EOT);
                logits[target as usize] = 10.0;
            }
            Ok(Prediction {
                logits,
                key_update: vec![0.5; KV_DIM],
                value_update: vec![0.5; KV_DIM],
                alignment_weights: Some(vec![0.1; self.frames]),
            })
        }
    }

    fn encoder_output() -> EncoderOutput {
        EncoderOutput {
            hidden: ndarray::Array2::zeros((8, 4)),
        }
    }

    fn text_options() -> DecodingOptions {
        let mut opts = DecodingOptions::default();
        opts.without_timestamps = true;
        opts
    }

    fn fresh_inputs(prompt: Vec<u32>) -> DecodingInputs {
        DecodingInputs::new(KV_DIM, crate::options::MAX_TOKEN_CONTEXT, prompt)
    }

    #[test]
    fn clean_decode_returns_on_first_attempt() {
        let decoder = ScriptedDecoder::new(vec![vec![1, 2, 3, EOT]]);
        let tokenizer = TestTokenizer::new();
        let mut inputs = fresh_inputs(vec![SOT, TRANSCRIBE, NO_TIMESTAMPS]);
        let mut timings = TranscriptionTimings::default();

        let result = decode_with_fallback(
            &decoder,
            &tokenizer,
            &encoder_output(),
            &mut inputs,
            &text_options(),
            0,
            &CancellationToken::new(),
            None,
            &mut timings,
        )
        .expect("decode");

        assert_eq!(result.tokens, vec![1, 2, 3]);
        assert_eq!(result.text, " alpha beta gamma");
        assert_eq!(result.temperature, 0.0);
        assert!(!result.fallback.needs_fallback);
        assert_eq!(decoder.attempts(), 1);
        assert_eq!(timings.total_decoding_fallbacks, 0);
        // Three generated tokens were committed to the cache.
        assert_eq!(inputs.cache_length, inputs.prompt.len() + 2);
    }

    #[test]
    fn greedy_decode_is_deterministic_across_runs() {
        let tokenizer = TestTokenizer::new();
        let mut reference: Option<Vec<u32>> = None;
        for _ in 0..3 {
            let decoder = ScriptedDecoder::new(vec![vec![3, 1, 2, 1, EOT]]);
            let mut inputs = fresh_inputs(vec![SOT, TRANSCRIBE, NO_TIMESTAMPS]);
            let mut timings = TranscriptionTimings::default();
            let result = decode_with_fallback(
                &decoder,
                &tokenizer,
                &encoder_output(),
                &mut inputs,
                &text_options(),
                0,
                &CancellationToken::new(),
                None,
                &mut timings,
            )
            .expect("decode");
            match &reference {
                Some(tokens) => assert_eq!(&result.tokens, tokens),
                None => reference = Some(result.tokens),
            }
        }
    }

    #[test]
    fn repetitive_decode_retries_then_recovers() {
        // Attempt 0 loops on token 7; attempt 1 is clean.
        let decoder = ScriptedDecoder::new(vec![vec![7; 200], vec![1, 2, 3, EOT]]);
        let tokenizer = TestTokenizer::new();
        let mut inputs = fresh_inputs(vec![SOT, TRANSCRIBE, NO_TIMESTAMPS]);
        let mut timings = TranscriptionTimings::default();

        let result = decode_with_fallback(
            &decoder,
            &tokenizer,
            &encoder_output(),
            &mut inputs,
            &text_options(),
            0,
            &CancellationToken::new(),
            None,
            &mut timings,
        )
        .expect("decode");

        assert_eq!(decoder.attempts(), 2);
        assert_eq!(timings.total_decoding_fallbacks, 1);
        assert!((result.temperature - 0.2).abs() < 1e-6);
        assert_eq!(result.text, " alpha beta gamma");
        assert!(!result.fallback.needs_fallback);
    }

    #[test]
    fn repetitive_stream_reports_compression_ratio_reason() {
        let mut opts = text_options();
        opts.temperature_fallback_count = 0;
        let decoder = ScriptedDecoder::new(vec![vec![7; 200]]);
        let tokenizer = TestTokenizer::new();
        let mut inputs = fresh_inputs(vec![SOT, TRANSCRIBE, NO_TIMESTAMPS]);
        let mut timings = TranscriptionTimings::default();

        let result = decode_with_fallback(
            &decoder,
            &tokenizer,
            &encoder_output(),
            &mut inputs,
            &opts,
            0,
            &CancellationToken::new(),
            None,
            &mut timings,
        )
        .expect("decode");

        assert!(result.fallback.needs_fallback);
        assert_eq!(
            result.fallback.reason,
            Some(crate::decode::FallbackReason::CompressionRatioThreshold)
        );
        assert!(result.compression_ratio > 2.4);
    }

    #[test]
    fn silent_window_does_not_retry() {
        let mut decoder = ScriptedDecoder::new(vec![vec![1, 2, EOT]]);
        decoder.silent = true;
        let tokenizer = TestTokenizer::new();
        let mut inputs = fresh_inputs(vec![SOT, TRANSCRIBE, NO_TIMESTAMPS]);
        let mut timings = TranscriptionTimings::default();

        let result = decode_with_fallback(
            &decoder,
            &tokenizer,
            &encoder_output(),
            &mut inputs,
            &text_options(),
            0,
            &CancellationToken::new(),
            None,
            &mut timings,
        )
        .expect("decode");

        assert_eq!(decoder.attempts(), 1);
        assert!(!result.fallback.needs_fallback);
        assert_eq!(
            result.fallback.reason,
            Some(crate::decode::FallbackReason::Silence)
        );
        assert!(result.no_speech_prob > 0.9);
    }

    #[test]
    fn language_detection_rewrites_the_prompt_slot() {
        let mut decoder = ScriptedDecoder::new(vec![vec![1, EOT]]);
        decoder.multilingual = true;
        decoder.detected_language = LANG_ZH;
        let tokenizer = TestTokenizer::new();
        let mut opts = text_options();
        opts.detect_language = true;
        let mut inputs = fresh_inputs(vec![SOT, LANG_EN, TRANSCRIBE, NO_TIMESTAMPS]);
        let mut timings = TranscriptionTimings::default();

        let result = decode_with_fallback(
            &decoder,
            &tokenizer,
            &encoder_output(),
            &mut inputs,
            &opts,
            0,
            &CancellationToken::new(),
            None,
            &mut timings,
        )
        .expect("decode");

        assert_eq!(result.language, "zh");
        assert_eq!(inputs.prompt[1], LANG_ZH);
    }

    #[test]
    fn observer_stop_vote_ends_generation_early() {
        let decoder = ScriptedDecoder::new(vec![vec![1, 2, 3, 1, 2, 3, EOT]]);
        let tokenizer = TestTokenizer::new();
        let mut inputs = fresh_inputs(vec![SOT, TRANSCRIBE, NO_TIMESTAMPS]);
        let mut timings = TranscriptionTimings::default();
        let observer = |progress: &TranscriptionProgress| {
            if progress.tokens.len() >= 2 {
                ProgressVote::Stop
            } else {
                ProgressVote::Continue
            }
        };

        let result = decode_with_fallback(
            &decoder,
            &tokenizer,
            &encoder_output(),
            &mut inputs,
            &text_options(),
            0,
            &CancellationToken::new(),
            Some(&observer),
            &mut timings,
        )
        .expect("decode");

        assert_eq!(result.tokens, vec![1, 2]);
    }

    #[test]
    fn cancellation_surfaces_as_cancelled() {
        let decoder = ScriptedDecoder::new(vec![vec![1, EOT]]);
        let tokenizer = TestTokenizer::new();
        let mut inputs = fresh_inputs(vec![SOT, TRANSCRIBE, NO_TIMESTAMPS]);
        let mut timings = TranscriptionTimings::default();
        let token = CancellationToken::new();
        token.cancel();

        let err = decode_with_fallback(
            &decoder,
            &tokenizer,
            &encoder_output(),
            &mut inputs,
            &text_options(),
            0,
            &token,
            None,
            &mut timings,
        )
        .expect_err("must cancel");
        assert!(err.is_cancelled());
    }

    #[test]
    fn flat_logits_trip_the_first_token_threshold() {
        // A script that never concentrates probability: every generated
        // token draws from a uniform distribution, so the first token's
        // log-probability sits near ln(1/VOCAB).
        struct FlatDecoder;
        impl TextDecoding for FlatDecoder {
            fn vocab_size(&self) -> usize {
                VOCAB
            }
            fn kv_cache_dim(&self) -> usize {
                KV_DIM
            }
            fn is_multilingual(&self) -> bool {
                false
            }
            fn predict(
                &self,
                _token: u32,
                _position: usize,
                _inputs: &DecodingInputs,
                _encoder_output: &EncoderOutput,
            ) -> crate::error::Result<Prediction> {
                Ok(Prediction {
                    logits: vec![0.0; VOCAB],
                    key_update: vec![0.0; KV_DIM],
                    value_update: vec![0.0; KV_DIM],
                    alignment_weights: None,
                })
            }
        }

        let tokenizer = TestTokenizer::new();
        let mut opts = text_options();
        opts.temperature_fallback_count = 1;
        let mut inputs = fresh_inputs(vec![SOT, TRANSCRIBE, NO_TIMESTAMPS]);
        let mut timings = TranscriptionTimings::default();

        let result = decode_with_fallback(
            &FlatDecoder,
            &tokenizer,
            &encoder_output(),
            &mut inputs,
            &opts,
            0,
            &CancellationToken::new(),
            None,
            &mut timings,
        )
        .expect("decode");

        assert!(result.fallback.needs_fallback);
        assert_eq!(
            result.fallback.reason,
            Some(crate::decode::FallbackReason::FirstTokenLogProbThreshold)
        );
        assert_eq!(timings.total_decoding_fallbacks, 1);
    }
}
