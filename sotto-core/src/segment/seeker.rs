//! Seek-point and segment extraction from a completed decode.
//!
//! Timestamp tokens partition the generated stream into time-bounded
//! segments. The no-clean-pairs path emits one window-spanning segment and
//! advances by the whole window — `seek` always moves forward, so the outer
//! loop cannot stall.

use tracing::debug;

use crate::decode::runner::{decode_text_tokens, DecodingResult};
use crate::error::Result;
use crate::options::{DecodingOptions, SECONDS_PER_TIME_TOKEN};
use crate::segment::TranscriptionSegment;
use crate::tokenizer::Tokenizing;

/// Convert one decode's token stream into segments and the next seek point.
///
/// Returns `(new_seek, segments)`; `segments` is `None` when the window was
/// skipped as silence. `new_seek >= seek`, advancing by at least one sample
/// whenever tokens exist.
#[allow(clippy::too_many_arguments)]
pub fn find_seek_point_and_segments(
    result: &DecodingResult,
    options: &DecodingOptions,
    all_segments_count: usize,
    seek: usize,
    segment_size: usize,
    sample_rate: usize,
    tokenizer: &dyn Tokenizing,
) -> Result<(usize, Option<Vec<TranscriptionSegment>>)> {
    let time_offset = seek as f32 / sample_rate as f32;

    // Silence skip — unless the decode is confident enough to override it.
    if let Some(no_speech_threshold) = options.no_speech_threshold {
        if result.no_speech_prob > no_speech_threshold {
            let confident_override = options
                .log_prob_threshold
                .is_some_and(|threshold| result.avg_log_prob > threshold);
            if !confident_override {
                debug!(
                    no_speech_prob = result.no_speech_prob,
                    avg_log_prob = result.avg_log_prob,
                    "window skipped as silence"
                );
                return Ok((seek + segment_size, None));
            }
        }
    }

    let time_token_begin = tokenizer.special_tokens().time_token_begin;
    let tokens = &result.tokens;
    let is_timestamp: Vec<bool> = tokens.iter().map(|&t| t >= time_token_begin).collect();
    let samples_per_time_token = SECONDS_PER_TIME_TOKEN * sample_rate as f32;

    // Adjacent timestamp-timestamp pairs are the split points.
    let mut boundaries: Vec<usize> = (1..tokens.len())
        .filter(|&i| is_timestamp[i] && is_timestamp[i - 1])
        .collect();
    let single_timestamp_ending = tokens.len() >= 2
        && is_timestamp[tokens.len() - 1]
        && !is_timestamp[tokens.len() - 2];

    let mut segments = Vec::new();

    if !boundaries.is_empty() {
        if single_timestamp_ending {
            boundaries.push(tokens.len());
        }
        let mut slice_start = 0usize;
        for &boundary in &boundaries {
            let slice = &tokens[slice_start..boundary];
            let slice_log_probs = &result.token_log_probs[slice_start..boundary];
            let start_step = timestamp_step(slice.first(), time_token_begin);
            let end_step = timestamp_step(slice.last(), time_token_begin);
            segments.push(build_segment(
                all_segments_count + segments.len(),
                seek,
                time_offset + start_step as f32 * SECONDS_PER_TIME_TOKEN,
                time_offset + end_step as f32 * SECONDS_PER_TIME_TOKEN,
                slice,
                slice_log_probs,
                result,
                tokenizer,
            )?);
            slice_start = boundary;
        }

        let new_seek = if single_timestamp_ending {
            // The stream ran to the end of speech in this window.
            seek + segment_size
        } else {
            let closing_timestamp = tokens[slice_start - 1];
            let advance =
                ((closing_timestamp - time_token_begin) as f32 * samples_per_time_token) as usize;
            seek + advance.max(1)
        };
        return Ok((new_seek, Some(segments)));
    }

    // No clean timestamp pairs: one segment spanning the window. A trailing
    // non-zero timestamp refines the end time, but the seek still advances
    // by the full window.
    let mut end = time_offset + segment_size as f32 / sample_rate as f32;
    if let Some(&last) = tokens.iter().rev().find(|&&t| t > time_token_begin) {
        end = time_offset + (last - time_token_begin) as f32 * SECONDS_PER_TIME_TOKEN;
    }
    if !tokens.is_empty() {
        segments.push(build_segment(
            all_segments_count,
            seek,
            time_offset,
            end,
            tokens,
            &result.token_log_probs,
            result,
            tokenizer,
        )?);
    }
    Ok((seek + segment_size, Some(segments)))
}

fn timestamp_step(token: Option<&u32>, time_token_begin: u32) -> u32 {
    token
        .copied()
        .filter(|&t| t >= time_token_begin)
        .map(|t| t - time_token_begin)
        .unwrap_or(0)
}

#[allow(clippy::too_many_arguments)]
fn build_segment(
    id: usize,
    seek: usize,
    start: f32,
    end: f32,
    tokens: &[u32],
    token_log_probs: &[f32],
    result: &DecodingResult,
    tokenizer: &dyn Tokenizing,
) -> Result<TranscriptionSegment> {
    Ok(TranscriptionSegment {
        id,
        seek,
        start,
        end,
        text: decode_text_tokens(tokenizer, tokens)?,
        tokens: tokens.to_vec(),
        token_log_probs: token_log_probs.to_vec(),
        temperature: result.temperature,
        avg_log_prob: result.avg_log_prob,
        compression_ratio: result.compression_ratio,
        no_speech_prob: result.no_speech_prob,
        words: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::runner::DecodingFallback;
    use crate::tokenizer::SpecialTokens;

    const TB: u32 = 20;
    const SAMPLE_RATE: usize = 16_000;

    struct TsTokenizer {
        specials: SpecialTokens,
    }

    impl TsTokenizer {
        fn new() -> Self {
            Self {
                specials: SpecialTokens {
                    end_of_text: 11,
                    start_of_transcript: 12,
                    start_of_prev: None,
                    transcribe: 13,
                    translate: 14,
                    no_timestamps: 15,
                    no_speech: 16,
                    time_token_begin: TB,
                    blank: 10,
                },
            }
        }
    }

    impl Tokenizing for TsTokenizer {
        fn decode(&self, tokens: &[u32]) -> Result<String> {
            Ok(tokens
                .iter()
                .map(|&t| match t {
                    1 => " one",
                    2 => " two",
                    3 => " three",
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

        fn language_token(&self, _code: &str) -> Option<u32> {
            None
        }

        fn all_language_tokens(&self) -> &[u32] {
            &[]
        }

        fn language_code(&self, _token: u32) -> Option<String> {
            None
        }

        fn is_special(&self, token: u32) -> bool {
            (11..TB).contains(&token)
        }
    }

    fn decoding_result(tokens: Vec<u32>, no_speech_prob: f32, avg_log_prob: f32) -> DecodingResult {
        let token_log_probs = vec![-0.1; tokens.len()];
        DecodingResult {
            language: "en".to_string(),
            tokens,
            token_log_probs,
            text: String::new(),
            avg_log_prob,
            no_speech_prob,
            temperature: 0.0,
            compression_ratio: 1.0,
            alignment_weights: None,
            fallback: DecodingFallback {
                needs_fallback: false,
                reason: None,
            },
        }
    }

    #[test]
    fn timestamp_pairs_round_trip_to_exact_times() {
        // <|0.00|> one two <|0.10|><|0.10|> three <|0.20|><|0.20|>
        let result = decoding_result(vec![20, 1, 2, 25, 25, 3, 30, 30], 0.0, -0.1);
        let tok = TsTokenizer::new();
        let seek = 32_000; // 2.0 s offset

        let (new_seek, segments) = find_seek_point_and_segments(
            &result,
            &DecodingOptions::default(),
            0,
            seek,
            WINDOW_SIZE,
            SAMPLE_RATE,
            &tok,
        )
        .expect("seek");
        let segments = segments.expect("not silence");

        assert_eq!(segments.len(), 2);
        assert!((segments[0].start - 2.00).abs() < 1e-6);
        assert!((segments[0].end - 2.10).abs() < 1e-6);
        assert!((segments[1].start - 2.10).abs() < 1e-6);
        assert!((segments[1].end - 2.20).abs() < 1e-6);
        assert_eq!(segments[0].text, " one two");
        assert_eq!(segments[1].text, " three");
        // Seek lands on the closing timestamp: 2.0 s + 10 time steps.
        assert_eq!(new_seek, seek + 10 * 320);
    }

    const WINDOW_SIZE: usize = 480_000;

    #[test]
    fn no_timestamp_tokens_still_advance_a_full_window() {
        let result = decoding_result(vec![1, 2, 3], 0.0, -0.1);
        let tok = TsTokenizer::new();

        let (new_seek, segments) = find_seek_point_and_segments(
            &result,
            &DecodingOptions::default(),
            0,
            0,
            WINDOW_SIZE,
            SAMPLE_RATE,
            &tok,
        )
        .expect("seek");
        let segments = segments.expect("not silence");

        assert_eq!(new_seek, WINDOW_SIZE);
        assert_eq!(segments.len(), 1);
        assert!((segments[0].start - 0.0).abs() < 1e-6);
        assert!((segments[0].end - 30.0).abs() < 1e-6);
    }

    #[test]
    fn trailing_timestamp_refines_the_fallback_end_time() {
        // No pairs, but a trailing <|0.16|> tightens the segment end.
        let result = decoding_result(vec![1, 2, 28], 0.0, -0.1);
        let tok = TsTokenizer::new();

        let (new_seek, segments) = find_seek_point_and_segments(
            &result,
            &DecodingOptions::default(),
            0,
            0,
            WINDOW_SIZE,
            SAMPLE_RATE,
            &tok,
        )
        .expect("seek");
        let segments = segments.expect("not silence");

        assert!((segments[0].end - 0.16).abs() < 1e-6);
        // Seek still advances by the whole window on this path.
        assert_eq!(new_seek, WINDOW_SIZE);
    }

    #[test]
    fn single_trailing_timestamp_after_pairs_closes_a_final_segment() {
        // <|0.00|> one <|0.08|><|0.08|> two <|0.12|>
        let result = decoding_result(vec![20, 1, 24, 24, 2, 26], 0.0, -0.1);
        let tok = TsTokenizer::new();

        let (new_seek, segments) = find_seek_point_and_segments(
            &result,
            &DecodingOptions::default(),
            0,
            0,
            WINDOW_SIZE,
            SAMPLE_RATE,
            &tok,
        )
        .expect("seek");
        let segments = segments.expect("not silence");

        assert_eq!(segments.len(), 2);
        assert!((segments[1].end - 0.12).abs() < 1e-6);
        // Stream ran to the end of speech — advance the whole window.
        assert_eq!(new_seek, WINDOW_SIZE);
    }

    #[test]
    fn seek_is_monotonic() {
        let result = decoding_result(vec![20, 1, 22, 22, 2, 25, 25], 0.0, -0.1);
        let tok = TsTokenizer::new();
        let seek = 100_000;

        let (new_seek, _) = find_seek_point_and_segments(
            &result,
            &DecodingOptions::default(),
            0,
            seek,
            WINDOW_SIZE,
            SAMPLE_RATE,
            &tok,
        )
        .expect("seek");
        assert!(new_seek > seek);
    }

    #[test]
    fn silent_window_is_skipped_entirely() {
        let result = decoding_result(vec![1, 2], 0.9, -2.0);
        let tok = TsTokenizer::new();

        let (new_seek, segments) = find_seek_point_and_segments(
            &result,
            &DecodingOptions::default(),
            0,
            0,
            WINDOW_SIZE,
            SAMPLE_RATE,
            &tok,
        )
        .expect("seek");

        assert!(segments.is_none());
        assert_eq!(new_seek, WINDOW_SIZE);
    }

    #[test]
    fn confident_decode_overrides_the_silence_verdict() {
        // High no-speech probability but unusually high avg log-prob.
        let result = decoding_result(vec![1, 2], 0.9, -0.05);
        let tok = TsTokenizer::new();

        let (_, segments) = find_seek_point_and_segments(
            &result,
            &DecodingOptions::default(),
            0,
            0,
            WINDOW_SIZE,
            SAMPLE_RATE,
            &tok,
        )
        .expect("seek");
        assert!(segments.is_some());
    }

    #[test]
    fn segment_ids_continue_from_the_running_count() {
        let result = decoding_result(vec![20, 1, 22, 22, 2, 25, 25], 0.0, -0.1);
        let tok = TsTokenizer::new();

        let (_, segments) = find_seek_point_and_segments(
            &result,
            &DecodingOptions::default(),
            7,
            0,
            WINDOW_SIZE,
            SAMPLE_RATE,
            &tok,
        )
        .expect("seek");
        let segments = segments.expect("not silence");
        assert_eq!(segments[0].id, 7);
        assert_eq!(segments[1].id, 8);
    }
}
