//! Word-level timestamp alignment.
//!
//! Cross-attention weights (token rows × encoder time-step columns) feed a
//! standard three-direction dynamic-time-warping pass that yields a
//! monotonic token → time mapping. Tokens regroup into words, leading and
//! trailing punctuation merges onto its neighbour, and a fixed duration-cap
//! policy truncates implausibly long words at sentence and segment
//! boundaries.

use ndarray::Array2;
use tracing::debug;

use crate::error::Result;
use crate::options::DecodingOptions;
use crate::segment::{TranscriptionSegment, WordTiming};
use crate::tokenizer::Tokenizing;

/// Words ending with one of these close a sentence for the duration cap.
const SENTENCE_END_MARKS: &str = ".。!！?？";

/// Duration-cap policy (fixed, empirically tuned upstream): twice the
/// constrained median of non-zero word durations, never above 1.4 s.
const MEDIAN_DURATION_CEILING: f32 = 0.7;

/// Attach word timings to every segment of one window.
///
/// `window_tokens` is the window's full generated token stream; row *i* of
/// `alignment_weights` belongs to `window_tokens[i]`. Segment token slices
/// are consecutive prefixes of that stream, so the alignment cursor walks
/// them in order.
#[allow(clippy::too_many_arguments)]
pub fn add_word_timestamps(
    segments: &mut [TranscriptionSegment],
    window_tokens: &[u32],
    alignment_weights: &Array2<f32>,
    tokenizer: &dyn Tokenizing,
    language: &str,
    options: &DecodingOptions,
    time_offset: f32,
    seconds_per_frame: f32,
) -> Result<()> {
    if segments.is_empty() {
        return Ok(());
    }

    // Rows for plain-text tokens only; timestamps and specials carry no
    // word content.
    let row_count = alignment_weights.nrows();
    let selected: Vec<usize> = window_tokens
        .iter()
        .enumerate()
        .filter(|(i, &t)| *i < row_count && !tokenizer.is_special(t) && !tokenizer.is_timestamp(t))
        .map(|(i, _)| i)
        .collect();
    if selected.is_empty() {
        return Ok(());
    }

    let frame_count = alignment_weights.ncols();
    let mut matrix = Array2::<f32>::zeros((selected.len(), frame_count));
    for (row, &src) in selected.iter().enumerate() {
        matrix.row_mut(row).assign(&alignment_weights.row(src));
    }

    let (text_indices, time_indices) = dtw(&matrix);

    // First frame of each token along the warping path.
    let token_count = selected.len();
    let mut token_start = vec![0.0f32; token_count];
    let mut previous_text = usize::MAX;
    for (&text_index, &time_index) in text_indices.iter().zip(&time_indices) {
        if text_index != previous_text {
            token_start[text_index] = time_index as f32 * seconds_per_frame;
            previous_text = text_index;
        }
    }
    let path_end = time_indices.last().map(|&f| (f + 1) as f32).unwrap_or(0.0);
    let mut token_end = vec![0.0f32; token_count];
    for i in 0..token_count {
        token_end[i] = if i + 1 < token_count {
            token_start[i + 1]
        } else {
            path_end * seconds_per_frame
        };
    }

    // Walk segments, consuming aligned tokens in stream order.
    let mut cursor = 0usize;
    for segment in segments.iter_mut() {
        let mut segment_text_tokens = Vec::new();
        let mut segment_log_probs = Vec::new();
        for (&token, &log_prob) in segment.tokens.iter().zip(&segment.token_log_probs) {
            if !tokenizer.is_special(token) && !tokenizer.is_timestamp(token) {
                segment_text_tokens.push(token);
                segment_log_probs.push(log_prob);
            }
        }

        let groups = tokenizer.split_to_word_tokens(&segment_text_tokens, language)?;
        let mut words = Vec::with_capacity(groups.len());
        let mut consumed = 0usize;
        for group in groups {
            let first = cursor + consumed;
            let last = first + group.tokens.len().saturating_sub(1);
            if group.tokens.is_empty() || last >= token_count {
                break;
            }
            let probability = segment_log_probs[consumed..consumed + group.tokens.len()]
                .iter()
                .map(|lp| lp.exp())
                .sum::<f32>()
                / group.tokens.len() as f32;
            words.push(WordTiming {
                word: group.word,
                start: time_offset + token_start[first],
                end: time_offset + token_end[last],
                probability,
                tokens: group.tokens,
            });
            consumed += words.last().map(|w| w.tokens.len()).unwrap_or(0);
        }
        cursor += segment_text_tokens.len();

        merge_punctuations(
            &mut words,
            &options.prepend_punctuations,
            &options.append_punctuations,
        );
        segment.words = Some(words);
    }

    apply_duration_cap(segments);
    debug!(
        segments = segments.len(),
        aligned_tokens = token_count,
        "word timestamps attached"
    );
    Ok(())
}

/// Three-direction DTW (diagonal/up/left) minimizing accumulated `-weight`,
/// i.e. maximizing attention mass along a monotonic path. Returns the path
/// as parallel (text index, time index) sequences.
fn dtw(matrix: &Array2<f32>) -> (Vec<usize>, Vec<usize>) {
    let n = matrix.nrows();
    let m = matrix.ncols();
    let width = m + 1;
    let mut cost = vec![f64::INFINITY; (n + 1) * width];
    let mut trace = vec![0u8; (n + 1) * width];
    cost[0] = 0.0;

    for i in 1..=n {
        for j in 1..=m {
            let diagonal = cost[(i - 1) * width + (j - 1)];
            let up = cost[(i - 1) * width + j];
            let left = cost[i * width + (j - 1)];
            let (best, step) = if diagonal <= up && diagonal <= left {
                (diagonal, 0)
            } else if up <= left {
                (up, 1)
            } else {
                (left, 2)
            };
            cost[i * width + j] = -(matrix[[i - 1, j - 1]] as f64) + best;
            trace[i * width + j] = step;
        }
    }

    let mut i = n;
    let mut j = m;
    let mut text_indices = Vec::with_capacity(n + m);
    let mut time_indices = Vec::with_capacity(n + m);
    while i > 0 || j > 0 {
        text_indices.push(i.saturating_sub(1));
        time_indices.push(j.saturating_sub(1));
        if i == 0 {
            j -= 1;
        } else if j == 0 {
            i -= 1;
        } else {
            match trace[i * width + j] {
                0 => {
                    i -= 1;
                    j -= 1;
                }
                1 => i -= 1,
                _ => j -= 1,
            }
        }
    }
    text_indices.reverse();
    time_indices.reverse();
    (text_indices, time_indices)
}

/// Merge leading punctuation onto the following word and trailing
/// punctuation onto the preceding one. Emptied entries are dropped.
fn merge_punctuations(words: &mut Vec<WordTiming>, prepended: &str, appended: &str) {
    if words.len() >= 2 {
        let mut i = words.len() - 2;
        let mut j = words.len() - 1;
        loop {
            let previous = words[i].word.clone();
            let trimmed = previous.trim();
            if previous.starts_with(' ')
                && !trimmed.is_empty()
                && trimmed.chars().all(|c| prepended.contains(c))
            {
                let mut merged = previous;
                merged.push_str(&words[j].word);
                words[j].word = merged;
                let mut tokens = std::mem::take(&mut words[i].tokens);
                tokens.extend(words[j].tokens.iter());
                words[j].tokens = tokens;
                words[i].word.clear();
            } else {
                j = i;
            }
            if i == 0 {
                break;
            }
            i -= 1;
        }
    }

    if words.len() >= 2 {
        let mut i = 0;
        let mut j = 1;
        while j < words.len() {
            let following = words[j].word.clone();
            if !words[i].word.is_empty()
                && !words[i].word.ends_with(' ')
                && !following.is_empty()
                && !following.starts_with(' ')
                && following.chars().all(|c| appended.contains(c))
            {
                words[i].word.push_str(&following);
                let tokens = std::mem::take(&mut words[j].tokens);
                words[i].tokens.extend(tokens);
                words[j].word.clear();
            } else {
                i = j;
            }
            j += 1;
        }
    }

    words.retain(|w| !w.word.is_empty());
}

/// Truncate anomalously long words. The cap is twice the constrained median
/// non-zero duration (≤ 1.4 s); sentence-final words shrink toward their
/// start, words after a sentence end shrink toward their end, and boundary
/// words defer to the segment timestamp.
fn apply_duration_cap(segments: &mut [TranscriptionSegment]) {
    let mut durations: Vec<f32> = segments
        .iter()
        .flat_map(|s| s.words.iter().flatten())
        .map(WordTiming::duration)
        .filter(|&d| d > 0.0)
        .collect();
    if durations.is_empty() {
        return;
    }
    durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = durations[durations.len() / 2].min(MEDIAN_DURATION_CEILING);
    let max_duration = median * 2.0;

    for segment in segments.iter_mut() {
        let (segment_start, segment_end) = (segment.start, segment.end);
        let Some(words) = segment.words.as_mut() else {
            continue;
        };

        for i in 0..words.len() {
            if words[i].duration() <= max_duration {
                continue;
            }
            if ends_sentence(&words[i].word) {
                words[i].end = words[i].start + max_duration;
            } else if i > 0 && ends_sentence(&words[i - 1].word) {
                words[i].start = words[i].end - max_duration;
            }
        }

        if let Some(first) = words.first_mut() {
            if first.duration() > max_duration {
                first.start = (first.end - max_duration).max(segment_start);
            }
        }
        if let Some(last) = words.last_mut() {
            if last.duration() > max_duration {
                last.end = (last.start + max_duration).min(segment_end).max(last.start);
            }
        }
    }
}

fn ends_sentence(word: &str) -> bool {
    word.trim_end()
        .chars()
        .last()
        .is_some_and(|c| SENTENCE_END_MARKS.contains(c))
}
