//! Logits filter pipeline.
//!
//! Each filter mutates the shared logits buffer in place before sampling.
//! Filters are cheap and order-sensitive: suppression lists run first, the
//! timestamp grammar last (it reasons over whatever survived).

use crate::tokenizer::SpecialTokens;

/// Contract for in-place logits transformations.
///
/// `tokens` is the full token history including the forced prompt; filters
/// that care about generation position compare against their `sample_begin`.
pub trait LogitsFiltering: Send + Sync {
    fn filter(&self, logits: &mut [f32], tokens: &[u32]);
}

// ── Suppress list ────────────────────────────────────────────────────────────

/// Unconditionally masks a fixed set of token ids.
pub struct SuppressTokensFilter {
    suppressed: Vec<u32>,
}

impl SuppressTokensFilter {
    pub fn new(suppressed: Vec<u32>) -> Self {
        Self { suppressed }
    }
}

impl LogitsFiltering for SuppressTokensFilter {
    fn filter(&self, logits: &mut [f32], _tokens: &[u32]) {
        for &token in &self.suppressed {
            if let Some(slot) = logits.get_mut(token as usize) {
                *slot = f32::NEG_INFINITY;
            }
        }
    }
}

// ── Suppress blank ───────────────────────────────────────────────────────────

/// Masks blank-ish tokens on the very first generated token only, so a
/// decode cannot open with empty output.
pub struct SuppressBlankFilter {
    suppressed: Vec<u32>,
    sample_begin: usize,
}

impl SuppressBlankFilter {
    pub fn new(blank: u32, end_of_text: u32, sample_begin: usize) -> Self {
        Self {
            suppressed: vec![blank, end_of_text],
            sample_begin,
        }
    }
}

impl LogitsFiltering for SuppressBlankFilter {
    fn filter(&self, logits: &mut [f32], tokens: &[u32]) {
        if tokens.len() != self.sample_begin {
            return;
        }
        for &token in &self.suppressed {
            if let Some(slot) = logits.get_mut(token as usize) {
                *slot = f32::NEG_INFINITY;
            }
        }
    }
}

// ── Timestamp grammar ────────────────────────────────────────────────────────

/// Enforces the timestamp-token grammar over the running history:
///
/// - the first generated token must be a timestamp, no later than
///   `max_initial_timestamp_index` past the window start;
/// - timestamps come in pairs (a lone timestamp forces text next, a
///   completed pair forbids an immediate third);
/// - timestamps never decrease;
/// - when the total probability mass on timestamps beats every text token,
///   only timestamps remain eligible.
pub struct TimestampRulesFilter {
    time_token_begin: u32,
    end_of_text: u32,
    no_timestamps: u32,
    sample_begin: usize,
    max_initial_timestamp_index: Option<usize>,
}

impl TimestampRulesFilter {
    pub fn new(
        specials: &SpecialTokens,
        sample_begin: usize,
        max_initial_timestamp_index: Option<usize>,
    ) -> Self {
        Self {
            time_token_begin: specials.time_token_begin,
            end_of_text: specials.end_of_text,
            no_timestamps: specials.no_timestamps,
            sample_begin,
            max_initial_timestamp_index,
        }
    }

    fn is_timestamp(&self, token: u32) -> bool {
        token >= self.time_token_begin
    }
}

impl LogitsFiltering for TimestampRulesFilter {
    fn filter(&self, logits: &mut [f32], tokens: &[u32]) {
        let tb = self.time_token_begin as usize;
        let n = logits.len();
        if let Some(slot) = logits.get_mut(self.no_timestamps as usize) {
            *slot = f32::NEG_INFINITY;
        }

        let generated = &tokens[self.sample_begin.min(tokens.len())..];
        if generated.is_empty() {
            // Window must open with a timestamp, and not an implausibly
            // late one.
            for slot in logits[..tb.min(n)].iter_mut() {
                *slot = f32::NEG_INFINITY;
            }
            if let Some(max_index) = self.max_initial_timestamp_index {
                let ceiling = tb + max_index + 1;
                for slot in logits[ceiling.min(n)..].iter_mut() {
                    *slot = f32::NEG_INFINITY;
                }
            }
        } else {
            let last_was_timestamp = generated.last().is_some_and(|&t| self.is_timestamp(t));
            let penultimate_was_timestamp = generated.len() < 2
                || generated
                    .get(generated.len() - 2)
                    .is_some_and(|&t| self.is_timestamp(t));

            if last_was_timestamp {
                if penultimate_was_timestamp {
                    // Completed pair — the next token must be text or EOT.
                    for slot in logits[tb.min(n)..].iter_mut() {
                        *slot = f32::NEG_INFINITY;
                    }
                } else {
                    // Lone timestamp — close the pair (or end the decode).
                    let eot = self.end_of_text as usize;
                    for (i, slot) in logits[..tb.min(n)].iter_mut().enumerate() {
                        if i != eot {
                            *slot = f32::NEG_INFINITY;
                        }
                    }
                }
            }

            // Timestamps are non-decreasing.
            if let Some(&last_timestamp) =
                generated.iter().rev().find(|&&t| self.is_timestamp(t))
            {
                let floor = if last_was_timestamp && !penultimate_was_timestamp {
                    last_timestamp as usize
                } else {
                    last_timestamp as usize + 1
                };
                for slot in logits[tb.min(n)..floor.min(n)].iter_mut() {
                    *slot = f32::NEG_INFINITY;
                }
            }
        }

        // When the aggregate timestamp probability beats every text token,
        // commit to a timestamp.
        if let Some((timestamp_logprob, max_text_logprob)) = split_log_probs(logits, tb) {
            if timestamp_logprob > max_text_logprob {
                for slot in logits[..tb.min(n)].iter_mut() {
                    *slot = f32::NEG_INFINITY;
                }
            }
        }
    }
}

/// Log-sum-exp over the timestamp range and the max log-probability over the
/// text range, both under the current (post-grammar) logits. Returns `None`
/// when either side is fully suppressed.
fn split_log_probs(logits: &[f32], time_token_begin: usize) -> Option<(f32, f32)> {
    let tb = time_token_begin.min(logits.len());
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return None;
    }
    let log_z = max + logits.iter().map(|&l| (l - max).exp()).sum::<f32>().ln();

    let ts_max = logits[tb..].iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let text_max = logits[..tb].iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !ts_max.is_finite() || !text_max.is_finite() {
        return None;
    }
    let ts_sum = ts_max
        + logits[tb..]
            .iter()
            .map(|&l| (l - ts_max).exp())
            .sum::<f32>()
            .ln();
    Some((ts_sum - log_z, text_max - log_z))
}

// ── Language detection ───────────────────────────────────────────────────────

/// Restricts sampling to language-tag tokens; used only by the
/// language-detection pass.
pub struct LanguageFilter {
    language_tokens: Vec<u32>,
}

impl LanguageFilter {
    pub fn new(mut language_tokens: Vec<u32>) -> Self {
        language_tokens.sort_unstable();
        Self { language_tokens }
    }
}

impl LogitsFiltering for LanguageFilter {
    fn filter(&self, logits: &mut [f32], _tokens: &[u32]) {
        for (i, slot) in logits.iter_mut().enumerate() {
            if self.language_tokens.binary_search(&(i as u32)).is_err() {
                *slot = f32::NEG_INFINITY;
            }
        }
    }
}
