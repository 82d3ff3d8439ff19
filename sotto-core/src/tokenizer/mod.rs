//! Tokenizer abstraction.
//!
//! The decode loop, segment seeker and word aligner only need a narrow
//! contract: id↔text mapping, the Whisper special-token layout, and a way to
//! regroup sub-word tokens into words. `Tokenizing` captures that contract;
//! the `hf-tokenizer` feature ships an adapter over the HuggingFace
//! `tokenizers` crate.

#[cfg(feature = "hf-tokenizer")]
pub mod hf;

#[cfg(feature = "hf-tokenizer")]
pub use hf::HfTokenizer;

use crate::error::Result;

/// Languages written without space-delimited words; these split on Unicode
/// boundaries instead of leading spaces.
pub const UNICODE_SPLIT_LANGUAGES: [&str; 6] = ["zh", "ja", "th", "lo", "my", "yue"];

/// The fixed special-token ids a Whisper-family tokenizer exposes.
#[derive(Debug, Clone)]
pub struct SpecialTokens {
    /// `<|endoftext|>`
    pub end_of_text: u32,
    /// `<|startoftranscript|>`
    pub start_of_transcript: u32,
    /// `<|startofprev|>`, when the vocabulary carries it (prompt conditioning).
    pub start_of_prev: Option<u32>,
    /// `<|transcribe|>`
    pub transcribe: u32,
    /// `<|translate|>`
    pub translate: u32,
    /// `<|notimestamps|>`
    pub no_timestamps: u32,
    /// `<|nospeech|>` (or `<|nocaptions|>` on older exports)
    pub no_speech: u32,
    /// `<|0.00|>` — every id at or above this is a timestamp token.
    pub time_token_begin: u32,
    /// The single-space text token (id 220 on the standard vocabulary).
    pub blank: u32,
}

/// A word with the sub-word tokens that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct WordTokenGroup {
    pub word: String,
    pub tokens: Vec<u32>,
}

/// Contract for Whisper-family tokenizers.
pub trait Tokenizing: Send + Sync {
    /// Decode token ids into text. Special tokens are omitted.
    fn decode(&self, tokens: &[u32]) -> Result<String>;

    /// Look up the id for an exact vocabulary piece.
    fn token_to_id(&self, piece: &str) -> Option<u32>;

    fn special_tokens(&self) -> &SpecialTokens;

    /// Language-tag token (`<|en|>` → id) if the vocabulary carries it.
    fn language_token(&self, code: &str) -> Option<u32>;

    /// All language-tag token ids, for the detection filter.
    fn all_language_tokens(&self) -> &[u32];

    /// Reverse mapping from a language-tag token to its code.
    fn language_code(&self, token: u32) -> Option<String>;

    fn is_special(&self, token: u32) -> bool;

    fn is_timestamp(&self, token: u32) -> bool {
        token >= self.special_tokens().time_token_begin
    }

    /// Regroup text tokens into words. Space-delimited languages split on
    /// leading spaces; the rest split on Unicode boundaries.
    fn split_to_word_tokens(&self, tokens: &[u32], language: &str) -> Result<Vec<WordTokenGroup>> {
        if UNICODE_SPLIT_LANGUAGES.contains(&language) {
            self.split_tokens_on_unicode(tokens)
        } else {
            self.split_tokens_on_spaces(tokens)
        }
    }

    /// Group tokens into the smallest runs that decode to complete Unicode
    /// text (no replacement character from a split multi-byte sequence).
    fn split_tokens_on_unicode(&self, tokens: &[u32]) -> Result<Vec<WordTokenGroup>> {
        let mut words = Vec::new();
        let mut current: Vec<u32> = Vec::new();
        for &token in tokens {
            current.push(token);
            let decoded = self.decode(&current)?;
            if !decoded.contains('\u{FFFD}') {
                words.push(WordTokenGroup {
                    word: decoded,
                    tokens: std::mem::take(&mut current),
                });
            }
        }
        if !current.is_empty() {
            let decoded = self.decode(&current)?;
            words.push(WordTokenGroup {
                word: decoded,
                tokens: current,
            });
        }
        Ok(words)
    }

    /// Merge Unicode sub-words into space-delimited words: a sub-word starts
    /// a new word iff it is special, begins with a space, or is a lone
    /// punctuation mark.
    fn split_tokens_on_spaces(&self, tokens: &[u32]) -> Result<Vec<WordTokenGroup>> {
        let subwords = self.split_tokens_on_unicode(tokens)?;
        let mut words: Vec<WordTokenGroup> = Vec::new();
        for sub in subwords {
            let special = sub.tokens.first().is_some_and(|&t| self.is_special(t));
            let with_space = sub.word.starts_with(' ');
            let trimmed = sub.word.trim();
            let punctuation =
                trimmed.chars().count() == 1 && trimmed.chars().all(|c| c.is_ascii_punctuation());
            if special || with_space || punctuation || words.is_empty() {
                words.push(sub);
            } else if let Some(last) = words.last_mut() {
                last.word.push_str(&sub.word);
                last.tokens.extend(sub.tokens);
            }
        }
        Ok(words)
    }
}
