//! HuggingFace tokenizer adapter.
//!
//! Wraps a `tokenizer.json` fast tokenizer from the `optimum` Whisper
//! exports. Special-token ids are resolved by name with fixed fallbacks for
//! exports that strip the added-token table (the multilingual id layout).

use std::path::Path;

use tokenizers::Tokenizer;
use tracing::{debug, warn};

use crate::error::{Result, SottoError};
use crate::tokenizer::{SpecialTokens, Tokenizing};

// Fallback ids for the multilingual vocabulary.
const EOT_FALLBACK: u32 = 50_257;
const SOT_FALLBACK: u32 = 50_258;
const TRANSLATE_FALLBACK: u32 = 50_358;
const TRANSCRIBE_FALLBACK: u32 = 50_359;
const NO_SPEECH_FALLBACK: u32 = 50_362;
const NO_TIMESTAMPS_FALLBACK: u32 = 50_363;
const TIMESTAMP_BEGIN_FALLBACK: u32 = 50_364;
const BLANK_FALLBACK: u32 = 220;

/// Language codes in Whisper vocabulary order.
const LANGUAGE_CODES: [&str; 99] = [
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv", "it",
    "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no", "th", "ur",
    "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr", "az", "sl", "kn",
    "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw", "gl", "mr", "pa", "si",
    "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu", "am", "yi", "lo", "uz", "fo",
    "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl", "mg", "as", "tt", "haw", "ln",
    "ha", "ba", "jw", "su",
];

/// `Tokenizing` implementation over a HuggingFace fast tokenizer.
pub struct HfTokenizer {
    inner: Tokenizer,
    specials: SpecialTokens,
    language_tokens: Vec<u32>,
    language_codes: Vec<(u32, &'static str)>,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| SottoError::Tokenizer(format!("failed to load {path:?}: {e}")))?;
        Self::new(inner)
    }

    pub fn new(inner: Tokenizer) -> Result<Self> {
        let specials = SpecialTokens {
            end_of_text: token_id_or(&inner, "<|endoftext|>", EOT_FALLBACK),
            start_of_transcript: token_id_or(&inner, "<|startoftranscript|>", SOT_FALLBACK),
            start_of_prev: inner.token_to_id("<|startofprev|>"),
            transcribe: token_id_or(&inner, "<|transcribe|>", TRANSCRIBE_FALLBACK),
            translate: token_id_or(&inner, "<|translate|>", TRANSLATE_FALLBACK),
            no_timestamps: token_id_or(&inner, "<|notimestamps|>", NO_TIMESTAMPS_FALLBACK),
            no_speech: ["<|nospeech|>", "<|nocaptions|>"]
                .iter()
                .find_map(|t| inner.token_to_id(t))
                .unwrap_or(NO_SPEECH_FALLBACK),
            time_token_begin: token_id_or(&inner, "<|0.00|>", TIMESTAMP_BEGIN_FALLBACK),
            blank: inner.token_to_id(" ").unwrap_or(BLANK_FALLBACK),
        };

        let mut language_tokens = Vec::new();
        let mut language_codes = Vec::new();
        for code in LANGUAGE_CODES {
            if let Some(id) = inner.token_to_id(&format!("<|{code}|>")) {
                language_tokens.push(id);
                language_codes.push((id, code));
            }
        }
        if language_tokens.is_empty() {
            warn!("tokenizer exposes no language tokens — treating model as English-only");
        }
        debug!(
            vocab_size = inner.get_vocab_size(true),
            language_tokens = language_tokens.len(),
            time_token_begin = specials.time_token_begin,
            "HF tokenizer loaded"
        );

        Ok(Self {
            inner,
            specials,
            language_tokens,
            language_codes,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

fn token_id_or(tokenizer: &Tokenizer, token: &str, fallback: u32) -> u32 {
    tokenizer.token_to_id(token).unwrap_or(fallback)
}

impl Tokenizing for HfTokenizer {
    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.inner
            .decode(tokens, true)
            .map_err(|e| SottoError::Tokenizer(e.to_string()))
    }

    fn token_to_id(&self, piece: &str) -> Option<u32> {
        self.inner.token_to_id(piece)
    }

    fn special_tokens(&self) -> &SpecialTokens {
        &self.specials
    }

    fn language_token(&self, code: &str) -> Option<u32> {
        self.inner.token_to_id(&format!("<|{code}|>"))
    }

    fn all_language_tokens(&self) -> &[u32] {
        &self.language_tokens
    }

    fn language_code(&self, token: u32) -> Option<String> {
        self.language_codes
            .iter()
            .find(|(id, _)| *id == token)
            .map(|(_, code)| (*code).to_string())
    }

    fn is_special(&self, token: u32) -> bool {
        token >= self.specials.end_of_text
    }
}
