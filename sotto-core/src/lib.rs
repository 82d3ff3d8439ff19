//! # sotto-core
//!
//! Whisper-model speech-to-text decoding core.
//!
//! ## Architecture
//!
//! ```text
//! audio window → FeatureExtracting → AudioEncoding (external forward passes)
//!                                          │
//!                                decode_with_fallback
//!                        (temperature ladder over the decode loop:
//!                         filters → sampler → KV-cache commit)
//!                                          │
//!                                   DecodingResult
//!                                          │
//!                         find_seek_point_and_segments
//!                     (+ optional DTW word alignment)
//!                                          │
//!                  Transcriber accumulates → TranscriptionResult
//! ```
//!
//! Model execution, audio capture, VAD chunking and result serialization
//! live behind the traits in [`model`] and [`tokenizer`]; this crate owns
//! the decoding loop, cache state, retry policy, and segmentation.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod decode;
pub mod error;
pub mod model;
pub mod options;
pub mod progress;
pub mod segment;
pub mod tokenizer;
pub mod transcribe;

// Convenience re-exports for downstream crates
pub use decode::{DecodingFallback, DecodingInputs, DecodingResult, FallbackReason};
pub use error::{Result, SottoError};
pub use model::{AudioEncoding, EncoderOutput, FeatureExtracting, MelFeatures, Prediction, TextDecoding};
pub use options::{DecodingOptions, DecodingTask};
pub use progress::{CancellationToken, ProgressObserver, ProgressVote, TranscriptionProgress};
pub use segment::{TranscriptionSegment, WordTiming};
pub use tokenizer::{SpecialTokens, Tokenizing, WordTokenGroup};
pub use transcribe::{timings::TranscriptionTimings, TranscriptionResult, Transcriber};

#[cfg(feature = "hf-tokenizer")]
pub use tokenizer::HfTokenizer;
