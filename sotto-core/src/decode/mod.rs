//! Autoregressive decoding: KV-cache state, logits filters, sampling, the
//! decode loop itself, and the temperature-fallback controller around it.

pub mod fallback;
pub mod filters;
pub mod inputs;
pub mod runner;
pub mod sampler;

pub use fallback::decode_with_fallback;
pub use filters::{
    LanguageFilter, LogitsFiltering, SuppressBlankFilter, SuppressTokensFilter,
    TimestampRulesFilter,
};
pub use inputs::DecodingInputs;
pub use runner::{DecodingFallback, DecodingResult, FallbackReason};
pub use sampler::{GreedyTokenSampler, SamplingOutput, TokenSampling};
