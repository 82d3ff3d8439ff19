//! Model backend abstraction.
//!
//! The decoding core never executes a neural network itself. Feature
//! extraction, the audio encoder, and the text-decoder forward pass are
//! external collaborators reached through the traits below, so an ONNX
//! backend, a CoreML backend, or a scripted test fake all plug in without
//! touching the decode loop.
//!
//! Backend outputs are validated at this boundary: malformed shapes become
//! `SottoError::InvalidPrediction` instead of a panic deep inside the loop.

use ndarray::Array2;

use crate::decode::inputs::DecodingInputs;
use crate::error::{Result, SottoError};

/// Log-mel features for one audio window. Shape: `(n_mels, n_frames)`.
#[derive(Debug, Clone)]
pub struct MelFeatures {
    pub data: Array2<f32>,
}

/// Encoder hidden states for one window. Shape: `(n_audio_frames, d_model)`.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub hidden: Array2<f32>,
}

impl EncoderOutput {
    /// Number of encoder time-steps (rows).
    pub fn frame_count(&self) -> usize {
        self.hidden.nrows()
    }
}

/// One decoder forward pass worth of outputs.
///
/// `key_update`/`value_update` are the cache deltas for the position that was
/// just processed — one column of the persistent KV cache, length
/// `kv_cache_dim`. `alignment_weights`, when the model exposes
/// cross-attention scores, holds one head-averaged weight per encoder
/// time-step and feeds word-level timing.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub logits: Vec<f32>,
    pub key_update: Vec<f32>,
    pub value_update: Vec<f32>,
    pub alignment_weights: Option<Vec<f32>>,
}

impl Prediction {
    /// Boundary validation per the structural-failure policy: a backend that
    /// returns mismatched shapes fails the call, it does not crash it.
    pub fn validate(&self, vocab_size: usize, kv_dim: usize) -> Result<()> {
        if self.logits.len() != vocab_size {
            return Err(SottoError::InvalidPrediction(format!(
                "logits length {} != vocab size {}",
                self.logits.len(),
                vocab_size
            )));
        }
        if self.key_update.len() != kv_dim || self.value_update.len() != kv_dim {
            return Err(SottoError::InvalidPrediction(format!(
                "cache delta lengths ({}, {}) != kv dim {}",
                self.key_update.len(),
                self.value_update.len(),
                kv_dim
            )));
        }
        Ok(())
    }
}

/// Log-mel feature extraction for fixed-size audio windows.
pub trait FeatureExtracting: Send + Sync {
    /// Fixed window length in samples (default Whisper: 480 000 = 30 s).
    fn window_samples(&self) -> usize;

    /// Compute log-mel features for one window. Implementations pad or trim
    /// to `window_samples` internally.
    fn log_mel_spectrogram(&self, audio: &[f32]) -> Result<MelFeatures>;
}

/// Audio encoder forward pass.
pub trait AudioEncoding: Send + Sync {
    fn encode_features(&self, features: &MelFeatures) -> Result<EncoderOutput>;
}

/// Autoregressive text-decoder forward pass.
///
/// `predict` consumes the current token plus the caller-owned cache state in
/// `DecodingInputs` and returns logits and cache deltas for that position.
/// The loop — not the backend — owns cache mutation; backends read the
/// caches/masks and must not retain references across calls.
pub trait TextDecoding: Send + Sync {
    /// Vocabulary size — the length every logits vector must have.
    fn vocab_size(&self) -> usize;

    /// KV-cache row count (embedding dim × layers, flattened by the backend).
    fn kv_cache_dim(&self) -> usize;

    /// Hard context ceiling (prompt + generated), typically 448.
    fn max_token_context(&self) -> usize {
        crate::options::MAX_TOKEN_CONTEXT
    }

    /// Whether the model carries language tokens (enables detection).
    fn is_multilingual(&self) -> bool;

    /// One forward step: `token` at position `position` given the current
    /// cache state and the encoder output for this window.
    fn predict(
        &self,
        token: u32,
        position: usize,
        inputs: &DecodingInputs,
        encoder_output: &EncoderOutput,
    ) -> Result<Prediction>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prediction_validation_catches_shape_mismatches() {
        let ok = Prediction {
            logits: vec![0.0; 8],
            key_update: vec![0.0; 4],
            value_update: vec![0.0; 4],
            alignment_weights: None,
        };
        assert!(ok.validate(8, 4).is_ok());

        let bad_logits = Prediction {
            logits: vec![0.0; 7],
            ..ok.clone()
        };
        assert!(matches!(
            bad_logits.validate(8, 4),
            Err(SottoError::InvalidPrediction(_))
        ));

        let bad_cache = Prediction {
            value_update: vec![0.0; 3],
            ..ok
        };
        assert!(matches!(
            bad_cache.validate(8, 4),
            Err(SottoError::InvalidPrediction(_))
        ));
    }
}
