//! Mutable per-window decoder state: KV caches and attention masks.
//!
//! One `DecodingInputs` exists per transcription call. The decode loop holds
//! the only mutable reference for the duration of a window; fallback retries
//! and window advances call [`DecodingInputs::reset`], which rewinds the mask
//! state without touching cache contents — stale bytes are masked out, so
//! zeroing the tensors would be wasted work.

use ndarray::Array2;

use crate::error::{Result, SottoError};
use crate::model::Prediction;

/// Mask value for cache slots the decoder must ignore.
pub const MASK_IGNORE: f32 = -1.0e4;
/// Mask value for live cache slots.
pub const MASK_ATTEND: f32 = 0.0;

/// Caller-owned decoder state for one audio window.
pub struct DecodingInputs {
    /// Forced prompt tokens (start-of-transcript sequence, optional
    /// conditioning prefix, language + task tokens).
    pub prompt: Vec<u32>,
    /// Number of committed cache positions.
    pub cache_length: usize,
    /// Key cache, shape `(kv_dim, max_sequence_length)`.
    pub key_cache: Array2<f32>,
    /// Value cache, same shape as `key_cache`.
    pub value_cache: Array2<f32>,
    /// Marks the single slot the next forward pass will write.
    pub update_mask: Vec<f32>,
    /// Additive attention mask over cache slots: `MASK_ATTEND` for live
    /// positions, `MASK_IGNORE` for stale or unwritten ones.
    pub kv_padding_mask: Vec<f32>,
}

impl DecodingInputs {
    pub fn new(kv_dim: usize, max_sequence_length: usize, prompt: Vec<u32>) -> Self {
        let mut inputs = Self {
            prompt,
            cache_length: 0,
            key_cache: Array2::zeros((kv_dim, max_sequence_length)),
            value_cache: Array2::zeros((kv_dim, max_sequence_length)),
            update_mask: vec![0.0; max_sequence_length],
            kv_padding_mask: vec![MASK_IGNORE; max_sequence_length],
        };
        inputs.reset(0);
        inputs
    }

    pub fn max_sequence_length(&self) -> usize {
        self.update_mask.len()
    }

    /// Commit one forward pass: write the cache deltas into column
    /// `position` and mark `position + 1` as the next write slot.
    ///
    /// The write is a targeted column update; rows are disjoint slices of
    /// the backing storage.
    pub fn commit(&mut self, position: usize, prediction: &Prediction) -> Result<()> {
        let max_len = self.max_sequence_length();
        if position >= max_len {
            return Err(SottoError::InvalidPrediction(format!(
                "cache position {position} out of range (max sequence length {max_len})"
            )));
        }

        for (dst, &src) in self
            .key_cache
            .column_mut(position)
            .iter_mut()
            .zip(&prediction.key_update)
        {
            *dst = src;
        }
        for (dst, &src) in self
            .value_cache
            .column_mut(position)
            .iter_mut()
            .zip(&prediction.value_update)
        {
            *dst = src;
        }

        self.kv_padding_mask[position] = MASK_ATTEND;
        self.update_mask[position] = 0.0;
        if position + 1 < max_len {
            self.update_mask[position + 1] = 1.0;
        }
        self.cache_length = position + 1;
        Ok(())
    }

    /// Rewind mask state to `prefill_length` live positions. Cache contents
    /// are left as-is.
    pub fn reset(&mut self, prefill_length: usize) {
        let max_len = self.max_sequence_length();
        let prefill_length = prefill_length.min(max_len);
        for (i, slot) in self.kv_padding_mask.iter_mut().enumerate() {
            *slot = if i < prefill_length {
                MASK_ATTEND
            } else {
                MASK_IGNORE
            };
        }
        for slot in self.update_mask.iter_mut() {
            *slot = 0.0;
        }
        if prefill_length < max_len {
            self.update_mask[prefill_length] = 1.0;
        }
        self.cache_length = prefill_length;
    }
}
