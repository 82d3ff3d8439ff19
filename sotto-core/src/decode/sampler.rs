//! Next-token sampling.
//!
//! The sampler owns the logits → token step and the running log-probability
//! bookkeeping. Probabilities are always taken from the full-vocabulary
//! softmax (pre-top-K) so scores are comparable across steps and across
//! temperature attempts.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// One sampling step's outcome: the extended histories plus completion.
#[derive(Debug, Clone)]
pub struct SamplingOutput {
    pub tokens: Vec<u32>,
    pub log_probs: Vec<f32>,
    pub completed: bool,
}

/// Contract for next-token sampling strategies.
pub trait TokenSampling: Send + Sync {
    /// Extend `tokens`/`log_probs` with the next token drawn from `logits`.
    /// `completed` is true iff the sampled token is the end-of-text token.
    fn update(&self, tokens: &[u32], logits: &[f32], log_probs: &[f32]) -> SamplingOutput;

    /// Guarantee a clean terminator: append the end-of-text token with
    /// log-probability 0 unless the sequence already ends with it.
    fn finalize(&self, tokens: &[u32], log_probs: &[f32]) -> SamplingOutput;
}

/// Greedy (T = 0) or temperature/top-K stochastic sampling.
pub struct GreedyTokenSampler {
    temperature: f32,
    end_of_text: u32,
    top_k: usize,
    rng: Mutex<StdRng>,
}

impl GreedyTokenSampler {
    pub fn new(temperature: f32, end_of_text: u32, top_k: usize) -> Self {
        Self {
            temperature,
            end_of_text,
            top_k: top_k.max(1),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic variant for tests and reproducible runs.
    pub fn with_seed(temperature: f32, end_of_text: u32, top_k: usize, seed: u64) -> Self {
        Self {
            temperature,
            end_of_text,
            top_k: top_k.max(1),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    fn sample_stochastic(&self, probs: &[f32]) -> usize {
        // Restrict to top-K, re-normalize, then walk the cumulative sum
        // until it exceeds a uniform draw. Ties break by enumeration order.
        let mut candidates: Vec<usize> = (0..probs.len()).collect();
        candidates.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(self.top_k);
        candidates.sort_unstable();

        let total: f32 = candidates.iter().map(|&i| probs[i]).sum();
        let draw: f32 = self.rng.lock().gen::<f32>() * total;
        let mut cumulative = 0.0f32;
        for &i in &candidates {
            cumulative += probs[i];
            if cumulative > draw {
                return i;
            }
        }
        *candidates.last().expect("top_k >= 1")
    }
}

impl TokenSampling for GreedyTokenSampler {
    fn update(&self, tokens: &[u32], logits: &[f32], log_probs: &[f32]) -> SamplingOutput {
        let (index, log_prob) = if self.temperature > 0.0 {
            let scaled: Vec<f32> = logits.iter().map(|&l| l / self.temperature).collect();
            let probs = softmax(&scaled);
            let index = self.sample_stochastic(&probs);
            (index, probs[index].ln())
        } else {
            let probs = softmax(logits);
            let index = argmax(&probs);
            (index, probs[index].ln())
        };

        let next = index as u32;
        let mut tokens = tokens.to_vec();
        let mut log_probs = log_probs.to_vec();
        tokens.push(next);
        log_probs.push(log_prob);

        SamplingOutput {
            completed: next == self.end_of_text,
            tokens,
            log_probs,
        }
    }

    fn finalize(&self, tokens: &[u32], log_probs: &[f32]) -> SamplingOutput {
        let mut tokens = tokens.to_vec();
        let mut log_probs = log_probs.to_vec();
        if tokens.last() != Some(&self.end_of_text) {
            tokens.push(self.end_of_text);
            log_probs.push(0.0);
        }
        SamplingOutput {
            tokens,
            log_probs,
            completed: true,
        }
    }
}

/// Numerically stable softmax over a raw logits slice.
pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}
