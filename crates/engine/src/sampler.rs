//! Token sampling
//!
//! Greedy decoding (temperature 0, or top-k 1) is a pure argmax and never
//! touches the RNG. Otherwise logits are tempered, softmaxed, filtered by
//! top-k and nucleus (top-p), renormalized, and drawn by inverse CDF from
//! a seeded RNG whose state persists across the request, so a fixed seed
//! reproduces the whole token sequence.

use emberlm_common::config::{GenerationMode, GenerationOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Floor applied to the temperature divisor
const TEMPERATURE_EPS: f32 = 1e-4;

/// Stateful sampler for one generation request
pub struct Sampler {
    temperature: f32,
    top_k: usize,
    top_p: f32,
    rng: Option<StdRng>,

    /// Reused candidate buffer; no per-token allocation after warmup
    candidates: Vec<(f32, u32)>,
}

impl Sampler {
    /// Build a sampler from request options.
    ///
    /// The seed is honored in `Deterministic` mode; `Exploratory` draws a
    /// fresh RNG from entropy. Greedy option sets skip RNG construction
    /// entirely.
    pub fn from_options(options: &GenerationOptions) -> Self {
        let rng = if options.is_greedy() {
            None
        } else {
            Some(match options.mode {
                GenerationMode::Deterministic => StdRng::seed_from_u64(options.seed),
                GenerationMode::Exploratory => StdRng::from_entropy(),
            })
        };

        Self {
            temperature: options.temperature,
            top_k: options.top_k,
            top_p: options.top_p,
            rng,
            candidates: Vec::new(),
        }
    }

    /// Whether this sampler is a pure argmax
    pub fn is_greedy(&self) -> bool {
        self.rng.is_none()
    }

    /// Choose the next token id from a logit row
    pub fn sample(&mut self, logits: &[f32]) -> u32 {
        debug_assert!(!logits.is_empty());
        if self.rng.is_none() {
            return argmax(logits);
        }
        self.sample_distribution(logits)
    }

    fn sample_distribution(&mut self, logits: &[f32]) -> u32 {
        let inv_temp = 1.0 / self.temperature.max(TEMPERATURE_EPS);

        // Tempered softmax with max subtraction.
        let max = logits.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        self.candidates.clear();
        self.candidates.reserve(logits.len());
        let mut sum = 0.0f32;
        for (i, &logit) in logits.iter().enumerate() {
            let p = ((logit - max) * inv_temp).exp();
            sum += p;
            self.candidates.push((p, i as u32));
        }
        let inv_sum = 1.0 / sum;
        for (p, _) in self.candidates.iter_mut() {
            *p *= inv_sum;
        }

        // Top-k restriction: keep the k most probable, 0 disables.
        if self.top_k > 0 && self.top_k < self.candidates.len() {
            self.candidates
                .select_nth_unstable_by(self.top_k - 1, |a, b| b.0.total_cmp(&a.0));
            self.candidates.truncate(self.top_k);
        }
        self.candidates
            .sort_unstable_by(|a, b| b.0.total_cmp(&a.0));

        // Nucleus: smallest prefix whose cumulative probability reaches
        // top_p; 1.0 disables.
        let mut kept = self.candidates.len();
        if self.top_p < 1.0 {
            let mut cumulative = 0.0f32;
            for (i, (p, _)) in self.candidates.iter().enumerate() {
                cumulative += p;
                if cumulative >= self.top_p {
                    kept = i + 1;
                    break;
                }
            }
        }
        let kept_slice = &self.candidates[..kept];

        // Renormalize over the kept set and draw by inverse CDF.
        let total: f32 = kept_slice.iter().map(|(p, _)| p).sum();
        let rng = self.rng.as_mut().expect("distribution sampling requires RNG");
        let draw: f32 = rng.gen::<f32>() * total;

        let mut cumulative = 0.0f32;
        for &(p, id) in kept_slice {
            cumulative += p;
            if draw <= cumulative {
                return id;
            }
        }
        kept_slice[kept_slice.len() - 1].1
    }
}

/// Index of the largest logit; ties resolve to the lowest index
pub fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(temperature: f32, top_k: usize, top_p: f32, seed: u64) -> GenerationOptions {
        GenerationOptions {
            temperature,
            top_k,
            top_p,
            seed,
            mode: GenerationMode::Deterministic,
            ..Default::default()
        }
    }

    #[test]
    fn test_greedy_is_argmax() {
        let mut sampler = Sampler::from_options(&options(0.0, 0, 1.0, 42));
        assert!(sampler.is_greedy());
        assert_eq!(sampler.sample(&[0.1, 3.0, 2.0, -1.0]), 1);
    }

    #[test]
    fn test_greedy_is_seed_independent() {
        let logits = vec![0.5f32, -0.25, 4.0, 1.0];
        let a = Sampler::from_options(&options(0.0, 0, 1.0, 1)).sample(&logits);
        let b = Sampler::from_options(&options(0.0, 0, 1.0, 999)).sample(&logits);
        assert_eq!(a, b);
        assert_eq!(a, 2);
    }

    #[test]
    fn test_top_k_one_is_greedy() {
        let mut sampler = Sampler::from_options(&options(0.9, 1, 1.0, 42));
        assert!(sampler.is_greedy());
        assert_eq!(sampler.sample(&[1.0, 5.0, 3.0]), 1);
    }

    #[test]
    fn test_fixed_seed_reproduces_sequence() {
        let logits = vec![1.0f32, 1.1, 0.9, 1.05, 0.4];

        let run = |seed: u64| -> Vec<u32> {
            let mut sampler = Sampler::from_options(&options(0.8, 3, 0.95, seed));
            (0..20).map(|_| sampler.sample(&logits)).collect()
        };

        assert_eq!(run(42), run(42));
    }

    #[test]
    fn test_different_seeds_diverge() {
        // Near-uniform logits so the draws actually vary.
        let logits: Vec<f32> = (0..100).map(|i| (i % 7) as f32 * 0.01).collect();

        let run = |seed: u64| -> Vec<u32> {
            let mut sampler = Sampler::from_options(&options(1.0, 0, 1.0, seed));
            (0..30).map(|_| sampler.sample(&logits)).collect()
        };

        assert_ne!(run(1), run(2));
    }

    #[test]
    fn test_top_k_restricts_support() {
        // Only the top-2 logits may ever be drawn.
        let logits = vec![10.0f32, 9.5, -50.0, -50.0, -50.0];
        let mut sampler = Sampler::from_options(&options(1.0, 2, 1.0, 7));
        for _ in 0..50 {
            let id = sampler.sample(&logits);
            assert!(id < 2, "sampled filtered token {id}");
        }
    }

    #[test]
    fn test_top_p_restricts_support() {
        // First token carries ~95% mass; top_p = 0.5 keeps only it.
        let logits = vec![10.0f32, 7.0, 1.0, 0.0];
        let mut sampler = Sampler::from_options(&options(1.0, 0, 0.5, 7));
        for _ in 0..50 {
            assert_eq!(sampler.sample(&logits), 0);
        }
    }

    #[test]
    fn test_disabled_filters_keep_full_support() {
        // top_k = 0 and top_p = 1.0 disable filtering; with uniform
        // logits every token stays reachable.
        let logits = vec![0.0f32; 8];
        let mut sampler = Sampler::from_options(&options(1.0, 0, 1.0, 3));
        let mut seen = [false; 8];
        for _ in 0..500 {
            seen[sampler.sample(&logits) as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}
