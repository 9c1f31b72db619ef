//! Transformer forward pass
//!
//! One entry point serves both prefill and decode: a batch of `m` tokens is
//! pushed through every layer, appending K/V to the session cache, and the
//! last token's logits land in the caller's buffer. Decode is the `m == 1`
//! case. The cache watermark is NOT advanced here; the generation loop
//! commits a step only after it survives cancellation checks.
//!
//! All transients are scratch-pool guards, so an error exit returns every
//! buffer to the pool.

use crate::kernels::activation::{gelu, silu};
use crate::kernels::attention::attention_prefill;
use crate::kernels::norm::{
    layer_norm, layer_norm_fused_residual, rms_norm, rms_norm_fused_residual, NORM_EPS,
};
use crate::kernels::rope::apply_rope;
use crate::kernels::KernelDispatch;
use crate::kv_cache::KvCache;
use crate::model::{Activation, Hyperparams, ModelWeights, NormType, NormWeights};
use crate::scratch::ScratchPool;
use emberlm_common::{EmberError, Result};
use std::sync::Arc;
use tracing::trace;

/// Stateless forward-pass driver bound to one model
pub struct ForwardPass<'a> {
    dispatch: &'a KernelDispatch,
    params: &'a Hyperparams,
    weights: &'a ModelWeights,
    pool: &'a Arc<ScratchPool>,
}

impl<'a> ForwardPass<'a> {
    /// Bind a driver to a model's parameters and weights
    pub fn new(
        dispatch: &'a KernelDispatch,
        params: &'a Hyperparams,
        weights: &'a ModelWeights,
        pool: &'a Arc<ScratchPool>,
    ) -> Self {
        Self {
            dispatch,
            params,
            weights,
            pool,
        }
    }

    /// Run `tokens` through the stack, appending K/V for each layer at the
    /// cache watermark, and write the last token's logits.
    ///
    /// `logits` must hold `vocab_size` elements. Empty input is a no-op.
    /// The caller commits the step with [`KvCache::advance`].
    pub fn forward(&self, tokens: &[u32], cache: &mut KvCache, logits: &mut [f32]) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }

        let p = self.params;
        if logits.len() != p.vocab_size {
            return Err(EmberError::shape(format!(
                "logits buffer holds {} elements, vocab is {}",
                logits.len(),
                p.vocab_size
            )));
        }

        let m = tokens.len();
        let base = cache.seq_len();
        let (e, q_dim, kv_dim, f) = (p.embed_dim, p.q_dim(), p.kv_dim(), p.ffn_dim);

        let mut hidden = self.pool.rent_scoped(m * e);
        let mut delta = self.pool.rent_scoped(m * e);
        let mut normed = self.pool.rent_scoped(m * e);
        let mut q_buf = self.pool.rent_scoped(m * q_dim);
        let mut k_buf = self.pool.rent_scoped(m * kv_dim);
        let mut v_buf = self.pool.rent_scoped(m * kv_dim);
        let mut attn_buf = self.pool.rent_scoped(m * q_dim);
        let mut ffn_a = self.pool.rent_scoped(m * f);
        let mut ffn_b = self.pool.rent_scoped(m * f);
        let mut scores = self.pool.rent_scoped(p.num_heads * (base + m));

        // Embed the batch into the residual stream.
        for (ti, &token) in tokens.iter().enumerate() {
            self.weights
                .embed_token(token, &mut hidden[ti * e..(ti + 1) * e])?;
        }
        delta[..m * e].fill(0.0);

        for (layer_idx, layer) in self.weights.layers.iter().enumerate() {
            trace!(layer = layer_idx, tokens = m, base, "forward layer");

            // Pre-attention norm reads hidden + the previous sublayer's
            // delta, then the delta is committed into the stream.
            self.norm_fused(&mut normed[..m * e], &hidden[..m * e], &delta[..m * e], &layer.attn_norm, m)?;
            commit_delta(&mut hidden[..m * e], &delta[..m * e]);

            // Projections.
            layer
                .wq
                .matmul(self.dispatch, &mut q_buf[..m * q_dim], &normed[..m * e], m)?;
            layer
                .wk
                .matmul(self.dispatch, &mut k_buf[..m * kv_dim], &normed[..m * e], m)?;
            layer
                .wv
                .matmul(self.dispatch, &mut v_buf[..m * kv_dim], &normed[..m * e], m)?;

            // Rotate Q and K in place, per token position.
            for ti in 0..m {
                let position = base + ti;
                apply_rope(
                    &mut q_buf[ti * q_dim..(ti + 1) * q_dim],
                    p.head_dim,
                    position,
                    p.rope_base,
                )?;
                apply_rope(
                    &mut k_buf[ti * kv_dim..(ti + 1) * kv_dim],
                    p.head_dim,
                    position,
                    p.rope_base,
                )?;
            }

            // Append this step's K/V, then attend over cache + batch.
            cache.append(layer_idx, &k_buf[..m * kv_dim], &v_buf[..m * kv_dim], m)?;

            attention_prefill(
                self.dispatch,
                &mut attn_buf[..m * q_dim],
                &q_buf[..m * q_dim],
                cache.keys_pending(layer_idx, m),
                cache.values_pending(layer_idx, m),
                &mut scores[..p.num_heads * (base + m)],
                base,
                m,
                p.num_heads,
                p.kv_heads,
                p.head_dim,
            )?;

            // Output projection becomes the attention delta.
            layer
                .wo
                .matmul(self.dispatch, &mut delta[..m * e], &attn_buf[..m * q_dim], m)?;

            // Pre-FFN norm over hidden + attention delta, then commit.
            self.norm_fused(&mut normed[..m * e], &hidden[..m * e], &delta[..m * e], &layer.ffn_norm, m)?;
            commit_delta(&mut hidden[..m * e], &delta[..m * e]);

            // Feed-forward.
            match p.activation {
                Activation::Silu => {
                    let gate = layer.w_gate.as_ref().ok_or_else(|| {
                        EmberError::model("gated activation without gate weights")
                    })?;
                    gate.matmul(self.dispatch, &mut ffn_a[..m * f], &normed[..m * e], m)?;
                    silu(&mut ffn_a[..m * f]);
                    layer
                        .w_up
                        .matmul(self.dispatch, &mut ffn_b[..m * f], &normed[..m * e], m)?;
                    for (av, bv) in ffn_a[..m * f].iter_mut().zip(ffn_b[..m * f].iter()) {
                        *av *= bv;
                    }
                }
                Activation::Gelu => {
                    layer
                        .w_up
                        .matmul(self.dispatch, &mut ffn_a[..m * f], &normed[..m * e], m)?;
                    gelu(&mut ffn_a[..m * f]);
                }
            }
            layer
                .w_down
                .matmul(self.dispatch, &mut delta[..m * e], &ffn_a[..m * f], m)?;
        }

        // Commit the trailing FFN delta for the last token, final norm,
        // LM head.
        let last = m - 1;
        commit_delta(
            &mut hidden[last * e..(last + 1) * e],
            &delta[last * e..(last + 1) * e],
        );

        let final_norm = &self.weights.final_norm;
        match p.norm_type {
            NormType::RmsNorm => rms_norm(
                &mut normed[..e],
                &hidden[last * e..(last + 1) * e],
                &final_norm.gamma,
                1,
                e,
                NORM_EPS,
            )?,
            NormType::LayerNorm => layer_norm(
                &mut normed[..e],
                &hidden[last * e..(last + 1) * e],
                &final_norm.gamma,
                beta_of(final_norm)?,
                1,
                e,
                NORM_EPS,
            )?,
        }

        self.weights
            .lm_head
            .matmul(self.dispatch, logits, &normed[..e], 1)?;
        Ok(())
    }

    /// Fused norm over `hidden + delta`, writing into `normed`
    fn norm_fused(
        &self,
        normed: &mut [f32],
        hidden: &[f32],
        delta: &[f32],
        weights: &NormWeights,
        m: usize,
    ) -> Result<()> {
        let e = self.params.embed_dim;
        match self.params.norm_type {
            NormType::RmsNorm => {
                rms_norm_fused_residual(normed, hidden, delta, &weights.gamma, m, e, NORM_EPS)
            }
            NormType::LayerNorm => layer_norm_fused_residual(
                normed,
                hidden,
                delta,
                &weights.gamma,
                beta_of(weights)?,
                m,
                e,
                NORM_EPS,
            ),
        }
    }
}

fn beta_of(weights: &NormWeights) -> Result<&[f32]> {
    weights
        .beta
        .as_deref()
        .ok_or_else(|| EmberError::model("LayerNorm weights are missing beta"))
}

/// `hidden += delta`
fn commit_delta(hidden: &mut [f32], delta: &[f32]) {
    for (h, d) in hidden.iter_mut().zip(delta.iter()) {
        *h += d;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{tiny_params, tiny_weights};
    use emberlm_common::config::ScratchConfig;

    fn run_forward(p: &Hyperparams, tokens_batches: &[&[u32]]) -> Vec<f32> {
        let weights = tiny_weights(p);
        let pool = Arc::new(ScratchPool::new(&ScratchConfig::default()));
        let dispatch = KernelDispatch::scalar();
        let fp = ForwardPass::new(&dispatch, p, &weights, &pool);

        let mut cache = KvCache::new(
            p.num_layers,
            p.num_heads,
            p.kv_heads,
            p.head_dim,
            p.context_length,
        )
        .unwrap();

        let mut logits = vec![0.0; p.vocab_size];
        for batch in tokens_batches {
            fp.forward(batch, &mut cache, &mut logits).unwrap();
            cache.advance(batch.len()).unwrap();
        }
        logits
    }

    #[test]
    fn test_forward_writes_finite_logits() {
        for (activation, norm) in [
            (Activation::Silu, NormType::RmsNorm),
            (Activation::Gelu, NormType::LayerNorm),
        ] {
            let p = tiny_params(activation, norm);
            let logits = run_forward(&p, &[&[1, 2, 3]]);
            assert_eq!(logits.len(), p.vocab_size);
            assert!(logits.iter().all(|v| v.is_finite()));
            assert!(logits.iter().any(|&v| v != 0.0));
        }
    }

    #[test]
    fn test_prefill_then_decode_matches_full_prefill() {
        // Decoding token-by-token against the cache must produce the same
        // final logits as prefilling the whole prompt at once.
        let p = tiny_params(Activation::Silu, NormType::RmsNorm);

        let all_at_once = run_forward(&p, &[&[1, 2, 3, 4]]);
        let incremental = run_forward(&p, &[&[1, 2, 3], &[4]]);

        for (a, b) in all_at_once.iter().zip(incremental.iter()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_forward_is_deterministic() {
        let p = tiny_params(Activation::Silu, NormType::RmsNorm);
        let a = run_forward(&p, &[&[5, 6]]);
        let b = run_forward(&p, &[&[5, 6]]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_input_is_noop() {
        let p = tiny_params(Activation::Silu, NormType::RmsNorm);
        let weights = tiny_weights(&p);
        let pool = Arc::new(ScratchPool::new(&ScratchConfig::default()));
        let dispatch = KernelDispatch::scalar();
        let fp = ForwardPass::new(&dispatch, &p, &weights, &pool);

        let mut cache =
            KvCache::new(p.num_layers, p.num_heads, p.kv_heads, p.head_dim, 8).unwrap();
        let mut logits = vec![0.0; p.vocab_size];
        fp.forward(&[], &mut cache, &mut logits).unwrap();
        assert_eq!(cache.seq_len(), 0);
        assert!(logits.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_failed_step_leaves_watermark() {
        // Forward appends but never advances; an abandoned step is
        // invisible once the loop declines to commit.
        let p = tiny_params(Activation::Silu, NormType::RmsNorm);
        let weights = tiny_weights(&p);
        let pool = Arc::new(ScratchPool::new(&ScratchConfig::default()));
        let dispatch = KernelDispatch::scalar();
        let fp = ForwardPass::new(&dispatch, &p, &weights, &pool);

        let mut cache =
            KvCache::new(p.num_layers, p.num_heads, p.kv_heads, p.head_dim, 8).unwrap();
        let mut logits = vec![0.0; p.vocab_size];

        fp.forward(&[1], &mut cache, &mut logits).unwrap();
        assert_eq!(cache.seq_len(), 0); // uncommitted
        fp.forward(&[1], &mut cache, &mut logits).unwrap();
        cache.advance(1).unwrap();
        assert_eq!(cache.seq_len(), 1);
    }
}
