//! Attention kernels
//!
//! Incremental decode attention reads the whole cached K/V range for one
//! new query token; prefill covers a batch of prompt tokens with causal
//! masking. Both are MQA/GQA-aware: query head `h` reads KV head
//! `h / (num_heads / kv_heads)`. Cache layout is `[position][kv_head]
//! [feature]`, matching the KV cache's natural stride.

use super::activation::softmax;
use super::KernelDispatch;
use emberlm_common::{EmberError, Result};
use rayon::prelude::*;

/// Head-count threshold above which attention parallelizes across heads
const PARALLEL_HEAD_THRESHOLD: usize = 4;

/// Attend one new token's queries over `seq_len` cached positions.
///
/// `out` and `q` hold `num_heads * head_dim` elements; `keys`/`values`
/// hold at least `seq_len * kv_heads * head_dim`; `scores` is caller-owned
/// scratch of at least `num_heads * seq_len` elements.
#[allow(clippy::too_many_arguments)]
pub fn attention_step(
    dispatch: &KernelDispatch,
    out: &mut [f32],
    q: &[f32],
    keys: &[f32],
    values: &[f32],
    scores: &mut [f32],
    seq_len: usize,
    num_heads: usize,
    kv_heads: usize,
    head_dim: usize,
) -> Result<()> {
    check_attention_dims(
        out.len(),
        q.len(),
        keys.len(),
        values.len(),
        scores.len(),
        seq_len,
        num_heads,
        kv_heads,
        head_dim,
    )?;
    if seq_len == 0 {
        out.fill(0.0);
        return Ok(());
    }

    let group = num_heads / kv_heads;
    let kv_stride = kv_heads * head_dim;
    let scale = 1.0 / (head_dim as f32).sqrt();

    let head_op = |(h, (out_head, head_scores)): (usize, (&mut [f32], &mut [f32]))| {
        let q_head = &q[h * head_dim..(h + 1) * head_dim];
        let kv_offset = (h / group) * head_dim;

        for pos in 0..seq_len {
            let key = &keys[pos * kv_stride + kv_offset..pos * kv_stride + kv_offset + head_dim];
            head_scores[pos] = dispatch.dot(q_head, key) * scale;
        }
        softmax(&mut head_scores[..seq_len]);

        out_head.fill(0.0);
        for pos in 0..seq_len {
            let value =
                &values[pos * kv_stride + kv_offset..pos * kv_stride + kv_offset + head_dim];
            dispatch.axpy(head_scores[pos], value, out_head);
        }
    };

    if num_heads >= PARALLEL_HEAD_THRESHOLD {
        out.par_chunks_mut(head_dim)
            .zip(scores.par_chunks_mut(seq_len))
            .enumerate()
            .for_each(head_op);
    } else {
        out.chunks_mut(head_dim)
            .zip(scores.chunks_mut(seq_len))
            .enumerate()
            .for_each(head_op);
    }
    Ok(())
}

/// Causal attention for a batch of `n_tokens` prompt tokens.
///
/// The K/V buffers must already contain the batch (positions
/// `[0, base + n_tokens)`); token `t` attends to positions
/// `[0, base + t]`. `scores` needs `num_heads * (base + n_tokens)`
/// elements.
#[allow(clippy::too_many_arguments)]
pub fn attention_prefill(
    dispatch: &KernelDispatch,
    out: &mut [f32],
    q: &[f32],
    keys: &[f32],
    values: &[f32],
    scores: &mut [f32],
    base: usize,
    n_tokens: usize,
    num_heads: usize,
    kv_heads: usize,
    head_dim: usize,
) -> Result<()> {
    let token_width = num_heads * head_dim;
    if out.len() != n_tokens * token_width || q.len() != n_tokens * token_width {
        return Err(EmberError::shape(format!(
            "attention_prefill: out={}, q={} for {} tokens of width {}",
            out.len(),
            q.len(),
            n_tokens,
            token_width
        )));
    }

    for t in 0..n_tokens {
        let visible = base + t + 1;
        attention_step(
            dispatch,
            &mut out[t * token_width..(t + 1) * token_width],
            &q[t * token_width..(t + 1) * token_width],
            keys,
            values,
            &mut scores[..num_heads * visible],
            visible,
            num_heads,
            kv_heads,
            head_dim,
        )?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn check_attention_dims(
    out_len: usize,
    q_len: usize,
    keys_len: usize,
    values_len: usize,
    scores_len: usize,
    seq_len: usize,
    num_heads: usize,
    kv_heads: usize,
    head_dim: usize,
) -> Result<()> {
    if kv_heads == 0 || num_heads % kv_heads != 0 {
        return Err(EmberError::invalid_input(format!(
            "num_heads ({num_heads}) must be a positive multiple of kv_heads ({kv_heads})"
        )));
    }
    let token_width = num_heads * head_dim;
    let kv_required = seq_len * kv_heads * head_dim;
    if out_len != token_width
        || q_len != token_width
        || keys_len < kv_required
        || values_len < kv_required
        || scores_len < num_heads * seq_len
    {
        return Err(EmberError::shape(format!(
            "attention_step: out={out_len}, q={q_len}, keys={keys_len}, values={values_len}, scores={scores_len} for seq_len={seq_len}, heads={num_heads}/{kv_heads}, head_dim={head_dim}"
        )));
    }
    Ok(())
}
