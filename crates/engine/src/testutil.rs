//! Shared fixtures for unit tests: a tiny deterministic model

use crate::model::{
    Activation, Hyperparams, LayerWeights, ModelWeights, NormType, NormWeights, WeightMatrix,
};
use crate::tensor::Tensor;

pub(crate) fn tiny_params(activation: Activation, norm_type: NormType) -> Hyperparams {
    Hyperparams {
        vocab_size: 11,
        context_length: 32,
        num_layers: 2,
        num_heads: 2,
        kv_heads: 1,
        head_dim: 4,
        embed_dim: 8,
        ffn_dim: 16,
        norm_type,
        activation,
        rope_base: 10_000.0,
    }
}

/// Deterministic pseudo-random weight value
pub(crate) fn det(salt: u64, i: usize) -> f32 {
    let x = (salt.wrapping_add(i as u64).wrapping_mul(0x2545F4914F6CDD1D) >> 33) % 1000;
    x as f32 / 2500.0 - 0.2
}

fn matrix(rows: usize, cols: usize, salt: u64) -> WeightMatrix {
    let data: Vec<f32> = (0..rows * cols).map(|i| det(salt, i)).collect();
    WeightMatrix::F32(Tensor::from_vec(data, vec![rows, cols]).unwrap())
}

fn norm_weights(e: usize, p: &Hyperparams) -> NormWeights {
    NormWeights {
        gamma: vec![1.0; e],
        beta: match p.norm_type {
            NormType::LayerNorm => Some(vec![0.0; e]),
            NormType::RmsNorm => None,
        },
    }
}

pub(crate) fn tiny_weights(p: &Hyperparams) -> ModelWeights {
    let (e, q, kv, f, v) = (p.embed_dim, p.q_dim(), p.kv_dim(), p.ffn_dim, p.vocab_size);
    let layers = (0..p.num_layers)
        .map(|li| LayerWeights {
            attn_norm: norm_weights(e, p),
            wq: matrix(e, q, 100 + li as u64),
            wk: matrix(e, kv, 200 + li as u64),
            wv: matrix(e, kv, 300 + li as u64),
            wo: matrix(q, e, 400 + li as u64),
            ffn_norm: norm_weights(e, p),
            w_gate: p.gated_ffn().then(|| matrix(e, f, 500 + li as u64)),
            w_up: matrix(e, f, 600 + li as u64),
            w_down: matrix(f, e, 700 + li as u64),
        })
        .collect();

    ModelWeights {
        embedding: Tensor::from_vec((0..v * e).map(|i| det(1, i)).collect(), vec![v, e]).unwrap(),
        layers,
        final_norm: norm_weights(e, p),
        lm_head: matrix(e, v, 900),
    }
}
