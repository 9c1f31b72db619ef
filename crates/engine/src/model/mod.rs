//! Model container: hyperparameters, weight bundles, and handles
//!
//! A loaded model is an immutable set of weight matrices shared across
//! sessions behind an `Arc`. Projection weights are stored as
//! `(in_features, out_features)` so every projection is one
//! `y = x · W` against the row-major kernels, whatever the encoding.

pub mod format;
pub mod import;

use crate::budget::BudgetRecord;
use crate::kernels::{matmul, quant_matmul, KernelDispatch};
use crate::tensor::{Q4Tensor, Q8Tensor, Tensor, TensorStorage};
use emberlm_common::{EmberError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Normalization flavor used by the architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormType {
    /// Mean/variance LayerNorm with bias
    LayerNorm,

    /// RMSNorm, no bias
    RmsNorm,
}

/// Feed-forward activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    /// GELU (tanh approximation), two-matrix FFN
    Gelu,

    /// SiLU with a gate projection, three-matrix FFN
    Silu,
}

/// Weight encoding of a model's bulk parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightKind {
    /// Full-precision f32
    F32,

    /// 4-bit block quantized
    Q4,

    /// 8-bit block quantized
    Q8,
}

impl WeightKind {
    /// Average bytes per element including per-block scale overhead
    /// (32-wide blocks assumed for the estimate)
    pub fn bytes_per_element(&self) -> f64 {
        match self {
            WeightKind::F32 => 4.0,
            WeightKind::Q4 => 0.5625,  // 16 data + 2 scale bytes per 32
            WeightKind::Q8 => 1.0625, // 32 data + 2 scale bytes per 32
        }
    }
}

/// How weight payloads are backed in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoragePolicy {
    /// Copy payloads into heap buffers at load
    Preload,

    /// Map f32 payloads from the model file, zero-copy
    MemoryMap,
}

/// Architecture hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparams {
    pub vocab_size: usize,
    pub context_length: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
    pub embed_dim: usize,
    pub ffn_dim: usize,
    pub norm_type: NormType,
    pub activation: Activation,
    pub rope_base: f32,
}

impl Hyperparams {
    /// Width of the concatenated query heads
    pub fn q_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Width of the concatenated key/value heads
    pub fn kv_dim(&self) -> usize {
        self.kv_heads * self.head_dim
    }

    /// Whether the FFN carries a gate projection
    pub fn gated_ffn(&self) -> bool {
        matches!(self.activation, Activation::Silu)
    }

    /// Exact parameter count implied by the dimensions
    pub fn param_count(&self) -> usize {
        let (e, q, kv, f, v) = (
            self.embed_dim,
            self.q_dim(),
            self.kv_dim(),
            self.ffn_dim,
            self.vocab_size,
        );

        let attention = e * q + 2 * e * kv + q * e;
        let ffn = if self.gated_ffn() {
            2 * e * f + f * e
        } else {
            e * f + f * e
        };
        let norms_per_layer = match self.norm_type {
            NormType::LayerNorm => 4 * e,
            NormType::RmsNorm => 2 * e,
        };
        let final_norm = match self.norm_type {
            NormType::LayerNorm => 2 * e,
            NormType::RmsNorm => e,
        };

        v * e + self.num_layers * (attention + ffn + norms_per_layer) + final_norm + e * v
    }

    /// Sanity-check dimensional consistency
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0
            || self.context_length == 0
            || self.num_layers == 0
            || self.num_heads == 0
            || self.kv_heads == 0
            || self.head_dim == 0
            || self.embed_dim == 0
            || self.ffn_dim == 0
        {
            return Err(EmberError::model("hyperparameters must be positive"));
        }
        if self.num_heads % self.kv_heads != 0 {
            return Err(EmberError::model(format!(
                "num_heads ({}) must be a multiple of kv_heads ({})",
                self.num_heads, self.kv_heads
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(EmberError::model("head_dim must be even for rotary embedding"));
        }
        Ok(())
    }
}

/// One weight matrix in any supported encoding, stored `(in, out)`
#[derive(Debug)]
pub enum WeightMatrix {
    F32(Tensor),
    Q4(Q4Tensor),
    Q8(Q8Tensor),
}

impl WeightMatrix {
    /// Input features (rows)
    pub fn in_features(&self) -> usize {
        match self {
            WeightMatrix::F32(t) => t.shape()[0],
            WeightMatrix::Q4(q) => q.rows(),
            WeightMatrix::Q8(q) => q.rows(),
        }
    }

    /// Output features (columns)
    pub fn out_features(&self) -> usize {
        match self {
            WeightMatrix::F32(t) => t.shape()[1],
            WeightMatrix::Q4(q) => q.cols(),
            WeightMatrix::Q8(q) => q.cols(),
        }
    }

    /// Encoding of this matrix
    pub fn kind(&self) -> WeightKind {
        match self {
            WeightMatrix::F32(_) => WeightKind::F32,
            WeightMatrix::Q4(_) => WeightKind::Q4,
            WeightMatrix::Q8(_) => WeightKind::Q8,
        }
    }

    /// Bytes held by the encoded payload
    pub fn payload_bytes(&self) -> usize {
        match self {
            WeightMatrix::F32(t) => t.len() * 4,
            WeightMatrix::Q4(q) => q.payload_bytes(),
            WeightMatrix::Q8(q) => q.payload_bytes(),
        }
    }

    /// `out = a · W` with `a: (m, in_features)`, `out: (m, out_features)`.
    ///
    /// Quantized encodings stream their blocks; f32 runs the dense kernel,
    /// chunk by chunk when the tensor is chunked.
    pub fn matmul(&self, dispatch: &KernelDispatch, out: &mut [f32], a: &[f32], m: usize) -> Result<()> {
        let k = self.in_features();
        let n = self.out_features();
        match self {
            WeightMatrix::F32(t) => match t.storage().contiguous() {
                Some(w) => matmul::matmul(dispatch, out, a, w, m, k, n),
                None => matmul_chunked(dispatch, out, a, t.storage(), m, k, n),
            },
            WeightMatrix::Q4(q) => quant_matmul::matmul_q4(dispatch, out, a, q, m, k, n),
            WeightMatrix::Q8(q) => quant_matmul::matmul_q8(dispatch, out, a, q, m, k, n),
        }
    }
}

/// Dense matmul against a chunked weight, streaming whole rows per chunk.
///
/// Chunked weight tensors are allocated with row-aligned chunk lengths, so
/// every chunk holds complete rows.
fn matmul_chunked(
    dispatch: &KernelDispatch,
    out: &mut [f32],
    a: &[f32],
    storage: &TensorStorage,
    m: usize,
    k: usize,
    n: usize,
) -> Result<()> {
    if a.len() != m * k || out.len() != m * n {
        return Err(EmberError::shape(format!(
            "matmul_chunked: a={}, out={} for ({m}, {k}) x ({k}, {n})",
            a.len(),
            out.len()
        )));
    }
    out.fill(0.0);

    for chunk_idx in 0..storage.chunk_count() {
        let chunk = storage.chunk(chunk_idx);
        let offset = storage.chunk_offset(chunk_idx);
        if offset % n != 0 || chunk.len() % n != 0 {
            return Err(EmberError::storage(
                "chunked weight is not row-aligned; reload with an aligned chunk length",
            ));
        }
        let first_row = offset / n;
        let rows = chunk.len() / n;

        for mi in 0..m {
            let a_row = &a[mi * k..(mi + 1) * k];
            let out_row = &mut out[mi * n..(mi + 1) * n];
            for r in 0..rows {
                dispatch.axpy(a_row[first_row + r], &chunk[r * n..(r + 1) * n], out_row);
            }
        }
    }
    Ok(())
}

/// Gamma (and beta for LayerNorm) of one normalization site
#[derive(Debug, Clone)]
pub struct NormWeights {
    pub gamma: Vec<f32>,
    pub beta: Option<Vec<f32>>,
}

/// Weights of a single decoder layer
#[derive(Debug)]
pub struct LayerWeights {
    pub attn_norm: NormWeights,
    pub wq: WeightMatrix,
    pub wk: WeightMatrix,
    pub wv: WeightMatrix,
    pub wo: WeightMatrix,
    pub ffn_norm: NormWeights,
    /// Present only for gated activations
    pub w_gate: Option<WeightMatrix>,
    pub w_up: WeightMatrix,
    pub w_down: WeightMatrix,
}

/// The full weight set of a loaded model
#[derive(Debug)]
pub struct ModelWeights {
    /// Token embedding table, `(vocab, embed)`
    pub embedding: Tensor,
    pub layers: Vec<LayerWeights>,
    pub final_norm: NormWeights,
    /// LM head, `(embed, vocab)`
    pub lm_head: WeightMatrix,
}

impl ModelWeights {
    /// Copy the embedding row for a token into `dst`
    pub fn embed_token(&self, token: u32, dst: &mut [f32]) -> Result<()> {
        let embed_dim = self.embedding.shape()[1];
        if token as usize >= self.embedding.shape()[0] {
            return Err(EmberError::invalid_input(format!(
                "token id {token} outside vocabulary of {}",
                self.embedding.shape()[0]
            )));
        }
        self.embedding
            .storage()
            .copy_to(token as usize * embed_dim, &mut dst[..embed_dim])
    }

    /// Total encoded parameter bytes
    pub fn param_bytes(&self) -> u64 {
        let mut bytes = (self.embedding.len() * 4) as u64;
        for layer in &self.layers {
            for w in [&layer.wq, &layer.wk, &layer.wv, &layer.wo, &layer.w_up, &layer.w_down] {
                bytes += w.payload_bytes() as u64;
            }
            if let Some(gate) = &layer.w_gate {
                bytes += gate.payload_bytes() as u64;
            }
            bytes += (layer.attn_norm.gamma.len() * 4) as u64;
            bytes += (layer.ffn_norm.gamma.len() * 4) as u64;
        }
        bytes += (self.final_norm.gamma.len() * 4) as u64;
        bytes += self.lm_head.payload_bytes() as u64;
        bytes
    }
}

/// An opaque handle to a loaded model
#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub(crate) model_id: String,
    pub(crate) params: Hyperparams,
    pub(crate) weights: Arc<ModelWeights>,
    pub(crate) policy: StoragePolicy,
    pub(crate) budget: BudgetRecord,
}

impl ModelHandle {
    /// Stable identifier for telemetry and logs
    pub fn id(&self) -> &str {
        &self.model_id
    }

    /// Architecture hyperparameters
    pub fn hyperparams(&self) -> &Hyperparams {
        &self.params
    }

    /// Shared weight set
    pub fn weights(&self) -> &Arc<ModelWeights> {
        &self.weights
    }

    /// Storage policy the model was loaded under
    pub fn storage_policy(&self) -> StoragePolicy {
        self.policy
    }

    /// Memory estimate recorded at load
    pub fn budget_record(&self) -> &BudgetRecord {
        &self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::all_dispatches;

    fn params() -> Hyperparams {
        Hyperparams {
            vocab_size: 32,
            context_length: 64,
            num_layers: 2,
            num_heads: 4,
            kv_heads: 2,
            head_dim: 8,
            embed_dim: 16,
            ffn_dim: 32,
            norm_type: NormType::RmsNorm,
            activation: Activation::Silu,
            rope_base: 10_000.0,
        }
    }

    #[test]
    fn test_hyperparams_validation() {
        assert!(params().validate().is_ok());

        let mut bad = params();
        bad.num_heads = 5;
        assert!(bad.validate().is_err());

        let mut odd = params();
        odd.head_dim = 7;
        assert!(odd.validate().is_err());
    }

    #[test]
    fn test_param_count_matches_dimensions() {
        let p = params();
        // embedding + lm head
        let mut expected = 2 * 32 * 16;
        // attention: e*q + 2*e*kv + q*e
        expected += 2 * (16 * 32 + 2 * 16 * 16 + 32 * 16);
        // gated ffn: 2*e*f + f*e
        expected += 2 * (2 * 16 * 32 + 32 * 16);
        // rms norms: 2 per layer + final
        expected += 2 * 2 * 16 + 16;
        assert_eq!(p.param_count(), expected);
    }

    #[test]
    fn test_weight_matrix_matmul_equivalence() {
        // All three encodings of the same matrix must agree within the
        // quantization tolerance.
        let (k, n) = (8, 32);
        let data: Vec<f32> = (0..k * n).map(|i| ((i % 13) as f32 - 6.0) / 7.0).collect();
        let a: Vec<f32> = (0..k).map(|i| ((i % 5) as f32 - 2.0) / 3.0).collect();

        for dispatch in all_dispatches() {
            let f32_w =
                WeightMatrix::F32(Tensor::from_vec(data.clone(), vec![k, n]).unwrap());
            let q8_w = WeightMatrix::Q8(Q8Tensor::quantize(&data, k, n, 32).unwrap());

            let mut out_f32 = vec![0.0; n];
            let mut out_q8 = vec![0.0; n];
            f32_w.matmul(&dispatch, &mut out_f32, &a, 1).unwrap();
            q8_w.matmul(&dispatch, &mut out_q8, &a, 1).unwrap();

            for (x, y) in out_f32.iter().zip(out_q8.iter()) {
                assert!((x - y).abs() < 0.05, "{x} vs {y}");
            }
        }
    }

    #[test]
    fn test_chunked_weight_matmul_matches_dense() {
        let (k, n) = (12, 8);
        let data: Vec<f32> = (0..k * n).map(|i| (i as f32) * 0.01 - 0.4).collect();
        let a: Vec<f32> = (0..2 * k).map(|i| (i as f32) * 0.1 - 1.0).collect();

        // Row-aligned chunks: 3 rows (24 elements) per chunk.
        let mut storage = TensorStorage::alloc_with_limits(k * n, 32, 3 * n);
        storage.copy_from(&data, 0).unwrap();
        let chunked = WeightMatrix::F32(Tensor::new(storage, vec![k, n]).unwrap());
        let dense = WeightMatrix::F32(Tensor::from_vec(data, vec![k, n]).unwrap());

        let dispatch = KernelDispatch::scalar();
        let mut out_chunked = vec![0.0; 2 * n];
        let mut out_dense = vec![0.0; 2 * n];
        chunked.matmul(&dispatch, &mut out_chunked, &a, 2).unwrap();
        dense.matmul(&dispatch, &mut out_dense, &a, 2).unwrap();

        for (x, y) in out_dense.iter().zip(out_chunked.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_embed_token_lookup() {
        let vocab = 4;
        let embed = 3;
        let table: Vec<f32> = (0..vocab * embed).map(|i| i as f32).collect();
        let weights = ModelWeights {
            embedding: Tensor::from_vec(table, vec![vocab, embed]).unwrap(),
            layers: vec![],
            final_norm: NormWeights {
                gamma: vec![1.0; embed],
                beta: None,
            },
            lm_head: WeightMatrix::F32(
                Tensor::from_vec(vec![0.0; embed * vocab], vec![embed, vocab]).unwrap(),
            ),
        };

        let mut dst = vec![0.0; embed];
        weights.embed_token(2, &mut dst).unwrap();
        assert_eq!(dst, vec![6.0, 7.0, 8.0]);

        assert!(weights.embed_token(9, &mut dst).is_err());
    }
}
